//! Seams to the collaborators this engine does not own: the remote task API
//! and the connectivity signal.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;

use daylist_core::model::{Group, MutationOp, Project, SyncResponse, Task};

/// Scope parameter of the generic list endpoint. Group, project, and search
/// reads go through their own endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListScope {
    Today,
    Upcoming,
    Inbox,
}

impl ListScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            ListScope::Today => "today",
            ListScope::Upcoming => "upcoming",
            ListScope::Inbox => "inbox",
        }
    }
}

/// Payload of every read endpoint. Groups and projects ride along as
/// metadata and are merged, never wholesale-replaced.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FetchResponse {
    #[serde(default)]
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub groups: Vec<Group>,
    #[serde(default)]
    pub projects: Vec<Project>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

/// Transport failures are retryable and leave optimistic state alone;
/// rejections are permanent verdicts that trigger rollback.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ApiError {
    #[error("network unavailable: {0}")]
    Transport(String),
    #[error("request rejected: {0}")]
    Rejected(String),
}

pub type ApiResult<T> = Result<T, ApiError>;

/// The remote task API.
///
/// Contract: the mutation endpoint behind [`RemoteApi::sync`] is idempotent
/// per `(op, id)`. A batch whose response was lost may be replayed in full
/// and must converge to the same server state.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    async fn list(&self, scope: ListScope) -> ApiResult<FetchResponse>;
    async fn group_tasks(&self, id: &str) -> ApiResult<FetchResponse>;
    async fn project_tasks(&self, id: &str) -> ApiResult<FetchResponse>;
    async fn search(&self, query: &str) -> ApiResult<FetchResponse>;
    async fn counts(&self) -> ApiResult<HashMap<String, i64>>;
    async fn sync(&self, batch: &[MutationOp]) -> ApiResult<SyncResponse>;
}

/// Connectivity signal: a readable online flag plus became-online events.
pub trait Connectivity: Send + Sync {
    fn is_online(&self) -> bool;
    fn subscribe(&self) -> watch::Receiver<bool>;
}

/// In-process connectivity source backed by a watch channel. Production
/// wires this to the platform reachability callback; tests drive it
/// directly.
pub struct ConnectivityHandle {
    tx: watch::Sender<bool>,
}

impl ConnectivityHandle {
    pub fn new(online: bool) -> Self {
        let (tx, _) = watch::channel(online);
        Self { tx }
    }

    pub fn set_online(&self, online: bool) {
        let _ = self.tx.send(online);
    }
}

impl Connectivity for ConnectivityHandle {
    fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connectivity_handle_reports_and_signals() {
        let handle = ConnectivityHandle::new(false);
        assert!(!handle.is_online());

        let mut rx = handle.subscribe();
        handle.set_online(true);
        rx.changed().await.expect("signal");
        assert!(*rx.borrow());
        assert!(handle.is_online());
    }
}
