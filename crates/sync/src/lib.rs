//! Client-side task synchronization and cache engine.
//!
//! The [`TaskStore`] sits between a UI and the remote task API and makes the
//! app feel local-first: reads render from cache before any network round
//! trip, edits apply optimistically and queue in a durable outbox, and the
//! outbox replays when connectivity returns. The UI consumes everything
//! through a single watched [`ViewState`].

pub mod api;
pub mod engine;
pub mod error;
pub mod notice;
pub mod state;

pub use api::{
    ApiError, ApiResult, Connectivity, ConnectivityHandle, FetchResponse, ListScope, RemoteApi,
};
pub use engine::{EngineOptions, LoadOptions, NewTaskInput, NextTasksHook, TaskStore};
pub use error::EngineError;
pub use notice::{ConflictNotice, Notice};
pub use state::ViewState;
