use chrono::{DateTime, Utc};

use daylist_core::model::SyncConflict;

/// Transient, auto-expiring user-visible message. The engine clears it after
/// the configured notice TTL (6 s by default).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// General sync information, e.g. a recurring task's next instance was
    /// scheduled.
    Info(String),
    /// A silent refresh failed while offline but a cached list is shown.
    Offline,
    /// A background refresh of a non-visible view produced different tasks;
    /// carries the view's cache key.
    TasksUpdated(String),
}

/// The server detected a concurrent edit. Persists until the user
/// explicitly dismisses it; never auto-resolved or auto-expired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictNotice {
    pub conflicts: Vec<SyncConflict>,
    pub raised_at: DateTime<Utc>,
}

impl ConflictNotice {
    pub fn new(conflicts: Vec<SyncConflict>) -> Self {
        Self {
            conflicts,
            raised_at: Utc::now(),
        }
    }
}
