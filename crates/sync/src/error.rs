use thiserror::Error;

use crate::api::ApiError;

/// Failure classes of engine operations. These never reach the UI as
/// errors: mutation actions catch them at the action boundary and convert
/// them into state fields.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("title cannot be empty")]
    EmptyTitle,
    #[error("no target list for the new task")]
    NoTargetList,
    #[error("unknown task: {0}")]
    UnknownTask(String),
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl EngineError {
    /// Local validation failures never touch the network or the outbox.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            EngineError::EmptyTitle | EngineError::NoTargetList | EngineError::UnknownTask(_)
        )
    }
}
