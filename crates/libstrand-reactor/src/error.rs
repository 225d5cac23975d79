use libstrand_core::StrandError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReactorError {
    #[error("invalid batch: {0}")]
    InvalidBatch(String),

    #[error("invalid action: {0}")]
    InvalidAction(String),

    #[error("document not found: {0}")]
    DocumentNotFound(String),

    #[error("document deleted: {0}")]
    DocumentDeleted(String),

    #[error("operation {got} of {document_id}/{scope} does not follow revision {expected}")]
    IndexGap {
        document_id: String,
        scope: String,
        expected: u64,
        got: u64,
    },

    #[error("operation {index} of {document_id}/{scope} conflicts with the stored history")]
    HistoryConflict {
        document_id: String,
        scope: String,
        index: u64,
    },

    #[error("dependency failed: {0}")]
    DependencyFailed(String),

    #[error("Queue is blocked")]
    QueueBlocked,

    #[error("timed out waiting for job {0}")]
    Timeout(String),

    #[error("reactor is shut down")]
    ShutDown,

    #[error(transparent)]
    Storage(#[from] StrandError),
}

impl ReactorError {
    /// Whether running the job again could succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            ReactorError::Storage(e) => {
                !e.is_caller_error() && !matches!(e, StrandError::Conflict(_))
            }
            _ => false,
        }
    }
}
