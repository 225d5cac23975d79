use libstrand_core::types::listener::ErrorStatus;
use libstrand_core::StrandError;
use thiserror::Error;

/// Errors of the listener subsystem.
///
/// Cloneable so one debounced update result can be handed to every caller.
#[derive(Debug, Clone, Error)]
pub enum ListenerError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("duplicated id: {0}")]
    DuplicatedId(String),

    #[error("transmitter already exists for listener {0}")]
    DuplicatedTransmitter(String),

    /// Failure reported by the remote side of a transmission
    #[error("{status}: {message}")]
    Operation { status: ErrorStatus, message: String },

    #[error("transmit failed: {0}")]
    Transmit(String),

    #[error("Maximum retries exhausted ({0} continuations)")]
    RetriesExhausted(u32),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("update cancelled")]
    Cancelled,

    #[error(transparent)]
    InitTransmitters(#[from] InitTransmittersError),
}

impl ListenerError {
    pub fn operation(status: ErrorStatus, message: impl Into<String>) -> Self {
        ListenerError::Operation {
            status,
            message: message.into(),
        }
    }

    /// Status a listener takes after this error
    pub fn error_status(&self) -> ErrorStatus {
        match self {
            ListenerError::Operation { status, .. } => *status,
            _ => ErrorStatus::Error,
        }
    }
}

impl From<StrandError> for ListenerError {
    fn from(e: StrandError) -> Self {
        match e {
            StrandError::NotFound(msg) => ListenerError::NotFound(msg),
            StrandError::DuplicatedId(msg) => ListenerError::DuplicatedId(msg),
            other => ListenerError::Storage(other.to_string()),
        }
    }
}

/// Per-listener failures collected while creating transmitters in bulk
#[derive(Debug, Clone, Error)]
#[error("failed to initialize {} transmitter(s)", errors.len())]
pub struct InitTransmittersError {
    /// (listener id, error)
    pub errors: Vec<(String, ListenerError)>,
}
