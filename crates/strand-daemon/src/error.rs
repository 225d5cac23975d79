//! Daemon error type

use libstrand_core::StrandError;
use libstrand_listener::ListenerError;
use libstrand_reactor::ReactorError;
use libstrand_sync::SyncError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("Strand error: {0}")]
    Strand(#[from] StrandError),

    #[error("Listener error: {0}")]
    Listener(#[from] ListenerError),

    #[error("Reactor error: {0}")]
    Reactor(#[from] ReactorError),

    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),
}

impl DaemonError {
    /// Process exit code
    pub fn exit_code(&self) -> i32 {
        match self {
            DaemonError::Strand(e) => e.exit_code(),
            DaemonError::Sync(SyncError::Storage(e)) => e.exit_code(),
            _ => 1,
        }
    }
}
