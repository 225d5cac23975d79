//! Sync operations
//!
//! A [`SyncOperation`] carries the operations of one document exchanged with
//! one remote. Its status only moves forward:
//! `Unknown -> TransportPending -> ExecutionPending -> Applied`, and `Error`
//! can be entered from any state and is never left.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use libstrand_core::types::ids::new_id;
use libstrand_core::OperationWithContext;
use serde::{Deserialize, Serialize};

use crate::error::ChannelError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncOperationStatus {
    Unknown,
    TransportPending,
    ExecutionPending,
    Applied,
    Error,
}

impl SyncOperationStatus {
    fn rank(self) -> u8 {
        match self {
            SyncOperationStatus::Unknown => 0,
            SyncOperationStatus::TransportPending => 1,
            SyncOperationStatus::ExecutionPending => 2,
            SyncOperationStatus::Applied => 3,
            SyncOperationStatus::Error => 4,
        }
    }

    pub fn is_final(self) -> bool {
        matches!(self, SyncOperationStatus::Applied | SyncOperationStatus::Error)
    }
}

pub type StatusCallback =
    Arc<dyn Fn(&SyncOperation, SyncOperationStatus, SyncOperationStatus) + Send + Sync>;

struct StatusState {
    status: SyncOperationStatus,
    error: Option<ChannelError>,
    callbacks: Vec<StatusCallback>,
}

pub struct SyncOperation {
    pub id: String,
    /// Job that produced (outbox) or should apply (inbox) the operations; empty when unkeyed
    pub job_id: String,
    pub job_dependencies: Vec<String>,
    pub remote_name: String,
    pub document_id: String,
    pub scopes: Vec<String>,
    pub branch: String,
    pub operations: Vec<OperationWithContext>,
    state: Mutex<StatusState>,
}

impl SyncOperation {
    pub fn new(
        remote_name: &str,
        document_id: &str,
        scopes: Vec<String>,
        branch: &str,
        operations: Vec<OperationWithContext>,
    ) -> Self {
        Self {
            id: new_id(),
            job_id: String::new(),
            job_dependencies: Vec::new(),
            remote_name: remote_name.to_string(),
            document_id: document_id.to_string(),
            scopes,
            branch: branch.to_string(),
            operations,
            state: Mutex::new(StatusState {
                status: SyncOperationStatus::Unknown,
                error: None,
                callbacks: Vec::new(),
            }),
        }
    }

    pub fn with_job(mut self, job_id: &str, job_dependencies: Vec<String>) -> Self {
        self.job_id = job_id.to_string();
        self.job_dependencies = job_dependencies;
        self
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.id = id.to_string();
        self
    }

    fn lock(&self) -> MutexGuard<'_, StatusState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_keyed(&self) -> bool {
        !self.job_id.is_empty()
    }

    pub fn status(&self) -> SyncOperationStatus {
        self.lock().status
    }

    pub fn error(&self) -> Option<ChannelError> {
        self.lock().error.clone()
    }

    /// Highest index ordinal among the carried operations
    pub fn max_ordinal(&self) -> Option<u64> {
        self.operations.iter().filter_map(|op| op.ordinal).max()
    }

    /// Called with `(operation, previous, next)` on every accepted transition
    pub fn on_status_change<F>(&self, callback: F)
    where
        F: Fn(&SyncOperation, SyncOperationStatus, SyncOperationStatus) + Send + Sync + 'static,
    {
        self.lock().callbacks.push(Arc::new(callback));
    }

    pub fn started(&self) {
        self.transition(SyncOperationStatus::TransportPending, None);
    }

    pub fn transported(&self) {
        self.transition(SyncOperationStatus::ExecutionPending, None);
    }

    pub fn executed(&self) {
        self.transition(SyncOperationStatus::Applied, None);
    }

    pub fn failed(&self, error: ChannelError) {
        self.transition(SyncOperationStatus::Error, Some(error));
    }

    fn transition(&self, next: SyncOperationStatus, error: Option<ChannelError>) {
        let (previous, callbacks) = {
            let mut state = self.lock();
            let previous = state.status;
            if next.rank() <= previous.rank() {
                return;
            }
            state.status = next;
            if error.is_some() {
                state.error = error;
            }
            (previous, state.callbacks.clone())
        };
        for callback in callbacks {
            callback(self, previous, next);
        }
    }
}

impl fmt::Debug for SyncOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncOperation")
            .field("id", &self.id)
            .field("job_id", &self.job_id)
            .field("job_dependencies", &self.job_dependencies)
            .field("remote_name", &self.remote_name)
            .field("document_id", &self.document_id)
            .field("scopes", &self.scopes)
            .field("branch", &self.branch)
            .field("operations", &self.operations.len())
            .field("status", &self.status())
            .finish()
    }
}
