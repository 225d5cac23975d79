//! Storage interfaces and their in-memory and sled implementations, plus the
//! sled-backed operation index

mod memory;
mod sled_index;
mod sled_store;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::StrandError;
use crate::registry::ListenerState;
use crate::types::operation::Operation;
use crate::types::remote::{RemoteCursor, RemoteRecord};

pub use memory::MemoryStore;
pub use sled_index::SledOperationIndex;
pub use sled_store::SledStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentHeader {
    pub id: String,
    pub document_type: String,
    pub created_at_utc_ms: u64,
    #[serde(default)]
    pub deleted: bool,
}

/// Revision summary of one (scope, branch) of a document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeRevision {
    pub scope: String,
    pub branch: String,
    pub revision: u64,
}

/// Persists documents and their operation logs
#[async_trait]
pub trait DocumentOperationStorage: Send + Sync {
    /// Fails with `DuplicatedId` if the document exists
    async fn create_document(&self, header: DocumentHeader) -> Result<(), StrandError>;

    async fn get_document(&self, document_id: &str) -> Result<Option<DocumentHeader>, StrandError>;

    async fn mark_deleted(&self, document_id: &str) -> Result<(), StrandError>;

    /// Append operations; the first must follow the current revision
    async fn append_operations(
        &self,
        document_id: &str,
        scope: &str,
        branch: &str,
        operations: &[Operation],
    ) -> Result<(), StrandError>;

    /// Operations with `index > from_revision`, in index order
    async fn get_operations(
        &self,
        document_id: &str,
        scope: &str,
        branch: &str,
        from_revision: u64,
        limit: Option<usize>,
    ) -> Result<Vec<Operation>, StrandError>;

    async fn get_last_operation(
        &self,
        document_id: &str,
        scope: &str,
        branch: &str,
    ) -> Result<Option<Operation>, StrandError>;

    /// Index of the last operation (0 when none)
    async fn get_revision(
        &self,
        document_id: &str,
        scope: &str,
        branch: &str,
    ) -> Result<u64, StrandError> {
        Ok(self
            .get_last_operation(document_id, scope, branch)
            .await?
            .map(|op| op.index)
            .unwrap_or(0))
    }

    async fn list_scopes(&self, document_id: &str) -> Result<Vec<ScopeRevision>, StrandError>;
}

/// Persists listener definitions and their per-sync-unit state
#[async_trait]
pub trait ListenerStorage: Send + Sync {
    async fn save_listener(&self, state: &ListenerState) -> Result<(), StrandError>;
    async fn remove_listener(&self, listener_id: &str) -> Result<(), StrandError>;
    async fn list_listeners(&self) -> Result<Vec<ListenerState>, StrandError>;
}

#[async_trait]
pub trait SyncRemoteStorage: Send + Sync {
    async fn list(&self) -> Result<Vec<RemoteRecord>, StrandError>;
    async fn get(&self, name: &str) -> Result<Option<RemoteRecord>, StrandError>;
    async fn upsert(&self, record: &RemoteRecord) -> Result<(), StrandError>;
    async fn remove(&self, name: &str) -> Result<(), StrandError>;
}

#[async_trait]
pub trait SyncCursorStorage: Send + Sync {
    async fn list(&self) -> Result<Vec<RemoteCursor>, StrandError>;
    async fn get(&self, remote_name: &str) -> Result<Option<RemoteCursor>, StrandError>;
    async fn upsert(&self, cursor: &RemoteCursor) -> Result<(), StrandError>;
    async fn remove(&self, remote_name: &str) -> Result<(), StrandError>;
}

/// Check that `operations` continue a log whose last index is `revision`
pub(crate) fn check_append(
    document_id: &str,
    scope: &str,
    revision: u64,
    operations: &[Operation],
) -> Result<(), StrandError> {
    let mut expected = revision;
    for op in operations {
        if op.index <= expected || op.index.checked_sub(op.skip) != Some(expected + 1) {
            return Err(StrandError::Conflict(format!(
                "operation {} of {}/{} does not follow revision {}",
                op.index, document_id, scope, expected
            )));
        }
        expected = op.index;
    }
    Ok(())
}
