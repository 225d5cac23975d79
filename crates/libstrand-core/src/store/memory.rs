use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::StrandError;
use crate::registry::ListenerState;
use crate::types::operation::Operation;
use crate::types::remote::{RemoteCursor, RemoteRecord};

use super::{
    check_append, DocumentHeader, DocumentOperationStorage, ListenerStorage, ScopeRevision,
    SyncCursorStorage, SyncRemoteStorage,
};

type LogKey = (String, String, String);

#[derive(Default)]
struct MemoryState {
    documents: HashMap<String, DocumentHeader>,
    /// (document, scope, branch) -> operations in index order
    logs: BTreeMap<LogKey, Vec<Operation>>,
    listeners: BTreeMap<String, ListenerState>,
    remotes: BTreeMap<String, RemoteRecord>,
    cursors: BTreeMap<String, RemoteCursor>,
}

/// Storage kept entirely in memory; used by tests and storage-less nodes
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn log_key(document_id: &str, scope: &str, branch: &str) -> LogKey {
    (document_id.to_string(), scope.to_string(), branch.to_string())
}

#[async_trait]
impl DocumentOperationStorage for MemoryStore {
    async fn create_document(&self, header: DocumentHeader) -> Result<(), StrandError> {
        let mut state = self.state.write().await;
        if state.documents.contains_key(&header.id) {
            return Err(StrandError::DuplicatedId(format!(
                "document '{}' already exists",
                header.id
            )));
        }
        state.documents.insert(header.id.clone(), header);
        Ok(())
    }

    async fn get_document(&self, document_id: &str) -> Result<Option<DocumentHeader>, StrandError> {
        Ok(self.state.read().await.documents.get(document_id).cloned())
    }

    async fn mark_deleted(&self, document_id: &str) -> Result<(), StrandError> {
        let mut state = self.state.write().await;
        let header = state
            .documents
            .get_mut(document_id)
            .ok_or_else(|| StrandError::NotFound(format!("document '{}'", document_id)))?;
        header.deleted = true;
        Ok(())
    }

    async fn append_operations(
        &self,
        document_id: &str,
        scope: &str,
        branch: &str,
        operations: &[Operation],
    ) -> Result<(), StrandError> {
        let mut state = self.state.write().await;
        let log = state
            .logs
            .entry(log_key(document_id, scope, branch))
            .or_default();
        let revision = log.last().map(|op| op.index).unwrap_or(0);
        check_append(document_id, scope, revision, operations)?;
        log.extend_from_slice(operations);
        Ok(())
    }

    async fn get_operations(
        &self,
        document_id: &str,
        scope: &str,
        branch: &str,
        from_revision: u64,
        limit: Option<usize>,
    ) -> Result<Vec<Operation>, StrandError> {
        let state = self.state.read().await;
        let Some(log) = state.logs.get(&log_key(document_id, scope, branch)) else {
            return Ok(Vec::new());
        };
        let start = log.partition_point(|op| op.index <= from_revision);
        Ok(log[start..]
            .iter()
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    async fn get_last_operation(
        &self,
        document_id: &str,
        scope: &str,
        branch: &str,
    ) -> Result<Option<Operation>, StrandError> {
        let state = self.state.read().await;
        Ok(state
            .logs
            .get(&log_key(document_id, scope, branch))
            .and_then(|log| log.last().cloned()))
    }

    async fn list_scopes(&self, document_id: &str) -> Result<Vec<ScopeRevision>, StrandError> {
        let state = self.state.read().await;
        Ok(state
            .logs
            .iter()
            .filter(|((doc, _, _), log)| doc == document_id && !log.is_empty())
            .map(|((_, scope, branch), log)| ScopeRevision {
                scope: scope.clone(),
                branch: branch.clone(),
                revision: log.last().map(|op| op.index).unwrap_or(0),
            })
            .collect())
    }
}

#[async_trait]
impl ListenerStorage for MemoryStore {
    async fn save_listener(&self, state: &ListenerState) -> Result<(), StrandError> {
        self.state
            .write()
            .await
            .listeners
            .insert(state.listener.listener_id.clone(), state.clone());
        Ok(())
    }

    async fn remove_listener(&self, listener_id: &str) -> Result<(), StrandError> {
        self.state.write().await.listeners.remove(listener_id);
        Ok(())
    }

    async fn list_listeners(&self) -> Result<Vec<ListenerState>, StrandError> {
        Ok(self.state.read().await.listeners.values().cloned().collect())
    }
}

#[async_trait]
impl SyncRemoteStorage for MemoryStore {
    async fn list(&self) -> Result<Vec<RemoteRecord>, StrandError> {
        Ok(self.state.read().await.remotes.values().cloned().collect())
    }

    async fn get(&self, name: &str) -> Result<Option<RemoteRecord>, StrandError> {
        Ok(self.state.read().await.remotes.get(name).cloned())
    }

    async fn upsert(&self, record: &RemoteRecord) -> Result<(), StrandError> {
        self.state
            .write()
            .await
            .remotes
            .insert(record.name.clone(), record.clone());
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<(), StrandError> {
        self.state.write().await.remotes.remove(name);
        Ok(())
    }
}

#[async_trait]
impl SyncCursorStorage for MemoryStore {
    async fn list(&self) -> Result<Vec<RemoteCursor>, StrandError> {
        Ok(self.state.read().await.cursors.values().cloned().collect())
    }

    async fn get(&self, remote_name: &str) -> Result<Option<RemoteCursor>, StrandError> {
        Ok(self.state.read().await.cursors.get(remote_name).cloned())
    }

    async fn upsert(&self, cursor: &RemoteCursor) -> Result<(), StrandError> {
        self.state
            .write()
            .await
            .cursors
            .insert(cursor.remote_name.clone(), cursor.clone());
        Ok(())
    }

    async fn remove(&self, remote_name: &str) -> Result<(), StrandError> {
        self.state.write().await.cursors.remove(remote_name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::exercise_document_storage;
    use super::*;
    use crate::types::listener::{Listener, ListenerFilter, TransmitterType};
    use crate::types::remote::{ChannelConfig, RemoteFilter, RemoteOptions, RemoteStatus};

    #[tokio::test]
    async fn test_document_storage() {
        exercise_document_storage(&MemoryStore::new()).await;
    }

    #[tokio::test]
    async fn test_listener_storage() {
        let store = MemoryStore::new();
        let listener = Listener::new("l1", "d1", ListenerFilter::all(), TransmitterType::Internal);
        let mut state = ListenerState::new(listener);
        store.save_listener(&state).await.unwrap();
        state.sync_units.insert("u".into(), Default::default());
        store.save_listener(&state).await.unwrap();

        let listeners = store.list_listeners().await.unwrap();
        assert_eq!(listeners, vec![state]);
        store.remove_listener("l1").await.unwrap();
        assert!(store.list_listeners().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remote_and_cursor_storage() {
        let store = MemoryStore::new();
        let record = RemoteRecord {
            id: "id-1".into(),
            name: "remote".into(),
            collection_id: "main:d".into(),
            channel_config: ChannelConfig::internal(),
            filter: RemoteFilter::default(),
            options: RemoteOptions::default(),
            status: RemoteStatus::default(),
        };
        SyncRemoteStorage::upsert(&store, &record).await.unwrap();
        assert_eq!(SyncRemoteStorage::get(&store, "remote").await.unwrap(), Some(record));

        let cursor = RemoteCursor {
            remote_name: "remote".into(),
            cursor_ordinal: 7,
            last_synced_at_utc_ms: Some(1),
        };
        SyncCursorStorage::upsert(&store, &cursor).await.unwrap();
        assert_eq!(SyncCursorStorage::get(&store, "remote").await.unwrap(), Some(cursor));

        SyncRemoteStorage::remove(&store, "remote").await.unwrap();
        SyncCursorStorage::remove(&store, "remote").await.unwrap();
        assert!(SyncRemoteStorage::list(&store).await.unwrap().is_empty());
        assert!(SyncCursorStorage::list(&store).await.unwrap().is_empty());
    }
}
