use std::path::Path;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::StrandError;
use crate::registry::ListenerState;
use crate::types::operation::Operation;
use crate::types::remote::{RemoteCursor, RemoteRecord};

use super::sled_index::SledOperationIndex;
use super::{
    check_append, DocumentHeader, DocumentOperationStorage, ListenerStorage, ScopeRevision,
    SyncCursorStorage, SyncRemoteStorage,
};

/// Storage backed by sled
pub struct SledStore {
    db: sled::Db,
    documents: sled::Tree,
    operations: sled::Tree,
    listeners: sled::Tree,
    remotes: sled::Tree,
    cursors: sled::Tree,
    /// Serializes revision checks with their writes
    append_lock: Mutex<()>,
}

impl SledStore {
    /// Open or create a store at the given path
    pub fn open(path: &Path) -> Result<Self, StrandError> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// Open a throwaway store that is deleted on drop
    pub fn temporary() -> Result<Self, StrandError> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> Result<Self, StrandError> {
        let documents = db.open_tree("documents")?;
        let operations = db.open_tree("operations")?;
        let listeners = db.open_tree("listeners")?;
        let remotes = db.open_tree("remotes")?;
        let cursors = db.open_tree("cursors")?;
        Ok(Self {
            db,
            documents,
            operations,
            listeners,
            remotes,
            cursors,
            append_lock: Mutex::new(()),
        })
    }

    /// Operation index sharing this store's database
    pub fn operation_index(&self) -> Result<SledOperationIndex, StrandError> {
        SledOperationIndex::open(&self.db)
    }

    /// Flush pending writes to disk
    pub async fn flush(&self) -> Result<(), StrandError> {
        self.db.flush_async().await?;
        Ok(())
    }
}

// Key helpers

/// `<doc>\0` prefix of every log of a document
fn document_prefix(document_id: &str) -> Vec<u8> {
    let mut key = document_id.as_bytes().to_vec();
    key.push(0);
    key
}

/// `<doc>\0<scope>\0<branch>\0` prefix of one log
fn log_prefix(document_id: &str, scope: &str, branch: &str) -> Vec<u8> {
    let mut key = document_prefix(document_id);
    key.extend_from_slice(scope.as_bytes());
    key.push(0);
    key.extend_from_slice(branch.as_bytes());
    key.push(0);
    key
}

fn operation_key(document_id: &str, scope: &str, branch: &str, index: u64) -> Vec<u8> {
    let mut key = log_prefix(document_id, scope, branch);
    key.extend_from_slice(&index.to_be_bytes());
    key
}

/// Split an operation key back into (scope, branch) after the document prefix
fn parse_log_key(key: &[u8], prefix_len: usize) -> Option<(String, String)> {
    let rest = key.get(prefix_len..key.len().checked_sub(8)?)?;
    let mut parts = rest.split(|b| *b == 0);
    let scope = String::from_utf8(parts.next()?.to_vec()).ok()?;
    let branch = String::from_utf8(parts.next()?.to_vec()).ok()?;
    Some((scope, branch))
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, StrandError> {
    Ok(serde_json::from_slice(bytes)?)
}

fn scan_values<T: serde::de::DeserializeOwned>(tree: &sled::Tree) -> Result<Vec<T>, StrandError> {
    let mut values = Vec::new();
    for item in tree.iter() {
        let (_, value) = item?;
        values.push(decode(&value)?);
    }
    Ok(values)
}

#[async_trait]
impl DocumentOperationStorage for SledStore {
    async fn create_document(&self, header: DocumentHeader) -> Result<(), StrandError> {
        let value = serde_json::to_vec(&header)?;
        let result = self
            .documents
            .compare_and_swap(header.id.as_bytes(), None as Option<&[u8]>, Some(value))?;
        if result.is_err() {
            return Err(StrandError::DuplicatedId(format!(
                "document '{}' already exists",
                header.id
            )));
        }
        Ok(())
    }

    async fn get_document(&self, document_id: &str) -> Result<Option<DocumentHeader>, StrandError> {
        match self.documents.get(document_id.as_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn mark_deleted(&self, document_id: &str) -> Result<(), StrandError> {
        let mut header = self
            .get_document(document_id)
            .await?
            .ok_or_else(|| StrandError::NotFound(format!("document '{}'", document_id)))?;
        header.deleted = true;
        self.documents
            .insert(document_id.as_bytes(), serde_json::to_vec(&header)?)?;
        Ok(())
    }

    async fn append_operations(
        &self,
        document_id: &str,
        scope: &str,
        branch: &str,
        operations: &[Operation],
    ) -> Result<(), StrandError> {
        let _guard = self.append_lock.lock().await;
        let revision = self.get_revision(document_id, scope, branch).await?;
        check_append(document_id, scope, revision, operations)?;

        let mut batch = sled::Batch::default();
        for op in operations {
            batch.insert(
                operation_key(document_id, scope, branch, op.index),
                serde_json::to_vec(op)?,
            );
        }
        self.operations.apply_batch(batch)?;
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
        let prefix = log_prefix(document_id, scope, branch);
        let start = operation_key(document_id, scope, branch, from_revision.saturating_add(1));
        let limit = limit.unwrap_or(usize::MAX);

        let mut operations = Vec::new();
        for item in self.operations.range(start..) {
            if operations.len() >= limit {
                break;
            }
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            operations.push(decode(&value)?);
        }
        Ok(operations)
    }

    async fn get_last_operation(
        &self,
        document_id: &str,
        scope: &str,
        branch: &str,
    ) -> Result<Option<Operation>, StrandError> {
        let prefix = log_prefix(document_id, scope, branch);
        match self.operations.scan_prefix(prefix).next_back() {
            Some(item) => {
                let (_, value) = item?;
                Ok(Some(decode(&value)?))
            }
            None => Ok(None),
        }
    }

    async fn list_scopes(&self, document_id: &str) -> Result<Vec<ScopeRevision>, StrandError> {
        let prefix = document_prefix(document_id);
        let mut scopes: Vec<ScopeRevision> = Vec::new();
        for item in self.operations.scan_prefix(&prefix) {
            let (key, value) = item?;
            let Some((scope, branch)) = parse_log_key(&key, prefix.len()) else {
                continue;
            };
            let op: Operation = decode(&value)?;
            match scopes.last_mut() {
                Some(last) if last.scope == scope && last.branch == branch => {
                    last.revision = op.index;
                }
                _ => scopes.push(ScopeRevision {
                    scope,
                    branch,
                    revision: op.index,
                }),
            }
        }
        Ok(scopes)
    }
}

#[async_trait]
impl ListenerStorage for SledStore {
    async fn save_listener(&self, state: &ListenerState) -> Result<(), StrandError> {
        self.listeners.insert(
            state.listener.listener_id.as_bytes(),
            serde_json::to_vec(state)?,
        )?;
        Ok(())
    }

    async fn remove_listener(&self, listener_id: &str) -> Result<(), StrandError> {
        self.listeners.remove(listener_id.as_bytes())?;
        Ok(())
    }

    async fn list_listeners(&self) -> Result<Vec<ListenerState>, StrandError> {
        scan_values(&self.listeners)
    }
}

#[async_trait]
impl SyncRemoteStorage for SledStore {
    async fn list(&self) -> Result<Vec<RemoteRecord>, StrandError> {
        scan_values(&self.remotes)
    }

    async fn get(&self, name: &str) -> Result<Option<RemoteRecord>, StrandError> {
        match self.remotes.get(name.as_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn upsert(&self, record: &RemoteRecord) -> Result<(), StrandError> {
        self.remotes
            .insert(record.name.as_bytes(), serde_json::to_vec(record)?)?;
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<(), StrandError> {
        self.remotes.remove(name.as_bytes())?;
        Ok(())
    }
}

#[async_trait]
impl SyncCursorStorage for SledStore {
    async fn list(&self) -> Result<Vec<RemoteCursor>, StrandError> {
        scan_values(&self.cursors)
    }

    async fn get(&self, remote_name: &str) -> Result<Option<RemoteCursor>, StrandError> {
        match self.cursors.get(remote_name.as_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn upsert(&self, cursor: &RemoteCursor) -> Result<(), StrandError> {
        self.cursors
            .insert(cursor.remote_name.as_bytes(), serde_json::to_vec(cursor)?)?;
        Ok(())
    }

    async fn remove(&self, remote_name: &str) -> Result<(), StrandError> {
        self.cursors.remove(remote_name.as_bytes())?;
        Ok(())
    }
}
