//! Append-only, globally ordered index of written operations
//!
//! Every indexed operation gets an `ordinal`, strictly increasing across the
//! whole index. Collections group documents (e.g. a drive's contents); a
//! collection query returns operations of every member document, including
//! operations written before the document joined the collection.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::StrandError;
use crate::types::operation::{Operation, OperationContext, OperationWithContext};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexedOperation {
    pub ordinal: u64,
    pub operation: Operation,
    pub context: OperationContext,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_remote: Option<String>,
}

impl IndexedOperation {
    pub fn to_with_context(&self) -> OperationWithContext {
        OperationWithContext {
            operation: self.operation.clone(),
            context: self.context.clone(),
            ordinal: Some(self.ordinal),
        }
    }
}

/// Pending index writes, applied atomically by `commit`
#[derive(Debug, Clone, Default)]
pub struct OperationIndexTxn {
    writes: Vec<(OperationWithContext, Option<String>)>,
    added: Vec<(String, String)>,
    removed: Vec<(String, String)>,
}

impl OperationIndexTxn {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue operations, tagged with the remote they arrived from
    pub fn write(&mut self, operations: Vec<OperationWithContext>, source_remote: Option<&str>) {
        for op in operations {
            self.writes.push((op, source_remote.map(str::to_string)));
        }
    }

    pub fn add_to_collection(&mut self, collection_id: &str, document_id: &str) {
        self.added
            .push((collection_id.to_string(), document_id.to_string()));
    }

    pub fn remove_from_collection(&mut self, collection_id: &str, document_id: &str) {
        self.removed
            .push((collection_id.to_string(), document_id.to_string()));
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty() && self.added.is_empty() && self.removed.is_empty()
    }

    pub(crate) fn into_parts(self) -> (Vec<(OperationWithContext, Option<String>)>, Vec<(String, String)>, Vec<(String, String)>) {
        (self.writes, self.added, self.removed)
    }
}

#[derive(Debug, Clone, Default)]
pub struct FindOptions {
    /// Skip operations that arrived from this remote
    pub exclude_source_remote: Option<String>,
    pub limit: Option<usize>,
}

impl FindOptions {
    pub fn excluding(remote: &str) -> Self {
        Self {
            exclude_source_remote: Some(remote.to_string()),
            limit: None,
        }
    }
}

#[async_trait]
pub trait OperationIndex: Send + Sync {
    /// Apply a transaction; returns the ordinals assigned to its writes
    async fn commit(&self, txn: OperationIndexTxn) -> Result<Vec<u64>, StrandError>;

    /// Operations of the collection with `ordinal > since_ordinal`, in ordinal order
    async fn find(
        &self,
        collection_id: &str,
        since_ordinal: u64,
        options: &FindOptions,
    ) -> Result<Vec<IndexedOperation>, StrandError>;

    /// Collection ids each document currently belongs to
    async fn get_collections_for_documents(
        &self,
        document_ids: &[String],
    ) -> Result<HashMap<String, Vec<String>>, StrandError>;

    /// Highest ordinal assigned so far (0 when empty)
    async fn latest_ordinal(&self) -> Result<u64, StrandError>;

    /// Highest ordinal in the collection (0 when empty)
    async fn get_latest_ordinal(&self, collection_id: &str) -> Result<u64, StrandError>;

    async fn get_latest_timestamp_for_collection(
        &self,
        collection_id: &str,
    ) -> Result<Option<u64>, StrandError>;
}

#[derive(Default)]
struct IndexState {
    next_ordinal: u64,
    entries: Vec<IndexedOperation>,
    /// collection id -> member document ids
    collections: HashMap<String, BTreeSet<String>>,
}

impl IndexState {
    fn members(&self, collection_id: &str) -> Option<&BTreeSet<String>> {
        self.collections.get(collection_id)
    }
}

/// Operation index held in memory; readers never block each other
#[derive(Default)]
pub struct InMemoryOperationIndex {
    state: RwLock<IndexState>,
}

impl InMemoryOperationIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.entries.len()
    }
}

#[async_trait]
impl OperationIndex for InMemoryOperationIndex {
    async fn commit(&self, txn: OperationIndexTxn) -> Result<Vec<u64>, StrandError> {
        let mut state = self.state.write().await;
        for (collection_id, document_id) in txn.added {
            state
                .collections
                .entry(collection_id)
                .or_default()
                .insert(document_id);
        }
        for (collection_id, document_id) in txn.removed {
            if let Some(members) = state.collections.get_mut(&collection_id) {
                members.remove(&document_id);
            }
        }

        let mut ordinals = Vec::with_capacity(txn.writes.len());
        for (op, source_remote) in txn.writes {
            state.next_ordinal += 1;
            let ordinal = state.next_ordinal;
            state.entries.push(IndexedOperation {
                ordinal,
                operation: op.operation,
                context: op.context,
                source_remote,
            });
            ordinals.push(ordinal);
        }
        Ok(ordinals)
    }

    async fn find(
        &self,
        collection_id: &str,
        since_ordinal: u64,
        options: &FindOptions,
    ) -> Result<Vec<IndexedOperation>, StrandError> {
        let state = self.state.read().await;
        let Some(members) = state.members(collection_id) else {
            return Ok(Vec::new());
        };

        // entries are sorted by ordinal, so binary search the start
        let start = state.entries.partition_point(|e| e.ordinal <= since_ordinal);
        let limit = options.limit.unwrap_or(usize::MAX);
        let found = state.entries[start..]
            .iter()
            .filter(|e| members.contains(&e.context.document_id))
            .filter(|e| match (&options.exclude_source_remote, &e.source_remote) {
                (Some(excluded), Some(source)) => excluded != source,
                _ => true,
            })
            .take(limit)
            .cloned()
            .collect();
        Ok(found)
    }

    async fn get_collections_for_documents(
        &self,
        document_ids: &[String],
    ) -> Result<HashMap<String, Vec<String>>, StrandError> {
        let state = self.state.read().await;
        let mut result: HashMap<String, Vec<String>> = HashMap::new();
        let mut collection_ids: Vec<&String> = state.collections.keys().collect();
        collection_ids.sort();
        for collection_id in collection_ids {
            let members = &state.collections[collection_id];
            for document_id in document_ids {
                if members.contains(document_id) {
                    result
                        .entry(document_id.clone())
                        .or_default()
                        .push(collection_id.clone());
                }
            }
        }
        Ok(result)
    }

    async fn latest_ordinal(&self) -> Result<u64, StrandError> {
        Ok(self.state.read().await.next_ordinal)
    }

    async fn get_latest_ordinal(&self, collection_id: &str) -> Result<u64, StrandError> {
        let state = self.state.read().await;
        let Some(members) = state.members(collection_id) else {
            return Ok(0);
        };
        Ok(state
            .entries
            .iter()
            .rev()
            .find(|e| members.contains(&e.context.document_id))
            .map(|e| e.ordinal)
            .unwrap_or(0))
    }

    async fn get_latest_timestamp_for_collection(
        &self,
        collection_id: &str,
    ) -> Result<Option<u64>, StrandError> {
        let state = self.state.read().await;
        let Some(members) = state.members(collection_id) else {
            return Ok(None);
        };
        Ok(state
            .entries
            .iter()
            .filter(|e| members.contains(&e.context.document_id))
            .map(|e| e.operation.timestamp_utc_ms)
            .max())
    }
}
