use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::StrandError;
use crate::operation_index::{FindOptions, IndexedOperation, OperationIndex, OperationIndexTxn};

const ENTRY_PREFIX: &[u8] = b"o\0";
const MEMBER_PREFIX: &[u8] = b"c\0";
/// First key past every entry
const ENTRY_END: &[u8] = b"o\x01";

/// Operation index in its own sled tree, so ordinals survive a restart
///
/// Entries live under `o\0<ordinal>` and collection memberships under
/// `c\0<collection>\0<document>`, which keeps a commit to one sled batch.
pub struct SledOperationIndex {
    tree: sled::Tree,
    /// Serializes ordinal assignment
    commit_lock: Mutex<()>,
}

impl SledOperationIndex {
    pub(super) fn open(db: &sled::Db) -> Result<Self, StrandError> {
        Ok(Self {
            tree: db.open_tree("operation_index")?,
            commit_lock: Mutex::new(()),
        })
    }

    fn last_ordinal(&self) -> Result<u64, StrandError> {
        match self.tree.scan_prefix(ENTRY_PREFIX).next_back() {
            Some(item) => {
                let (key, _) = item?;
                Ok(parse_ordinal(&key).unwrap_or(0))
            }
            None => Ok(0),
        }
    }

    fn members(&self, collection_id: &str) -> Result<BTreeSet<String>, StrandError> {
        let prefix = collection_prefix(collection_id);
        let mut members = BTreeSet::new();
        for item in self.tree.scan_prefix(&prefix) {
            let (key, _) = item?;
            if let Ok(document_id) = String::from_utf8(key[prefix.len()..].to_vec()) {
                members.insert(document_id);
            }
        }
        Ok(members)
    }

    /// Entries after `since_ordinal`, oldest first
    fn entries_after(
        &self,
        since_ordinal: u64,
    ) -> impl DoubleEndedIterator<Item = Result<IndexedOperation, StrandError>> {
        self.tree
            .range(entry_key(since_ordinal.saturating_add(1))..ENTRY_END.to_vec())
            .map(|item| -> Result<IndexedOperation, StrandError> {
                let (_, value) = item?;
                Ok(serde_json::from_slice(&value)?)
            })
    }
}

fn entry_key(ordinal: u64) -> Vec<u8> {
    let mut key = ENTRY_PREFIX.to_vec();
    key.extend_from_slice(&ordinal.to_be_bytes());
    key
}

fn parse_ordinal(key: &[u8]) -> Option<u64> {
    let bytes: [u8; 8] = key.get(ENTRY_PREFIX.len()..)?.try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}

fn collection_prefix(collection_id: &str) -> Vec<u8> {
    let mut key = MEMBER_PREFIX.to_vec();
    key.extend_from_slice(collection_id.as_bytes());
    key.push(0);
    key
}

fn member_key(collection_id: &str, document_id: &str) -> Vec<u8> {
    let mut key = collection_prefix(collection_id);
    key.extend_from_slice(document_id.as_bytes());
    key
}

#[async_trait]
impl OperationIndex for SledOperationIndex {
    async fn commit(&self, txn: OperationIndexTxn) -> Result<Vec<u64>, StrandError> {
        let _guard = self.commit_lock.lock().await;
        let (writes, added, removed) = txn.into_parts();

        let mut batch = sled::Batch::default();
        for (collection_id, document_id) in &added {
            batch.insert(member_key(collection_id, document_id), Vec::new());
        }
        for (collection_id, document_id) in &removed {
            batch.remove(member_key(collection_id, document_id));
        }

        let mut next = self.last_ordinal()?;
        let mut ordinals = Vec::with_capacity(writes.len());
        for (op, source_remote) in writes {
            next += 1;
            let entry = IndexedOperation {
                ordinal: next,
                operation: op.operation,
                context: op.context,
                source_remote,
            };
            batch.insert(entry_key(next), serde_json::to_vec(&entry)?);
            ordinals.push(next);
        }
        self.tree.apply_batch(batch)?;
        Ok(ordinals)
    }

    async fn find(
        &self,
        collection_id: &str,
        since_ordinal: u64,
        options: &FindOptions,
    ) -> Result<Vec<IndexedOperation>, StrandError> {
        let members = self.members(collection_id)?;
        if members.is_empty() {
            return Ok(Vec::new());
        }
        let limit = options.limit.unwrap_or(usize::MAX);
        let mut found = Vec::new();
        for entry in self.entries_after(since_ordinal) {
            if found.len() >= limit {
                break;
            }
            let entry = entry?;
            if !members.contains(&entry.context.document_id) {
                continue;
            }
            if let (Some(excluded), Some(source)) =
                (&options.exclude_source_remote, &entry.source_remote)
            {
                if excluded == source {
                    continue;
                }
            }
            found.push(entry);
        }
        Ok(found)
    }

    async fn get_collections_for_documents(
        &self,
        document_ids: &[String],
    ) -> Result<HashMap<String, Vec<String>>, StrandError> {
        let mut result: HashMap<String, Vec<String>> = HashMap::new();
        for item in self.tree.scan_prefix(MEMBER_PREFIX) {
            let (key, _) = item?;
            let mut parts = key[MEMBER_PREFIX.len()..].splitn(2, |b| *b == 0);
            let (Some(collection), Some(document)) = (parts.next(), parts.next()) else {
                continue;
            };
            let document = String::from_utf8_lossy(document);
            if document_ids.iter().any(|id| *id == document) {
                result
                    .entry(document.into_owned())
                    .or_default()
                    .push(String::from_utf8_lossy(collection).into_owned());
            }
        }
        Ok(result)
    }

    async fn latest_ordinal(&self) -> Result<u64, StrandError> {
        self.last_ordinal()
    }

    async fn get_latest_ordinal(&self, collection_id: &str) -> Result<u64, StrandError> {
        let members = self.members(collection_id)?;
        for entry in self.entries_after(0).rev() {
            let entry = entry?;
            if members.contains(&entry.context.document_id) {
                return Ok(entry.ordinal);
            }
        }
        Ok(0)
    }

    async fn get_latest_timestamp_for_collection(
        &self,
        collection_id: &str,
    ) -> Result<Option<u64>, StrandError> {
        let members = self.members(collection_id)?;
        if members.is_empty() {
            return Ok(None);
        }
        let mut latest = None;
        for entry in self.entries_after(0) {
            let entry = entry?;
            if members.contains(&entry.context.document_id) {
                latest = latest.max(Some(entry.operation.timestamp_utc_ms));
            }
        }
        Ok(latest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SledStore;
    use crate::types::operation::{Action, Operation, OperationContext, OperationWithContext};
    use serde_json::json;

    fn op(doc: &str, index: u64) -> OperationWithContext {
        OperationWithContext {
            operation: Operation {
                id: format!("{doc}-{index}"),
                index,
                skip: 0,
                hash: format!("h{index}"),
                timestamp_utc_ms: 100 + index,
                action: Action::new("SET_NAME", "global", json!({})),
            },
            context: OperationContext {
                document_id: doc.to_string(),
                document_type: "test/doc".to_string(),
                scope: "global".to_string(),
                branch: "main".to_string(),
            },
            ordinal: None,
        }
    }

    #[tokio::test]
    async fn test_find_and_memberships() {
        let store = SledStore::temporary().unwrap();
        let index = store.operation_index().unwrap();
        let mut txn = OperationIndexTxn::new();
        txn.add_to_collection("main:drive", "a");
        txn.write(vec![op("a", 1), op("b", 1)], None);
        txn.write(vec![op("a", 2)], Some("remote-1"));
        assert_eq!(index.commit(txn).await.unwrap(), vec![1, 2, 3]);

        let found = index
            .find("main:drive", 0, &FindOptions::excluding("remote-1"))
            .await
            .unwrap();
        let ids: Vec<&str> = found.iter().map(|e| e.operation.id.as_str()).collect();
        assert_eq!(ids, vec!["a-1"]);
        assert_eq!(index.get_latest_ordinal("main:drive").await.unwrap(), 3);
        assert_eq!(
            index.get_latest_timestamp_for_collection("main:drive").await.unwrap(),
            Some(102)
        );

        let memberships = index
            .get_collections_for_documents(&["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        assert_eq!(memberships["a"], vec!["main:drive".to_string()]);
        assert!(memberships.get("b").is_none());

        let mut txn = OperationIndexTxn::new();
        txn.remove_from_collection("main:drive", "a");
        index.commit(txn).await.unwrap();
        assert!(index
            .find("main:drive", 0, &FindOptions::default())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_ordinals_continue_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = SledStore::open(dir.path()).unwrap();
            let index = store.operation_index().unwrap();
            let mut txn = OperationIndexTxn::new();
            txn.write(vec![op("a", 1), op("a", 2)], None);
            index.commit(txn).await.unwrap();
            store.flush().await.unwrap();
        }

        let store = SledStore::open(dir.path()).unwrap();
        let index = store.operation_index().unwrap();
        assert_eq!(index.latest_ordinal().await.unwrap(), 2);
        let mut txn = OperationIndexTxn::new();
        txn.write(vec![op("a", 3)], None);
        assert_eq!(index.commit(txn).await.unwrap(), vec![3]);
    }
}
