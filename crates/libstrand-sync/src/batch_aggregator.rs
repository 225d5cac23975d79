//! Groups write-ready events of one job batch before routing
//!
//! A batch of more than one job is held until every job of the batch has
//! reported, then released as one [`PreparedBatch`]. A failure of any job in
//! the batch releases what has arrived so far.

use std::collections::{HashMap, HashSet};

use libstrand_core::event_bus::{JobFailedEvent, JobWriteReadyEvent};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct BatchEntry {
    pub event: JobWriteReadyEvent,
    /// Jobs of earlier entries in the same batch
    pub job_dependencies: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct PreparedBatch {
    /// document id -> collection ids, merged across all entries
    pub collection_memberships: HashMap<String, Vec<String>>,
    pub entries: Vec<BatchEntry>,
    /// Whether the events came from a multi-job batch
    pub is_batch: bool,
}

impl PreparedBatch {
    fn from_events(events: Vec<JobWriteReadyEvent>, is_batch: bool) -> Self {
        let mut batch = PreparedBatch {
            is_batch,
            ..Default::default()
        };
        let mut previous: Vec<String> = Vec::new();
        for event in events {
            for (document_id, collections) in &event.collection_memberships {
                let merged = batch
                    .collection_memberships
                    .entry(document_id.clone())
                    .or_default();
                for collection in collections {
                    if !merged.contains(collection) {
                        merged.push(collection.clone());
                    }
                }
            }
            let job_id = event.job_id.clone();
            batch.entries.push(BatchEntry {
                event,
                job_dependencies: previous.clone(),
            });
            previous.push(job_id);
        }
        batch
    }
}

#[derive(Debug, Default)]
struct PendingBatch {
    expected: HashSet<String>,
    arrived: Vec<JobWriteReadyEvent>,
    /// Jobs that failed or were already released
    reported: HashSet<String>,
}

impl PendingBatch {
    fn is_complete(&self) -> bool {
        self.expected.iter().all(|job_id| {
            self.reported.contains(job_id) || self.arrived.iter().any(|e| &e.job_id == job_id)
        })
    }
}

#[derive(Debug, Default)]
pub struct BatchAggregator {
    pending: HashMap<String, PendingBatch>,
}

impl BatchAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of batches still waiting for jobs
    pub fn pending_batches(&self) -> usize {
        self.pending.len()
    }

    /// Ids of operations waiting in incomplete batches
    pub fn held_operation_ids(&self) -> HashSet<String> {
        self.pending
            .values()
            .flat_map(|pending| &pending.arrived)
            .flat_map(|event| &event.operations)
            .map(|op| op.operation.id.clone())
            .collect()
    }

    pub fn write_ready(&mut self, event: JobWriteReadyEvent) -> Option<PreparedBatch> {
        if event.job_meta.batch_size() <= 1 || event.job_meta.batch_id.is_empty() {
            return Some(PreparedBatch::from_events(vec![event], false));
        }

        let batch_id = event.job_meta.batch_id.clone();
        let pending = self.pending.entry(batch_id.clone()).or_insert_with(|| PendingBatch {
            expected: event.job_meta.batch_job_ids.iter().cloned().collect(),
            ..Default::default()
        });
        pending.arrived.push(event);
        if !pending.is_complete() {
            debug!(batch = %batch_id, arrived = pending.arrived.len(), "Batch waiting for jobs");
            return None;
        }
        let pending = self.pending.remove(&batch_id)?;
        Some(PreparedBatch::from_events(pending.arrived, true))
    }

    /// Release whatever the failed job's batch has collected
    pub fn job_failed(&mut self, event: &JobFailedEvent) -> Option<PreparedBatch> {
        let meta = &event.job_meta;
        if meta.batch_id.is_empty() || meta.batch_size() <= 1 {
            return None;
        }
        let pending = self
            .pending
            .entry(meta.batch_id.clone())
            .or_insert_with(|| PendingBatch {
                expected: meta.batch_job_ids.iter().cloned().collect(),
                ..Default::default()
            });
        pending.reported.insert(event.job_id.clone());

        if pending.is_complete() {
            let pending = self.pending.remove(&meta.batch_id)?;
            if pending.arrived.is_empty() {
                return None;
            }
            return Some(PreparedBatch::from_events(pending.arrived, true));
        }
        if pending.arrived.is_empty() {
            return None;
        }
        debug!(batch = %meta.batch_id, job = %event.job_id, "Flushing partial batch after failure");
        let arrived = std::mem::take(&mut pending.arrived);
        pending
            .reported
            .extend(arrived.iter().map(|e| e.job_id.clone()));
        Some(PreparedBatch::from_events(arrived, true))
    }

    /// Drop every partial batch
    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use libstrand_core::types::job::JobMeta;
    use libstrand_core::types::operation::{Action, Operation, OperationContext, OperationWithContext};
    use serde_json::json;

    fn meta(batch: &str, jobs: &[&str]) -> JobMeta {
        JobMeta {
            batch_id: batch.into(),
            batch_job_ids: jobs.iter().map(|j| j.to_string()).collect(),
            source_remote: None,
        }
    }

    fn ready(job_id: &str, meta: JobMeta, doc: &str, collection: &str) -> JobWriteReadyEvent {
        JobWriteReadyEvent {
            job_id: job_id.into(),
            operations: Vec::new(),
            collection_memberships: HashMap::from([(doc.to_string(), vec![collection.to_string()])]),
            job_meta: meta,
        }
    }

    fn failed(job_id: &str, meta: JobMeta) -> JobFailedEvent {
        JobFailedEvent {
            job_id: job_id.into(),
            error: "boom".into(),
            job_meta: meta,
        }
    }

    #[test]
    fn test_single_job_is_released_immediately() {
        let mut aggregator = BatchAggregator::new();
        let batch = aggregator
            .write_ready(ready("j1", JobMeta::single("j1"), "doc-a", "c1"))
            .unwrap();
        assert!(!batch.is_batch);
        assert_eq!(batch.entries.len(), 1);
        assert!(batch.entries[0].job_dependencies.is_empty());
    }

    #[test]
    fn test_batch_waits_for_all_jobs() {
        let mut aggregator = BatchAggregator::new();
        let m = meta("b1", &["j1", "j2", "j2"]);
        assert!(aggregator.write_ready(ready("j1", m.clone(), "doc-a", "c1")).is_none());
        assert_eq!(aggregator.pending_batches(), 1);

        let batch = aggregator.write_ready(ready("j2", m, "doc-b", "c2")).unwrap();
        assert!(batch.is_batch);
        assert_eq!(batch.entries.len(), 2);
        assert!(batch.entries[0].job_dependencies.is_empty());
        assert_eq!(batch.entries[1].job_dependencies, vec!["j1".to_string()]);
        assert_eq!(batch.collection_memberships["doc-b"], vec!["c2".to_string()]);
        assert_eq!(aggregator.pending_batches(), 0);
    }

    #[test]
    fn test_failure_flushes_partial_batch() {
        let mut aggregator = BatchAggregator::new();
        let m = meta("b1", &["j1", "j2", "j3"]);
        assert!(aggregator.write_ready(ready("j1", m.clone(), "doc-a", "c1")).is_none());

        let batch = aggregator.job_failed(&failed("j2", m.clone())).unwrap();
        assert_eq!(batch.entries.len(), 1);
        assert!(aggregator.job_failed(&failed("j2", m.clone())).is_none());

        let rest = aggregator.write_ready(ready("j3", m, "doc-c", "c1")).unwrap();
        assert_eq!(rest.entries[0].event.job_id, "j3");
        assert_eq!(aggregator.pending_batches(), 0);
    }

    #[test]
    fn test_failure_without_batch_is_ignored() {
        let mut aggregator = BatchAggregator::new();
        assert!(aggregator.job_failed(&failed("j1", JobMeta::single("j1"))).is_none());
        assert_eq!(aggregator.pending_batches(), 0);
    }

    #[test]
    fn test_clear_drops_partial_batches() {
        let mut aggregator = BatchAggregator::new();
        let m = meta("b1", &["j1", "j2"]);
        assert!(aggregator.write_ready(ready("j1", m, "doc-a", "c1")).is_none());
        aggregator.clear();
        assert_eq!(aggregator.pending_batches(), 0);
    }

    #[test]
    fn test_held_operation_ids_follow_pending_batches() {
        let mut aggregator = BatchAggregator::new();
        let m = meta("b1", &["j1", "j2"]);
        let mut first = ready("j1", m.clone(), "doc-a", "c1");
        first.operations.push(OperationWithContext {
            operation: Operation {
                id: "op-1".into(),
                index: 1,
                skip: 0,
                hash: "h1".into(),
                timestamp_utc_ms: 1,
                action: Action::new("SET_NAME", "global", json!({})),
            },
            context: OperationContext {
                document_id: "doc-a".into(),
                document_type: "test/doc".into(),
                scope: "global".into(),
                branch: "main".into(),
            },
            ordinal: Some(1),
        });
        assert!(aggregator.write_ready(first).is_none());
        assert_eq!(aggregator.held_operation_ids(), HashSet::from(["op-1".to_string()]));

        aggregator.write_ready(ready("j2", m, "doc-b", "c1")).unwrap();
        assert!(aggregator.held_operation_ids().is_empty());
    }
}
