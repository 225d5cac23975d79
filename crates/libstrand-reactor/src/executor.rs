//! Serial job executor
//!
//! A single worker pulls runnable jobs from the [`JobQueue`], plans the new
//! operations in memory, writes them to storage, indexes them and then
//! announces the outcome on the event bus. Planning happens before any
//! write, so a rejected job leaves storage untouched. A job retried after a
//! storage failure resumes its staged writes instead of planning again.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use libstrand_core::event_bus::{JobFailedEvent, JobWriteReadyEvent};
use libstrand_core::hash::{chain_hash, ChainPosition};
use libstrand_core::store::{DocumentHeader, DocumentOperationStorage};
use libstrand_core::types::ids::{drive_collection_id, new_id, parse_operation_hash};
use libstrand_core::types::job::{ConsistencyCoordinate, ConsistencyToken};
use libstrand_core::types::operation::{
    action_types, CreateDocumentInput, RelationshipInput, DOCUMENT_SCOPE, DRIVE_DOCUMENT_TYPE,
};
use libstrand_core::{
    Action, EventBus, Operation, OperationContext, OperationIndex, OperationIndexTxn,
    OperationWithContext, ReactorEvent, StrandError,
};
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::ReactorError;
use crate::job::{Job, JobKind};
use crate::queue::JobQueue;
use crate::tracker::JobTracker;

/// Last operation of one scope while a job is planned
#[derive(Clone)]
struct Head {
    index: u64,
    hash: Option<String>,
}

/// Document header as it will look once the job's operations are applied
struct DocumentDraft {
    header: Option<DocumentHeader>,
    created: bool,
    deleted: bool,
}

/// Planned writes of a job, kept across retries so a retry resumes them
struct StagedJob {
    header: DocumentHeader,
    created: bool,
    deleted: bool,
    planned: Vec<Operation>,
    txn: OperationIndexTxn,
}

impl DocumentDraft {
    fn live_header(&self, document_id: &str) -> Result<&DocumentHeader, ReactorError> {
        match &self.header {
            None => Err(ReactorError::DocumentNotFound(document_id.to_string())),
            Some(header) if header.deleted => {
                Err(ReactorError::DocumentDeleted(document_id.to_string()))
            }
            Some(header) => Ok(header),
        }
    }
}

pub struct JobExecutor {
    storage: Arc<dyn DocumentOperationStorage>,
    index: Arc<dyn OperationIndex>,
    bus: Arc<EventBus>,
    tracker: Arc<JobTracker>,
    queue: Arc<JobQueue>,
    staged: Mutex<HashMap<String, StagedJob>>,
}

impl JobExecutor {
    pub fn new(
        storage: Arc<dyn DocumentOperationStorage>,
        index: Arc<dyn OperationIndex>,
        bus: Arc<EventBus>,
        tracker: Arc<JobTracker>,
        queue: Arc<JobQueue>,
    ) -> Self {
        Self {
            storage,
            index,
            bus,
            tracker,
            queue,
            staged: Mutex::new(HashMap::new()),
        }
    }

    /// Run the worker until `shutdown` flips to true
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("Job executor started");
            loop {
                while let Some(job) = self.queue.dequeue_next() {
                    self.process(job).await;
                }
                if *shutdown.borrow() {
                    break;
                }
                tokio::select! {
                    _ = self.queue.wait_available() => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Job executor stopped");
        })
    }

    /// Execute one dequeued job and report its outcome
    pub async fn process(&self, job: Job) {
        self.tracker.mark_running(&job.id);
        self.emit(ReactorEvent::JobRunning {
            job_id: job.id.clone(),
        })
        .await;

        match self.execute(&job).await {
            Ok(operations) => self.succeed(&job, operations).await,
            Err(e) if e.is_retryable() && job.retry_count < job.max_retries => {
                let message = e.to_string();
                warn!(
                    job = %job.id,
                    attempt = job.retry_count + 1,
                    error = %message,
                    "Job failed, retrying"
                );
                self.tracker.record_retry(&job.id, &message);
                self.queue.retry(&job.id, &message);
            }
            Err(e) => {
                self.take_staged(&job.id);
                self.fail(&job, e).await
            }
        }
    }

    async fn execute(&self, job: &Job) -> Result<Vec<OperationWithContext>, ReactorError> {
        if let Some(dependency) = self.queue.dependency_failed(job) {
            return Err(ReactorError::DependencyFailed(dependency));
        }

        let staged = match self.take_staged(&job.id) {
            Some(staged) => {
                debug!(job = %job.id, "Resuming staged writes");
                staged
            }
            None => self.plan(job).await?,
        };
        match self.write(job, &staged).await {
            Ok(written) => Ok(written),
            Err(e) => {
                if e.is_retryable() {
                    self.staged
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .insert(job.id.clone(), staged);
                }
                Err(e)
            }
        }
    }

    async fn plan(&self, job: &Job) -> Result<StagedJob, ReactorError> {
        let mut txn = OperationIndexTxn::new();
        let (draft, planned) = match &job.kind {
            JobKind::Mutate { actions } => self.plan_actions(job, actions, &mut txn).await?,
            JobKind::Load { operations } => self.plan_load(job, operations, &mut txn).await?,
        };
        let header = draft
            .header
            .ok_or_else(|| ReactorError::DocumentNotFound(job.document_id.clone()))?;
        Ok(StagedJob {
            header,
            created: draft.created,
            deleted: draft.deleted,
            planned,
            txn,
        })
    }

    /// Apply a staged job; steps a previous attempt already stored are skipped
    async fn write(
        &self,
        job: &Job,
        staged: &StagedJob,
    ) -> Result<Vec<OperationWithContext>, ReactorError> {
        if staged.created {
            match self.storage.get_document(&job.document_id).await? {
                Some(existing)
                    if existing.document_type == staged.header.document_type
                        && existing.created_at_utc_ms == staged.header.created_at_utc_ms => {}
                Some(_) => return Err(StrandError::DuplicatedId(job.document_id.clone()).into()),
                None => self.storage.create_document(staged.header.clone()).await?,
            }
        }
        let mut written = Vec::with_capacity(staged.planned.len());
        for (scope, operations) in group_by_scope(staged.planned.clone()) {
            let pending = self.unwritten(job, &scope, &operations).await?;
            if !pending.is_empty() {
                self.storage
                    .append_operations(&job.document_id, &scope, &job.branch, pending)
                    .await?;
            }
            let context = OperationContext {
                document_id: job.document_id.clone(),
                document_type: staged.header.document_type.clone(),
                scope,
                branch: job.branch.clone(),
            };
            written.extend(operations.into_iter().map(|operation| OperationWithContext {
                operation,
                context: context.clone(),
                ordinal: None,
            }));
        }
        if staged.deleted {
            self.storage.mark_deleted(&job.document_id).await?;
        }

        let mut txn = staged.txn.clone();
        txn.write(written.clone(), job.meta.source_remote.as_deref());
        let ordinals = self.index.commit(txn).await?;
        for (op, ordinal) in written.iter_mut().zip(ordinals) {
            op.ordinal = Some(ordinal);
        }
        debug!(job = %job.id, operations = written.len(), "Job written");
        Ok(written)
    }

    /// The tail of `operations` not yet in storage
    async fn unwritten<'a>(
        &self,
        job: &Job,
        scope: &str,
        operations: &'a [Operation],
    ) -> Result<&'a [Operation], ReactorError> {
        let Some(first) = operations.first() else {
            return Ok(operations);
        };
        let revision = self
            .storage
            .get_revision(&job.document_id, scope, &job.branch)
            .await?;
        if revision < first.index {
            return Ok(operations);
        }
        let stored = self
            .storage
            .get_operations(
                &job.document_id,
                scope,
                &job.branch,
                first.index.saturating_sub(1),
                Some(operations.len()),
            )
            .await?;
        let mut done = 0;
        for op in operations.iter().take_while(|op| op.index <= revision) {
            match stored.iter().find(|s| s.index == op.index) {
                Some(existing) if existing.hash == op.hash => done += 1,
                _ => {
                    return Err(ReactorError::HistoryConflict {
                        document_id: job.document_id.clone(),
                        scope: scope.to_string(),
                        index: op.index,
                    })
                }
            }
        }
        Ok(&operations[done..])
    }

    fn take_staged(&self, job_id: &str) -> Option<StagedJob> {
        self.staged
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(job_id)
    }

    /// Turn actions into operations chained onto the stored history
    async fn plan_actions(
        &self,
        job: &Job,
        actions: &[Action],
        txn: &mut OperationIndexTxn,
    ) -> Result<(DocumentDraft, Vec<Operation>), ReactorError> {
        let mut draft = self.load_draft(&job.document_id).await?;
        let mut heads: HashMap<String, Head> = HashMap::new();
        let mut planned = Vec::with_capacity(actions.len());

        for action in actions {
            let scope = if action.is_document_action() {
                DOCUMENT_SCOPE
            } else {
                action.scope.as_str()
            };
            if action.is_document_action() {
                apply_document_action(job, action, &mut draft, txn)?;
            } else {
                draft.live_header(&job.document_id)?;
            }

            let head = match heads.get(scope) {
                Some(head) => head.clone(),
                None => self.load_head(job, scope).await?,
            };
            let previous = head
                .hash
                .as_deref()
                .map(parse_operation_hash)
                .transpose()
                .map_err(StrandError::from)?;
            let index = head.index + 1;
            let mut action = action.clone();
            action.scope = scope.to_string();
            let hash = chain_hash(
                &ChainPosition {
                    document_id: &job.document_id,
                    scope,
                    branch: &job.branch,
                    index,
                    skip: 0,
                    previous: previous.as_ref(),
                },
                &action,
            );
            heads.insert(
                scope.to_string(),
                Head {
                    index,
                    hash: Some(hash.clone()),
                },
            );
            planned.push(Operation {
                id: new_id(),
                index,
                skip: 0,
                hash,
                timestamp_utc_ms: action.timestamp_utc_ms,
                action,
            });
        }
        Ok((draft, planned))
    }

    /// Keep the operations that extend the stored history.
    ///
    /// Operations already stored with the same hash are skipped; a different
    /// hash at a stored index is a conflict.
    async fn plan_load(
        &self,
        job: &Job,
        operations: &[Operation],
        txn: &mut OperationIndexTxn,
    ) -> Result<(DocumentDraft, Vec<Operation>), ReactorError> {
        let mut draft = self.load_draft(&job.document_id).await?;
        let stored_revision = self
            .storage
            .get_revision(&job.document_id, &job.scope, &job.branch)
            .await?;
        let mut expected = stored_revision;
        let mut planned = Vec::new();

        for op in operations {
            if op.index <= stored_revision {
                let stored = self
                    .storage
                    .get_operations(
                        &job.document_id,
                        &job.scope,
                        &job.branch,
                        op.index.saturating_sub(1),
                        Some(1),
                    )
                    .await?;
                match stored.first() {
                    Some(existing) if existing.index == op.index && existing.hash == op.hash => {
                        continue
                    }
                    _ => {
                        return Err(ReactorError::HistoryConflict {
                            document_id: job.document_id.clone(),
                            scope: job.scope.clone(),
                            index: op.index,
                        })
                    }
                }
            }
            if op.index.checked_sub(op.skip) != Some(expected + 1) {
                return Err(ReactorError::IndexGap {
                    document_id: job.document_id.clone(),
                    scope: job.scope.clone(),
                    expected,
                    got: op.index,
                });
            }
            expected = op.index;

            if op.action.is_document_action() {
                apply_document_action(job, &op.action, &mut draft, txn)?;
            } else {
                draft.live_header(&job.document_id)?;
            }
            let mut op = op.clone();
            op.action.scope = job.scope.clone();
            planned.push(op);
        }
        Ok((draft, planned))
    }

    async fn load_draft(&self, document_id: &str) -> Result<DocumentDraft, ReactorError> {
        Ok(DocumentDraft {
            header: self.storage.get_document(document_id).await?,
            created: false,
            deleted: false,
        })
    }

    async fn load_head(&self, job: &Job, scope: &str) -> Result<Head, ReactorError> {
        let last = self
            .storage
            .get_last_operation(&job.document_id, scope, &job.branch)
            .await?;
        Ok(match last {
            Some(op) => Head {
                index: op.index,
                hash: Some(op.hash),
            },
            None => Head {
                index: 0,
                hash: None,
            },
        })
    }

    async fn succeed(&self, job: &Job, operations: Vec<OperationWithContext>) {
        self.tracker
            .mark_completed(&job.id, consistency_token(&operations), None);

        let collection_memberships = match self
            .index
            .get_collections_for_documents(&[job.document_id.clone()])
            .await
        {
            Ok(memberships) => memberships,
            Err(e) => {
                warn!(job = %job.id, error = %e, "Failed to read collection memberships");
                HashMap::new()
            }
        };

        self.emit(ReactorEvent::JobWriteReady(JobWriteReadyEvent {
            job_id: job.id.clone(),
            operations: operations.clone(),
            collection_memberships,
            job_meta: job.meta.clone(),
        }))
        .await;
        self.emit(ReactorEvent::JobReadModelsReady {
            job_id: job.id.clone(),
            operations,
        })
        .await;
        self.tracker.mark_read_models_ready(&job.id);
        self.queue.complete(&job.id);
    }

    async fn fail(&self, job: &Job, error: ReactorError) {
        let message = error.to_string();
        warn!(
            job = %job.id,
            document = %job.document_id,
            error = %message,
            "Job failed"
        );
        let history = self
            .queue
            .fail(&job.id, &message)
            .map(|failed| failed.error_history)
            .unwrap_or_default();
        self.tracker.mark_failed(&job.id, &message, history);
        self.emit(ReactorEvent::JobFailed(JobFailedEvent {
            job_id: job.id.clone(),
            error: message,
            job_meta: job.meta.clone(),
        }))
        .await;
    }

    async fn emit(&self, event: ReactorEvent) {
        let job_id = event.job_id().to_string();
        let event_type = event.event_type();
        if let Err(e) = self.bus.emit(event).await {
            warn!(
                job = %job_id,
                event = event_type.as_str(),
                error = %e,
                "Event subscriber failed"
            );
        }
    }
}

/// Validate a document-scope action and record its effect on the draft
fn apply_document_action(
    job: &Job,
    action: &Action,
    draft: &mut DocumentDraft,
    txn: &mut OperationIndexTxn,
) -> Result<(), ReactorError> {
    match action.action_type.as_str() {
        action_types::CREATE_DOCUMENT => {
            if draft.header.is_some() {
                return Err(StrandError::DuplicatedId(job.document_id.clone()).into());
            }
            let input: CreateDocumentInput = parse_input(action)?;
            if input.document_id != job.document_id {
                return Err(ReactorError::InvalidAction(format!(
                    "CREATE_DOCUMENT for '{}' submitted on '{}'",
                    input.document_id, job.document_id
                )));
            }
            if input.document_type == DRIVE_DOCUMENT_TYPE {
                let collection = drive_collection_id(&job.branch, &job.document_id);
                txn.add_to_collection(&collection, &job.document_id);
            }
            draft.header = Some(DocumentHeader {
                id: input.document_id,
                document_type: input.document_type,
                created_at_utc_ms: action.timestamp_utc_ms,
                deleted: false,
            });
            draft.created = true;
        }
        action_types::DELETE_DOCUMENT => {
            draft.live_header(&job.document_id)?;
            if let Some(header) = draft.header.as_mut() {
                header.deleted = true;
            }
            draft.deleted = true;
        }
        action_types::ADD_RELATIONSHIP | action_types::REMOVE_RELATIONSHIP => {
            let header = draft.live_header(&job.document_id)?;
            let input: RelationshipInput = parse_input(action)?;
            if input.source_id.is_empty()
                || input.target_id.is_empty()
                || input.relationship_type.is_empty()
            {
                return Err(ReactorError::InvalidAction(format!(
                    "{} requires sourceId, targetId and relationshipType",
                    action.action_type
                )));
            }
            if input.source_id == input.target_id {
                return Err(ReactorError::InvalidAction(format!(
                    "{}: a document cannot relate to itself",
                    action.action_type
                )));
            }
            if input.source_id != job.document_id {
                return Err(ReactorError::InvalidAction(format!(
                    "{} source '{}' submitted on '{}'",
                    action.action_type, input.source_id, job.document_id
                )));
            }
            if header.document_type == DRIVE_DOCUMENT_TYPE {
                let collection = drive_collection_id(&job.branch, &input.source_id);
                if action.action_type == action_types::ADD_RELATIONSHIP {
                    txn.add_to_collection(&collection, &input.target_id);
                } else {
                    txn.remove_from_collection(&collection, &input.target_id);
                }
            }
        }
        _ => {}
    }
    Ok(())
}

fn parse_input<T: DeserializeOwned>(action: &Action) -> Result<T, ReactorError> {
    serde_json::from_value(action.input.clone())
        .map_err(|e| ReactorError::InvalidAction(format!("{}: {}", action.action_type, e)))
}

/// Split planned operations per scope, keeping first-seen scope order
fn group_by_scope(operations: Vec<Operation>) -> Vec<(String, Vec<Operation>)> {
    let mut groups: Vec<(String, Vec<Operation>)> = Vec::new();
    for op in operations {
        match groups.iter_mut().find(|(scope, _)| *scope == op.action.scope) {
            Some((_, ops)) => ops.push(op),
            None => groups.push((op.action.scope.clone(), vec![op])),
        }
    }
    groups
}

/// Highest written index per (document, scope, branch)
fn consistency_token(operations: &[OperationWithContext]) -> ConsistencyToken {
    let mut coordinates: Vec<ConsistencyCoordinate> = Vec::new();
    for op in operations {
        let context = &op.context;
        match coordinates.iter_mut().find(|c| {
            c.document_id == context.document_id
                && c.scope == context.scope
                && c.branch == context.branch
        }) {
            Some(coordinate) => {
                coordinate.operation_index = coordinate.operation_index.max(op.operation.index)
            }
            None => coordinates.push(ConsistencyCoordinate {
                document_id: context.document_id.clone(),
                scope: context.scope.clone(),
                branch: context.branch.clone(),
                operation_index: op.operation.index,
            }),
        }
    }
    ConsistencyToken { coordinates }
}

#[cfg(test)]
mod tests {
    use super::*;
    use libstrand_core::store::MemoryStore;
    use libstrand_core::types::job::{JobMeta, JobStatus};
    use libstrand_core::types::operation::{GLOBAL_SCOPE, MAIN_BRANCH};
    use libstrand_core::InMemoryOperationIndex;
    use serde_json::json;

    struct Fixture {
        executor: JobExecutor,
        storage: Arc<MemoryStore>,
        index: Arc<InMemoryOperationIndex>,
        tracker: Arc<JobTracker>,
        queue: Arc<JobQueue>,
    }

    fn fixture() -> Fixture {
        let storage = Arc::new(MemoryStore::new());
        let index = Arc::new(InMemoryOperationIndex::new());
        let tracker = Arc::new(JobTracker::new());
        let queue = Arc::new(JobQueue::new());
        let executor = JobExecutor::new(
            storage.clone(),
            index.clone(),
            Arc::new(EventBus::new()),
            tracker.clone(),
            queue.clone(),
        );
        Fixture {
            executor,
            storage,
            index,
            tracker,
            queue,
        }
    }

    fn mutate(id: &str, document_id: &str, actions: Vec<Action>) -> Job {
        Job {
            id: id.to_string(),
            document_id: document_id.to_string(),
            scope: actions
                .first()
                .map(|a| a.scope.clone())
                .unwrap_or_else(|| GLOBAL_SCOPE.to_string()),
            branch: MAIN_BRANCH.to_string(),
            kind: JobKind::Mutate { actions },
            created_at_utc_ms: 0,
            queue_hint: Vec::new(),
            retry_count: 0,
            max_retries: 3,
            error_history: Vec::new(),
            meta: JobMeta::single(id),
        }
    }

    fn create(document_id: &str, document_type: &str) -> Action {
        Action::new(
            action_types::CREATE_DOCUMENT,
            DOCUMENT_SCOPE,
            json!({ "documentId": document_id, "documentType": document_type }),
        )
    }

    async fn run(fixture: &Fixture, job: Job) -> JobStatus {
        let id = job.id.clone();
        fixture.tracker.register(libstrand_core::types::job::JobInfo::pending(&id, 0));
        fixture.queue.enqueue(job).unwrap();
        let job = fixture.queue.dequeue_next().unwrap();
        fixture.executor.process(job).await;
        fixture.tracker.get(&id).unwrap().status
    }

    #[tokio::test]
    async fn test_mutation_chains_hashes_per_scope() {
        let f = fixture();
        let actions = vec![
            create("doc", "test/doc"),
            Action::new("SET_NAME", GLOBAL_SCOPE, json!({ "name": "a" })),
            Action::new("SET_NAME", GLOBAL_SCOPE, json!({ "name": "b" })),
        ];
        assert_eq!(run(&f, mutate("j1", "doc", actions)).await, JobStatus::ReadModelsReady);

        let global = f
            .storage
            .get_operations("doc", GLOBAL_SCOPE, MAIN_BRANCH, 0, None)
            .await
            .unwrap();
        assert_eq!(global.iter().map(|o| o.index).collect::<Vec<_>>(), vec![1, 2]);
        assert_ne!(global[0].hash, global[1].hash);
        assert_eq!(
            f.storage
                .get_revision("doc", DOCUMENT_SCOPE, MAIN_BRANCH)
                .await
                .unwrap(),
            1
        );
        assert_eq!(f.index.len().await, 3);

        let info = f.tracker.get("j1").unwrap();
        assert_eq!(info.consistency_token.coordinates.len(), 2);
    }

    #[tokio::test]
    async fn test_rejected_job_writes_nothing() {
        let f = fixture();
        let actions = vec![
            create("doc", "test/doc"),
            Action::new(
                action_types::ADD_RELATIONSHIP,
                DOCUMENT_SCOPE,
                json!({ "sourceId": "doc", "targetId": "doc", "relationshipType": "child" }),
            ),
        ];
        assert_eq!(run(&f, mutate("j1", "doc", actions)).await, JobStatus::Failed);
        assert!(f.storage.get_document("doc").await.unwrap().is_none());
        assert_eq!(f.index.len().await, 0);
    }

    #[tokio::test]
    async fn test_actions_on_missing_or_deleted_documents_fail() {
        let f = fixture();
        let set = || Action::new("SET_NAME", GLOBAL_SCOPE, json!({}));
        assert_eq!(run(&f, mutate("j1", "doc", vec![set()])).await, JobStatus::Failed);
        let error = f.tracker.get("j1").unwrap().error.unwrap().message;
        assert!(error.contains("document not found"));

        let delete = Action::new(action_types::DELETE_DOCUMENT, DOCUMENT_SCOPE, json!({}));
        let actions = vec![create("doc", "test/doc"), delete];
        assert_eq!(run(&f, mutate("j2", "doc", actions)).await, JobStatus::ReadModelsReady);
        assert_eq!(run(&f, mutate("j3", "doc", vec![set()])).await, JobStatus::Failed);
        assert!(f.storage.get_document("doc").await.unwrap().unwrap().deleted);
    }

    #[tokio::test]
    async fn test_drive_relationships_update_collection() {
        let f = fixture();
        let drive_actions = vec![create("drive", DRIVE_DOCUMENT_TYPE)];
        run(&f, mutate("j1", "drive", drive_actions)).await;
        run(&f, mutate("j2", "child", vec![create("child", "test/doc")])).await;

        let relate = |action_type: &str| {
            Action::new(
                action_type,
                DOCUMENT_SCOPE,
                json!({ "sourceId": "drive", "targetId": "child", "relationshipType": "child" }),
            )
        };
        run(&f, mutate("j3", "drive", vec![relate(action_types::ADD_RELATIONSHIP)])).await;
        let collection = drive_collection_id(MAIN_BRANCH, "drive");
        let memberships = f
            .index
            .get_collections_for_documents(&["drive".to_string(), "child".to_string()])
            .await
            .unwrap();
        assert_eq!(memberships["drive"], vec![collection.clone()]);
        assert_eq!(memberships["child"], vec![collection]);

        run(&f, mutate("j4", "drive", vec![relate(action_types::REMOVE_RELATIONSHIP)])).await;
        let memberships = f
            .index
            .get_collections_for_documents(&["child".to_string()])
            .await
            .unwrap();
        assert!(!memberships.contains_key("child"));
    }

    #[tokio::test]
    async fn test_load_skips_known_operations_and_rejects_gaps() {
        let source = fixture();
        let actions = vec![
            create("doc", "test/doc"),
            Action::new("SET_NAME", GLOBAL_SCOPE, json!({ "name": "a" })),
            Action::new("SET_NAME", GLOBAL_SCOPE, json!({ "name": "b" })),
        ];
        run(&source, mutate("j1", "doc", actions)).await;
        let header_ops = source
            .storage
            .get_operations("doc", DOCUMENT_SCOPE, MAIN_BRANCH, 0, None)
            .await
            .unwrap();
        let global_ops = source
            .storage
            .get_operations("doc", GLOBAL_SCOPE, MAIN_BRANCH, 0, None)
            .await
            .unwrap();

        let target = fixture();
        let load = |id: &str, scope: &str, operations: Vec<Operation>| {
            let mut job = mutate(id, "doc", Vec::new());
            job.scope = scope.to_string();
            job.kind = JobKind::Load { operations };
            job
        };
        let status = run(&target, load("l1", DOCUMENT_SCOPE, header_ops)).await;
        assert_eq!(status, JobStatus::ReadModelsReady);
        let status = run(&target, load("l2", GLOBAL_SCOPE, global_ops[..1].to_vec())).await;
        assert_eq!(status, JobStatus::ReadModelsReady);
        // replaying the first operation alongside the second is fine
        let status = run(&target, load("l3", GLOBAL_SCOPE, global_ops.clone())).await;
        assert_eq!(status, JobStatus::ReadModelsReady);
        assert_eq!(
            target
                .storage
                .get_revision("doc", GLOBAL_SCOPE, MAIN_BRANCH)
                .await
                .unwrap(),
            2
        );

        let mut far = global_ops[1].clone();
        far.index = 5;
        assert_eq!(run(&target, load("l4", GLOBAL_SCOPE, vec![far])).await, JobStatus::Failed);

        let mut forged = global_ops[0].clone();
        forged.hash = "00".repeat(32);
        assert_eq!(run(&target, load("l5", GLOBAL_SCOPE, vec![forged])).await, JobStatus::Failed);
        let error = target.tracker.get("l5").unwrap().error.unwrap().message;
        assert!(error.contains("conflicts"));
    }
}
