use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use libstrand_core::event_bus::EventType;
use libstrand_core::store::{
    DocumentHeader, DocumentOperationStorage, MemoryStore, ScopeRevision, SledStore,
};
use libstrand_core::types::ids::drive_collection_id;
use libstrand_core::types::job::JobStatus;
use libstrand_core::types::operation::{
    DOCUMENT_SCOPE, DRIVE_DOCUMENT_TYPE, GLOBAL_SCOPE, MAIN_BRANCH,
};
use libstrand_core::{
    Action, EventBus, InMemoryOperationIndex, Operation, ReactorEvent, StrandError,
};
use libstrand_reactor::{
    BatchJobPlan, JobKind, Reactor, ReactorError, ReactorOptions, RequestMeta,
};
use serde_json::json;
use tempfile::tempdir;

fn reactor_with(storage: Arc<dyn DocumentOperationStorage>) -> (Reactor, Arc<EventBus>) {
    let bus = Arc::new(EventBus::new());
    let options = ReactorOptions {
        max_retries: 2,
        read_model_timeout: Duration::from_secs(5),
    };
    let reactor = Reactor::new(
        storage,
        Arc::new(InMemoryOperationIndex::new()),
        bus.clone(),
        options,
    );
    reactor.start();
    (reactor, bus)
}

/// Records (event type, job id) for every job event
fn record_events(bus: &EventBus) -> Arc<Mutex<Vec<(EventType, String)>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    for event_type in [
        EventType::JobRunning,
        EventType::JobWriteReady,
        EventType::JobFailed,
    ] {
        let seen = seen.clone();
        let _subscription = bus.subscribe(event_type, move |event: Arc<ReactorEvent>| {
            let seen = seen.clone();
            async move {
                seen.lock()
                    .unwrap()
                    .push((event.event_type(), event.job_id().to_string()));
                Ok(())
            }
        });
    }
    seen
}

fn set_name(name: &str) -> Action {
    Action::new("SET_NAME", GLOBAL_SCOPE, json!({ "name": name }))
}

fn plan(key: &str, document_id: &str, actions: Vec<Action>, deps: &[&str]) -> BatchJobPlan {
    BatchJobPlan {
        key: key.to_string(),
        document_id: document_id.to_string(),
        scope: GLOBAL_SCOPE.to_string(),
        branch: MAIN_BRANCH.to_string(),
        kind: JobKind::Mutate { actions },
        depends_on: deps.iter().map(|d| d.to_string()).collect(),
    }
}

#[tokio::test]
async fn batch_runs_in_dependency_order() {
    let (reactor, bus) = reactor_with(Arc::new(MemoryStore::new()));
    let events = record_events(&bus);
    for doc in ["doc-a", "doc-b"] {
        let job = reactor
            .create(doc, "test/doc", RequestMeta::default())
            .await
            .unwrap();
        reactor.wait_for_job(&job.id).await.unwrap();
    }
    events.lock().unwrap().clear();

    let result = reactor
        .execute_batch(
            vec![
                plan("second", "doc-b", vec![set_name("b")], &["first"]),
                plan("first", "doc-a", vec![set_name("a")], &[]),
            ],
            RequestMeta::default(),
        )
        .await
        .unwrap();
    let first = result.jobs["first"].id.clone();
    let second = result.jobs["second"].id.clone();

    assert_eq!(
        reactor.wait_for_job(&second).await.unwrap().status,
        JobStatus::ReadModelsReady
    );
    let written: Vec<String> = events
        .lock()
        .unwrap()
        .iter()
        .filter(|(event_type, _)| *event_type == EventType::JobWriteReady)
        .map(|(_, id)| id.clone())
        .collect();
    assert_eq!(written, vec![first, second]);
    reactor.shutdown().await;
}

#[tokio::test]
async fn dependents_of_a_failed_job_fail_and_independents_run() {
    let (reactor, _bus) = reactor_with(Arc::new(MemoryStore::new()));
    let job = reactor
        .create("doc-c", "test/doc", RequestMeta::default())
        .await
        .unwrap();
    reactor.wait_for_job(&job.id).await.unwrap();

    let result = reactor
        .execute_batch(
            vec![
                plan("missing", "doc-x", vec![set_name("x")], &[]),
                plan("dependent", "doc-c", vec![set_name("y")], &["missing"]),
                plan("independent", "doc-c", vec![set_name("z")], &[]),
            ],
            RequestMeta::default(),
        )
        .await
        .unwrap();

    let missing = reactor.wait_for_job(&result.jobs["missing"].id).await.unwrap();
    assert_eq!(missing.status, JobStatus::Failed);

    let dependent = reactor
        .wait_for_job(&result.jobs["dependent"].id)
        .await
        .unwrap();
    assert_eq!(dependent.status, JobStatus::Failed);
    assert!(dependent.error.unwrap().message.contains("dependency failed"));

    let independent = reactor
        .wait_for_job(&result.jobs["independent"].id)
        .await
        .unwrap();
    assert_eq!(independent.status, JobStatus::ReadModelsReady);
    reactor.shutdown().await;
}

#[tokio::test]
async fn invalid_batches_are_rejected_before_enqueue() {
    let (reactor, _bus) = reactor_with(Arc::new(MemoryStore::new()));
    let err = reactor
        .execute_batch(
            vec![
                plan("a", "doc-a", Vec::new(), &["b"]),
                plan("b", "doc-b", Vec::new(), &["a"]),
            ],
            RequestMeta::default(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ReactorError::InvalidBatch(_)));
    assert_eq!(reactor.queue().total_size(), 0);

    let not_load = reactor
        .load_batch(vec![plan("a", "doc-a", Vec::new(), &[])], RequestMeta::default())
        .await;
    assert!(not_load.is_err());
}

/// Storage whose first appends fail with a transient error
struct FlakyStore {
    inner: MemoryStore,
    failures_left: AtomicUsize,
}

#[async_trait]
impl DocumentOperationStorage for FlakyStore {
    async fn create_document(&self, header: DocumentHeader) -> Result<(), StrandError> {
        self.inner.create_document(header).await
    }

    async fn get_document(&self, document_id: &str) -> Result<Option<DocumentHeader>, StrandError> {
        self.inner.get_document(document_id).await
    }

    async fn mark_deleted(&self, document_id: &str) -> Result<(), StrandError> {
        self.inner.mark_deleted(document_id).await
    }

    async fn append_operations(
        &self,
        document_id: &str,
        scope: &str,
        branch: &str,
        operations: &[Operation],
    ) -> Result<(), StrandError> {
        if scope == GLOBAL_SCOPE
            && self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            return Err(StrandError::Internal("disk busy".into()));
        }
        self.inner
            .append_operations(document_id, scope, branch, operations)
            .await
    }

    async fn get_operations(
        &self,
        document_id: &str,
        scope: &str,
        branch: &str,
        from_revision: u64,
        limit: Option<usize>,
    ) -> Result<Vec<Operation>, StrandError> {
        self.inner
            .get_operations(document_id, scope, branch, from_revision, limit)
            .await
    }

    async fn get_last_operation(
        &self,
        document_id: &str,
        scope: &str,
        branch: &str,
    ) -> Result<Option<Operation>, StrandError> {
        self.inner.get_last_operation(document_id, scope, branch).await
    }

    async fn list_scopes(&self, document_id: &str) -> Result<Vec<ScopeRevision>, StrandError> {
        self.inner.list_scopes(document_id).await
    }
}

#[tokio::test]
async fn transient_storage_failures_are_retried() {
    let store = Arc::new(FlakyStore {
        inner: MemoryStore::new(),
        failures_left: AtomicUsize::new(2),
    });
    let (reactor, _bus) = reactor_with(store.clone());
    let created = reactor
        .create("doc", "test/doc", RequestMeta::default())
        .await
        .unwrap();
    reactor.wait_for_job(&created.id).await.unwrap();

    let job = reactor
        .mutate("doc", MAIN_BRANCH, vec![set_name("n")], RequestMeta::default())
        .await
        .unwrap();
    let info = reactor.wait_for_job(&job.id).await.unwrap();
    assert_eq!(info.status, JobStatus::ReadModelsReady);
    assert_eq!(info.error_history.len(), 2);
    assert_eq!(
        store.get_revision("doc", GLOBAL_SCOPE, MAIN_BRANCH).await.unwrap(),
        1
    );

    store.failures_left.store(5, Ordering::SeqCst);
    let job = reactor
        .mutate("doc", MAIN_BRANCH, vec![set_name("m")], RequestMeta::default())
        .await
        .unwrap();
    let info = reactor.wait_for_job(&job.id).await.unwrap();
    assert_eq!(info.status, JobStatus::Failed);
    assert_eq!(info.error_history.len(), 3);
    reactor.shutdown().await;
}

#[tokio::test]
async fn retry_after_partial_write_resumes_instead_of_recreating() {
    let store = Arc::new(FlakyStore {
        inner: MemoryStore::new(),
        failures_left: AtomicUsize::new(1),
    });
    let (reactor, bus) = reactor_with(store.clone());
    let written = Arc::new(Mutex::new(Vec::new()));
    let _subscription = bus.subscribe(EventType::JobWriteReady, {
        let written = written.clone();
        move |event: Arc<ReactorEvent>| {
            let written = written.clone();
            async move {
                if let ReactorEvent::JobWriteReady(ready) = event.as_ref() {
                    written.lock().unwrap().extend(ready.operations.clone());
                }
                Ok(())
            }
        }
    });

    let create = Action::new(
        "CREATE_DOCUMENT",
        DOCUMENT_SCOPE,
        json!({ "documentId": "doc", "documentType": "test/doc" }),
    );
    let job = reactor
        .mutate("doc", MAIN_BRANCH, vec![create, set_name("n")], RequestMeta::default())
        .await
        .unwrap();
    let info = reactor.wait_for_job(&job.id).await.unwrap();
    assert_eq!(info.status, JobStatus::ReadModelsReady);
    assert_eq!(info.error_history.len(), 1);

    assert_eq!(
        store.get_revision("doc", DOCUMENT_SCOPE, MAIN_BRANCH).await.unwrap(),
        1
    );
    assert_eq!(
        store.get_revision("doc", GLOBAL_SCOPE, MAIN_BRANCH).await.unwrap(),
        1
    );
    let written = written.lock().unwrap().clone();
    assert_eq!(written.len(), 2);
    assert!(written.iter().all(|op| op.ordinal.is_some()));
    assert_eq!(written[1].operation.action.input["name"], "n");
    reactor.shutdown().await;
}

#[tokio::test]
async fn drive_children_join_the_drive_collection() {
    let (reactor, bus) = reactor_with(Arc::new(MemoryStore::new()));
    let memberships = Arc::new(Mutex::new(Vec::new()));
    let _subscription = bus.subscribe(EventType::JobWriteReady, {
        let memberships = memberships.clone();
        move |event: Arc<ReactorEvent>| {
            let memberships = memberships.clone();
            async move {
                if let ReactorEvent::JobWriteReady(ready) = event.as_ref() {
                    memberships
                        .lock()
                        .unwrap()
                        .push(ready.collection_memberships.clone());
                }
                Ok(())
            }
        }
    });

    for (id, document_type) in [("drive", DRIVE_DOCUMENT_TYPE), ("file", "test/doc")] {
        let job = reactor
            .create(id, document_type, RequestMeta::default())
            .await
            .unwrap();
        reactor.wait_for_job(&job.id).await.unwrap();
    }
    let job = reactor
        .add_children("drive", &["file".to_string()], MAIN_BRANCH, RequestMeta::default())
        .await
        .unwrap();
    assert_eq!(
        reactor.wait_for_job(&job.id).await.unwrap().status,
        JobStatus::ReadModelsReady
    );

    let collection = drive_collection_id(MAIN_BRANCH, "drive");
    let seen = memberships.lock().unwrap().clone();
    assert_eq!(seen[0]["drive"], vec![collection.clone()]);
    assert!(seen[1].get("file").is_none());
    assert_eq!(seen[2]["drive"], vec![collection]);

    let ops = reactor
        .get_operations("drive", DOCUMENT_SCOPE, MAIN_BRANCH, 0)
        .await
        .unwrap();
    assert_eq!(ops.len(), 2);
    assert_eq!(ops[1].action.input["targetId"], "file");
    reactor.shutdown().await;
}

#[tokio::test]
async fn load_replays_remote_history_into_sled() {
    let (source, _bus) = reactor_with(Arc::new(MemoryStore::new()));
    let job = source
        .create("doc", "test/doc", RequestMeta::default())
        .await
        .unwrap();
    source.wait_for_job(&job.id).await.unwrap();
    let job = source
        .mutate("doc", MAIN_BRANCH, vec![set_name("a"), set_name("b")], RequestMeta::default())
        .await
        .unwrap();
    source.wait_for_job(&job.id).await.unwrap();

    let dir = tempdir().unwrap();
    let sled = Arc::new(SledStore::open(dir.path()).unwrap());
    let (target, _bus) = reactor_with(sled.clone());
    for scope in [DOCUMENT_SCOPE, GLOBAL_SCOPE] {
        let ops = source.get_operations("doc", scope, MAIN_BRANCH, 0).await.unwrap();
        let job = target
            .load("doc", MAIN_BRANCH, ops, RequestMeta::from_remote("peer"))
            .await
            .unwrap();
        assert_eq!(
            target.wait_for_job(&job.id).await.unwrap().status,
            JobStatus::ReadModelsReady
        );
    }

    assert_eq!(
        target.get_operations("doc", GLOBAL_SCOPE, MAIN_BRANCH, 0).await.unwrap(),
        source.get_operations("doc", GLOBAL_SCOPE, MAIN_BRANCH, 0).await.unwrap()
    );
    assert_eq!(
        target.get_document("doc").await.unwrap().unwrap().document_type,
        "test/doc"
    );
    source.shutdown().await;
    target.shutdown().await;
}

#[tokio::test]
async fn shutdown_drains_queue_and_rejects_new_jobs() {
    let (reactor, _bus) = reactor_with(Arc::new(MemoryStore::new()));
    let job = reactor
        .create("doc", "test/doc", RequestMeta::default())
        .await
        .unwrap();
    reactor.shutdown().await;

    assert_eq!(reactor.get_job_status(&job.id).status, JobStatus::ReadModelsReady);
    let err = reactor
        .mutate("doc", MAIN_BRANCH, vec![set_name("late")], RequestMeta::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ReactorError::QueueBlocked));

    let unknown = reactor.get_job_status("never-submitted");
    assert_eq!(unknown.status, JobStatus::Failed);
    assert_eq!(unknown.error.unwrap().message, "Job not found");
}
