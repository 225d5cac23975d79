//! Reactor facade: submit jobs, follow their status

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use libstrand_core::config::ReactorConfig;
use libstrand_core::store::{DocumentHeader, DocumentOperationStorage};
use libstrand_core::types::ids::new_id;
use libstrand_core::types::job::{JobInfo, JobMeta};
use libstrand_core::types::operation::{
    action_types, now_utc_ms, DOCUMENT_SCOPE, GLOBAL_SCOPE, MAIN_BRANCH,
};
use libstrand_core::{Action, EventBus, Operation, OperationIndex, ReactorEvent};
use serde_json::json;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::ReactorError;
use crate::executor::JobExecutor;
use crate::job::{validate_batch, BatchJobPlan, BatchResult, Job, JobKind};
use crate::queue::JobQueue;
use crate::tracker::{JobAwaiter, JobTracker};

#[derive(Debug, Clone, PartialEq)]
pub struct ReactorOptions {
    pub max_retries: u32,
    /// Bound for `wait_for_job`
    pub read_model_timeout: Duration,
}

impl Default for ReactorOptions {
    fn default() -> Self {
        ReactorConfig::default().into()
    }
}

impl From<ReactorConfig> for ReactorOptions {
    fn from(config: ReactorConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            read_model_timeout: Duration::from_millis(config.read_model_timeout_ms),
        }
    }
}

/// Caller metadata attached to submitted jobs
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestMeta {
    /// Remote the operations were received from
    pub source_remote: Option<String>,
}

impl RequestMeta {
    pub fn from_remote(remote: &str) -> Self {
        Self {
            source_remote: Some(remote.to_string()),
        }
    }
}

struct Worker {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

pub struct Reactor {
    storage: Arc<dyn DocumentOperationStorage>,
    bus: Arc<EventBus>,
    queue: Arc<JobQueue>,
    tracker: Arc<JobTracker>,
    awaiter: JobAwaiter,
    executor: Arc<JobExecutor>,
    options: ReactorOptions,
    worker: Mutex<Option<Worker>>,
}

impl Reactor {
    pub fn new(
        storage: Arc<dyn DocumentOperationStorage>,
        index: Arc<dyn OperationIndex>,
        bus: Arc<EventBus>,
        options: ReactorOptions,
    ) -> Self {
        let queue = Arc::new(JobQueue::new());
        let tracker = Arc::new(JobTracker::new());
        let executor = Arc::new(JobExecutor::new(
            storage.clone(),
            index,
            bus.clone(),
            tracker.clone(),
            queue.clone(),
        ));
        Self {
            storage,
            bus,
            queue,
            awaiter: JobAwaiter::new(tracker.clone()),
            tracker,
            executor,
            options,
            worker: Mutex::new(None),
        }
    }

    /// Spawn the executor worker; no-op when already running
    pub fn start(&self) {
        let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        if worker.is_some() {
            return;
        }
        let (stop, stopped) = watch::channel(false);
        let handle = self.executor.clone().spawn(stopped);
        *worker = Some(Worker { stop, handle });
        info!("Reactor started");
    }

    pub fn options(&self) -> &ReactorOptions {
        &self.options
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Apply actions to a document; the job scope is the first action's scope
    pub async fn mutate(
        &self,
        document_id: &str,
        branch: &str,
        actions: Vec<Action>,
        meta: RequestMeta,
    ) -> Result<JobInfo, ReactorError> {
        let scope = actions
            .first()
            .map(|action| action.scope.clone())
            .unwrap_or_else(|| GLOBAL_SCOPE.to_string());
        let job = self.new_job(document_id, &scope, branch, JobKind::Mutate { actions }, &meta);
        self.submit(job).await
    }

    pub async fn create(
        &self,
        document_id: &str,
        document_type: &str,
        meta: RequestMeta,
    ) -> Result<JobInfo, ReactorError> {
        let action = Action::new(
            action_types::CREATE_DOCUMENT,
            DOCUMENT_SCOPE,
            json!({ "documentId": document_id, "documentType": document_type }),
        );
        self.mutate(document_id, MAIN_BRANCH, vec![action], meta)
            .await
    }

    pub async fn delete(&self, document_id: &str, meta: RequestMeta) -> Result<JobInfo, ReactorError> {
        let action = Action::new(action_types::DELETE_DOCUMENT, DOCUMENT_SCOPE, json!({}));
        self.mutate(document_id, MAIN_BRANCH, vec![action], meta)
            .await
    }

    /// Append operations received from elsewhere; all must share one scope
    pub async fn load(
        &self,
        document_id: &str,
        branch: &str,
        operations: Vec<Operation>,
        meta: RequestMeta,
    ) -> Result<JobInfo, ReactorError> {
        let scope = single_scope(&operations)?;
        let job = self.new_job(document_id, &scope, branch, JobKind::Load { operations }, &meta);
        self.submit(job).await
    }

    pub async fn execute_batch(
        &self,
        plans: Vec<BatchJobPlan>,
        meta: RequestMeta,
    ) -> Result<BatchResult, ReactorError> {
        self.submit_batch(plans, meta).await
    }

    pub async fn load_batch(
        &self,
        plans: Vec<BatchJobPlan>,
        meta: RequestMeta,
    ) -> Result<BatchResult, ReactorError> {
        if let Some(plan) = plans.iter().find(|plan| !plan.kind.is_load()) {
            return Err(ReactorError::InvalidBatch(format!(
                "'{}' is not a load job",
                plan.key
            )));
        }
        self.submit_batch(plans, meta).await
    }

    pub async fn add_children(
        &self,
        parent_id: &str,
        child_ids: &[String],
        branch: &str,
        meta: RequestMeta,
    ) -> Result<JobInfo, ReactorError> {
        let actions = relationship_actions(action_types::ADD_RELATIONSHIP, parent_id, child_ids);
        self.mutate(parent_id, branch, actions, meta).await
    }

    pub async fn remove_children(
        &self,
        parent_id: &str,
        child_ids: &[String],
        branch: &str,
        meta: RequestMeta,
    ) -> Result<JobInfo, ReactorError> {
        let actions = relationship_actions(action_types::REMOVE_RELATIONSHIP, parent_id, child_ids);
        self.mutate(parent_id, branch, actions, meta).await
    }

    /// Unknown ids report `Failed` with "Job not found"
    pub fn get_job_status(&self, job_id: &str) -> JobInfo {
        self.tracker
            .get(job_id)
            .unwrap_or_else(|| JobInfo::not_found(job_id))
    }

    pub async fn wait_for_job(&self, job_id: &str) -> Result<JobInfo, ReactorError> {
        self.awaiter
            .wait_for_job(job_id, Some(self.options.read_model_timeout))
            .await
    }

    pub async fn get_document(&self, document_id: &str) -> Result<Option<DocumentHeader>, ReactorError> {
        Ok(self.storage.get_document(document_id).await?)
    }

    pub async fn get_operations(
        &self,
        document_id: &str,
        scope: &str,
        branch: &str,
        from_revision: u64,
    ) -> Result<Vec<Operation>, ReactorError> {
        Ok(self
            .storage
            .get_operations(document_id, scope, branch, from_revision, None)
            .await?)
    }

    /// Stop accepting jobs, let queued jobs finish, then stop the worker
    pub async fn shutdown(&self) {
        let (drained_tx, drained_rx) = oneshot::channel::<()>();
        self.queue.block(Some(Box::new(move || {
            let _ = drained_tx.send(());
        })));

        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(worker) = worker else {
            return;
        };
        if self.queue.is_paused() {
            warn!(
                pending = self.queue.total_size(),
                "Queue paused at shutdown, dropping pending jobs"
            );
        } else {
            let _ = drained_rx.await;
        }
        let _ = worker.stop.send(true);
        if let Err(e) = worker.handle.await {
            warn!(error = %e, "Job executor ended abnormally");
        }
        info!("Reactor shut down");
    }

    fn new_job(
        &self,
        document_id: &str,
        scope: &str,
        branch: &str,
        kind: JobKind,
        meta: &RequestMeta,
    ) -> Job {
        let id = new_id();
        let mut job_meta = JobMeta::single(&id);
        job_meta.source_remote = meta.source_remote.clone();
        Job {
            document_id: document_id.to_string(),
            scope: scope.to_string(),
            branch: branch.to_string(),
            kind,
            created_at_utc_ms: now_utc_ms(),
            queue_hint: Vec::new(),
            retry_count: 0,
            max_retries: self.options.max_retries,
            error_history: Vec::new(),
            meta: job_meta,
            id,
        }
    }

    async fn submit(&self, job: Job) -> Result<JobInfo, ReactorError> {
        let info = JobInfo::pending(&job.id, job.created_at_utc_ms);
        self.tracker.register(info.clone());
        self.announce(&job).await;

        let job_id = job.id.clone();
        if let Err(e) = self.queue.enqueue(job) {
            self.tracker.mark_failed(&job_id, &e.to_string(), Vec::new());
            return Err(e);
        }
        Ok(info)
    }

    async fn submit_batch(
        &self,
        plans: Vec<BatchJobPlan>,
        meta: RequestMeta,
    ) -> Result<BatchResult, ReactorError> {
        let order = validate_batch(&plans)?;
        let ids: HashMap<&str, String> = plans
            .iter()
            .map(|plan| (plan.key.as_str(), new_id()))
            .collect();
        let job_meta = JobMeta {
            batch_id: new_id(),
            batch_job_ids: plans
                .iter()
                .map(|plan| ids[plan.key.as_str()].clone())
                .collect(),
            source_remote: meta.source_remote,
        };

        let created_at_utc_ms = now_utc_ms();
        let mut infos = HashMap::with_capacity(plans.len());
        let mut jobs = Vec::with_capacity(plans.len());
        for position in order {
            let plan = &plans[position];
            let id = ids[plan.key.as_str()].clone();
            let info = JobInfo::pending(&id, created_at_utc_ms);
            self.tracker.register(info.clone());
            infos.insert(plan.key.clone(), info);
            jobs.push(Job {
                id,
                document_id: plan.document_id.clone(),
                scope: plan.scope.clone(),
                branch: plan.branch.clone(),
                kind: plan.kind.clone(),
                created_at_utc_ms,
                queue_hint: plan
                    .depends_on
                    .iter()
                    .map(|dep| ids[dep.as_str()].clone())
                    .collect(),
                retry_count: 0,
                max_retries: self.options.max_retries,
                error_history: Vec::new(),
                meta: job_meta.clone(),
            });
        }
        for job in &jobs {
            self.announce(job).await;
        }

        let job_ids: Vec<String> = jobs.iter().map(|job| job.id.clone()).collect();
        if let Err(e) = self.queue.enqueue_all(jobs) {
            for id in &job_ids {
                self.queue.remove(id);
                self.tracker
                    .mark_failed(id, "Batch enqueue failed", Vec::new());
            }
            warn!(batch = %job_meta.batch_id, error = %e, "Batch enqueue failed");
            return Err(e);
        }
        Ok(BatchResult { jobs: infos })
    }

    async fn announce(&self, job: &Job) {
        let event = ReactorEvent::JobPending {
            job_id: job.id.clone(),
            job_meta: job.meta.clone(),
        };
        if let Err(e) = self.bus.emit(event).await {
            warn!(job = %job.id, error = %e, "Event subscriber failed");
        }
    }
}

fn relationship_actions(action_type: &str, parent_id: &str, child_ids: &[String]) -> Vec<Action> {
    child_ids
        .iter()
        .map(|child_id| {
            Action::new(
                action_type,
                DOCUMENT_SCOPE,
                json!({
                    "sourceId": parent_id,
                    "targetId": child_id,
                    "relationshipType": "child",
                }),
            )
        })
        .collect()
}

fn single_scope(operations: &[Operation]) -> Result<String, ReactorError> {
    let Some(first) = operations.first() else {
        return Ok(GLOBAL_SCOPE.to_string());
    };
    let scope = &first.action.scope;
    if let Some(other) = operations.iter().find(|op| &op.action.scope != scope) {
        return Err(ReactorError::InvalidAction(format!(
            "load mixes scopes '{}' and '{}'",
            scope, other.action.scope
        )));
    }
    Ok(scope.clone())
}
