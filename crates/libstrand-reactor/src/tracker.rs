//! Job status tracking and waiting

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use libstrand_core::types::job::{ConsistencyToken, JobError, JobInfo, JobStatus};
use libstrand_core::types::operation::now_utc_ms;
use serde_json::Value;
use tokio::sync::watch;

use crate::error::ReactorError;

/// Latest known status of every job
pub struct JobTracker {
    jobs: RwLock<HashMap<String, JobInfo>>,
    /// Bumped on every change so awaiters re-check
    version: watch::Sender<u64>,
}

impl Default for JobTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl JobTracker {
    pub fn new() -> Self {
        let (version, _) = watch::channel(0);
        Self {
            jobs: RwLock::new(HashMap::new()),
            version,
        }
    }

    pub fn register(&self, info: JobInfo) {
        self.update(&info.id.clone(), |existing| *existing = info);
    }

    pub fn get(&self, job_id: &str) -> Option<JobInfo> {
        self.jobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(job_id)
            .cloned()
    }

    pub fn mark_running(&self, job_id: &str) {
        self.update(job_id, |info| info.status = JobStatus::Running);
    }

    pub fn mark_completed(&self, job_id: &str, token: ConsistencyToken, result: Option<Value>) {
        self.update(job_id, |info| {
            info.status = JobStatus::Completed;
            info.completed_at_utc_ms = Some(now_utc_ms());
            info.consistency_token = token;
            info.result = result;
        });
    }

    pub fn mark_read_models_ready(&self, job_id: &str) {
        self.update(job_id, |info| {
            if info.status == JobStatus::Completed {
                info.status = JobStatus::ReadModelsReady;
            }
        });
    }

    pub fn mark_failed(&self, job_id: &str, message: &str, history: Vec<JobError>) {
        self.update(job_id, |info| {
            let error = JobError {
                message: message.to_string(),
                at_utc_ms: now_utc_ms(),
            };
            info.status = JobStatus::Failed;
            info.completed_at_utc_ms = Some(error.at_utc_ms);
            info.error_history = history;
            info.error = Some(error);
        });
    }

    /// Record a failed attempt that will be retried
    pub fn record_retry(&self, job_id: &str, message: &str) {
        self.update(job_id, |info| {
            info.status = JobStatus::Pending;
            info.error_history.push(JobError {
                message: message.to_string(),
                at_utc_ms: now_utc_ms(),
            });
        });
    }

    fn update<F: FnOnce(&mut JobInfo)>(&self, job_id: &str, f: F) {
        {
            let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
            let info = jobs
                .entry(job_id.to_string())
                .or_insert_with(|| JobInfo::pending(job_id, now_utc_ms()));
            f(info);
        }
        self.version.send_modify(|v| *v += 1);
    }

    fn subscribe(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }
}

/// Resolves once jobs reach a final state
#[derive(Clone)]
pub struct JobAwaiter {
    tracker: Arc<JobTracker>,
}

impl JobAwaiter {
    pub fn new(tracker: Arc<JobTracker>) -> Self {
        Self { tracker }
    }

    /// Wait for `ReadModelsReady` or `Failed`; unknown jobs report "Job not found"
    pub async fn wait_for_job(
        &self,
        job_id: &str,
        timeout: Option<Duration>,
    ) -> Result<JobInfo, ReactorError> {
        let wait = self.wait_terminal(job_id);
        match timeout {
            Some(limit) => tokio::time::timeout(limit, wait)
                .await
                .map_err(|_| ReactorError::Timeout(job_id.to_string())),
            None => Ok(wait.await),
        }
    }

    async fn wait_terminal(&self, job_id: &str) -> JobInfo {
        let mut changes = self.tracker.subscribe();
        loop {
            match self.tracker.get(job_id) {
                None => return JobInfo::not_found(job_id),
                Some(info) if info.status.is_terminal() => return info,
                Some(_) => {}
            }
            if changes.changed().await.is_err() {
                return self
                    .tracker
                    .get(job_id)
                    .unwrap_or_else(|| JobInfo::not_found(job_id));
            }
        }
    }
}
