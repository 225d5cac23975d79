//! In-memory job queue
//!
//! Jobs wait in arrival order. A job is handed out only when every job in
//! its `queue_hint` has finished and no other job of the same document is
//! executing. Failed jobs count as finished so their dependents are
//! released; the executor then fails those dependents itself.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use libstrand_core::types::job::JobError;
use libstrand_core::types::operation::now_utc_ms;
use tokio::sync::Notify;
use tracing::debug;

use crate::error::ReactorError;
use crate::job::Job;

type DrainedCallback = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Job>,
    /// Jobs handed out and not yet finished, by id
    executing: HashMap<String, Job>,
    completed: HashSet<String>,
    failed: HashSet<String>,
    paused: bool,
    blocked: bool,
    on_drained: Vec<DrainedCallback>,
}

impl QueueState {
    fn document_executing(&self, document_id: &str) -> bool {
        self.executing
            .values()
            .any(|job| job.document_id == document_id)
    }

    fn dependencies_met(&self, job: &Job) -> bool {
        job.queue_hint
            .iter()
            .all(|dep| self.completed.contains(dep) || self.failed.contains(dep))
    }

    fn is_drained(&self) -> bool {
        self.pending.is_empty() && self.executing.is_empty()
    }
}

#[derive(Default)]
pub struct JobQueue {
    state: Mutex<QueueState>,
    available: Notify,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn enqueue(&self, job: Job) -> Result<(), ReactorError> {
        {
            let mut state = self.lock();
            if state.blocked {
                return Err(ReactorError::QueueBlocked);
            }
            debug!(job = %job.id, key = %job.queue_key(), "Enqueued job");
            state.pending.push_back(job);
        }
        self.available.notify_one();
        Ok(())
    }

    /// Enqueue all jobs or none
    pub fn enqueue_all(&self, jobs: Vec<Job>) -> Result<(), ReactorError> {
        {
            let mut state = self.lock();
            if state.blocked {
                return Err(ReactorError::QueueBlocked);
            }
            debug!(jobs = jobs.len(), "Enqueued batch");
            state.pending.extend(jobs);
        }
        self.available.notify_one();
        Ok(())
    }

    /// Next runnable job, marked as executing
    pub fn dequeue_next(&self) -> Option<Job> {
        let mut state = self.lock();
        if state.paused {
            return None;
        }
        let position = state
            .pending
            .iter()
            .position(|job| state.dependencies_met(job) && !state.document_executing(&job.document_id))?;
        let job = state.pending.remove(position)?;
        state.executing.insert(job.id.clone(), job.clone());
        Some(job)
    }

    /// Resolves when a job may have become runnable
    pub async fn wait_available(&self) {
        self.available.notified().await;
    }

    pub fn complete(&self, job_id: &str) {
        let drained = {
            let mut state = self.lock();
            state.executing.remove(job_id);
            state.completed.insert(job_id.to_string());
            take_drained(&mut state)
        };
        self.finish(drained);
    }

    /// Record a failure; returns the failed job with the error in its history
    pub fn fail(&self, job_id: &str, error: &str) -> Option<Job> {
        let (job, drained) = {
            let mut state = self.lock();
            let job = state.executing.remove(job_id).map(|mut job| {
                job.error_history.push(JobError {
                    message: error.to_string(),
                    at_utc_ms: now_utc_ms(),
                });
                job
            });
            state.failed.insert(job_id.to_string());
            (job, take_drained(&mut state))
        };
        self.finish(drained);
        job
    }

    /// Put an executing job back at the front of the queue
    pub fn retry(&self, job_id: &str, error: &str) -> bool {
        let retried = {
            let mut state = self.lock();
            match state.executing.remove(job_id) {
                Some(mut job) => {
                    job.retry_count += 1;
                    job.error_history.push(JobError {
                        message: error.to_string(),
                        at_utc_ms: now_utc_ms(),
                    });
                    state.pending.push_front(job);
                    true
                }
                None => false,
            }
        };
        if retried {
            self.available.notify_one();
        }
        retried
    }

    /// Drop a job that has not started yet
    pub fn remove(&self, job_id: &str) -> bool {
        let mut state = self.lock();
        let before = state.pending.len();
        state.pending.retain(|job| job.id != job_id);
        state.pending.len() != before
    }

    /// Whether any of the job's dependencies failed
    pub fn dependency_failed(&self, job: &Job) -> Option<String> {
        let state = self.lock();
        job.queue_hint
            .iter()
            .find(|dep| state.failed.contains(*dep))
            .cloned()
    }

    pub fn size(&self, document_id: &str, scope: &str, branch: &str) -> usize {
        self.lock()
            .pending
            .iter()
            .filter(|job| job.document_id == document_id && job.scope == scope && job.branch == branch)
            .count()
    }

    pub fn total_size(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn pending_jobs(&self) -> Vec<Job> {
        self.lock().pending.iter().cloned().collect()
    }

    pub fn executing_job_ids(&self) -> Vec<String> {
        self.lock().executing.keys().cloned().collect()
    }

    pub fn pause(&self) {
        self.lock().paused = true;
    }

    pub fn resume(&self) {
        self.lock().paused = false;
        self.available.notify_one();
    }

    pub fn is_paused(&self) -> bool {
        self.lock().paused
    }

    /// Refuse new jobs; `on_drained` runs once nothing is pending or executing
    pub fn block(&self, on_drained: Option<DrainedCallback>) {
        let drained = {
            let mut state = self.lock();
            state.blocked = true;
            state.on_drained.extend(on_drained);
            take_drained(&mut state)
        };
        self.finish(drained);
    }

    pub fn unblock(&self) {
        let mut state = self.lock();
        state.blocked = false;
        state.on_drained.clear();
    }

    pub fn is_blocked(&self) -> bool {
        self.lock().blocked
    }

    pub fn is_drained(&self) -> bool {
        self.lock().is_drained()
    }

    fn finish(&self, drained: Vec<DrainedCallback>) {
        for callback in drained {
            callback();
        }
        self.available.notify_one();
    }
}

fn take_drained(state: &mut QueueState) -> Vec<DrainedCallback> {
    if state.blocked && state.is_drained() {
        std::mem::take(&mut state.on_drained)
    } else {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobKind;
    use libstrand_core::types::job::JobMeta;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn job(id: &str, document_id: &str, deps: &[&str]) -> Job {
        Job {
            id: id.to_string(),
            document_id: document_id.to_string(),
            scope: "global".to_string(),
            branch: "main".to_string(),
            kind: JobKind::Mutate {
                actions: Vec::new(),
            },
            created_at_utc_ms: 0,
            queue_hint: deps.iter().map(|d| d.to_string()).collect(),
            retry_count: 0,
            max_retries: 3,
            error_history: Vec::new(),
            meta: JobMeta::single(id),
        }
    }

    #[test]
    fn test_one_job_per_document_at_a_time() {
        let queue = JobQueue::new();
        queue.enqueue(job("j1", "doc-a", &[])).unwrap();
        queue.enqueue(job("j2", "doc-a", &[])).unwrap();
        queue.enqueue(job("j3", "doc-b", &[])).unwrap();

        assert_eq!(queue.dequeue_next().unwrap().id, "j1");
        assert_eq!(queue.dequeue_next().unwrap().id, "j3");
        assert!(queue.dequeue_next().is_none());

        queue.complete("j1");
        assert_eq!(queue.dequeue_next().unwrap().id, "j2");
    }

    #[test]
    fn test_dependencies_gate_dequeue() {
        let queue = JobQueue::new();
        queue.enqueue(job("child", "doc-b", &["parent"])).unwrap();
        queue.enqueue(job("parent", "doc-a", &[])).unwrap();

        assert_eq!(queue.dequeue_next().unwrap().id, "parent");
        assert!(queue.dequeue_next().is_none());

        let failed = queue.fail("parent", "boom").unwrap();
        assert_eq!(failed.error_history.len(), 1);
        let child = queue.dequeue_next().unwrap();
        assert_eq!(queue.dependency_failed(&child).as_deref(), Some("parent"));
    }

    #[test]
    fn test_retry_requeues_at_front() {
        let queue = JobQueue::new();
        queue.enqueue(job("j1", "doc-a", &[])).unwrap();
        queue.enqueue(job("j2", "doc-a", &[])).unwrap();
        queue.dequeue_next().unwrap();

        assert!(queue.retry("j1", "transient"));
        let again = queue.dequeue_next().unwrap();
        assert_eq!(again.id, "j1");
        assert_eq!(again.retry_count, 1);
        assert!(!queue.retry("unknown", "x"));
    }

    #[test]
    fn test_pause_and_remove() {
        let queue = JobQueue::new();
        queue.enqueue(job("j1", "doc-a", &[])).unwrap();
        queue.pause();
        assert!(queue.dequeue_next().is_none());
        queue.resume();
        assert_eq!(queue.size("doc-a", "global", "main"), 1);
        assert!(queue.remove("j1"));
        assert_eq!(queue.total_size(), 0);
    }

    #[test]
    fn test_block_rejects_and_reports_drain() {
        let queue = JobQueue::new();
        queue.enqueue(job("j1", "doc-a", &[])).unwrap();
        queue.dequeue_next().unwrap();

        let drained = Arc::new(AtomicBool::new(false));
        let d = drained.clone();
        queue.block(Some(Box::new(move || d.store(true, Ordering::SeqCst))));
        assert!(matches!(
            queue.enqueue(job("j2", "doc-a", &[])),
            Err(ReactorError::QueueBlocked)
        ));
        assert!(!drained.load(Ordering::SeqCst));

        queue.complete("j1");
        assert!(drained.load(Ordering::SeqCst));
        assert!(queue.is_drained());
    }
}
