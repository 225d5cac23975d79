//! In-process pub/sub of job lifecycle events
//!
//! Subscribers of an event type run one after another in registration order.
//! A subscriber added while an emit is in flight is not called for that emit.
//! Failures of individual subscribers do not stop the others; they are
//! returned together as an [`EventBusAggregateError`].

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use futures::future::BoxFuture;
use thiserror::Error;

use crate::types::job::JobMeta;
use crate::types::operation::OperationWithContext;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

type Handler = Arc<dyn Fn(Arc<ReactorEvent>) -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    JobPending,
    JobRunning,
    JobWriteReady,
    JobReadModelsReady,
    JobFailed,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::JobPending => "JOB_PENDING",
            EventType::JobRunning => "JOB_RUNNING",
            EventType::JobWriteReady => "JOB_WRITE_READY",
            EventType::JobReadModelsReady => "JOB_READ_MODELS_READY",
            EventType::JobFailed => "JOB_FAILED",
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobWriteReadyEvent {
    pub job_id: String,
    pub operations: Vec<OperationWithContext>,
    /// document id -> collection ids
    pub collection_memberships: HashMap<String, Vec<String>>,
    pub job_meta: JobMeta,
}

#[derive(Debug, Clone)]
pub struct JobFailedEvent {
    pub job_id: String,
    pub error: String,
    pub job_meta: JobMeta,
}

#[derive(Debug, Clone)]
pub enum ReactorEvent {
    JobPending { job_id: String, job_meta: JobMeta },
    JobRunning { job_id: String },
    JobWriteReady(JobWriteReadyEvent),
    JobReadModelsReady { job_id: String, operations: Vec<OperationWithContext> },
    JobFailed(JobFailedEvent),
}

impl ReactorEvent {
    pub fn event_type(&self) -> EventType {
        match self {
            ReactorEvent::JobPending { .. } => EventType::JobPending,
            ReactorEvent::JobRunning { .. } => EventType::JobRunning,
            ReactorEvent::JobWriteReady(_) => EventType::JobWriteReady,
            ReactorEvent::JobReadModelsReady { .. } => EventType::JobReadModelsReady,
            ReactorEvent::JobFailed(_) => EventType::JobFailed,
        }
    }

    pub fn job_id(&self) -> &str {
        match self {
            ReactorEvent::JobPending { job_id, .. }
            | ReactorEvent::JobRunning { job_id }
            | ReactorEvent::JobReadModelsReady { job_id, .. } => job_id,
            ReactorEvent::JobWriteReady(e) => &e.job_id,
            ReactorEvent::JobFailed(e) => &e.job_id,
        }
    }
}

/// Failures of one or more subscribers during a single emit
#[derive(Debug, Error)]
#[error("{} event handler(s) failed: {}", errors.len(), errors.join("; "))]
pub struct EventBusAggregateError {
    pub errors: Vec<String>,
}

#[derive(Default)]
struct Subscribers {
    by_type: HashMap<EventType, Vec<(u64, Handler)>>,
}

#[derive(Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Subscribers>>,
    next_id: AtomicU64,
}

/// Handle returned by `subscribe`; call `unsubscribe` to stop delivery
#[must_use = "dropping a Subscription keeps the handler registered"]
pub struct Subscription {
    subscribers: Weak<Mutex<Subscribers>>,
    event_type: EventType,
    id: u64,
}

impl Subscription {
    /// Idempotent
    pub fn unsubscribe(&self) {
        if let Some(subscribers) = self.subscribers.upgrade() {
            let mut subs = subscribers.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(handlers) = subs.by_type.get_mut(&self.event_type) {
                handlers.retain(|(id, _)| *id != self.id);
            }
        }
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F, Fut>(&self, event_type: EventType, handler: F) -> Subscription
    where
        F: Fn(Arc<ReactorEvent>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let handler: Handler = Arc::new(move |event| Box::pin(handler(event)));
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .by_type
            .entry(event_type)
            .or_default()
            .push((id, handler));
        Subscription {
            subscribers: Arc::downgrade(&self.subscribers),
            event_type,
            id,
        }
    }

    pub fn subscriber_count(&self, event_type: EventType) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .by_type
            .get(&event_type)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Deliver an event to the subscribers registered right now
    pub async fn emit(&self, event: ReactorEvent) -> Result<(), EventBusAggregateError> {
        let event_type = event.event_type();
        let handlers: Vec<Handler> = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .by_type
            .get(&event_type)
            .map(|handlers| handlers.iter().map(|(_, h)| h.clone()).collect())
            .unwrap_or_default();

        let event = Arc::new(event);
        let mut errors = Vec::new();
        for handler in handlers {
            if let Err(e) = handler(event.clone()).await {
                errors.push(e.to_string());
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(EventBusAggregateError { errors })
        }
    }
}
