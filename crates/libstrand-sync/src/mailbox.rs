//! Mailboxes of sync operations
//!
//! A mailbox holds sync operations by id and tells its subscribers about
//! additions and removals. Every `add`/`remove` call is one delivery carrying
//! all of its items. While paused, deliveries are held back and handed over
//! as a single batch on `resume` or `flush`.
//!
//! A buffered mailbox stores items right away but defers deliveries until no
//! change happened for `flush_after`, or until `max_queued` items are waiting.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use libstrand_core::config::SyncConfig;
use libstrand_core::event_bus::BoxError;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::error::MailboxCallbackError;
use crate::sync_operation::SyncOperation;

pub type MailboxCallback =
    Arc<dyn Fn(&[Arc<SyncOperation>]) -> Result<(), BoxError> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferPolicy {
    pub flush_after: Duration,
    pub max_queued: usize,
}

impl From<&SyncConfig> for BufferPolicy {
    fn from(config: &SyncConfig) -> Self {
        Self {
            flush_after: Duration::from_millis(config.outbox_flush_ms),
            max_queued: config.outbox_max_queued.max(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Added,
    Removed,
}

#[derive(Default)]
struct Pending {
    items: Vec<Arc<SyncOperation>>,
    timer: Option<JoinHandle<()>>,
}

impl Pending {
    fn push(&mut self, items: Vec<Arc<SyncOperation>>) {
        for item in items {
            upsert(&mut self.items, item);
        }
    }

    fn take(&mut self) -> Vec<Arc<SyncOperation>> {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        std::mem::take(&mut self.items)
    }
}

#[derive(Default)]
struct MailboxState {
    items: Vec<Arc<SyncOperation>>,
    latest_ordinal: u64,
    paused: bool,
    added: Pending,
    removed: Pending,
    on_added: Vec<MailboxCallback>,
    on_removed: Vec<MailboxCallback>,
}

impl MailboxState {
    fn pending(&mut self, direction: Direction) -> &mut Pending {
        match direction {
            Direction::Added => &mut self.added,
            Direction::Removed => &mut self.removed,
        }
    }

    fn callbacks(&self, direction: Direction) -> Vec<MailboxCallback> {
        match direction {
            Direction::Added => self.on_added.clone(),
            Direction::Removed => self.on_removed.clone(),
        }
    }
}

type Delivery = (Vec<Arc<SyncOperation>>, Vec<MailboxCallback>);

pub struct Mailbox {
    state: Mutex<MailboxState>,
    buffer: Option<BufferPolicy>,
    this: Weak<Mailbox>,
}

impl Mailbox {
    pub fn new() -> Arc<Self> {
        Self::build(None)
    }

    /// Mailbox whose deliveries are batched by `policy`
    pub fn buffered(policy: BufferPolicy) -> Arc<Self> {
        Self::build(Some(policy))
    }

    fn build(buffer: Option<BufferPolicy>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            state: Mutex::new(MailboxState::default()),
            buffer,
            this: this.clone(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, MailboxState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, id: &str) -> Option<Arc<SyncOperation>> {
        self.lock().items.iter().find(|item| item.id == id).cloned()
    }

    pub fn items(&self) -> Vec<Arc<SyncOperation>> {
        self.lock().items.clone()
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    /// Highest ordinal ever added to this mailbox (0 when none)
    pub fn latest_ordinal(&self) -> u64 {
        self.lock().latest_ordinal
    }

    pub fn on_added<F>(&self, callback: F)
    where
        F: Fn(&[Arc<SyncOperation>]) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        self.lock().on_added.push(Arc::new(callback));
    }

    pub fn on_removed<F>(&self, callback: F)
    where
        F: Fn(&[Arc<SyncOperation>]) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        self.lock().on_removed.push(Arc::new(callback));
    }

    /// Store items, replacing those with the same id
    pub fn add(&self, items: Vec<Arc<SyncOperation>>) -> Result<(), MailboxCallbackError> {
        if items.is_empty() {
            return Ok(());
        }
        let delivery = {
            let mut state = self.lock();
            for item in &items {
                if let Some(ordinal) = item.max_ordinal() {
                    state.latest_ordinal = state.latest_ordinal.max(ordinal);
                }
                upsert(&mut state.items, item.clone());
            }
            self.stage(&mut state, Direction::Added, items)
        };
        deliver(delivery)
    }

    /// Drop items by id; ids not held are ignored
    pub fn remove(&self, ids: &[String]) -> Result<(), MailboxCallbackError> {
        let delivery = {
            let mut state = self.lock();
            let mut removed = Vec::new();
            state.items.retain(|item| {
                if ids.contains(&item.id) {
                    removed.push(item.clone());
                    false
                } else {
                    true
                }
            });
            if removed.is_empty() {
                return Ok(());
            }
            self.stage(&mut state, Direction::Removed, removed)
        };
        deliver(delivery)
    }

    pub fn pause(&self) {
        self.lock().paused = true;
    }

    /// Unpause and deliver everything held back
    pub fn resume(&self) -> Result<(), MailboxCallbackError> {
        self.lock().paused = false;
        self.flush()
    }

    pub fn is_paused(&self) -> bool {
        self.lock().paused
    }

    /// Deliver everything held back without changing the paused state
    pub fn flush(&self) -> Result<(), MailboxCallbackError> {
        let (added, removed) = {
            let mut state = self.lock();
            (
                take_delivery(&mut state, Direction::Added),
                take_delivery(&mut state, Direction::Removed),
            )
        };
        let first = deliver(added);
        let second = deliver(removed);
        merge_results(first, second)
    }

    /// Decide whether a change is delivered now, held back, or left to a timer
    fn stage(
        &self,
        state: &mut MailboxState,
        direction: Direction,
        items: Vec<Arc<SyncOperation>>,
    ) -> Option<Delivery> {
        if state.paused {
            state.pending(direction).push(items);
            return None;
        }
        let Some(policy) = self.buffer else {
            return Some((items, state.callbacks(direction)));
        };

        let pending = state.pending(direction);
        pending.push(items);
        if pending.items.len() >= policy.max_queued {
            return take_delivery(state, direction);
        }
        if let Some(timer) = pending.timer.take() {
            timer.abort();
        }
        pending.timer = Some(self.schedule_flush(direction, policy.flush_after));
        None
    }

    fn schedule_flush(&self, direction: Direction, delay: Duration) -> JoinHandle<()> {
        let this = self.this.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(mailbox) = this.upgrade() else {
                return;
            };
            let delivery = {
                let mut state = mailbox.lock();
                if state.paused {
                    return;
                }
                let pending = state.pending(direction);
                // the timer is finishing; do not abort ourselves
                pending.timer = None;
                take_delivery(&mut state, direction)
            };
            if let Err(e) = deliver(delivery) {
                warn!(error = %e, "Buffered mailbox delivery failed");
            }
        })
    }
}

fn upsert(items: &mut Vec<Arc<SyncOperation>>, item: Arc<SyncOperation>) {
    match items.iter_mut().find(|existing| existing.id == item.id) {
        Some(existing) => *existing = item,
        None => items.push(item),
    }
}

fn take_delivery(state: &mut MailboxState, direction: Direction) -> Option<Delivery> {
    let items = state.pending(direction).take();
    if items.is_empty() {
        None
    } else {
        Some((items, state.callbacks(direction)))
    }
}

/// Run every callback, even after one fails
fn deliver(delivery: Option<Delivery>) -> Result<(), MailboxCallbackError> {
    let Some((items, callbacks)) = delivery else {
        return Ok(());
    };
    let errors = callbacks
        .iter()
        .filter_map(|callback| callback(&items).err())
        .collect();
    MailboxCallbackError::from_errors(errors)
}

fn merge_results(
    first: Result<(), MailboxCallbackError>,
    second: Result<(), MailboxCallbackError>,
) -> Result<(), MailboxCallbackError> {
    match (first, second) {
        (Ok(()), Ok(())) => Ok(()),
        (Err(e), Ok(())) | (Ok(()), Err(e)) => Err(e),
        (Err(mut a), Err(b)) => {
            a.errors.extend(b.errors);
            Err(a)
        }
    }
}
