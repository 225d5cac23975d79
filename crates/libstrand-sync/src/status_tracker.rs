//! Per-document sync status derived from channel mailbox traffic

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

use crate::channel::Channel;
use crate::mailbox::Mailbox;
use crate::sync_operation::SyncOperation;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DocumentSyncStatus {
    Synced,
    Outgoing,
    Incoming,
    OutgoingAndIncoming,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MailboxKind {
    Inbox,
    Outbox,
    DeadLetter,
}

#[derive(Debug, Default, Clone, Copy)]
struct Counts {
    inbox: usize,
    outbox: usize,
    dead_letter: usize,
}

impl Counts {
    fn slot(&mut self, which: MailboxKind) -> &mut usize {
        match which {
            MailboxKind::Inbox => &mut self.inbox,
            MailboxKind::Outbox => &mut self.outbox,
            MailboxKind::DeadLetter => &mut self.dead_letter,
        }
    }
}

type ChangeCallback = Arc<dyn Fn(&str, DocumentSyncStatus) + Send + Sync>;

#[derive(Default)]
struct TrackerState {
    /// (remote, document) -> counts
    counts: HashMap<(String, String), Counts>,
    known: HashSet<String>,
    /// Bumped per remote on track/untrack so stale mailbox callbacks are ignored
    generations: HashMap<String, u64>,
    next_generation: u64,
    callbacks: Vec<(u64, ChangeCallback)>,
    next_callback: u64,
}

impl TrackerState {
    fn status(&self, document_id: &str) -> Option<DocumentSyncStatus> {
        if !self.known.contains(document_id) {
            return None;
        }
        let mut total = Counts::default();
        for ((_, doc), counts) in &self.counts {
            if doc == document_id {
                total.inbox += counts.inbox;
                total.outbox += counts.outbox;
                total.dead_letter += counts.dead_letter;
            }
        }
        Some(if total.dead_letter > 0 {
            DocumentSyncStatus::Error
        } else if total.outbox > 0 && total.inbox > 0 {
            DocumentSyncStatus::OutgoingAndIncoming
        } else if total.outbox > 0 {
            DocumentSyncStatus::Outgoing
        } else if total.inbox > 0 {
            DocumentSyncStatus::Incoming
        } else {
            DocumentSyncStatus::Synced
        })
    }
}

#[derive(Default)]
pub struct SyncStatusTracker {
    state: Mutex<TrackerState>,
}

impl SyncStatusTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// `None` for documents never seen in any mailbox
    pub fn get_status(&self, document_id: &str) -> Option<DocumentSyncStatus> {
        self.lock().status(document_id)
    }

    pub fn on_change<F>(&self, callback: F) -> u64
    where
        F: Fn(&str, DocumentSyncStatus) + Send + Sync + 'static,
    {
        let mut state = self.lock();
        state.next_callback += 1;
        let id = state.next_callback;
        state.callbacks.push((id, Arc::new(callback)));
        id
    }

    pub fn off_change(&self, id: u64) {
        self.lock().callbacks.retain(|(existing, _)| *existing != id);
    }

    /// Follow the mailboxes of a remote's channel
    pub fn track_remote(self: &Arc<Self>, remote_name: &str, channel: &dyn Channel) {
        let generation = {
            let mut state = self.lock();
            state.next_generation += 1;
            let generation = state.next_generation;
            state.generations.insert(remote_name.to_string(), generation);
            generation
        };
        let wire = |mailbox: &Mailbox, which: MailboxKind| {
            let tracker = Arc::downgrade(self);
            let remote = remote_name.to_string();
            mailbox.on_added(move |items| {
                if let Some(tracker) = tracker.upgrade() {
                    tracker.apply(&remote, generation, which, items, true);
                }
                Ok(())
            });
            let tracker = Arc::downgrade(self);
            let remote = remote_name.to_string();
            mailbox.on_removed(move |items| {
                if let Some(tracker) = tracker.upgrade() {
                    tracker.apply(&remote, generation, which, items, false);
                }
                Ok(())
            });
        };
        wire(channel.inbox().as_ref(), MailboxKind::Inbox);
        wire(channel.outbox().as_ref(), MailboxKind::Outbox);
        wire(channel.dead_letter().as_ref(), MailboxKind::DeadLetter);
    }

    /// Forget a remote's counts; affected documents are notified
    pub fn untrack_remote(&self, remote_name: &str) {
        let (changes, callbacks) = {
            let mut state = self.lock();
            if state.generations.remove(remote_name).is_none() {
                return;
            }
            let affected: Vec<String> = state
                .counts
                .keys()
                .filter(|(remote, _)| remote == remote_name)
                .map(|(_, doc)| doc.clone())
                .collect();
            let before: Vec<_> = affected.iter().map(|doc| state.status(doc)).collect();
            state.counts.retain(|(remote, _), _| remote != remote_name);
            let changes = collect_changes(&state, affected, before);
            (changes, state.callbacks.clone())
        };
        notify(&changes, &callbacks);
    }

    /// Drop all state without notifying
    pub fn clear(&self) {
        let mut state = self.lock();
        state.counts.clear();
        state.known.clear();
        state.generations.clear();
    }

    fn apply(
        &self,
        remote_name: &str,
        generation: u64,
        which: MailboxKind,
        items: &[Arc<SyncOperation>],
        added: bool,
    ) {
        let (changes, callbacks) = {
            let mut state = self.lock();
            if state.generations.get(remote_name) != Some(&generation) {
                return;
            }
            let mut affected: Vec<String> = Vec::new();
            for item in items {
                if which == MailboxKind::Inbox && item.remote_name.is_empty() {
                    continue;
                }
                if !affected.contains(&item.document_id) {
                    affected.push(item.document_id.clone());
                }
            }
            let before: Vec<_> = affected.iter().map(|doc| state.status(doc)).collect();
            for item in items {
                if which == MailboxKind::Inbox && item.remote_name.is_empty() {
                    continue;
                }
                state.known.insert(item.document_id.clone());
                let counts = state
                    .counts
                    .entry((remote_name.to_string(), item.document_id.clone()))
                    .or_default();
                let slot = counts.slot(which);
                *slot = if added { *slot + 1 } else { slot.saturating_sub(1) };
            }
            let changes = collect_changes(&state, affected, before);
            (changes, state.callbacks.clone())
        };
        notify(&changes, &callbacks);
    }
}

fn collect_changes(
    state: &TrackerState,
    affected: Vec<String>,
    before: Vec<Option<DocumentSyncStatus>>,
) -> Vec<(String, DocumentSyncStatus)> {
    affected
        .into_iter()
        .zip(before)
        .filter_map(|(doc, before)| match state.status(&doc) {
            Some(after) if Some(after) != before => Some((doc, after)),
            _ => None,
        })
        .collect()
}

fn notify(changes: &[(String, DocumentSyncStatus)], callbacks: &[(u64, ChangeCallback)]) {
    for (doc, status) in changes {
        for (_, callback) in callbacks {
            callback(doc, *status);
        }
    }
}
