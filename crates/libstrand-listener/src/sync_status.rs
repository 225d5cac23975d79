//! Push/pull synchronization status per drive or sync unit

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};

use libstrand_core::types::listener::{ErrorStatus, UpdateStatus};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncStatus {
    InitialSync,
    Syncing,
    Success,
    Conflict,
    Missing,
    Error,
}

impl From<UpdateStatus> for SyncStatus {
    fn from(status: UpdateStatus) -> Self {
        match status {
            UpdateStatus::Success => SyncStatus::Success,
            UpdateStatus::Conflict => SyncStatus::Conflict,
            UpdateStatus::Missing => SyncStatus::Missing,
            UpdateStatus::Error => SyncStatus::Error,
        }
    }
}

impl From<ErrorStatus> for SyncStatus {
    fn from(status: ErrorStatus) -> Self {
        UpdateStatus::from(status).into()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncDirection {
    Push,
    Pull,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct DirectionStatus {
    push: Option<SyncStatus>,
    pull: Option<SyncStatus>,
}

/// Order in which a status wins when push and pull disagree
const PRIORITY: [SyncStatus; 5] = [
    SyncStatus::Error,
    SyncStatus::Missing,
    SyncStatus::Conflict,
    SyncStatus::Syncing,
    SyncStatus::Success,
];

type ChangeCallback = Arc<dyn Fn(&str, SyncStatus) + Send + Sync>;

#[derive(Default)]
pub struct SyncStatusTracker {
    statuses: RwLock<HashMap<String, DirectionStatus>>,
    initial_sync: RwLock<HashSet<String>>,
    errors: RwLock<HashMap<String, String>>,
    callbacks: RwLock<Vec<ChangeCallback>>,
}

impl SyncStatusTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_change<F>(&self, callback: F)
    where
        F: Fn(&str, SyncStatus) + Send + Sync + 'static,
    {
        self.callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(callback));
    }

    pub fn start_initial_sync(&self, id: &str) {
        self.initial_sync
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.to_string());
    }

    pub fn finish_initial_sync(&self, id: &str) {
        let removed = self
            .initial_sync
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        if removed {
            self.notify(id);
        }
    }

    pub fn update_status(
        &self,
        id: &str,
        direction: SyncDirection,
        status: SyncStatus,
        error: Option<String>,
    ) {
        let before = self.get_status(id);
        {
            let mut statuses = self.statuses.write().unwrap_or_else(PoisonError::into_inner);
            let entry = statuses.entry(id.to_string()).or_default();
            match direction {
                SyncDirection::Push => entry.push = Some(status),
                SyncDirection::Pull => entry.pull = Some(status),
            }
        }
        {
            let mut errors = self.errors.write().unwrap_or_else(PoisonError::into_inner);
            match error {
                Some(message) => {
                    errors.insert(id.to_string(), message);
                }
                None if status == SyncStatus::Success => {
                    errors.remove(id);
                }
                None => {}
            }
        }
        if self.get_status(id) != before {
            self.notify(id);
        }
    }

    /// Combined status of both directions
    pub fn get_status(&self, id: &str) -> Option<SyncStatus> {
        let entry = *self
            .statuses
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)?;
        let status = PRIORITY
            .iter()
            .copied()
            .find(|p| entry.push == Some(*p) || entry.pull == Some(*p))?;

        let initial = self
            .initial_sync
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(id);
        if status == SyncStatus::Syncing && initial {
            Some(SyncStatus::InitialSync)
        } else {
            Some(status)
        }
    }

    pub fn get_direction_status(&self, id: &str, direction: SyncDirection) -> Option<SyncStatus> {
        let statuses = self.statuses.read().unwrap_or_else(PoisonError::into_inner);
        let entry = statuses.get(id)?;
        match direction {
            SyncDirection::Push => entry.push,
            SyncDirection::Pull => entry.pull,
        }
    }

    pub fn last_error(&self, id: &str) -> Option<String> {
        self.errors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    pub fn clear(&self, id: &str) {
        self.statuses
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        self.errors
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        self.initial_sync
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
    }

    fn notify(&self, id: &str) {
        let Some(status) = self.get_status(id) else {
            return;
        };
        let callbacks = self
            .callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for callback in callbacks {
            callback(id, status);
        }
    }
}
