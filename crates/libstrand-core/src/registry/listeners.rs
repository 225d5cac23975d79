use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::StrandError;
use crate::types::listener::{Listener, ListenerStatus, ListenerSyncUnitState};
use crate::types::sync_unit::SyncUnit;

use super::observable::{ObservableMap, ObserverId, RegistryEvent};

/// A listener with its acknowledgement state per sync unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenerState {
    pub listener: Listener,
    pub status: ListenerStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Keyed by sync unit id
    #[serde(default)]
    pub sync_units: HashMap<String, ListenerSyncUnitState>,
}

impl ListenerState {
    pub fn new(listener: Listener) -> Self {
        Self {
            listener,
            status: ListenerStatus::Created,
            last_error: None,
            sync_units: HashMap::new(),
        }
    }

    /// Last revision acknowledged for a sync unit (0 when never sent)
    pub fn listener_rev(&self, sync_unit_id: &str) -> u64 {
        self.sync_units
            .get(sync_unit_id)
            .map(|s| s.listener_rev)
            .unwrap_or(0)
    }

    /// Whether this listener lags behind the unit's revision
    pub fn is_outdated(&self, unit: &SyncUnit) -> bool {
        self.listener.drive_id == unit.drive_id
            && self.listener.filter.matches(unit)
            && self.listener_rev(&unit.id) < unit.revision
    }
}

/// Listener subscriptions keyed by listener id
pub struct ListenerRegistry {
    listeners: ObservableMap<ListenerState>,
}

impl Default for ListenerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self {
            listeners: ObservableMap::new("listener"),
        }
    }

    pub fn on<F>(&self, event: RegistryEvent, callback: F) -> ObserverId
    where
        F: Fn(&str, &ListenerState) + Send + Sync + 'static,
    {
        self.listeners.on(event, callback)
    }

    pub fn off(&self, id: ObserverId) -> bool {
        self.listeners.off(id)
    }

    pub fn add_listener(&self, listener: Listener) -> Result<(), StrandError> {
        let id = listener.listener_id.clone();
        self.listeners.insert_new(&id, ListenerState::new(listener))
    }

    /// Restore a persisted listener with its acknowledgement state
    pub fn restore(&self, state: ListenerState) -> Result<(), StrandError> {
        let id = state.listener.listener_id.clone();
        self.listeners.insert_new(&id, state)
    }

    /// Add or replace a listener definition, keeping known acknowledgement state
    pub fn set_listener(&self, listener: Listener) -> ListenerState {
        let id = listener.listener_id.clone();
        self.listeners
            .upsert_with(&id, ListenerState::new(listener), |existing, incoming| {
                existing.listener = incoming.listener;
                existing.status = ListenerStatus::Created;
                existing.last_error = None;
            })
    }

    pub fn remove_listener(&self, listener_id: &str) -> Option<ListenerState> {
        self.listeners.remove(listener_id)
    }

    pub fn remove_drive(&self, drive_id: &str) -> Vec<ListenerState> {
        self.listeners
            .remove_where(|state| state.listener.drive_id == drive_id)
    }

    pub fn get_listener(&self, listener_id: &str) -> Option<Listener> {
        self.listeners.get(listener_id).map(|state| state.listener)
    }

    pub fn get_listener_state(&self, listener_id: &str) -> Option<ListenerState> {
        self.listeners.get(listener_id)
    }

    pub fn listeners_for_drive(&self, drive_id: &str) -> Vec<ListenerState> {
        self.listeners
            .filter(|state| state.listener.drive_id == drive_id)
    }

    pub fn all(&self) -> Vec<ListenerState> {
        self.listeners.values()
    }

    /// Distinct drive ids with at least one listener, sorted
    pub fn drives(&self) -> Vec<String> {
        let mut drives: Vec<String> = self
            .listeners
            .values()
            .into_iter()
            .map(|state| state.listener.drive_id)
            .collect();
        drives.sort();
        drives.dedup();
        drives
    }

    /// Record the revision a listener holds for a sync unit
    pub fn update_listener_revision(
        &self,
        listener_id: &str,
        sync_unit_id: &str,
        revision: u64,
        last_updated: u64,
    ) -> Result<ListenerSyncUnitState, StrandError> {
        self.listeners.update(listener_id, |state| {
            let entry = ListenerSyncUnitState {
                listener_rev: revision,
                last_updated,
            };
            state.sync_units.insert(sync_unit_id.to_string(), entry);
            entry
        })
    }

    pub fn set_listener_status(
        &self,
        listener_id: &str,
        status: ListenerStatus,
        error: Option<String>,
    ) -> Result<(), StrandError> {
        self.listeners.update(listener_id, |state| {
            state.status = status;
            state.last_error = error;
        })
    }

    /// Drop a listener's state for the given sync units
    pub fn remove_sync_units(
        &self,
        listener_id: &str,
        sync_unit_ids: &[String],
    ) -> Result<(), StrandError> {
        self.listeners.update(listener_id, |state| {
            for id in sync_unit_ids {
                state.sync_units.remove(id);
            }
        })
    }

    /// Listeners whose drive and filter match the sync unit
    pub fn get_sync_unit_listeners(&self, unit: &SyncUnit) -> Vec<Listener> {
        self.listeners
            .filter(|state| {
                state.listener.drive_id == unit.drive_id && state.listener.filter.matches(unit)
            })
            .into_iter()
            .map(|state| state.listener)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::listener::{ListenerFilter, TransmitterType};

    fn listener(id: &str, scopes: &[&str]) -> Listener {
        let filter = ListenerFilter {
            scope: Some(scopes.iter().map(|s| s.to_string()).collect()),
            document_id: Some(vec!["*".into()]),
            ..Default::default()
        };
        Listener::new(id, "drive-1", filter, TransmitterType::Internal)
    }

    #[test]
    fn test_add_duplicate_listener() {
        let registry = ListenerRegistry::new();
        registry.add_listener(listener("l1", &["global"])).unwrap();
        let err = registry.add_listener(listener("l1", &["global"])).unwrap_err();
        assert!(matches!(err, StrandError::DuplicatedId(_)));
    }

    #[test]
    fn test_update_unknown_listener_revision() {
        let registry = ListenerRegistry::new();
        let err = registry
            .update_listener_revision("missing", "unit", 1, 0)
            .unwrap_err();
        assert!(matches!(err, StrandError::NotFound(_)));
    }

    #[test]
    fn test_update_listener_revision_is_idempotent() {
        let registry = ListenerRegistry::new();
        registry.add_listener(listener("l1", &["global"])).unwrap();
        registry.update_listener_revision("l1", "u1", 3, 100).unwrap();
        let first = registry.get_listener_state("l1").unwrap();
        registry.update_listener_revision("l1", "u1", 3, 100).unwrap();
        assert_eq!(registry.get_listener_state("l1").unwrap(), first);
        assert_eq!(first.listener_rev("u1"), 3);
        assert_eq!(first.listener_rev("u2"), 0);
    }

    #[test]
    fn test_set_listener_keeps_sync_unit_state() {
        let registry = ListenerRegistry::new();
        registry.add_listener(listener("l1", &["global"])).unwrap();
        registry.update_listener_revision("l1", "u1", 4, 1).unwrap();
        registry
            .set_listener_status("l1", ListenerStatus::Error, Some("boom".into()))
            .unwrap();

        let state = registry.set_listener(listener("l1", &["global", "local"]));
        assert_eq!(state.status, ListenerStatus::Created);
        assert_eq!(state.listener_rev("u1"), 4);
        assert_eq!(state.listener.filter.scope.as_ref().unwrap().len(), 2);
        assert!(state.last_error.is_none());
    }

    #[test]
    fn test_get_sync_unit_listeners() {
        let registry = ListenerRegistry::new();
        registry.add_listener(listener("global", &["global"])).unwrap();
        registry.add_listener(listener("local", &["local"])).unwrap();
        registry.add_listener(listener("none", &[])).unwrap();

        let unit = SyncUnit::new("drive-1", "doc", "t", "global", "main");
        let ids: Vec<String> = registry
            .get_sync_unit_listeners(&unit)
            .into_iter()
            .map(|l| l.listener_id)
            .collect();
        assert_eq!(ids, vec!["global".to_string()]);

        let other_drive = SyncUnit::new("drive-2", "doc", "t", "global", "main");
        assert!(registry.get_sync_unit_listeners(&other_drive).is_empty());
    }

    #[test]
    fn test_outdated_and_remove_sync_units() {
        let registry = ListenerRegistry::new();
        registry.add_listener(listener("l1", &["global"])).unwrap();
        let unit = SyncUnit::new("drive-1", "doc", "t", "global", "main").with_revision(2, 0);
        assert!(registry.get_listener_state("l1").unwrap().is_outdated(&unit));

        registry.update_listener_revision("l1", &unit.id, 2, 0).unwrap();
        assert!(!registry.get_listener_state("l1").unwrap().is_outdated(&unit));

        registry.remove_sync_units("l1", &[unit.id.clone()]).unwrap();
        assert!(registry.get_listener_state("l1").unwrap().is_outdated(&unit));
    }

    #[test]
    fn test_drives_are_distinct() {
        let registry = ListenerRegistry::new();
        registry.add_listener(listener("a", &["global"])).unwrap();
        registry.add_listener(listener("b", &["global"])).unwrap();
        assert_eq!(registry.drives(), vec!["drive-1".to_string()]);
        assert_eq!(registry.remove_drive("drive-1").len(), 2);
        assert!(registry.drives().is_empty());
    }
}
