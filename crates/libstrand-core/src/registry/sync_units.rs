use crate::error::StrandError;
use crate::types::sync_unit::{SyncUnit, SyncUnitQuery};

use super::observable::{ObservableMap, ObserverId, RegistryEvent};

/// Sync units with their latest revision.
///
/// Revisions only move forward: a lower revision never replaces a higher one.
pub struct SyncUnitRegistry {
    units: ObservableMap<SyncUnit>,
}

impl Default for SyncUnitRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncUnitRegistry {
    pub fn new() -> Self {
        Self {
            units: ObservableMap::new("sync unit"),
        }
    }

    pub fn on<F>(&self, event: RegistryEvent, callback: F) -> ObserverId
    where
        F: Fn(&str, &SyncUnit) + Send + Sync + 'static,
    {
        self.units.on(event, callback)
    }

    pub fn off(&self, id: ObserverId) -> bool {
        self.units.off(id)
    }

    pub fn add_sync_unit(&self, unit: SyncUnit) -> Result<(), StrandError> {
        let id = unit.id.clone();
        self.units.insert_new(&id, unit)
    }

    pub fn get(&self, id: &str) -> Option<SyncUnit> {
        self.units.get(id)
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Advance the revision of a known sync unit
    pub fn update_sync_unit_revision(
        &self,
        id: &str,
        revision: u64,
        last_updated: u64,
    ) -> Result<SyncUnit, StrandError> {
        self.units.update(id, |unit| {
            if revision > unit.revision {
                unit.revision = revision;
                unit.last_updated = last_updated;
            }
            unit.clone()
        })
    }

    /// Add the unit, or advance the revision of an existing one
    pub fn upsert_revision(&self, unit: SyncUnit) -> SyncUnit {
        let id = unit.id.clone();
        self.units.upsert_with(&id, unit, |existing, incoming| {
            if incoming.revision > existing.revision {
                existing.revision = incoming.revision;
                existing.last_updated = incoming.last_updated;
            }
        })
    }

    pub fn remove_sync_unit(&self, id: &str) -> Option<SyncUnit> {
        self.units.remove(id)
    }

    /// Remove every scope/branch of a document
    pub fn remove_document(&self, document_id: &str) -> Vec<SyncUnit> {
        self.units.remove_where(|unit| unit.document_id == document_id)
    }

    pub fn remove_drive(&self, drive_id: &str) -> Vec<SyncUnit> {
        self.units.remove_where(|unit| unit.drive_id == drive_id)
    }

    /// Sync units matching the query, sorted by id
    pub fn filter_sync_units(&self, query: &SyncUnitQuery) -> Vec<SyncUnit> {
        self.units.filter(|unit| query.matches(unit))
    }

    pub fn drive_sync_units(&self, drive_id: &str) -> Vec<SyncUnit> {
        self.units.filter(|unit| unit.drive_id == drive_id)
    }
}
