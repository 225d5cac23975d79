//! Assembles strands of missing operations for a listener

use std::sync::Arc;

use libstrand_core::store::DocumentOperationStorage;
use libstrand_core::types::operation::OperationUpdate;
use libstrand_core::types::sync_unit::SyncUnitQuery;
use libstrand_core::{ListenerRegistry, ListenerState, StrandUpdate, SyncUnit, SyncUnitRegistry};

use crate::error::ListenerError;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GetStrandsOptions {
    /// Only operations with a timestamp at or after this instant
    pub since: Option<u64>,
    /// Override the listener's acknowledged revision for every unit
    pub from_revision: Option<u64>,
    /// Maximum number of operations across all strands
    pub limit: Option<usize>,
}

pub struct StrandCollector {
    storage: Arc<dyn DocumentOperationStorage>,
    listeners: Arc<ListenerRegistry>,
    sync_units: Arc<SyncUnitRegistry>,
}

impl StrandCollector {
    pub fn new(
        storage: Arc<dyn DocumentOperationStorage>,
        listeners: Arc<ListenerRegistry>,
        sync_units: Arc<SyncUnitRegistry>,
    ) -> Self {
        Self {
            storage,
            listeners,
            sync_units,
        }
    }

    pub fn listeners(&self) -> &Arc<ListenerRegistry> {
        &self.listeners
    }

    pub fn sync_units(&self) -> &Arc<SyncUnitRegistry> {
        &self.sync_units
    }

    fn listener_state(&self, drive_id: &str, listener_id: &str) -> Result<ListenerState, ListenerError> {
        self.listeners
            .get_listener_state(listener_id)
            .filter(|state| state.listener.drive_id == drive_id)
            .ok_or_else(|| {
                ListenerError::NotFound(format!("listener {listener_id} of drive {drive_id}"))
            })
    }

    /// Sync units of the drive matched by the listener's filter
    pub fn listener_sync_units(
        &self,
        drive_id: &str,
        listener_id: &str,
    ) -> Result<Vec<SyncUnit>, ListenerError> {
        let state = self.listener_state(drive_id, listener_id)?;
        Ok(self
            .sync_units
            .filter_sync_units(&SyncUnitQuery::for_drive(drive_id, state.listener.filter)))
    }

    /// Operations of `unit` after `from_revision`; `None` when there are none
    pub async fn fetch_strand(
        &self,
        unit: &SyncUnit,
        from_revision: u64,
        since: Option<u64>,
        limit: Option<usize>,
    ) -> Result<Option<StrandUpdate>, ListenerError> {
        if unit.revision <= from_revision {
            return Ok(None);
        }
        let operations = self
            .storage
            .get_operations(&unit.document_id, &unit.scope, &unit.branch, from_revision, None)
            .await?;

        let operations: Vec<OperationUpdate> = operations
            .iter()
            .filter(|op| since.map_or(true, |since| op.timestamp_utc_ms >= since))
            .take(limit.unwrap_or(usize::MAX))
            .map(OperationUpdate::from)
            .collect();
        if operations.is_empty() {
            return Ok(None);
        }

        Ok(Some(StrandUpdate {
            drive_id: unit.drive_id.clone(),
            document_id: unit.document_id.clone(),
            document_type: unit.document_type.clone(),
            scope: unit.scope.clone(),
            branch: unit.branch.clone(),
            operations,
        }))
    }

    /// Strands a pull client has not acknowledged yet.
    ///
    /// Read-only: listener state only moves on acknowledgement.
    pub async fn get_strands(
        &self,
        drive_id: &str,
        listener_id: &str,
        options: &GetStrandsOptions,
    ) -> Result<Vec<StrandUpdate>, ListenerError> {
        let state = self.listener_state(drive_id, listener_id)?;
        let units = self
            .sync_units
            .filter_sync_units(&SyncUnitQuery::for_drive(drive_id, state.listener.filter.clone()));

        let mut remaining = options.limit;
        let mut strands = Vec::new();
        for unit in units {
            if remaining == Some(0) {
                break;
            }
            let from_revision = options
                .from_revision
                .unwrap_or_else(|| state.listener_rev(&unit.id));
            let Some(strand) = self
                .fetch_strand(&unit, from_revision, options.since, remaining)
                .await?
            else {
                continue;
            };
            if let Some(left) = remaining.as_mut() {
                *left = left.saturating_sub(strand.operations.len());
            }
            strands.push(strand);
        }
        Ok(strands)
    }
}
