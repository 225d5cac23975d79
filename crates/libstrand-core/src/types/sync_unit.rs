use serde::{Deserialize, Serialize};

use super::ids::sync_unit_id;
use super::listener::ListenerFilter;

/// Identity of a sync unit
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncUnitKey {
    pub document_id: String,
    pub scope: String,
    pub branch: String,
}

impl SyncUnitKey {
    pub fn new(document_id: &str, scope: &str, branch: &str) -> Self {
        Self {
            document_id: document_id.to_string(),
            scope: scope.to_string(),
            branch: branch.to_string(),
        }
    }

    pub fn id(&self) -> String {
        sync_unit_id(&self.document_id, &self.scope, &self.branch)
    }
}

/// A (document, scope, branch) tracked with its latest revision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncUnit {
    pub id: String,
    pub drive_id: String,
    pub document_id: String,
    pub document_type: String,
    pub scope: String,
    pub branch: String,
    /// Index of the last operation applied to this scope (0 = none)
    pub revision: u64,
    pub last_updated: u64,
}

impl SyncUnit {
    pub fn new(
        drive_id: &str,
        document_id: &str,
        document_type: &str,
        scope: &str,
        branch: &str,
    ) -> Self {
        Self {
            id: sync_unit_id(document_id, scope, branch),
            drive_id: drive_id.to_string(),
            document_id: document_id.to_string(),
            document_type: document_type.to_string(),
            scope: scope.to_string(),
            branch: branch.to_string(),
            revision: 0,
            last_updated: 0,
        }
    }

    pub fn with_revision(mut self, revision: u64, last_updated: u64) -> Self {
        self.revision = revision;
        self.last_updated = last_updated;
        self
    }

    pub fn key(&self) -> SyncUnitKey {
        SyncUnitKey::new(&self.document_id, &self.scope, &self.branch)
    }
}

/// Criteria for `SyncUnitRegistry::filter_sync_units`
#[derive(Debug, Clone, Default)]
pub struct SyncUnitQuery {
    pub drive_id: Option<String>,
    pub filter: ListenerFilter,
}

impl SyncUnitQuery {
    pub fn for_drive(drive_id: &str, filter: ListenerFilter) -> Self {
        Self {
            drive_id: Some(drive_id.to_string()),
            filter,
        }
    }

    pub fn matches(&self, unit: &SyncUnit) -> bool {
        if let Some(drive_id) = &self.drive_id {
            if &unit.drive_id != drive_id {
                return false;
            }
        }
        self.filter.matches(unit)
    }
}
