use serde::{Deserialize, Serialize};

use super::sync_unit::SyncUnit;

/// Matches any value in a filter dimension
pub const WILDCARD: &str = "*";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransmitterType {
    Internal,
    SwitchboardPush,
    PullResponder,
}

/// Transport details of a listener
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Endpoint url for push transmitters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

/// Sync units a listener subscribes to.
///
/// A `None` dimension is unconstrained. `Some(vec![])` matches nothing,
/// and a list containing `"*"` matches anything.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenerFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_id: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_type: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<Vec<String>>,
}

fn dimension_matches(dimension: &Option<Vec<String>>, value: &str) -> bool {
    match dimension {
        None => true,
        Some(values) => values.iter().any(|v| v == WILDCARD || v == value),
    }
}

fn wildcard() -> Option<Vec<String>> {
    Some(vec![WILDCARD.to_string()])
}

impl ListenerFilter {
    /// Filter matching every sync unit
    pub fn all() -> Self {
        Self {
            branch: wildcard(),
            document_id: wildcard(),
            document_type: wildcard(),
            scope: wildcard(),
        }
    }

    pub fn matches(&self, unit: &SyncUnit) -> bool {
        self.matches_values(&unit.document_id, &unit.document_type, &unit.scope, &unit.branch)
    }

    pub fn matches_values(
        &self,
        document_id: &str,
        document_type: &str,
        scope: &str,
        branch: &str,
    ) -> bool {
        dimension_matches(&self.branch, branch)
            && dimension_matches(&self.document_id, document_id)
            && dimension_matches(&self.document_type, document_type)
            && dimension_matches(&self.scope, scope)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Listener {
    pub listener_id: String,
    pub drive_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub block: bool,
    pub system: bool,
    pub filter: ListenerFilter,
    pub transmitter_type: TransmitterType,
    #[serde(default)]
    pub call_info: CallInfo,
}

impl Listener {
    pub fn new(
        listener_id: &str,
        drive_id: &str,
        filter: ListenerFilter,
        transmitter_type: TransmitterType,
    ) -> Self {
        Self {
            listener_id: listener_id.to_string(),
            drive_id: drive_id.to_string(),
            label: None,
            block: false,
            system: false,
            filter,
            transmitter_type,
            call_info: CallInfo::default(),
        }
    }

    pub fn with_label(mut self, label: &str) -> Self {
        self.label = Some(label.to_string());
        self
    }

    pub fn with_endpoint(mut self, url: &str) -> Self {
        self.call_info.data = Some(url.to_string());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UpdateStatus {
    Success,
    Conflict,
    Missing,
    Error,
}

/// Non-success subset of `UpdateStatus`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorStatus {
    Conflict,
    Missing,
    Error,
}

impl UpdateStatus {
    pub fn error_status(self) -> Option<ErrorStatus> {
        match self {
            UpdateStatus::Success => None,
            UpdateStatus::Conflict => Some(ErrorStatus::Conflict),
            UpdateStatus::Missing => Some(ErrorStatus::Missing),
            UpdateStatus::Error => Some(ErrorStatus::Error),
        }
    }
}

impl From<ErrorStatus> for UpdateStatus {
    fn from(status: ErrorStatus) -> Self {
        match status {
            ErrorStatus::Conflict => UpdateStatus::Conflict,
            ErrorStatus::Missing => UpdateStatus::Missing,
            ErrorStatus::Error => UpdateStatus::Error,
        }
    }
}

impl std::fmt::Display for ErrorStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorStatus::Conflict => "CONFLICT",
            ErrorStatus::Missing => "MISSING",
            ErrorStatus::Error => "ERROR",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ListenerStatus {
    Created,
    Pending,
    Success,
    Missing,
    Conflict,
    Error,
}

impl From<ErrorStatus> for ListenerStatus {
    fn from(status: ErrorStatus) -> Self {
        match status {
            ErrorStatus::Conflict => ListenerStatus::Conflict,
            ErrorStatus::Missing => ListenerStatus::Missing,
            ErrorStatus::Error => ListenerStatus::Error,
        }
    }
}

/// Acknowledgement of one strand
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenerRevision {
    pub drive_id: String,
    pub document_id: String,
    pub scope: String,
    pub branch: String,
    pub status: UpdateStatus,
    pub revision: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ListenerRevision {
    pub fn sync_unit_id(&self) -> String {
        super::ids::sync_unit_id(&self.document_id, &self.scope, &self.branch)
    }
}

/// Last revision a listener is known to hold for one sync unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenerSyncUnitState {
    pub listener_rev: u64,
    pub last_updated: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit() -> SyncUnit {
        SyncUnit::new("drive", "doc-1", "test/doc", "global", "main")
    }

    #[test]
    fn test_filter_wildcard_matches_everything() {
        assert!(ListenerFilter::all().matches(&unit()));
    }

    #[test]
    fn test_filter_unset_dimension_matches() {
        let filter = ListenerFilter {
            scope: Some(vec!["global".into()]),
            ..Default::default()
        };
        assert!(filter.matches(&unit()));
    }

    #[test]
    fn test_filter_empty_dimension_matches_nothing() {
        let filter = ListenerFilter {
            document_id: Some(vec![]),
            ..ListenerFilter::all()
        };
        assert!(!filter.matches(&unit()));
    }

    #[test]
    fn test_filter_and_across_or_within() {
        let filter = ListenerFilter {
            scope: Some(vec!["local".into(), "global".into()]),
            document_id: Some(vec!["doc-2".into()]),
            ..Default::default()
        };
        assert!(!filter.matches(&unit()));

        let filter = ListenerFilter {
            scope: Some(vec!["local".into(), "global".into()]),
            document_id: Some(vec!["doc-2".into(), "doc-1".into()]),
            ..Default::default()
        };
        assert!(filter.matches(&unit()));
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&UpdateStatus::Missing).unwrap();
        assert_eq!(json, "\"MISSING\"");
        assert_eq!(UpdateStatus::Success.error_status(), None);
        assert_eq!(
            ListenerStatus::from(ErrorStatus::Conflict),
            ListenerStatus::Conflict
        );
    }
}
