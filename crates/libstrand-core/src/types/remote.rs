//! Remote channel records and cursors

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::operation::OperationContext;

/// Narrows a collection to the operations a remote receives.
///
/// Empty lists and an empty branch place no restriction.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteFilter {
    #[serde(default)]
    pub document_type: Vec<String>,
    #[serde(default)]
    pub document_id: Vec<String>,
    #[serde(default)]
    pub scope: Vec<String>,
    #[serde(default)]
    pub branch: String,
}

impl RemoteFilter {
    pub fn matches(&self, context: &OperationContext) -> bool {
        (self.document_type.is_empty() || self.document_type.contains(&context.document_type))
            && (self.document_id.is_empty() || self.document_id.contains(&context.document_id))
            && (self.scope.is_empty() || self.scope.contains(&context.scope))
            && (self.branch.is_empty() || self.branch == context.branch)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelConfig {
    #[serde(rename = "type")]
    pub channel_type: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

impl ChannelConfig {
    pub fn internal() -> Self {
        Self {
            channel_type: "internal".to_string(),
            parameters: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_interval_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Idle,
    Running,
    Error,
}

/// Health of one channel direction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelHealth {
    pub state: HealthState,
    pub failure_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_success_utc_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failure_utc_ms: Option<u64>,
}

impl ChannelHealth {
    pub fn idle() -> Self {
        Self {
            state: HealthState::Idle,
            failure_count: 0,
            last_success_utc_ms: None,
            last_failure_utc_ms: None,
        }
    }
}

impl Default for ChannelHealth {
    fn default() -> Self {
        Self::idle()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RemoteStatus {
    pub push: ChannelHealth,
    pub pull: ChannelHealth,
}

/// Persisted remote definition; `name` is unique
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteRecord {
    pub id: String,
    pub name: String,
    pub collection_id: String,
    pub channel_config: ChannelConfig,
    pub filter: RemoteFilter,
    pub options: RemoteOptions,
    pub status: RemoteStatus,
}

/// Last ordinal a remote has processed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteCursor {
    pub remote_name: String,
    pub cursor_ordinal: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_synced_at_utc_ms: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(doc: &str, scope: &str) -> OperationContext {
        OperationContext {
            document_id: doc.into(),
            document_type: "test/doc".into(),
            scope: scope.into(),
            branch: "main".into(),
        }
    }

    #[test]
    fn test_empty_remote_filter_matches_all() {
        assert!(RemoteFilter::default().matches(&context("a", "global")));
    }

    #[test]
    fn test_remote_filter_restricts() {
        let filter = RemoteFilter {
            scope: vec!["global".into()],
            branch: "main".into(),
            ..Default::default()
        };
        assert!(filter.matches(&context("a", "global")));
        assert!(!filter.matches(&context("a", "local")));

        let filter = RemoteFilter {
            branch: "draft".into(),
            ..Default::default()
        };
        assert!(!filter.matches(&context("a", "global")));
    }

    #[test]
    fn test_health_serialization() {
        let json = serde_json::to_value(ChannelHealth::idle()).unwrap();
        assert_eq!(json["state"], "idle");
        assert_eq!(json["failureCount"], 0);
    }
}
