//! Operations, actions and strands
//!
//! An operation is an action applied to a document scope at a given `index`.
//! Indexes are 1-based per (document, scope, branch); revision 0 means the
//! scope has no operations yet.

use serde::{Deserialize, Serialize};

use super::ids::new_id;

pub const DOCUMENT_SCOPE: &str = "document";
pub const GLOBAL_SCOPE: &str = "global";
pub const MAIN_BRANCH: &str = "main";

/// Document type of drives; drive relationships define collection membership
pub const DRIVE_DOCUMENT_TYPE: &str = "powerhouse/document-drive";

/// Built-in document-scope action types
pub mod action_types {
    pub const CREATE_DOCUMENT: &str = "CREATE_DOCUMENT";
    pub const DELETE_DOCUMENT: &str = "DELETE_DOCUMENT";
    pub const ADD_RELATIONSHIP: &str = "ADD_RELATIONSHIP";
    pub const REMOVE_RELATIONSHIP: &str = "REMOVE_RELATIONSHIP";
}

/// Current wall clock in unix milliseconds
pub fn now_utc_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Action {
    pub id: String,
    #[serde(rename = "type")]
    pub action_type: String,
    pub scope: String,
    pub timestamp_utc_ms: u64,
    pub input: serde_json::Value,
}

impl Action {
    /// Create an action with a fresh id, stamped now
    pub fn new(action_type: &str, scope: &str, input: serde_json::Value) -> Self {
        Self {
            id: new_id(),
            action_type: action_type.to_string(),
            scope: scope.to_string(),
            timestamp_utc_ms: now_utc_ms(),
            input,
        }
    }

    pub fn is_document_action(&self) -> bool {
        matches!(
            self.action_type.as_str(),
            action_types::CREATE_DOCUMENT
                | action_types::DELETE_DOCUMENT
                | action_types::ADD_RELATIONSHIP
                | action_types::REMOVE_RELATIONSHIP
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    pub id: String,
    pub index: u64,
    /// Number of prior operations elided before this one
    pub skip: u64,
    /// Hex BLAKE2b-256 chain hash
    pub hash: String,
    pub timestamp_utc_ms: u64,
    pub action: Action,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationContext {
    pub document_id: String,
    pub document_type: String,
    pub scope: String,
    pub branch: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationWithContext {
    pub operation: Operation,
    pub context: OperationContext,
    /// Global ordinal assigned by the operation index, when indexed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ordinal: Option<u64>,
}

/// Input of ADD_RELATIONSHIP / REMOVE_RELATIONSHIP
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationshipInput {
    pub source_id: String,
    pub target_id: String,
    pub relationship_type: String,
}

/// Input of CREATE_DOCUMENT
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateDocumentInput {
    pub document_id: String,
    pub document_type: String,
}

/// Wire form of an operation inside a strand
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationUpdate {
    pub id: String,
    pub index: u64,
    pub skip: u64,
    #[serde(rename = "type")]
    pub op_type: String,
    pub input: serde_json::Value,
    pub hash: String,
    pub timestamp_utc_ms: u64,
    pub action_id: String,
}

impl From<&Operation> for OperationUpdate {
    fn from(op: &Operation) -> Self {
        Self {
            id: op.id.clone(),
            index: op.index,
            skip: op.skip,
            op_type: op.action.action_type.clone(),
            input: op.action.input.clone(),
            hash: op.hash.clone(),
            timestamp_utc_ms: op.timestamp_utc_ms,
            action_id: op.action.id.clone(),
        }
    }
}

impl OperationUpdate {
    /// Rebuild the full operation for the given scope
    pub fn to_operation(&self, scope: &str) -> Operation {
        Operation {
            id: self.id.clone(),
            index: self.index,
            skip: self.skip,
            hash: self.hash.clone(),
            timestamp_utc_ms: self.timestamp_utc_ms,
            action: Action {
                id: self.action_id.clone(),
                action_type: self.op_type.clone(),
                scope: scope.to_string(),
                timestamp_utc_ms: self.timestamp_utc_ms,
                input: self.input.clone(),
            },
        }
    }
}

/// Contiguous operations of one sync unit, sent in one transmit call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StrandUpdate {
    pub drive_id: String,
    pub document_id: String,
    pub document_type: String,
    pub scope: String,
    pub branch: String,
    pub operations: Vec<OperationUpdate>,
}

impl StrandUpdate {
    pub fn last_index(&self) -> Option<u64> {
        self.operations.last().map(|op| op.index)
    }

    pub fn is_contiguous(&self) -> bool {
        is_contiguous(self.operations.iter().map(|op| (op.index, op.skip)))
    }

    pub fn to_operations(&self) -> Vec<Operation> {
        self.operations
            .iter()
            .map(|op| op.to_operation(&self.scope))
            .collect()
    }
}

/// Check that (index, skip) pairs form a gapless run: `index - skip == prev + 1`
pub fn is_contiguous<I>(pairs: I) -> bool
where
    I: IntoIterator<Item = (u64, u64)>,
{
    let mut prev: Option<u64> = None;
    for (index, skip) in pairs {
        if let Some(p) = prev {
            if index.checked_sub(skip) != Some(p + 1) {
                return false;
            }
        }
        prev = Some(index);
    }
    true
}
