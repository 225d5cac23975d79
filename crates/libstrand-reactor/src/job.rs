//! Jobs and dependency-ordered batches

use std::collections::{HashMap, HashSet, VecDeque};

use libstrand_core::types::job::{JobError, JobInfo, JobMeta};
use libstrand_core::{Action, Operation};
use serde::{Deserialize, Serialize};

use crate::error::ReactorError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum JobKind {
    /// Apply actions, producing new operations
    Mutate { actions: Vec<Action> },
    /// Append operations received from a remote
    Load { operations: Vec<Operation> },
}

impl JobKind {
    pub fn is_load(&self) -> bool {
        matches!(self, JobKind::Load { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub document_id: String,
    pub scope: String,
    pub branch: String,
    pub kind: JobKind,
    pub created_at_utc_ms: u64,
    /// Jobs that must finish before this one runs
    pub queue_hint: Vec<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub error_history: Vec<JobError>,
    pub meta: JobMeta,
}

impl Job {
    /// Queue key: one job per key runs at a time, in order
    pub fn queue_key(&self) -> String {
        format!("{}:{}:{}", self.document_id, self.scope, self.branch)
    }
}

/// One entry of an `execute_batch` / `load_batch` request
#[derive(Debug, Clone, PartialEq)]
pub struct BatchJobPlan {
    pub key: String,
    pub document_id: String,
    pub scope: String,
    pub branch: String,
    pub kind: JobKind,
    /// Keys of plans in the same batch
    pub depends_on: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchResult {
    /// Job info by plan key
    pub jobs: HashMap<String, JobInfo>,
}

/// Check keys and dependencies; returns plan positions in dependency order.
///
/// Plans without mutual dependencies keep their request order.
pub fn validate_batch(plans: &[BatchJobPlan]) -> Result<Vec<usize>, ReactorError> {
    let mut positions = HashMap::with_capacity(plans.len());
    for (i, plan) in plans.iter().enumerate() {
        if plan.key.is_empty() {
            return Err(ReactorError::InvalidBatch(format!("plan {i} has an empty key")));
        }
        if positions.insert(plan.key.as_str(), i).is_some() {
            return Err(ReactorError::InvalidBatch(format!("duplicate key '{}'", plan.key)));
        }
    }

    let mut indegree = vec![0usize; plans.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); plans.len()];
    for (i, plan) in plans.iter().enumerate() {
        let mut seen = HashSet::new();
        for dep in &plan.depends_on {
            let Some(&d) = positions.get(dep.as_str()) else {
                return Err(ReactorError::InvalidBatch(format!(
                    "'{}' depends on unknown key '{dep}'",
                    plan.key
                )));
            };
            if d == i {
                return Err(ReactorError::InvalidBatch(format!(
                    "'{}' depends on itself",
                    plan.key
                )));
            }
            if seen.insert(d) {
                indegree[i] += 1;
                dependents[d].push(i);
            }
        }
    }

    let mut ready: VecDeque<usize> = (0..plans.len()).filter(|&i| indegree[i] == 0).collect();
    let mut order = Vec::with_capacity(plans.len());
    while let Some(i) = ready.pop_front() {
        order.push(i);
        for &next in &dependents[i] {
            indegree[next] -= 1;
            if indegree[next] == 0 {
                ready.push_back(next);
            }
        }
    }

    if order.len() != plans.len() {
        let cyclic: Vec<&str> = (0..plans.len())
            .filter(|i| indegree[*i] > 0)
            .map(|i| plans[i].key.as_str())
            .collect();
        return Err(ReactorError::InvalidBatch(format!(
            "dependency cycle between {}",
            cyclic.join(", ")
        )));
    }
    Ok(order)
}
