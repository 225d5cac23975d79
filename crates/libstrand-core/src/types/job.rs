use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    ReadModelsReady,
}

impl JobStatus {
    /// Completed jobs may still advance to ReadModelsReady
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Failed | JobStatus::ReadModelsReady)
    }

    pub fn is_success(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::ReadModelsReady)
    }
}

/// Batch and origin metadata carried by every job event
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobMeta {
    pub batch_id: String,
    pub batch_job_ids: Vec<String>,
    /// Name of the remote the operations arrived from, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_remote: Option<String>,
}

impl JobMeta {
    /// Metadata of a job submitted on its own
    pub fn single(job_id: &str) -> Self {
        Self {
            batch_id: job_id.to_string(),
            batch_job_ids: vec![job_id.to_string()],
            source_remote: None,
        }
    }

    pub fn with_source_remote(mut self, remote: &str) -> Self {
        self.source_remote = Some(remote.to_string());
        self
    }

    /// Number of distinct jobs in the batch
    pub fn batch_size(&self) -> usize {
        let mut ids: Vec<&String> = self.batch_job_ids.iter().collect();
        ids.sort();
        ids.dedup();
        ids.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub message: String,
    pub at_utc_ms: u64,
}

/// Position a read model must reach to be consistent with a job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsistencyCoordinate {
    pub document_id: String,
    pub scope: String,
    pub branch: String,
    pub operation_index: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ConsistencyToken {
    pub coordinates: Vec<ConsistencyCoordinate>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobInfo {
    pub id: String,
    pub status: JobStatus,
    pub created_at_utc_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at_utc_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
    #[serde(default)]
    pub error_history: Vec<JobError>,
    #[serde(default)]
    pub consistency_token: ConsistencyToken,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}

impl JobInfo {
    pub fn pending(id: &str, created_at_utc_ms: u64) -> Self {
        Self {
            id: id.to_string(),
            status: JobStatus::Pending,
            created_at_utc_ms,
            completed_at_utc_ms: None,
            error: None,
            error_history: Vec::new(),
            consistency_token: ConsistencyToken::default(),
            result: None,
        }
    }

    /// Info returned for ids the reactor never saw
    pub fn not_found(id: &str) -> Self {
        let now = super::operation::now_utc_ms();
        let mut info = Self::pending(id, now);
        info.status = JobStatus::Failed;
        info.error = Some(JobError {
            message: "Job not found".to_string(),
            at_utc_ms: now,
        });
        info
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_size_counts_distinct_ids() {
        let meta = JobMeta {
            batch_id: "b1".into(),
            batch_job_ids: vec!["j1".into(), "j2".into(), "j1".into()],
            source_remote: None,
        };
        assert_eq!(meta.batch_size(), 2);
        assert_eq!(JobMeta::single("j").batch_size(), 1);
    }

    #[test]
    fn test_terminal_states() {
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::ReadModelsReady.is_terminal());
        assert!(!JobStatus::Completed.is_terminal());
        assert!(JobStatus::Completed.is_success());
    }

    #[test]
    fn test_not_found_info() {
        let info = JobInfo::not_found("missing");
        assert_eq!(info.status, JobStatus::Failed);
        assert_eq!(info.error.unwrap().message, "Job not found");
    }
}
