//! Client side of the pull protocol
//!
//! Fetch strands from a responder, apply them locally and acknowledge
//! what was applied, in rounds driven by [`PullLoop`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use libstrand_core::types::listener::{ListenerRevision, UpdateStatus};
use libstrand_core::StrandUpdate;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::ListenerError;
use crate::sync_status::{SyncDirection, SyncStatus, SyncStatusTracker};
use crate::transmitter::{UpdateSource, MAX_REVISIONS_PER_ACK};

/// Remote side serving strands to this client
#[async_trait]
pub trait PullSource: Send + Sync {
    async fn pull_strands(&self, listener_id: &str) -> Result<Vec<StrandUpdate>, ListenerError>;

    async fn acknowledge(
        &self,
        listener_id: &str,
        revisions: &[ListenerRevision],
    ) -> Result<bool, ListenerError>;
}

/// Applies pulled strands locally
#[async_trait]
pub trait StrandApplier: Send + Sync {
    async fn apply_strand(
        &self,
        strand: &StrandUpdate,
        source: &UpdateSource,
    ) -> Result<(), ListenerError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PullOutcome {
    pub revisions: Vec<ListenerRevision>,
    /// False when there was nothing to acknowledge or the source rejected part of it
    pub acknowledged: bool,
}

/// Run one pull round
pub async fn execute_pull(
    source: &dyn PullSource,
    listener_id: &str,
    applier: &dyn StrandApplier,
    origin: &UpdateSource,
) -> Result<PullOutcome, ListenerError> {
    let strands = source.pull_strands(listener_id).await?;
    if strands.is_empty() {
        return Ok(PullOutcome::default());
    }
    debug!(listener = %listener_id, strands = strands.len(), "Pulled strands");

    let mut revisions = Vec::with_capacity(strands.len());
    for strand in &strands {
        let (status, error) = match applier.apply_strand(strand, origin).await {
            Ok(()) => (UpdateStatus::Success, None),
            Err(e) => {
                warn!(listener = %listener_id, document = %strand.document_id, error = %e, "Failed to apply strand");
                (e.error_status().into(), Some(e.to_string()))
            }
        };
        revisions.push(ListenerRevision {
            drive_id: strand.drive_id.clone(),
            document_id: strand.document_id.clone(),
            scope: strand.scope.clone(),
            branch: strand.branch.clone(),
            status,
            revision: strand.last_index().unwrap_or(0),
            error,
        });
    }

    let mut acknowledged = true;
    for chunk in revisions.chunks(MAX_REVISIONS_PER_ACK) {
        acknowledged &= source.acknowledge(listener_id, chunk).await?;
    }
    Ok(PullOutcome {
        revisions,
        acknowledged,
    })
}

/// Periodic pull rounds until cancelled
pub struct PullLoop {
    cancel: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl PullLoop {
    pub fn spawn(
        interval: Duration,
        source: Arc<dyn PullSource>,
        listener_id: &str,
        applier: Arc<dyn StrandApplier>,
        origin: UpdateSource,
        status: Option<(Arc<SyncStatusTracker>, String)>,
    ) -> Self {
        let (cancel, mut cancelled) = watch::channel(false);
        let listener_id = listener_id.to_string();
        let handle = tokio::spawn(async move {
            info!(listener = %listener_id, interval_ms = interval.as_millis() as u64, "Pull loop started");
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancelled.changed() => break,
                    _ = ticker.tick() => {}
                }
                if let Some((tracker, id)) = &status {
                    tracker.update_status(id, SyncDirection::Pull, SyncStatus::Syncing, None);
                }
                let result = execute_pull(source.as_ref(), &listener_id, applier.as_ref(), &origin).await;
                let Some((tracker, id)) = &status else {
                    if let Err(e) = result {
                        warn!(listener = %listener_id, error = %e, "Pull failed");
                    }
                    continue;
                };
                match result {
                    Ok(outcome) => {
                        let worst = outcome
                            .revisions
                            .iter()
                            .find(|r| r.status != UpdateStatus::Success)
                            .map(|r| (SyncStatus::from(r.status), r.error.clone()));
                        let (next, error) = worst.unwrap_or((SyncStatus::Success, None));
                        tracker.update_status(id, SyncDirection::Pull, next, error);
                    }
                    Err(e) => {
                        warn!(listener = %listener_id, error = %e, "Pull failed");
                        tracker.update_status(
                            id,
                            SyncDirection::Pull,
                            e.error_status().into(),
                            Some(e.to_string()),
                        );
                    }
                }
            }
            info!(listener = %listener_id, "Pull loop stopped");
        });
        Self { cancel, handle }
    }

    pub async fn cancel(self) {
        let _ = self.cancel.send(true);
        let _ = self.handle.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use libstrand_core::types::operation::OperationUpdate;
    use std::sync::Mutex;

    struct FixedSource {
        strands: Vec<StrandUpdate>,
        acks: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl PullSource for FixedSource {
        async fn pull_strands(&self, _: &str) -> Result<Vec<StrandUpdate>, ListenerError> {
            Ok(self.strands.clone())
        }

        async fn acknowledge(
            &self,
            _: &str,
            revisions: &[ListenerRevision],
        ) -> Result<bool, ListenerError> {
            self.acks.lock().unwrap().push(revisions.len());
            Ok(true)
        }
    }

    struct RejectDocument(&'static str);

    #[async_trait]
    impl StrandApplier for RejectDocument {
        async fn apply_strand(
            &self,
            strand: &StrandUpdate,
            _: &UpdateSource,
        ) -> Result<(), ListenerError> {
            if strand.document_id == self.0 {
                Err(ListenerError::operation(
                    libstrand_core::types::listener::ErrorStatus::Conflict,
                    "diverged",
                ))
            } else {
                Ok(())
            }
        }
    }

    fn strand(document_id: &str, last: u64) -> StrandUpdate {
        StrandUpdate {
            drive_id: "drive".into(),
            document_id: document_id.into(),
            document_type: "test/doc".into(),
            scope: "global".into(),
            branch: "main".into(),
            operations: vec![OperationUpdate {
                id: format!("{document_id}-{last}"),
                index: last,
                skip: 0,
                op_type: "SET".into(),
                input: serde_json::Value::Null,
                hash: String::new(),
                timestamp_utc_ms: 0,
                action_id: "a".into(),
            }],
        }
    }

    #[tokio::test]
    async fn test_revisions_reflect_apply_outcome() {
        let source = FixedSource {
            strands: vec![strand("ok", 3), strand("bad", 5)],
            acks: Mutex::new(Vec::new()),
        };
        let outcome = execute_pull(&source, "l", &RejectDocument("bad"), &UpdateSource::Local)
            .await
            .unwrap();
        assert!(outcome.acknowledged);
        assert_eq!(outcome.revisions[0].status, UpdateStatus::Success);
        assert_eq!(outcome.revisions[0].revision, 3);
        assert_eq!(outcome.revisions[1].status, UpdateStatus::Conflict);
        assert_eq!(outcome.revisions[1].error.as_deref(), Some("CONFLICT: diverged"));
    }

    #[tokio::test]
    async fn test_acknowledge_in_chunks() {
        let strands = (0..MAX_REVISIONS_PER_ACK + 20)
            .map(|i| strand(&format!("doc-{i}"), 1))
            .collect();
        let source = FixedSource {
            strands,
            acks: Mutex::new(Vec::new()),
        };
        execute_pull(&source, "l", &RejectDocument("none"), &UpdateSource::Local)
            .await
            .unwrap();
        assert_eq!(*source.acks.lock().unwrap(), vec![MAX_REVISIONS_PER_ACK, 20]);
    }

    #[tokio::test]
    async fn test_nothing_pulled_nothing_acknowledged() {
        let source = FixedSource {
            strands: Vec::new(),
            acks: Mutex::new(Vec::new()),
        };
        let outcome = execute_pull(&source, "l", &RejectDocument("none"), &UpdateSource::Local)
            .await
            .unwrap();
        assert!(!outcome.acknowledged);
        assert!(source.acks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_loop_reports_status_and_stops() {
        let source = Arc::new(FixedSource {
            strands: vec![strand("bad", 1)],
            acks: Mutex::new(Vec::new()),
        });
        let tracker = Arc::new(SyncStatusTracker::new());
        let pull = PullLoop::spawn(
            Duration::from_millis(10),
            source.clone(),
            "l",
            Arc::new(RejectDocument("bad")),
            UpdateSource::Local,
            Some((tracker.clone(), "drive".to_string())),
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        pull.cancel().await;

        assert!(!source.acks.lock().unwrap().is_empty());
        assert_eq!(tracker.get_status("drive"), Some(SyncStatus::Conflict));
    }
}
