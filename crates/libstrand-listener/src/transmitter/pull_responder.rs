use std::sync::Arc;

use async_trait::async_trait;
use libstrand_core::types::listener::{ListenerRevision, UpdateStatus};
use libstrand_core::types::operation::now_utc_ms;
use libstrand_core::StrandUpdate;
use tracing::{debug, warn};

use crate::error::ListenerError;
use crate::pull_client::PullSource;
use crate::strands::{GetStrandsOptions, StrandCollector};

/// Acknowledgements accepted per call
pub const MAX_REVISIONS_PER_ACK: usize = 100;

/// Operations served per pull round unless the client asks for fewer
pub const MAX_PULLS: usize = 50;

/// Serves strands to a pull client and records its acknowledgements
pub struct PullResponder {
    drive_id: String,
    listener_id: String,
    strands: Arc<StrandCollector>,
}

impl PullResponder {
    pub fn new(drive_id: &str, listener_id: &str, strands: Arc<StrandCollector>) -> Self {
        Self {
            drive_id: drive_id.to_string(),
            listener_id: listener_id.to_string(),
            strands,
        }
    }

    pub fn drive_id(&self) -> &str {
        &self.drive_id
    }

    pub fn listener_id(&self) -> &str {
        &self.listener_id
    }

    pub async fn get_strands(
        &self,
        options: &GetStrandsOptions,
    ) -> Result<Vec<StrandUpdate>, ListenerError> {
        self.strands
            .get_strands(&self.drive_id, &self.listener_id, options)
            .await
    }

    /// Record the revisions a pull client confirmed.
    ///
    /// Returns false if any revision could not be matched to one of the
    /// listener's sync units or reported a failure.
    pub async fn process_acknowledge(
        &self,
        drive_id: &str,
        listener_id: &str,
        revisions: &[ListenerRevision],
    ) -> Result<bool, ListenerError> {
        let units = self.strands.listener_sync_units(drive_id, listener_id)?;
        let listeners = self.strands.listeners();
        let now = now_utc_ms();
        let mut success = true;

        for revision in revisions {
            let Some(unit) = units.iter().find(|unit| {
                unit.document_id == revision.document_id
                    && unit.scope == revision.scope
                    && unit.branch == revision.branch
            }) else {
                warn!(
                    listener = %listener_id,
                    document = %revision.document_id,
                    scope = %revision.scope,
                    branch = %revision.branch,
                    "Acknowledged revision for unknown sync unit"
                );
                success = false;
                continue;
            };

            match revision.status {
                UpdateStatus::Success | UpdateStatus::Missing => {}
                status => {
                    warn!(
                        listener = %listener_id,
                        sync_unit = %unit.id,
                        ?status,
                        error = revision.error.as_deref().unwrap_or(""),
                        "Pull client reported failure"
                    );
                    success = false;
                    continue;
                }
            }

            let current = listeners
                .get_listener_state(listener_id)
                .map(|state| state.listener_rev(&unit.id));
            if current == Some(revision.revision) {
                continue;
            }
            listeners.update_listener_revision(listener_id, &unit.id, revision.revision, now)?;
            debug!(listener = %listener_id, sync_unit = %unit.id, revision = revision.revision, "Acknowledged");
        }
        Ok(success)
    }

    pub async fn disconnect(&self) -> Result<(), ListenerError> {
        Ok(())
    }
}

#[async_trait]
impl PullSource for PullResponder {
    async fn pull_strands(&self, listener_id: &str) -> Result<Vec<StrandUpdate>, ListenerError> {
        self.strands
            .get_strands(
                &self.drive_id,
                listener_id,
                &GetStrandsOptions {
                    limit: Some(MAX_PULLS),
                    ..Default::default()
                },
            )
            .await
    }

    async fn acknowledge(
        &self,
        listener_id: &str,
        revisions: &[ListenerRevision],
    ) -> Result<bool, ListenerError> {
        self.process_acknowledge(&self.drive_id, listener_id, revisions)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strands::test_support::seed_document;
    use libstrand_core::store::MemoryStore;
    use libstrand_core::types::listener::{Listener, ListenerFilter, TransmitterType};
    use libstrand_core::{ListenerRegistry, SyncUnitRegistry};

    async fn responder() -> PullResponder {
        let store = Arc::new(MemoryStore::new());
        let listeners = Arc::new(ListenerRegistry::new());
        let sync_units = Arc::new(SyncUnitRegistry::new());
        seed_document(&store, &sync_units, "drive", "doc-a", 3).await;
        listeners
            .add_listener(Listener::new(
                "pull",
                "drive",
                ListenerFilter::all(),
                TransmitterType::PullResponder,
            ))
            .unwrap();
        let strands = Arc::new(StrandCollector::new(store, listeners, sync_units));
        PullResponder::new("drive", "pull", strands)
    }

    fn ack(document_id: &str, revision: u64, status: UpdateStatus) -> ListenerRevision {
        ListenerRevision {
            drive_id: "drive".into(),
            document_id: document_id.into(),
            scope: "global".into(),
            branch: "main".into(),
            status,
            revision,
            error: None,
        }
    }

    #[tokio::test]
    async fn test_acknowledge_advances_state() {
        let responder = responder().await;
        let strands = responder
            .get_strands(&GetStrandsOptions::default())
            .await
            .unwrap();
        assert_eq!(strands.len(), 1);

        let ok = responder
            .process_acknowledge("drive", "pull", &[ack("doc-a", 3, UpdateStatus::Success)])
            .await
            .unwrap();
        assert!(ok);
        let strands = responder
            .get_strands(&GetStrandsOptions::default())
            .await
            .unwrap();
        assert!(strands.is_empty());
    }

    #[tokio::test]
    async fn test_acknowledge_is_idempotent() {
        let responder = responder().await;
        let revisions = [ack("doc-a", 2, UpdateStatus::Success)];
        responder
            .process_acknowledge("drive", "pull", &revisions)
            .await
            .unwrap();
        let first = responder.strands.listeners().get_listener_state("pull");

        responder
            .process_acknowledge("drive", "pull", &revisions)
            .await
            .unwrap();
        let second = responder.strands.listeners().get_listener_state("pull");
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_unknown_sync_unit_reports_failure() {
        let responder = responder().await;
        let ok = responder
            .process_acknowledge(
                "drive",
                "pull",
                &[
                    ack("doc-missing", 1, UpdateStatus::Success),
                    ack("doc-a", 1, UpdateStatus::Success),
                ],
            )
            .await
            .unwrap();
        assert!(!ok);
        let state = responder
            .strands
            .listeners()
            .get_listener_state("pull")
            .unwrap();
        assert_eq!(state.listener_rev("doc-a:global:main"), 1);
    }

    #[tokio::test]
    async fn test_error_ack_does_not_advance() {
        let responder = responder().await;
        let ok = responder
            .process_acknowledge("drive", "pull", &[ack("doc-a", 3, UpdateStatus::Error)])
            .await
            .unwrap();
        assert!(!ok);
        let state = responder
            .strands
            .listeners()
            .get_listener_state("pull")
            .unwrap();
        assert_eq!(state.listener_rev("doc-a:global:main"), 0);
    }
}
