//! Transmitters deliver strands to a listener
//!
//! Push transmitters (`Internal`, `SwitchboardPush`) are driven by the
//! update loop. A pull responder holds strands until the client asks for
//! them and advances state only on acknowledgement.

mod internal;
mod manager;
mod pull_responder;
mod switchboard;

use std::sync::Arc;

use async_trait::async_trait;
use libstrand_core::types::listener::ListenerRevision;
use libstrand_core::StrandUpdate;

use crate::error::ListenerError;

pub use internal::{InternalReceiver, InternalTransmitter};
pub use manager::TransmitterManager;
pub use pull_responder::{PullResponder, MAX_PULLS, MAX_REVISIONS_PER_ACK};
pub use switchboard::{PushEndpoint, PushEndpointFactory, SwitchboardPushTransmitter};

/// Where an update originated
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum UpdateSource {
    /// Local write
    #[default]
    Local,
    /// Received from a remote endpoint
    Trigger { url: String },
}

#[async_trait]
pub trait PushTransmitter: Send + Sync {
    /// Send strands; returns one acknowledgement per strand
    async fn transmit(
        &self,
        strands: &[StrandUpdate],
        source: &UpdateSource,
    ) -> Result<Vec<ListenerRevision>, ListenerError>;

    async fn disconnect(&self) -> Result<(), ListenerError> {
        Ok(())
    }
}

#[derive(Clone)]
pub enum Transmitter {
    Push(Arc<dyn PushTransmitter>),
    Pull(Arc<PullResponder>),
}

impl Transmitter {
    pub fn is_push(&self) -> bool {
        matches!(self, Transmitter::Push(_))
    }

    pub async fn disconnect(&self) -> Result<(), ListenerError> {
        match self {
            Transmitter::Push(push) => push.disconnect().await,
            Transmitter::Pull(pull) => pull.disconnect().await,
        }
    }
}

impl std::fmt::Debug for Transmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transmitter::Push(_) => f.write_str("Transmitter::Push"),
            Transmitter::Pull(pull) => write!(f, "Transmitter::Pull({})", pull.listener_id()),
        }
    }
}

/// Acknowledge every strand as fully received
pub(crate) fn success_revisions(strands: &[StrandUpdate]) -> Vec<ListenerRevision> {
    strands
        .iter()
        .map(|strand| ListenerRevision {
            drive_id: strand.drive_id.clone(),
            document_id: strand.document_id.clone(),
            scope: strand.scope.clone(),
            branch: strand.branch.clone(),
            status: libstrand_core::types::listener::UpdateStatus::Success,
            revision: strand.last_index().unwrap_or(0),
            error: None,
        })
        .collect()
}
