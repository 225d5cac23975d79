use std::sync::Arc;

use async_trait::async_trait;
use libstrand_core::types::listener::ListenerRevision;
use libstrand_core::StrandUpdate;

use super::{success_revisions, PushTransmitter, UpdateSource};
use crate::error::ListenerError;

/// In-process consumer of strands (read models, processors)
#[async_trait]
pub trait InternalReceiver: Send + Sync {
    async fn receive(
        &self,
        strands: &[StrandUpdate],
        source: &UpdateSource,
    ) -> Result<(), ListenerError>;

    async fn disconnect(&self) -> Result<(), ListenerError> {
        Ok(())
    }
}

/// Hands strands to an in-process receiver; every strand is acknowledged
/// at its last index once the receiver accepts the call
pub struct InternalTransmitter {
    receiver: Arc<dyn InternalReceiver>,
}

impl InternalTransmitter {
    pub fn new(receiver: Arc<dyn InternalReceiver>) -> Self {
        Self { receiver }
    }
}

#[async_trait]
impl PushTransmitter for InternalTransmitter {
    async fn transmit(
        &self,
        strands: &[StrandUpdate],
        source: &UpdateSource,
    ) -> Result<Vec<ListenerRevision>, ListenerError> {
        self.receiver.receive(strands, source).await?;
        Ok(success_revisions(strands))
    }

    async fn disconnect(&self) -> Result<(), ListenerError> {
        self.receiver.disconnect().await
    }
}
