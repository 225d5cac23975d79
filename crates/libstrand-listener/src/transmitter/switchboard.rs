use std::sync::Arc;

use async_trait::async_trait;
use libstrand_core::types::listener::ListenerRevision;
use libstrand_core::StrandUpdate;
use tracing::debug;

use super::{success_revisions, PushTransmitter, UpdateSource};
use crate::error::ListenerError;

/// Network client for a remote switchboard's push endpoint
#[async_trait]
pub trait PushEndpoint: Send + Sync {
    async fn push_updates(
        &self,
        strands: &[StrandUpdate],
    ) -> Result<Vec<ListenerRevision>, ListenerError>;

    async fn close(&self) -> Result<(), ListenerError> {
        Ok(())
    }
}

/// Builds endpoint clients from a listener's url
pub trait PushEndpointFactory: Send + Sync {
    fn connect(&self, url: &str) -> Result<Arc<dyn PushEndpoint>, ListenerError>;
}

pub struct SwitchboardPushTransmitter {
    url: String,
    endpoint: Arc<dyn PushEndpoint>,
}

impl SwitchboardPushTransmitter {
    pub fn new(url: &str, endpoint: Arc<dyn PushEndpoint>) -> Self {
        Self {
            url: url.to_string(),
            endpoint,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl PushTransmitter for SwitchboardPushTransmitter {
    async fn transmit(
        &self,
        strands: &[StrandUpdate],
        source: &UpdateSource,
    ) -> Result<Vec<ListenerRevision>, ListenerError> {
        // the endpoint already holds what it sent us
        if let UpdateSource::Trigger { url } = source {
            if url == &self.url {
                debug!(url = %self.url, strands = strands.len(), "Skipping echo to update origin");
                return Ok(success_revisions(strands));
            }
        }
        self.endpoint.push_updates(strands).await
    }

    async fn disconnect(&self) -> Result<(), ListenerError> {
        self.endpoint.close().await
    }
}
