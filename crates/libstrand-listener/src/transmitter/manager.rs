use std::collections::HashMap;
use std::sync::Arc;

use libstrand_core::types::listener::{Listener, TransmitterType};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::{
    InternalReceiver, InternalTransmitter, PullResponder, PushEndpointFactory,
    SwitchboardPushTransmitter, Transmitter,
};
use crate::error::{InitTransmittersError, ListenerError};
use crate::strands::StrandCollector;

/// One transmitter per listener, created from its transmitter type
pub struct TransmitterManager {
    transmitters: RwLock<HashMap<String, Transmitter>>,
    receivers: RwLock<HashMap<String, Arc<dyn InternalReceiver>>>,
    push_endpoints: Option<Arc<dyn PushEndpointFactory>>,
    strands: Arc<StrandCollector>,
}

impl TransmitterManager {
    pub fn new(strands: Arc<StrandCollector>) -> Self {
        Self {
            transmitters: RwLock::new(HashMap::new()),
            receivers: RwLock::new(HashMap::new()),
            push_endpoints: None,
            strands,
        }
    }

    pub fn with_push_endpoints(mut self, factory: Arc<dyn PushEndpointFactory>) -> Self {
        self.push_endpoints = Some(factory);
        self
    }

    /// Receiver used when an `Internal` listener with this id is created
    pub async fn register_receiver(&self, listener_id: &str, receiver: Arc<dyn InternalReceiver>) {
        self.receivers
            .write()
            .await
            .insert(listener_id.to_string(), receiver);
    }

    pub async fn create_transmitter(&self, listener: &Listener) -> Result<Transmitter, ListenerError> {
        let mut transmitters = self.transmitters.write().await;
        if transmitters.contains_key(&listener.listener_id) {
            return Err(ListenerError::DuplicatedTransmitter(
                listener.listener_id.clone(),
            ));
        }

        let transmitter = match listener.transmitter_type {
            TransmitterType::Internal => {
                let receiver = self
                    .receivers
                    .read()
                    .await
                    .get(&listener.listener_id)
                    .cloned()
                    .ok_or_else(|| {
                        ListenerError::NotFound(format!(
                            "internal receiver for listener {}",
                            listener.listener_id
                        ))
                    })?;
                Transmitter::Push(Arc::new(InternalTransmitter::new(receiver)))
            }
            TransmitterType::SwitchboardPush => {
                let url = listener.call_info.data.as_deref().ok_or_else(|| {
                    ListenerError::Transmit(format!(
                        "listener {} has no push endpoint",
                        listener.listener_id
                    ))
                })?;
                let factory = self.push_endpoints.as_ref().ok_or_else(|| {
                    ListenerError::Transmit("no push endpoint factory configured".to_string())
                })?;
                let endpoint = factory.connect(url)?;
                Transmitter::Push(Arc::new(SwitchboardPushTransmitter::new(url, endpoint)))
            }
            TransmitterType::PullResponder => Transmitter::Pull(Arc::new(PullResponder::new(
                &listener.drive_id,
                &listener.listener_id,
                self.strands.clone(),
            ))),
        };

        debug!(listener = %listener.listener_id, kind = ?listener.transmitter_type, "Created transmitter");
        transmitters.insert(listener.listener_id.clone(), transmitter.clone());
        Ok(transmitter)
    }

    pub async fn get_transmitter(&self, listener_id: &str) -> Option<Transmitter> {
        self.transmitters.read().await.get(listener_id).cloned()
    }

    /// Disconnect (best-effort) and forget a listener's transmitter
    pub async fn delete_transmitter(&self, listener_id: &str) -> bool {
        let removed = self.transmitters.write().await.remove(listener_id);
        match removed {
            Some(transmitter) => {
                if let Err(e) = transmitter.disconnect().await {
                    warn!(listener = %listener_id, error = %e, "Transmitter disconnect failed");
                }
                true
            }
            None => false,
        }
    }

    /// Create transmitters for restored listeners, skipping ones that exist
    pub async fn init_transmitters(&self, listeners: &[Listener]) -> Result<(), InitTransmittersError> {
        let mut errors = Vec::new();
        for listener in listeners {
            match self.create_transmitter(listener).await {
                Ok(_) | Err(ListenerError::DuplicatedTransmitter(_)) => {}
                Err(e) => {
                    warn!(listener = %listener.listener_id, error = %e, "Failed to create transmitter");
                    errors.push((listener.listener_id.clone(), e));
                }
            }
        }
        info!(count = listeners.len(), failed = errors.len(), "Initialized transmitters");
        if errors.is_empty() {
            Ok(())
        } else {
            Err(InitTransmittersError { errors })
        }
    }

    pub async fn disconnect_all(&self) {
        let ids: Vec<String> = self.transmitters.read().await.keys().cloned().collect();
        for id in ids {
            self.delete_transmitter(&id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transmitter::UpdateSource;
    use async_trait::async_trait;
    use libstrand_core::store::MemoryStore;
    use libstrand_core::types::listener::ListenerFilter;
    use libstrand_core::{ListenerRegistry, StrandUpdate, SyncUnitRegistry};
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Sink {
        disconnected: AtomicBool,
    }

    #[async_trait]
    impl InternalReceiver for Sink {
        async fn receive(&self, _: &[StrandUpdate], _: &UpdateSource) -> Result<(), ListenerError> {
            Ok(())
        }

        async fn disconnect(&self) -> Result<(), ListenerError> {
            self.disconnected.store(true, Ordering::SeqCst);
            Err(ListenerError::Transmit("already closed".into()))
        }
    }

    fn manager() -> TransmitterManager {
        let strands = StrandCollector::new(
            Arc::new(MemoryStore::new()),
            Arc::new(ListenerRegistry::new()),
            Arc::new(SyncUnitRegistry::new()),
        );
        TransmitterManager::new(Arc::new(strands))
    }

    fn listener(id: &str, kind: TransmitterType) -> Listener {
        Listener::new(id, "drive", ListenerFilter::all(), kind)
    }

    #[tokio::test]
    async fn test_dispatch_on_transmitter_type() {
        let manager = manager();
        let sink = Arc::new(Sink {
            disconnected: AtomicBool::new(false),
        });
        manager.register_receiver("internal", sink).await;

        let push = manager
            .create_transmitter(&listener("internal", TransmitterType::Internal))
            .await
            .unwrap();
        assert!(push.is_push());
        let pull = manager
            .create_transmitter(&listener("pull", TransmitterType::PullResponder))
            .await
            .unwrap();
        assert!(!pull.is_push());
    }

    #[tokio::test]
    async fn test_duplicate_transmitter_rejected() {
        let manager = manager();
        let pull = listener("pull", TransmitterType::PullResponder);
        manager.create_transmitter(&pull).await.unwrap();
        let err = manager.create_transmitter(&pull).await.unwrap_err();
        assert!(matches!(err, ListenerError::DuplicatedTransmitter(_)));
    }

    #[tokio::test]
    async fn test_init_ignores_duplicates_and_aggregates_failures() {
        let manager = manager();
        let pull = listener("pull", TransmitterType::PullResponder);
        manager.create_transmitter(&pull).await.unwrap();

        let listeners = vec![
            pull,
            listener("push", TransmitterType::SwitchboardPush),
            listener("other", TransmitterType::PullResponder),
        ];
        let err = manager.init_transmitters(&listeners).await.unwrap_err();
        assert_eq!(err.errors.len(), 1);
        assert_eq!(err.errors[0].0, "push");
        assert!(manager.get_transmitter("other").await.is_some());
    }

    #[tokio::test]
    async fn test_delete_swallows_disconnect_errors() {
        let manager = manager();
        let sink = Arc::new(Sink {
            disconnected: AtomicBool::new(false),
        });
        manager.register_receiver("internal", sink.clone()).await;
        manager
            .create_transmitter(&listener("internal", TransmitterType::Internal))
            .await
            .unwrap();

        assert!(manager.delete_transmitter("internal").await);
        assert!(sink.disconnected.load(Ordering::SeqCst));
        assert!(!manager.delete_transmitter("internal").await);
    }
}
