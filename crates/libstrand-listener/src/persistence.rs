//! Writes listener state to storage as the registry changes
//!
//! Registry observers run synchronously, so they only enqueue; a single
//! worker task applies writes to storage in the order they happened.

use std::sync::Arc;

use libstrand_core::registry::ObserverId;
use libstrand_core::store::ListenerStorage;
use libstrand_core::{ListenerRegistry, ListenerState, RegistryEvent};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error};

enum PersistMessage {
    Save(Box<ListenerState>),
    Remove(String),
    Flush(oneshot::Sender<()>),
}

pub struct ListenerPersistence {
    tx: mpsc::UnboundedSender<PersistMessage>,
    observers: Vec<ObserverId>,
    worker: JoinHandle<()>,
}

impl ListenerPersistence {
    /// Subscribe to `registry` and persist every change to `storage`
    pub fn attach(registry: &ListenerRegistry, storage: Arc<dyn ListenerStorage>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(persist_worker(rx, storage));

        let mut observers = Vec::with_capacity(3);
        for event in [RegistryEvent::Add, RegistryEvent::Update] {
            let tx = tx.clone();
            observers.push(registry.on(event, move |_, state| {
                let _ = tx.send(PersistMessage::Save(Box::new(state.clone())));
            }));
        }
        let remove_tx = tx.clone();
        observers.push(registry.on(RegistryEvent::Remove, move |id, _| {
            let _ = remove_tx.send(PersistMessage::Remove(id.to_string()));
        }));

        Self {
            tx,
            observers,
            worker,
        }
    }

    /// Wait until every change queued so far is written
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        if self.tx.send(PersistMessage::Flush(done)).is_ok() {
            let _ = wait.await;
        }
    }

    /// Stop observing and drain outstanding writes
    pub async fn detach(self, registry: &ListenerRegistry) {
        for id in &self.observers {
            registry.off(*id);
        }
        self.flush().await;
        drop(self.tx);
        self.worker.abort();
    }
}

async fn persist_worker(
    mut rx: mpsc::UnboundedReceiver<PersistMessage>,
    storage: Arc<dyn ListenerStorage>,
) {
    while let Some(message) = rx.recv().await {
        match message {
            PersistMessage::Save(state) => {
                let listener_id = state.listener.listener_id.clone();
                if let Err(e) = storage.save_listener(&state).await {
                    error!(listener = %listener_id, error = %e, "Failed to persist listener");
                }
            }
            PersistMessage::Remove(listener_id) => {
                if let Err(e) = storage.remove_listener(&listener_id).await {
                    error!(listener = %listener_id, error = %e, "Failed to delete listener");
                }
            }
            PersistMessage::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!("Listener persistence stopped");
}
