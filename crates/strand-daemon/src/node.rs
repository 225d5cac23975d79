//! A strand node: storage, reactor, listener manager and remote sync wired
//! over one event bus

use std::collections::BTreeMap;
use std::sync::Arc;

use libstrand_core::config::{StorageConfig, StrandConfig};
use libstrand_core::event_bus::JobWriteReadyEvent;
use libstrand_core::store::{
    DocumentOperationStorage, ListenerStorage, MemoryStore, SledStore, SyncCursorStorage,
    SyncRemoteStorage,
};
use libstrand_core::types::operation::now_utc_ms;
use libstrand_core::{
    EventBus, EventType, InMemoryOperationIndex, ListenerRegistry, OperationIndex, ReactorEvent,
    Subscription,
    SyncUnit, SyncUnitRegistry,
};
use libstrand_listener::{
    ListenerError, ListenerManager, ListenerPersistence, StrandCollector, TransmitterManager,
    UpdateSource,
};
use libstrand_reactor::Reactor;
use libstrand_sync::{ChannelFactory, InternalNetwork, NewRemote, SyncError, SyncManager};
use tracing::{info, warn};

use crate::error::DaemonError;

/// Storage handles of a node, all backed by one store
struct Storage {
    documents: Arc<dyn DocumentOperationStorage>,
    index: Arc<dyn OperationIndex>,
    listeners: Arc<dyn ListenerStorage>,
    remotes: Arc<dyn SyncRemoteStorage>,
    cursors: Arc<dyn SyncCursorStorage>,
}

impl Storage {
    fn open(config: &StorageConfig) -> Result<Self, DaemonError> {
        match &config.path {
            Some(path) => {
                info!(path = %path.display(), "Opening sled storage");
                let store = Arc::new(SledStore::open(path)?);
                let index = Arc::new(store.operation_index()?);
                Ok(Self::from_store(store, index))
            }
            None => {
                info!("Using in-memory storage");
                Ok(Self::from_store(
                    Arc::new(MemoryStore::new()),
                    Arc::new(InMemoryOperationIndex::new()),
                ))
            }
        }
    }

    fn from_store<S>(store: Arc<S>, index: Arc<dyn OperationIndex>) -> Self
    where
        S: DocumentOperationStorage + ListenerStorage + SyncRemoteStorage + SyncCursorStorage + 'static,
    {
        Self {
            documents: store.clone(),
            index,
            listeners: store.clone(),
            remotes: store.clone(),
            cursors: store,
        }
    }
}

pub struct Node {
    bus: Arc<EventBus>,
    reactor: Arc<Reactor>,
    listeners: Arc<ListenerManager>,
    sync: Arc<SyncManager>,
    persistence: ListenerPersistence,
    bridge: Subscription,
}

impl Node {
    /// Start a node whose remotes use in-process channels
    pub async fn start(config: &StrandConfig) -> Result<Self, DaemonError> {
        let network = Arc::new(InternalNetwork::new(config.sync.clone()));
        Self::start_with(config, network).await
    }

    pub async fn start_with(
        config: &StrandConfig,
        channels: Arc<dyn ChannelFactory>,
    ) -> Result<Self, DaemonError> {
        let storage = Storage::open(&config.storage)?;
        let index = storage.index.clone();
        let bus = Arc::new(EventBus::new());

        let reactor = Arc::new(Reactor::new(
            storage.documents.clone(),
            index.clone(),
            bus.clone(),
            config.reactor.clone().into(),
        ));
        reactor.start();

        let strands = Arc::new(StrandCollector::new(
            storage.documents.clone(),
            Arc::new(ListenerRegistry::new()),
            Arc::new(SyncUnitRegistry::new()),
        ));
        let transmitters = Arc::new(TransmitterManager::new(strands.clone()));
        let listeners = Arc::new(ListenerManager::new(
            config.listener.clone().into(),
            transmitters,
            strands,
        ));
        match listeners.initialize(storage.listeners.as_ref()).await {
            Ok(()) => {}
            Err(ListenerError::InitTransmitters(e)) => {
                warn!(error = %e, "Some listeners have no transmitter")
            }
            Err(e) => return Err(e.into()),
        }
        let persistence = ListenerPersistence::attach(listeners.listeners(), storage.listeners.clone());

        let sync = Arc::new(SyncManager::new(
            storage.remotes.clone(),
            storage.cursors.clone(),
            index,
            bus.clone(),
            reactor.clone(),
            channels,
        ));
        sync.startup().await?;
        for remote in &config.remotes {
            match sync.get_by_name(&remote.name) {
                Ok(_) => continue,
                Err(SyncError::RemoteNotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
            let mut new = NewRemote::new(&remote.name, &remote.collection_id, remote.channel.clone());
            new.filter = remote.filter.clone();
            sync.add(new).await?;
        }

        let bridge = bridge_revisions(&bus, listeners.clone());
        info!(remotes = sync.list().len(), "Node started");
        Ok(Self {
            bus,
            reactor,
            listeners,
            sync,
            persistence,
            bridge,
        })
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn reactor(&self) -> &Arc<Reactor> {
        &self.reactor
    }

    pub fn listeners(&self) -> &Arc<ListenerManager> {
        &self.listeners
    }

    pub fn sync(&self) -> &Arc<SyncManager> {
        &self.sync
    }

    /// Stop remote sync first so no new loads reach the reactor
    pub async fn shutdown(self) {
        self.bridge.unsubscribe();
        self.sync.shutdown().await;
        self.listeners.shutdown().await;
        self.persistence.detach(self.listeners.listeners()).await;
        self.reactor.shutdown().await;
        info!("Node stopped");
    }
}

/// Feed written operations into the sync-unit revisions the listeners follow
fn bridge_revisions(bus: &EventBus, listeners: Arc<ListenerManager>) -> Subscription {
    bus.subscribe(EventType::JobWriteReady, move |event: Arc<ReactorEvent>| {
        if let ReactorEvent::JobWriteReady(event) = event.as_ref() {
            let source = match &event.job_meta.source_remote {
                Some(remote) => UpdateSource::Trigger { url: remote.clone() },
                None => UpdateSource::Local,
            };
            for (drive_id, units) in sync_units_by_drive(event) {
                let listeners = listeners.clone();
                let source = source.clone();
                tokio::spawn(async move {
                    if let Err(e) = listeners
                        .update_synchronization_revisions(&drive_id, &units, source, None, None, false)
                        .await
                    {
                        warn!(drive = %drive_id, error = %e, "Listener update failed");
                    }
                });
            }
        }
        async { Ok(()) }
    })
}

/// Latest revision per sync unit, grouped by the drives holding the document
fn sync_units_by_drive(event: &JobWriteReadyEvent) -> BTreeMap<String, Vec<SyncUnit>> {
    let mut latest: BTreeMap<(String, String, String), (String, u64)> = BTreeMap::new();
    for op in &event.operations {
        let key = (
            op.context.document_id.clone(),
            op.context.scope.clone(),
            op.context.branch.clone(),
        );
        let entry = latest
            .entry(key)
            .or_insert_with(|| (op.context.document_type.clone(), 0));
        entry.1 = entry.1.max(op.operation.index);
    }

    let now = now_utc_ms();
    let mut by_drive: BTreeMap<String, Vec<SyncUnit>> = BTreeMap::new();
    for ((document_id, scope, branch), (document_type, revision)) in latest {
        let prefix = format!("{branch}:");
        let drives = event
            .collection_memberships
            .get(&document_id)
            .into_iter()
            .flatten()
            .filter_map(|collection| collection.strip_prefix(&prefix));
        for drive_id in drives {
            by_drive.entry(drive_id.to_string()).or_default().push(
                SyncUnit::new(drive_id, &document_id, &document_type, &scope, &branch)
                    .with_revision(revision, now),
            );
        }
    }
    by_drive
}

#[cfg(test)]
mod tests {
    use super::*;
    use libstrand_core::types::job::JobMeta;
    use libstrand_core::{Action, Operation, OperationContext, OperationWithContext};
    use std::collections::HashMap;

    fn op(document_id: &str, scope: &str, index: u64) -> OperationWithContext {
        OperationWithContext {
            operation: Operation {
                id: format!("{document_id}-{index}"),
                index,
                skip: 0,
                hash: "h".into(),
                timestamp_utc_ms: 1,
                action: Action::new("SET", scope, serde_json::Value::Null),
            },
            context: OperationContext {
                document_id: document_id.into(),
                document_type: "test/doc".into(),
                scope: scope.into(),
                branch: "main".into(),
            },
            ordinal: None,
        }
    }

    #[test]
    fn test_units_take_the_last_index_per_scope() {
        let event = JobWriteReadyEvent {
            job_id: "j1".into(),
            operations: vec![op("doc-1", "global", 3), op("doc-1", "global", 4), op("doc-1", "local", 1)],
            collection_memberships: HashMap::from([(
                "doc-1".to_string(),
                vec!["main:drive-1".to_string(), "main:drive-2".to_string()],
            )]),
            job_meta: JobMeta::single("j1"),
        };

        let units = sync_units_by_drive(&event);
        assert_eq!(units.len(), 2);
        let drive_1 = &units["drive-1"];
        assert_eq!(drive_1.len(), 2);
        let global = drive_1.iter().find(|u| u.scope == "global").unwrap();
        assert_eq!(global.revision, 4);
        assert_eq!(global.drive_id, "drive-1");
    }

    #[test]
    fn test_documents_outside_drives_have_no_units() {
        let event = JobWriteReadyEvent {
            job_id: "j1".into(),
            operations: vec![op("doc-1", "global", 1)],
            collection_memberships: HashMap::from([("doc-1".to_string(), vec!["other:drive-1".to_string()])]),
            job_meta: JobMeta::single("j1"),
        };
        assert!(sync_units_by_drive(&event).is_empty());
    }
}
