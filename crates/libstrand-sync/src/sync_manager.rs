//! Sync manager
//!
//! Owns the remotes of a node. Write-ready job events are routed serially:
//! batches are assembled, collection membership is derived, and matching
//! operations are appended to each remote's outbox together with anything
//! the operation index holds beyond the remote's anchor. Operations arriving
//! in a remote's inbox are loaded through the reactor.
//!
//! Index catch-up never reaches past the highest ordinal the router has
//! received, and skips operations held in incomplete batches. Those reach
//! the outbox through their own events.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use async_trait::async_trait;
use libstrand_core::event_bus::{BoxError, JobFailedEvent, JobWriteReadyEvent};
use libstrand_core::operation_index::FindOptions;
use libstrand_core::store::{SyncCursorStorage, SyncRemoteStorage};
use libstrand_core::types::ids::{drive_collection_id, new_id};
use libstrand_core::types::job::{JobInfo, JobStatus};
use libstrand_core::types::operation::{
    action_types, RelationshipInput, DOCUMENT_SCOPE, DRIVE_DOCUMENT_TYPE,
};
use libstrand_core::types::remote::{
    ChannelConfig, RemoteFilter, RemoteOptions, RemoteRecord, RemoteStatus,
};
use libstrand_core::{EventBus, EventType, Operation, OperationIndex, OperationWithContext, ReactorEvent, Subscription};
use libstrand_reactor::{BatchJobPlan, BatchResult, JobKind, Reactor, ReactorError, RequestMeta};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::batch_aggregator::{BatchAggregator, PreparedBatch};
use crate::channel::{Channel, ChannelFactory, ChannelSpec};
use crate::error::{ChannelError, SyncError};
use crate::status_tracker::SyncStatusTracker;
use crate::sync_operation::SyncOperation;

/// What the sync manager needs from the reactor
#[async_trait]
pub trait ReactorClient: Send + Sync {
    async fn load(
        &self,
        document_id: &str,
        branch: &str,
        operations: Vec<Operation>,
        meta: RequestMeta,
    ) -> Result<JobInfo, ReactorError>;

    async fn load_batch(
        &self,
        plans: Vec<BatchJobPlan>,
        meta: RequestMeta,
    ) -> Result<BatchResult, ReactorError>;

    async fn wait_for_job(&self, job_id: &str) -> Result<JobInfo, ReactorError>;
}

#[async_trait]
impl ReactorClient for Reactor {
    async fn load(
        &self,
        document_id: &str,
        branch: &str,
        operations: Vec<Operation>,
        meta: RequestMeta,
    ) -> Result<JobInfo, ReactorError> {
        Reactor::load(self, document_id, branch, operations, meta).await
    }

    async fn load_batch(
        &self,
        plans: Vec<BatchJobPlan>,
        meta: RequestMeta,
    ) -> Result<BatchResult, ReactorError> {
        Reactor::load_batch(self, plans, meta).await
    }

    async fn wait_for_job(&self, job_id: &str) -> Result<JobInfo, ReactorError> {
        Reactor::wait_for_job(self, job_id).await
    }
}

/// Parameters of `SyncManager::add`
#[derive(Debug, Clone)]
pub struct NewRemote {
    pub name: String,
    pub collection_id: String,
    pub channel_config: ChannelConfig,
    pub filter: RemoteFilter,
    pub options: RemoteOptions,
    /// Generated when absent
    pub id: Option<String>,
}

impl NewRemote {
    pub fn new(name: &str, collection_id: &str, channel_config: ChannelConfig) -> Self {
        Self {
            name: name.to_string(),
            collection_id: collection_id.to_string(),
            channel_config,
            filter: RemoteFilter::default(),
            options: RemoteOptions::default(),
            id: None,
        }
    }

    pub fn with_filter(mut self, filter: RemoteFilter) -> Self {
        self.filter = filter;
        self
    }
}

/// A connected remote
#[derive(Clone)]
pub struct Remote {
    pub id: String,
    pub name: String,
    pub collection_id: String,
    pub channel_config: ChannelConfig,
    pub filter: RemoteFilter,
    pub options: RemoteOptions,
    pub channel: Arc<dyn Channel>,
}

impl Remote {
    fn from_record(record: &RemoteRecord, channel: Arc<dyn Channel>) -> Self {
        Self {
            id: record.id.clone(),
            name: record.name.clone(),
            collection_id: record.collection_id.clone(),
            channel_config: record.channel_config.clone(),
            filter: record.filter.clone(),
            options: record.options.clone(),
            channel,
        }
    }

    /// Persistable form with the channel's current health
    pub fn record(&self) -> RemoteRecord {
        RemoteRecord {
            id: self.id.clone(),
            name: self.name.clone(),
            collection_id: self.collection_id.clone(),
            channel_config: self.channel_config.clone(),
            filter: self.filter.clone(),
            options: self.options.clone(),
            status: self.channel.status(),
        }
    }
}

impl fmt::Debug for Remote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Remote")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("collection_id", &self.collection_id)
            .field("channel", &self.channel.id())
            .finish()
    }
}

enum RouterMessage {
    WriteReady(JobWriteReadyEvent),
    Failed(JobFailedEvent),
    Backfill {
        remote_name: String,
        done: oneshot::Sender<()>,
    },
    Shutdown,
}

/// How far the router has seen the operation index
#[derive(Debug, Default)]
struct RouterProgress {
    /// Highest ordinal of any received write-ready event
    watermark: u64,
    /// Operations of batches that are still incomplete
    held: HashSet<String>,
}

enum InboxMessage {
    Received {
        remote_name: String,
        items: Vec<Arc<SyncOperation>>,
    },
    Shutdown,
}

/// State shared with the background workers
struct Shared {
    remote_storage: Arc<dyn SyncRemoteStorage>,
    cursor_storage: Arc<dyn SyncCursorStorage>,
    index: Arc<dyn OperationIndex>,
    reactor: Arc<dyn ReactorClient>,
    remotes: RwLock<HashMap<String, Remote>>,
}

impl Shared {
    fn remote(&self, name: &str) -> Option<Remote> {
        self.remotes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    fn remotes(&self) -> Vec<Remote> {
        let mut remotes: Vec<Remote> = self
            .remotes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        remotes.sort_by(|a, b| a.name.cmp(&b.name));
        remotes
    }

    /// Ordinal after which the index may hold operations the remote has not seen
    async fn anchor(&self, remote: &Remote) -> Result<u64, SyncError> {
        let cursor = self
            .cursor_storage
            .get(&remote.name)
            .await?
            .map_or(0, |cursor| cursor.cursor_ordinal);
        Ok(cursor.max(remote.channel.outbox().latest_ordinal()))
    }

    /// Indexed operations in `(anchor, watermark]`, minus held and routed ones
    async fn catch_up(
        &self,
        remote: &Remote,
        anchor: u64,
        progress: &RouterProgress,
        already_routed: &HashSet<String>,
    ) -> Result<Vec<SyncOperation>, SyncError> {
        if anchor >= progress.watermark {
            return Ok(Vec::new());
        }
        let found = self
            .index
            .find(&remote.collection_id, anchor, &FindOptions::excluding(&remote.name))
            .await?;
        let mut seen = already_routed.clone();
        let operations: Vec<OperationWithContext> = found
            .iter()
            .take_while(|indexed| indexed.ordinal <= progress.watermark)
            .filter(|indexed| !progress.held.contains(&indexed.operation.id))
            .filter(|indexed| remote.filter.matches(&indexed.context))
            .filter(|indexed| seen.insert(indexed.operation.id.clone()))
            .map(|indexed| indexed.to_with_context())
            .collect();
        Ok(group_by_document(&remote.name, operations))
    }

    async fn backfill(&self, remote: &Remote, progress: &RouterProgress) {
        let outgoing = match self.anchor(remote).await {
            Ok(anchor) => self.catch_up(remote, anchor, progress, &HashSet::new()).await,
            Err(e) => Err(e),
        };
        match outgoing {
            Ok(outgoing) if outgoing.is_empty() => {}
            Ok(outgoing) => {
                info!(remote = %remote.name, count = outgoing.len(), "Backfilling outbox");
                let items = outgoing.into_iter().map(Arc::new).collect();
                if let Err(e) = remote.channel.outbox().add(items) {
                    warn!(remote = %remote.name, error = %e, "Outbox callback failed");
                }
            }
            Err(e) => warn!(remote = %remote.name, error = %e, "Backfill failed"),
        }
    }

    async fn route(&self, batch: PreparedBatch, progress: &RouterProgress) {
        let memberships = derive_memberships(&batch);
        for remote in self.remotes() {
            let anchor = match self.anchor(&remote).await {
                Ok(anchor) => anchor,
                Err(e) => {
                    warn!(remote = %remote.name, error = %e, "Failed to read anchor; skipping remote");
                    continue;
                }
            };
            let mut outgoing = Vec::new();
            let mut routed: HashSet<String> = HashSet::new();
            let mut previous_job: Option<String> = None;

            for entry in &batch.entries {
                let event = &entry.event;
                if event.job_meta.source_remote.as_deref() == Some(remote.name.as_str()) {
                    continue;
                }
                let operations: Vec<OperationWithContext> = event
                    .operations
                    .iter()
                    .filter(|op| {
                        memberships
                            .get(&op.context.document_id)
                            .is_some_and(|collections| collections.contains(&remote.collection_id))
                            && remote.filter.matches(&op.context)
                    })
                    // held batch ops never went through catch-up
                    .filter(|op| batch.is_batch || op.ordinal.map_or(true, |o| o > anchor))
                    .cloned()
                    .collect();
                if operations.is_empty() {
                    continue;
                }
                routed.extend(operations.iter().map(|op| op.operation.id.clone()));

                let dependencies: Vec<String> = previous_job.iter().cloned().collect();
                for sync_op in group_by_document(&remote.name, operations) {
                    outgoing.push(if batch.is_batch {
                        sync_op.with_job(&event.job_id, dependencies.clone())
                    } else {
                        sync_op
                    });
                }
                if batch.is_batch {
                    previous_job = Some(event.job_id.clone());
                }
            }

            match self.catch_up(&remote, anchor, progress, &routed).await {
                Ok(extra) => outgoing.extend(extra),
                Err(e) => warn!(remote = %remote.name, error = %e, "Index catch-up failed"),
            }
            if outgoing.is_empty() {
                continue;
            }
            debug!(remote = %remote.name, count = outgoing.len(), "Routing sync operations");
            let items = outgoing.into_iter().map(Arc::new).collect();
            if let Err(e) = remote.channel.outbox().add(items) {
                warn!(remote = %remote.name, error = %e, "Outbox callback failed");
            }
        }
    }

    async fn apply_inbox(&self, remote_name: &str, items: Vec<Arc<SyncOperation>>) {
        let Some(remote) = self.remote(remote_name) else {
            warn!(remote = %remote_name, "Dropping inbox items of unknown remote");
            return;
        };
        let meta = RequestMeta::from_remote(remote_name);
        let (keyed, single): (Vec<_>, Vec<_>) = items
            .into_iter()
            .filter(|item| !item.status().is_final())
            .partition(|item| item.is_keyed());

        if !keyed.is_empty() {
            self.apply_keyed(remote.channel.as_ref(), keyed, &meta).await;
        }
        for item in single {
            self.apply_single(remote.channel.as_ref(), item, &meta).await;
        }
    }

    /// Load keyed items as one batch, preserving their job dependencies
    async fn apply_keyed(&self, channel: &dyn Channel, items: Vec<Arc<SyncOperation>>, meta: &RequestMeta) {
        let mut keys_by_job: HashMap<String, Vec<String>> = HashMap::new();
        let mut grouped = Vec::with_capacity(items.len());
        for item in &items {
            let groups = scope_groups(item);
            let keys: Vec<String> = groups
                .iter()
                .map(|(scope, _)| format!("{}#{}", item.job_id, scope))
                .collect();
            keys_by_job
                .entry(item.job_id.clone())
                .or_default()
                .extend(keys.iter().cloned());
            grouped.push((groups, keys));
        }

        let mut plans = Vec::new();
        for (item, (groups, keys)) in items.iter().zip(&grouped) {
            for (position, ((scope, operations), key)) in groups.iter().zip(keys).enumerate() {
                let depends_on = if position == 0 {
                    item.job_dependencies
                        .iter()
                        .filter(|dep| **dep != item.job_id)
                        .filter_map(|dep| keys_by_job.get(dep))
                        .flatten()
                        .cloned()
                        .collect()
                } else {
                    vec![keys[position - 1].clone()]
                };
                plans.push(BatchJobPlan {
                    key: key.clone(),
                    document_id: item.document_id.clone(),
                    scope: scope.clone(),
                    branch: item.branch.clone(),
                    kind: JobKind::Load {
                        operations: operations.clone(),
                    },
                    depends_on,
                });
            }
        }

        let result = match self.reactor.load_batch(plans, meta.clone()).await {
            Ok(result) => result,
            Err(e) => {
                error!(remote = %channel.remote_name(), error = %e, "Batch load rejected");
                dead_letter(channel, &items, ChannelError::inbox(e.to_string()));
                return;
            }
        };

        for (item, (_, keys)) in items.iter().zip(&grouped) {
            let job_ids: Vec<String> = keys
                .iter()
                .filter_map(|key| result.jobs.get(key).map(|info| info.id.clone()))
                .collect();
            match self.wait_all(&job_ids).await {
                Ok(()) => applied(channel, item),
                Err(message) => dead_letter(channel, std::slice::from_ref(item), ChannelError::inbox(message)),
            }
        }
    }

    async fn apply_single(&self, channel: &dyn Channel, item: Arc<SyncOperation>, meta: &RequestMeta) {
        for (_, operations) in scope_groups(&item) {
            let outcome = match self
                .reactor
                .load(&item.document_id, &item.branch, operations, meta.clone())
                .await
            {
                Ok(info) => self.wait_all(&[info.id]).await,
                Err(e) => Err(e.to_string()),
            };
            if let Err(message) = outcome {
                dead_letter(channel, std::slice::from_ref(&item), ChannelError::inbox(message));
                return;
            }
        }
        applied(channel, &item);
    }

    async fn wait_all(&self, job_ids: &[String]) -> Result<(), String> {
        for job_id in job_ids {
            let info = self
                .reactor
                .wait_for_job(job_id)
                .await
                .map_err(|e| e.to_string())?;
            if info.status == JobStatus::Failed {
                let reason = info.error.map(|e| e.message).unwrap_or_default();
                return Err(format!("Failed to apply operations: {reason}"));
            }
        }
        Ok(())
    }
}

fn applied(channel: &dyn Channel, item: &Arc<SyncOperation>) {
    item.executed();
    if let Err(e) = channel.inbox().remove(&[item.id.clone()]) {
        warn!(remote = %channel.remote_name(), error = %e, "Inbox callback failed");
    }
}

fn dead_letter(channel: &dyn Channel, items: &[Arc<SyncOperation>], error: ChannelError) {
    error!(
        remote = %channel.remote_name(),
        count = items.len(),
        error = %error,
        "Moving sync operations to dead letter"
    );
    for item in items {
        item.failed(error.clone());
    }
    if let Err(e) = channel.dead_letter().add(items.to_vec()) {
        warn!(remote = %channel.remote_name(), error = %e, "Dead letter callback failed");
    }
    let ids: Vec<String> = items.iter().map(|item| item.id.clone()).collect();
    if let Err(e) = channel.inbox().remove(&ids) {
        warn!(remote = %channel.remote_name(), error = %e, "Inbox callback failed");
    }
}

/// Operations per scope, document scope first, each set to its context scope
fn scope_groups(item: &SyncOperation) -> Vec<(String, Vec<Operation>)> {
    let mut groups: Vec<(String, Vec<Operation>)> = Vec::new();
    for op in &item.operations {
        let scope = &op.context.scope;
        let mut operation = op.operation.clone();
        operation.action.scope = scope.clone();
        match groups.iter_mut().find(|(s, _)| s == scope) {
            Some((_, ops)) => ops.push(operation),
            None => groups.push((scope.clone(), vec![operation])),
        }
    }
    groups.sort_by_key(|(scope, _)| scope != DOCUMENT_SCOPE);
    groups
}

/// One sync operation per document and branch, in first-seen order
fn group_by_document(remote_name: &str, operations: Vec<OperationWithContext>) -> Vec<SyncOperation> {
    let mut groups: Vec<((String, String), Vec<OperationWithContext>)> = Vec::new();
    for op in operations {
        let key = (op.context.document_id.clone(), op.context.branch.clone());
        match groups.iter_mut().find(|(k, _)| *k == key) {
            Some((_, ops)) => ops.push(op),
            None => groups.push((key, vec![op])),
        }
    }
    groups
        .into_iter()
        .map(|((document_id, branch), operations)| {
            let mut scopes: Vec<String> = Vec::new();
            for op in &operations {
                if !scopes.contains(&op.context.scope) {
                    scopes.push(op.context.scope.clone());
                }
            }
            SyncOperation::new(remote_name, &document_id, scopes, &branch, operations)
        })
        .collect()
}

/// Batch memberships plus children added to drives anywhere in the batch
fn derive_memberships(batch: &PreparedBatch) -> HashMap<String, Vec<String>> {
    let mut memberships = batch.collection_memberships.clone();
    for entry in &batch.entries {
        for op in &entry.event.operations {
            let action = &op.operation.action;
            if action.action_type != action_types::ADD_RELATIONSHIP
                || op.context.document_type != DRIVE_DOCUMENT_TYPE
            {
                continue;
            }
            let Ok(input) = serde_json::from_value::<RelationshipInput>(action.input.clone()) else {
                continue;
            };
            let collection = drive_collection_id(&op.context.branch, &input.source_id);
            let collections = memberships.entry(input.target_id).or_default();
            if !collections.contains(&collection) {
                collections.push(collection);
            }
        }
    }
    memberships
}

struct RouterWorker {
    shared: Arc<Shared>,
    aggregator: BatchAggregator,
    progress: RouterProgress,
    rx: mpsc::UnboundedReceiver<RouterMessage>,
}

impl RouterWorker {
    async fn run(mut self) {
        info!("Sync router started");
        while let Some(message) = self.rx.recv().await {
            let batch = match message {
                RouterMessage::WriteReady(event) => {
                    let highest = event.operations.iter().filter_map(|op| op.ordinal).max();
                    if let Some(ordinal) = highest {
                        self.progress.watermark = self.progress.watermark.max(ordinal);
                    }
                    self.aggregator.write_ready(event)
                }
                RouterMessage::Failed(event) => self.aggregator.job_failed(&event),
                RouterMessage::Backfill { remote_name, done } => {
                    if let Some(remote) = self.shared.remote(&remote_name) {
                        self.shared.backfill(&remote, &self.progress).await;
                    }
                    let _ = done.send(());
                    continue;
                }
                RouterMessage::Shutdown => {
                    self.aggregator.clear();
                    break;
                }
            };
            self.progress.held = self.aggregator.held_operation_ids();
            if let Some(batch) = batch {
                self.shared.route(batch, &self.progress).await;
            }
        }
        info!("Sync router stopped");
    }
}

struct InboxWorker {
    shared: Arc<Shared>,
    rx: mpsc::UnboundedReceiver<InboxMessage>,
}

impl InboxWorker {
    async fn run(mut self) {
        info!("Sync inbox worker started");
        while let Some(message) = self.rx.recv().await {
            match message {
                InboxMessage::Received { remote_name, items } => {
                    self.shared.apply_inbox(&remote_name, items).await;
                }
                InboxMessage::Shutdown => break,
            }
        }
        info!("Sync inbox worker stopped");
    }
}

struct Workers {
    subscriptions: Vec<Subscription>,
    router_tx: mpsc::UnboundedSender<RouterMessage>,
    router: JoinHandle<()>,
    inbox: JoinHandle<()>,
}

pub struct SyncManager {
    shared: Arc<Shared>,
    bus: Arc<EventBus>,
    factory: Arc<dyn ChannelFactory>,
    status: Arc<SyncStatusTracker>,
    inbox_tx: mpsc::UnboundedSender<InboxMessage>,
    inbox_rx: Mutex<Option<mpsc::UnboundedReceiver<InboxMessage>>>,
    workers: Mutex<Option<Workers>>,
    shut_down: AtomicBool,
}

impl SyncManager {
    pub fn new(
        remote_storage: Arc<dyn SyncRemoteStorage>,
        cursor_storage: Arc<dyn SyncCursorStorage>,
        index: Arc<dyn OperationIndex>,
        bus: Arc<EventBus>,
        reactor: Arc<dyn ReactorClient>,
        factory: Arc<dyn ChannelFactory>,
    ) -> Self {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(Shared {
                remote_storage,
                cursor_storage,
                index,
                reactor,
                remotes: RwLock::new(HashMap::new()),
            }),
            bus,
            factory,
            status: SyncStatusTracker::new(),
            inbox_tx,
            inbox_rx: Mutex::new(Some(inbox_rx)),
            workers: Mutex::new(None),
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn status_tracker(&self) -> &Arc<SyncStatusTracker> {
        &self.status
    }

    /// Connect persisted remotes and start routing job events
    pub async fn startup(&self) -> Result<(), SyncError> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(SyncError::ShutDown);
        }
        let Some(inbox_rx) = self
            .inbox_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return Ok(());
        };

        let progress = RouterProgress {
            watermark: self.shared.index.latest_ordinal().await?,
            held: HashSet::new(),
        };
        for record in self.shared.remote_storage.list().await? {
            if self.shared.remote(&record.name).is_some() {
                continue;
            }
            match self.connect(&record).await {
                Ok(remote) => {
                    self.register(remote.clone());
                    self.shared.backfill(&remote, &progress).await;
                }
                Err(e) => {
                    error!(remote = %record.name, error = %e, "Failed to start channel; skipping remote")
                }
            }
        }

        let (router_tx, router_rx) = mpsc::unbounded_channel();
        let router = tokio::spawn(
            RouterWorker {
                shared: self.shared.clone(),
                aggregator: BatchAggregator::new(),
                progress,
                rx: router_rx,
            }
            .run(),
        );
        let inbox = tokio::spawn(
            InboxWorker {
                shared: self.shared.clone(),
                rx: inbox_rx,
            }
            .run(),
        );
        let subscriptions = [EventType::JobWriteReady, EventType::JobFailed]
            .into_iter()
            .map(|event_type| {
                let tx = router_tx.clone();
                self.bus.subscribe(event_type, move |event: Arc<ReactorEvent>| {
                    let message = match event.as_ref() {
                        ReactorEvent::JobWriteReady(e) => Some(RouterMessage::WriteReady(e.clone())),
                        ReactorEvent::JobFailed(e) => Some(RouterMessage::Failed(e.clone())),
                        _ => None,
                    };
                    let result: Result<(), BoxError> = match message {
                        Some(message) => tx.send(message).map_err(|_| "sync router stopped".into()),
                        None => Ok(()),
                    };
                    async move { result }
                })
            })
            .collect();

        *self.workers.lock().unwrap_or_else(PoisonError::into_inner) = Some(Workers {
            subscriptions,
            router_tx,
            router,
            inbox,
        });
        info!(remotes = self.shared.remotes().len(), "Sync manager started");
        Ok(())
    }

    /// Create, persist and connect a remote, then backfill its outbox
    pub async fn add(&self, new: NewRemote) -> Result<Remote, SyncError> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(SyncError::ShutDown);
        }
        if self.shared.remote(&new.name).is_some()
            || self.shared.remote_storage.get(&new.name).await?.is_some()
        {
            return Err(SyncError::DuplicatedRemote(new.name));
        }

        let record = RemoteRecord {
            id: new.id.unwrap_or_else(new_id),
            name: new.name,
            collection_id: new.collection_id,
            channel_config: new.channel_config,
            filter: new.filter,
            options: new.options,
            status: RemoteStatus::default(),
        };
        self.shared.remote_storage.upsert(&record).await?;
        let remote = match self.connect(&record).await {
            Ok(remote) => remote,
            Err(e) => {
                self.shared.remote_storage.remove(&record.name).await?;
                return Err(e);
            }
        };
        self.register(remote.clone());
        info!(remote = %remote.name, collection = %remote.collection_id, "Remote added");
        self.request_backfill(&remote).await?;
        Ok(remote)
    }

    /// Disconnect a remote and delete its record and cursor
    pub async fn remove(&self, name: &str) -> Result<(), SyncError> {
        let removed = self
            .shared
            .remotes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
        let Some(remote) = removed else {
            return Err(SyncError::RemoteNotFound(name.to_string()));
        };
        remote.channel.shutdown().await;
        self.status.untrack_remote(name);
        self.shared.remote_storage.remove(name).await?;
        self.shared.cursor_storage.remove(name).await?;
        info!(remote = %name, "Remote removed");
        Ok(())
    }

    pub fn get_by_name(&self, name: &str) -> Result<Remote, SyncError> {
        self.shared
            .remote(name)
            .ok_or_else(|| SyncError::RemoteNotFound(name.to_string()))
    }

    pub fn get_by_id(&self, id: &str) -> Result<Remote, SyncError> {
        self.shared
            .remotes()
            .into_iter()
            .find(|remote| remote.id == id)
            .ok_or_else(|| SyncError::RemoteNotFound(id.to_string()))
    }

    pub fn list(&self) -> Vec<Remote> {
        self.shared.remotes()
    }

    /// Stop accepting events, drop partial batches and shut every channel down
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let workers = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(workers) = workers {
            for subscription in &workers.subscriptions {
                subscription.unsubscribe();
            }
            let _ = workers.router_tx.send(RouterMessage::Shutdown);
            let _ = self.inbox_tx.send(InboxMessage::Shutdown);
            if let Err(e) = workers.router.await {
                warn!(error = %e, "Sync router task failed");
            }
            if let Err(e) = workers.inbox.await {
                warn!(error = %e, "Sync inbox task failed");
            }
        }

        let remotes: Vec<Remote> = self
            .shared
            .remotes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, remote)| remote)
            .collect();
        for remote in remotes {
            remote.channel.shutdown().await;
        }
        self.status.clear();
        info!("Sync manager shut down");
    }

    /// Backfill on the router task so it never races routing
    async fn request_backfill(&self, remote: &Remote) -> Result<(), SyncError> {
        let router_tx = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|workers| workers.router_tx.clone());
        let Some(router_tx) = router_tx else {
            let progress = RouterProgress {
                watermark: self.shared.index.latest_ordinal().await?,
                held: HashSet::new(),
            };
            self.shared.backfill(remote, &progress).await;
            return Ok(());
        };
        let (done, finished) = oneshot::channel();
        router_tx
            .send(RouterMessage::Backfill {
                remote_name: remote.name.clone(),
                done,
            })
            .map_err(|_| SyncError::ShutDown)?;
        finished.await.map_err(|_| SyncError::ShutDown)
    }

    async fn connect(&self, record: &RemoteRecord) -> Result<Remote, SyncError> {
        let channel = self.factory.instance(ChannelSpec {
            remote_id: &record.id,
            remote_name: &record.name,
            collection_id: &record.collection_id,
            config: &record.channel_config,
            filter: &record.filter,
            cursor_storage: self.shared.cursor_storage.clone(),
        })?;
        channel.init().await?;
        Ok(Remote::from_record(record, channel))
    }

    fn register(&self, remote: Remote) {
        let channel = remote.channel.clone();

        let weak = Arc::downgrade(&channel);
        channel.outbox().on_removed(move |items| {
            let ordinal = items
                .iter()
                .filter(|item| item.status() == crate::sync_operation::SyncOperationStatus::Applied)
                .filter_map(|item| item.max_ordinal())
                .max();
            if let (Some(ordinal), Some(channel)) = (ordinal, weak.upgrade()) {
                channel.update_cursor(ordinal);
            }
            Ok(())
        });

        let tx = self.inbox_tx.clone();
        let remote_name = remote.name.clone();
        channel.inbox().on_added(move |items| {
            tx.send(InboxMessage::Received {
                remote_name: remote_name.clone(),
                items: items.to_vec(),
            })
            .map_err(|_| "sync manager is shut down".into())
        });

        self.status.track_remote(&remote.name, channel.as_ref());
        self.shared
            .remotes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(remote.name.clone(), remote);
    }
}
