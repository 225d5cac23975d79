//! Channels move sync operations between this node and one remote
//!
//! A channel owns three mailboxes: the outbox (operations to send), the inbox
//! (operations received and waiting to be applied) and the dead-letter box
//! (operations that failed and need an operator).

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use libstrand_core::config::SyncConfig;
use libstrand_core::store::SyncCursorStorage;
use libstrand_core::types::operation::now_utc_ms;
use libstrand_core::types::remote::{ChannelConfig, RemoteFilter, RemoteStatus};
use libstrand_core::OperationWithContext;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cursor::CursorWriter;
use crate::error::{ChannelError, SyncError};
use crate::health::{HealthMonitor, HealthPolicy};
use crate::mailbox::{BufferPolicy, Mailbox};
use crate::sync_operation::SyncOperation;

pub const INTERNAL_CHANNEL_TYPE: &str = "internal";

#[async_trait]
pub trait Channel: Send + Sync {
    fn id(&self) -> &str;
    fn remote_name(&self) -> &str;
    fn inbox(&self) -> &Arc<Mailbox>;
    fn outbox(&self) -> &Arc<Mailbox>;
    fn dead_letter(&self) -> &Arc<Mailbox>;

    async fn init(&self) -> Result<(), SyncError>;

    /// Stop sending and receiving; pending cursor writes are flushed
    async fn shutdown(&self);

    /// Record that the remote has everything up to `ordinal`
    fn update_cursor(&self, ordinal: u64);

    fn status(&self) -> RemoteStatus;
}

/// Everything a factory needs to build the channel of one remote
pub struct ChannelSpec<'a> {
    pub remote_id: &'a str,
    pub remote_name: &'a str,
    pub collection_id: &'a str,
    pub config: &'a ChannelConfig,
    pub filter: &'a RemoteFilter,
    pub cursor_storage: Arc<dyn SyncCursorStorage>,
}

pub trait ChannelFactory: Send + Sync {
    fn instance(&self, spec: ChannelSpec<'_>) -> Result<Arc<dyn Channel>, SyncError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeType {
    Operations,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelMeta {
    pub id: String,
}

/// Operations of one outgoing sync operation, with its job ordering
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvelopeEntry {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub job_id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub job_dependencies: Vec<String>,
    pub operations: Vec<OperationWithContext>,
}

/// Unit of transfer between two channels
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncEnvelope {
    #[serde(rename = "type")]
    pub envelope_type: EnvelopeType,
    pub channel_meta: ChannelMeta,
    pub entries: Vec<EnvelopeEntry>,
}

impl SyncEnvelope {
    pub fn operations(channel_id: &str, items: &[Arc<SyncOperation>]) -> Self {
        Self {
            envelope_type: EnvelopeType::Operations,
            channel_meta: ChannelMeta {
                id: channel_id.to_string(),
            },
            entries: items
                .iter()
                .map(|item| EnvelopeEntry {
                    job_id: item.job_id.clone(),
                    job_dependencies: item.job_dependencies.clone(),
                    operations: item.operations.clone(),
                })
                .collect(),
        }
    }

    /// One sync operation per entry and document branch, tagged with `remote_name`
    pub fn to_sync_operations(&self, remote_name: &str) -> Vec<SyncOperation> {
        let mut result = Vec::new();
        for entry in &self.entries {
            let mut groups: Vec<((String, String), Vec<OperationWithContext>)> = Vec::new();
            for op in &entry.operations {
                let key = (op.context.document_id.clone(), op.context.branch.clone());
                match groups.iter_mut().find(|(k, _)| *k == key) {
                    Some((_, ops)) => ops.push(op.clone()),
                    None => groups.push((key, vec![op.clone()])),
                }
            }
            let keyed = groups.len() == 1;
            for ((document_id, branch), operations) in groups {
                let mut scopes: Vec<String> = Vec::new();
                for op in &operations {
                    if !scopes.contains(&op.context.scope) {
                        scopes.push(op.context.scope.clone());
                    }
                }
                let sync_op = SyncOperation::new(remote_name, &document_id, scopes, &branch, operations);
                result.push(if keyed {
                    sync_op.with_job(&entry.job_id, entry.job_dependencies.clone())
                } else {
                    sync_op
                });
            }
        }
        result
    }
}

pub type SendFn = Arc<dyn Fn(SyncEnvelope) -> Result<(), ChannelError> + Send + Sync>;

struct ChannelState {
    shutdown: bool,
    push: HealthMonitor,
    pull: HealthMonitor,
}

/// In-process transport: envelopes are handed to a send function
pub struct InternalChannel {
    id: String,
    remote_name: String,
    inbox: Arc<Mailbox>,
    outbox: Arc<Mailbox>,
    dead_letter: Arc<Mailbox>,
    send: SendFn,
    cursor: CursorWriter,
    state: Mutex<ChannelState>,
}

impl InternalChannel {
    pub fn new(
        id: &str,
        remote_name: &str,
        cursor_storage: Arc<dyn SyncCursorStorage>,
        send: SendFn,
        config: &SyncConfig,
    ) -> Arc<Self> {
        let policy = HealthPolicy::from(config);
        let channel = Arc::new(Self {
            id: id.to_string(),
            remote_name: remote_name.to_string(),
            inbox: Mailbox::new(),
            outbox: Mailbox::buffered(BufferPolicy::from(config)),
            dead_letter: Mailbox::new(),
            send,
            cursor: CursorWriter::new(
                remote_name,
                cursor_storage,
                Duration::from_millis(config.cursor_write_delay_ms),
            ),
            state: Mutex::new(ChannelState {
                shutdown: false,
                push: HealthMonitor::new(policy),
                pull: HealthMonitor::new(policy),
            }),
        });

        let weak = Arc::downgrade(&channel);
        channel.outbox.on_added(move |items| {
            if let Some(channel) = weak.upgrade() {
                channel.transmit(items);
            }
            Ok(())
        });
        channel
    }

    fn lock(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_shutdown(&self) -> bool {
        self.lock().shutdown
    }

    /// Accept an envelope from the peer into the inbox
    pub fn receive(&self, envelope: SyncEnvelope) -> Result<(), SyncError> {
        if self.is_shutdown() {
            return Err(SyncError::ChannelShutdown(self.id.clone()));
        }
        let items: Vec<Arc<SyncOperation>> = envelope
            .to_sync_operations(&self.remote_name)
            .into_iter()
            .map(|op| {
                op.transported();
                Arc::new(op)
            })
            .collect();
        debug!(
            channel = %self.id,
            from = %envelope.channel_meta.id,
            count = items.len(),
            "Envelope received"
        );
        self.lock().pull.record_success(now_utc_ms());
        self.inbox.add(items)?;
        Ok(())
    }

    fn transmit(&self, items: &[Arc<SyncOperation>]) {
        if self.is_shutdown() {
            return;
        }
        for item in items {
            item.started();
        }
        let ids: Vec<String> = items.iter().map(|item| item.id.clone()).collect();

        match (self.send)(SyncEnvelope::operations(&self.id, items)) {
            Ok(()) => {
                self.lock().push.record_success(now_utc_ms());
                for item in items {
                    item.executed();
                }
            }
            Err(e) => {
                let retry_in = {
                    let mut state = self.lock();
                    state.push.record_failure(now_utc_ms());
                    state.push.retry_delay()
                };
                warn!(
                    channel = %self.id,
                    remote = %self.remote_name,
                    error = %e,
                    retry_in_ms = retry_in.as_millis() as u64,
                    "Send failed; moving operations to dead letter"
                );
                for item in items {
                    item.failed(e.clone());
                }
                if let Err(e) = self.dead_letter.add(items.to_vec()) {
                    warn!(channel = %self.id, error = %e, "Dead letter callback failed");
                }
            }
        }
        if let Err(e) = self.outbox.remove(&ids) {
            warn!(channel = %self.id, error = %e, "Outbox callback failed");
        }
    }
}

#[async_trait]
impl Channel for InternalChannel {
    fn id(&self) -> &str {
        &self.id
    }

    fn remote_name(&self) -> &str {
        &self.remote_name
    }

    fn inbox(&self) -> &Arc<Mailbox> {
        &self.inbox
    }

    fn outbox(&self) -> &Arc<Mailbox> {
        &self.outbox
    }

    fn dead_letter(&self) -> &Arc<Mailbox> {
        &self.dead_letter
    }

    async fn init(&self) -> Result<(), SyncError> {
        info!(channel = %self.id, remote = %self.remote_name, "Internal channel ready");
        Ok(())
    }

    async fn shutdown(&self) {
        self.lock().shutdown = true;
        self.cursor.flush().await;
        info!(channel = %self.id, remote = %self.remote_name, "Internal channel shut down");
    }

    fn update_cursor(&self, ordinal: u64) {
        self.cursor.update(ordinal);
    }

    fn status(&self) -> RemoteStatus {
        let state = self.lock();
        RemoteStatus {
            push: state.push.health().clone(),
            pull: state.pull.health().clone(),
        }
    }
}

/// Connects internal channels of one process by address.
///
/// Channel parameters: `peer` (required) is the address envelopes go to,
/// `address` (defaults to the remote name) is where this channel listens.
pub struct InternalNetwork {
    config: SyncConfig,
    channels: Arc<Mutex<HashMap<String, Weak<InternalChannel>>>>,
}

impl InternalNetwork {
    pub fn new(config: SyncConfig) -> Self {
        Self {
            config,
            channels: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn deliver(
        channels: &Mutex<HashMap<String, Weak<InternalChannel>>>,
        peer: &str,
        envelope: SyncEnvelope,
    ) -> Result<(), ChannelError> {
        let target = channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(peer)
            .and_then(Weak::upgrade);
        match target {
            Some(channel) => channel
                .receive(envelope)
                .map_err(|e| ChannelError::outbox(e.to_string())),
            None => Err(ChannelError::outbox(format!("no channel listening at '{peer}'"))),
        }
    }
}

impl ChannelFactory for InternalNetwork {
    fn instance(&self, spec: ChannelSpec<'_>) -> Result<Arc<dyn Channel>, SyncError> {
        if spec.config.channel_type != INTERNAL_CHANNEL_TYPE {
            return Err(SyncError::UnknownChannelType(spec.config.channel_type.clone()));
        }
        let peer = spec
            .config
            .parameters
            .get("peer")
            .cloned()
            .ok_or_else(|| SyncError::InvalidChannel("internal channel needs a 'peer'".into()))?;
        let address = spec
            .config
            .parameters
            .get("address")
            .cloned()
            .unwrap_or_else(|| spec.remote_name.to_string());

        let channels = self.channels.clone();
        let send: SendFn =
            Arc::new(move |envelope| InternalNetwork::deliver(&channels, &peer, envelope));
        let channel = InternalChannel::new(
            spec.remote_id,
            spec.remote_name,
            spec.cursor_storage,
            send,
            &self.config,
        );
        self.channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(address, Arc::downgrade(&channel));
        Ok(channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync_operation::SyncOperationStatus;
    use libstrand_core::store::MemoryStore;
    use libstrand_core::types::operation::{Action, Operation, OperationContext};
    use std::sync::Mutex as StdMutex;

    fn config() -> SyncConfig {
        SyncConfig {
            outbox_flush_ms: 1,
            outbox_max_queued: 1,
            ..SyncConfig::default()
        }
    }

    fn op(document_id: &str, index: u64, ordinal: u64) -> OperationWithContext {
        OperationWithContext {
            operation: Operation {
                id: format!("op-{document_id}-{index}"),
                index,
                skip: 0,
                hash: format!("hash-{index}"),
                timestamp_utc_ms: 1,
                action: Action::new("SET_NAME", "global", serde_json::json!({})),
            },
            context: OperationContext {
                document_id: document_id.into(),
                document_type: "test/doc".into(),
                scope: "global".into(),
                branch: "main".into(),
            },
            ordinal: Some(ordinal),
        }
    }

    fn outgoing(document_id: &str) -> Arc<SyncOperation> {
        Arc::new(SyncOperation::new(
            "remote-1",
            document_id,
            vec!["global".into()],
            "main",
            vec![op(document_id, 1, 7)],
        ))
    }

    fn recording_send() -> (SendFn, Arc<StdMutex<Vec<SyncEnvelope>>>) {
        let sent = Arc::new(StdMutex::new(Vec::new()));
        let s = sent.clone();
        let send: SendFn = Arc::new(move |envelope| {
            s.lock().unwrap().push(envelope);
            Ok(())
        });
        (send, sent)
    }

    #[tokio::test]
    async fn test_outbox_items_are_sent_and_applied() {
        let (send, sent) = recording_send();
        let channel = InternalChannel::new("channel-1", "remote-1", Arc::new(MemoryStore::new()), send, &config());
        let item = outgoing("doc-1");
        channel.outbox().add(vec![item.clone()]).unwrap();

        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].envelope_type, EnvelopeType::Operations);
        assert_eq!(sent[0].channel_meta.id, "channel-1");
        assert_eq!(sent[0].entries[0].operations, item.operations);
        assert_eq!(item.status(), SyncOperationStatus::Applied);
        assert!(channel.outbox().is_empty());
        assert!(channel.status().push.last_success_utc_ms.is_some());
    }

    #[tokio::test]
    async fn test_failed_send_goes_to_dead_letter() {
        let send: SendFn = Arc::new(|_| Err(ChannelError::outbox("peer gone")));
        let channel = InternalChannel::new("channel-1", "remote-1", Arc::new(MemoryStore::new()), send, &config());
        let item = outgoing("doc-1");
        channel.outbox().add(vec![item.clone()]).unwrap();

        assert_eq!(item.status(), SyncOperationStatus::Error);
        assert_eq!(item.error().unwrap(), ChannelError::outbox("peer gone"));
        assert!(channel.outbox().is_empty());
        assert_eq!(channel.dead_letter().len(), 1);
        assert_eq!(channel.status().push.failure_count, 1);
    }

    #[tokio::test]
    async fn test_receive_fills_inbox_and_refuses_after_shutdown() {
        let (send, _) = recording_send();
        let channel = InternalChannel::new("channel-1", "remote-1", Arc::new(MemoryStore::new()), send, &config());
        let envelope = SyncEnvelope {
            envelope_type: EnvelopeType::Operations,
            channel_meta: ChannelMeta { id: "channel-2".into() },
            entries: vec![EnvelopeEntry {
                job_id: "j2".into(),
                job_dependencies: vec!["j1".into()],
                operations: vec![op("doc-1", 1, 3)],
            }],
        };
        channel.receive(envelope.clone()).unwrap();

        let items = channel.inbox().items();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].remote_name, "remote-1");
        assert_eq!(items[0].document_id, "doc-1");
        assert_eq!(items[0].job_id, "j2");
        assert_eq!(items[0].status(), SyncOperationStatus::ExecutionPending);

        channel.shutdown().await;
        let err = channel.receive(envelope).unwrap_err();
        assert_eq!(err.to_string(), "Channel channel-1 is shutdown and cannot receive envelopes");
    }

    #[tokio::test]
    async fn test_network_connects_peers() {
        let network = InternalNetwork::new(config());
        let store: Arc<dyn SyncCursorStorage> = Arc::new(MemoryStore::new());
        let make = |name: &str, peer: &str| {
            let mut channel_config = ChannelConfig::internal();
            channel_config.parameters.insert("peer".into(), peer.into());
            network
                .instance(ChannelSpec {
                    remote_id: name,
                    remote_name: name,
                    collection_id: "main:drive",
                    config: &channel_config,
                    filter: &RemoteFilter::default(),
                    cursor_storage: store.clone(),
                })
                .unwrap()
        };
        let left = make("left", "right");
        let right = make("right", "left");

        left.outbox().add(vec![outgoing("doc-1")]).unwrap();
        let received = right.inbox().items();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].remote_name, "right");

        let missing = ChannelConfig::internal();
        let err = network
            .instance(ChannelSpec {
                remote_id: "x",
                remote_name: "x",
                collection_id: "main:drive",
                config: &missing,
                filter: &RemoteFilter::default(),
                cursor_storage: store,
            })
            .err()
            .unwrap();
        assert!(matches!(err, SyncError::InvalidChannel(_)));
    }
}
