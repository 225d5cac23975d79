//! Remote replication for strand
//!
//! The [`SyncManager`] routes operations written by the reactor to the
//! outboxes of matching remotes and loads operations arriving in their
//! inboxes back through the reactor. Transport is behind the [`Channel`]
//! trait; [`InternalNetwork`] connects channels within one process.

pub mod batch_aggregator;
pub mod channel;
pub mod cursor;
pub mod error;
pub mod health;
pub mod mailbox;
pub mod status_tracker;
pub mod sync_manager;
pub mod sync_operation;

pub use batch_aggregator::{BatchAggregator, BatchEntry, PreparedBatch};
pub use channel::{
    Channel, ChannelFactory, ChannelSpec, InternalChannel, InternalNetwork, SendFn, SyncEnvelope,
    INTERNAL_CHANNEL_TYPE,
};
pub use cursor::CursorWriter;
pub use error::{ChannelError, ChannelErrorSource, MailboxCallbackError, SyncError};
pub use health::{HealthMonitor, HealthPolicy};
pub use mailbox::{BufferPolicy, Mailbox};
pub use status_tracker::{DocumentSyncStatus, SyncStatusTracker};
pub use sync_manager::{NewRemote, ReactorClient, Remote, SyncManager};
pub use sync_operation::{SyncOperation, SyncOperationStatus};
