//! Listener/transmitter synchronization
//!
//! The [`ListenerManager`] keeps every listener's acknowledged revisions
//! converged with the sync-unit revisions, delivering missing operations
//! through a push transmitter or serving them to a pull client.

pub mod error;
pub mod manager;
pub mod persistence;
pub mod pull_client;
pub mod strands;
pub mod sync_status;
pub mod transmitter;

pub use error::{InitTransmittersError, ListenerError};
pub use manager::{
    ErrorCallback, ListenerManager, ListenerManagerOptions, ListenerUpdate, WillUpdateCallback,
};
pub use persistence::ListenerPersistence;
pub use pull_client::{execute_pull, PullLoop, PullOutcome, PullSource, StrandApplier};
pub use strands::{GetStrandsOptions, StrandCollector};
pub use sync_status::{SyncDirection, SyncStatus, SyncStatusTracker};
pub use transmitter::{
    InternalReceiver, PullResponder, PushEndpoint, PushEndpointFactory, PushTransmitter,
    Transmitter, TransmitterManager, UpdateSource,
};
