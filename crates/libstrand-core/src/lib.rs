pub mod config;
pub mod debounce;
pub mod error;
pub mod event_bus;
pub mod hash;
pub mod operation_index;
pub mod registry;
pub mod store;
pub mod types;

pub use config::{load_config, save_config, StrandConfig};
pub use debounce::Debouncer;
pub use error::StrandError;
pub use event_bus::{EventBus, EventBusAggregateError, EventType, ReactorEvent, Subscription};
pub use operation_index::{InMemoryOperationIndex, OperationIndex, OperationIndexTxn};
pub use registry::{ListenerRegistry, ListenerState, RegistryEvent, SyncUnitRegistry};
pub use types::listener::{
    ErrorStatus, Listener, ListenerFilter, ListenerRevision, ListenerStatus, TransmitterType,
    UpdateStatus,
};
pub use types::operation::{Action, Operation, OperationContext, OperationWithContext, StrandUpdate};
pub use types::sync_unit::{SyncUnit, SyncUnitKey};
