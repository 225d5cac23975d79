//! In-memory registries of sync units and listeners
//!
//! Both registries sit on an [`ObservableMap`]; side effects such as
//! persistence are attached with `on(event, callback)`.

mod listeners;
mod observable;
mod sync_units;

pub use listeners::{ListenerRegistry, ListenerState};
pub use observable::{ObservableMap, ObserverId, RegistryEvent};
pub use sync_units::SyncUnitRegistry;
