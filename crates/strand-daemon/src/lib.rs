//! Strand node wiring shared by the daemon binary and its tests

pub mod error;
pub mod node;

pub use error::DaemonError;
pub use node::Node;
