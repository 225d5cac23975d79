pub mod ids;
pub mod job;
pub mod listener;
pub mod operation;
pub mod remote;
pub mod sync_unit;

pub use ids::{drive_collection_id, new_id, sync_unit_id, OperationHash};
