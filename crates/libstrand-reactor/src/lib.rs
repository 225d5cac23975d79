//! Job execution for strand
//!
//! Mutations and remote loads become [`Job`]s in a [`JobQueue`]; a single
//! executor task applies them to storage, indexes the written operations
//! and reports each job's outcome on the [`EventBus`](libstrand_core::EventBus).

pub mod error;
pub mod executor;
pub mod job;
pub mod queue;
pub mod reactor;
pub mod tracker;

pub use error::ReactorError;
pub use executor::JobExecutor;
pub use job::{validate_batch, BatchJobPlan, BatchResult, Job, JobKind};
pub use queue::JobQueue;
pub use reactor::{Reactor, ReactorOptions, RequestMeta};
pub use tracker::{JobAwaiter, JobTracker};
