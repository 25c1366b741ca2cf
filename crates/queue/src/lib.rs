//! `queue` crate: the dispatch queue of ready jobs and the registry of
//! connected runners.
//!
//! Both are plain instances guarded by their own lock; the orchestrator
//! owns them and passes them around explicitly.  Every mutation is a single
//! method call, so assignment of a job to a runner is atomic.

pub mod dispatch;
pub mod error;
pub mod registry;

pub use dispatch::{JobDispatchQueue, Lease, QueuedJob, ReadyKey, TagSet, Withdrawn};
pub use error::QueueError;
pub use registry::{LeaseConfig, Registration, RunnerInfo, RunnerRegistry, RunnerStatus, SweepOutcome};
