//! Queue-level error types.

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

/// Errors produced by the dispatch queue and the runner registry.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueueError {
    // ------ Registry errors ------

    /// The runner never registered, or was pruned after a long silence.
    #[error("unknown runner '{0}'")]
    UnknownRunner(String),

    /// The runner missed too many heartbeats and must register again.
    #[error("runner '{0}' is offline")]
    RunnerOffline(String),

    /// The runner already holds (or is being handed) an assignment.
    #[error("runner '{0}' is busy")]
    RunnerBusy(String),

    // ------ Queue errors ------

    /// The job is already waiting in the queue or leased to a runner.
    #[error("job {0} is already queued")]
    AlreadyQueued(Uuid),

    /// The lease presented with a result is no longer the job's live lease.
    #[error("lease {lease_id} on job {job_id} has expired")]
    LeaseExpired { job_id: Uuid, lease_id: Uuid },

    /// No eligible runner picked the job up within the warning threshold.
    #[error("job {job_id} waited {waited:?} without an eligible runner")]
    AssignmentTimeout { job_id: Uuid, waited: Duration },
}
