//! Scheduler tuning knobs.

use std::time::Duration;

use queue::LeaseConfig;

/// Configuration for the [`crate::Orchestrator`].
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often runners are expected to heartbeat; also the reaper tick.
    pub heartbeat_interval: Duration,
    /// Consecutive missed heartbeats before a runner's lease expires.
    pub missed_heartbeats: u32,
    /// How long a runner may ignore a cancellation before its job is
    /// force-cancelled.
    pub cancel_grace: Duration,
    /// Upper bound for a run when the workflow sets no `timeout`.
    pub run_timeout: Option<Duration>,
    /// How long an offline runner stays listed before it is forgotten.
    pub runner_retention: Duration,
    /// How long a finished run's status and log buffer stay in memory.
    /// After that the run is read back from the store.
    pub run_retention: Duration,
    /// Ready jobs waiting longer than this are logged as unassignable.
    pub assignment_warn_after: Duration,
    /// Capacity of each run actor's command channel.
    pub actor_mailbox: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(10),
            missed_heartbeats: 3,
            cancel_grace: Duration::from_secs(30),
            run_timeout: None,
            runner_retention: Duration::from_secs(600),
            run_retention: Duration::from_secs(600),
            assignment_warn_after: Duration::from_secs(60),
            actor_mailbox: 256,
        }
    }
}

impl SchedulerConfig {
    /// The registry settings implied by this configuration.
    pub fn lease_config(&self) -> LeaseConfig {
        LeaseConfig {
            heartbeat_interval: self.heartbeat_interval,
            missed_heartbeats: self.missed_heartbeats,
            retention: self.runner_retention,
        }
    }
}
