//! Registry of connected runners: tags, liveness, busy/idle state.
//!
//! A runner is eligible for new work only while `Online`.  Taking an
//! assignment is a two-phase affair: [`RunnerRegistry::reserve`] flips the
//! runner to `Busy` before the queue is consulted, then
//! [`RunnerRegistry::bind`] records the job, or [`RunnerRegistry::release`]
//! hands the runner back if nothing was dispatched.  A runner that misses
//! `missed_heartbeats` heartbeat intervals in a row is marked `Offline` by
//! [`RunnerRegistry::sweep`], which reports the job it held so the caller can
//! reclaim it.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{QueueError, TagSet};

// ---------------------------------------------------------------------------
// RunnerStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerStatus {
    Online,
    Busy,
    Offline,
}

impl fmt::Display for RunnerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Online => write!(f, "online"),
            Self::Busy => write!(f, "busy"),
            Self::Offline => write!(f, "offline"),
        }
    }
}

impl FromStr for RunnerStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "online" => Ok(Self::Online),
            "busy" => Ok(Self::Busy),
            "offline" => Ok(Self::Offline),
            other => Err(format!("unknown runner status: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Heartbeat and retention knobs.
#[derive(Debug, Clone)]
pub struct LeaseConfig {
    /// How often runners are expected to heartbeat.
    pub heartbeat_interval: Duration,
    /// Consecutive missed heartbeats before a runner is declared offline.
    pub missed_heartbeats: u32,
    /// How long an offline runner is remembered before it is removed.
    pub retention: Duration,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(10),
            missed_heartbeats: 3,
            retention: Duration::from_secs(600),
        }
    }
}

impl LeaseConfig {
    /// Silence longer than this expires a runner's lease.
    pub fn lease_window(&self) -> Duration {
        self.heartbeat_interval * self.missed_heartbeats.max(1)
    }
}

// ---------------------------------------------------------------------------
// Public snapshots
// ---------------------------------------------------------------------------

/// What a runner announces when it connects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    pub runner_id: String,
    pub name: String,
    pub version: String,
    pub tags: TagSet,
}

/// Point-in-time view of one runner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerInfo {
    pub id: String,
    pub name: String,
    pub version: String,
    pub tags: TagSet,
    pub status: RunnerStatus,
    pub last_seen: DateTime<Utc>,
    pub current_job: Option<Uuid>,
}

/// Result of one [`RunnerRegistry::sweep`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepOutcome {
    /// Runners newly marked offline, with the job each was holding.
    pub offline: Vec<(String, Option<Uuid>)>,
    /// Runners forgotten after `retention`.
    pub removed: Vec<String>,
}

// ---------------------------------------------------------------------------
// RunnerRegistry
// ---------------------------------------------------------------------------

struct Entry {
    info: RunnerInfo,
    last_heartbeat: Instant,
    offline_since: Option<Instant>,
    pending_cancels: Vec<Uuid>,
}

pub struct RunnerRegistry {
    config: LeaseConfig,
    runners: Mutex<HashMap<String, Entry>>,
}

impl RunnerRegistry {
    pub fn new(config: LeaseConfig) -> Self {
        Self {
            config,
            runners: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &LeaseConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.runners.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Add a runner, or refresh an existing one, as `Online`.
    ///
    /// Returns the job a re-registering runner still held: the runner
    /// restarted, so that assignment is lost and must be reclaimed.
    pub fn register(&self, registration: Registration) -> Option<Uuid> {
        let mut runners = self.lock();
        let now = Instant::now();
        let orphaned = runners
            .get(&registration.runner_id)
            .and_then(|e| e.info.current_job);

        info!(
            runner_id = %registration.runner_id,
            tags = ?registration.tags,
            version = %registration.version,
            "runner registered"
        );

        runners.insert(
            registration.runner_id.clone(),
            Entry {
                info: RunnerInfo {
                    id: registration.runner_id,
                    name: registration.name,
                    version: registration.version,
                    tags: registration.tags,
                    status: RunnerStatus::Online,
                    last_seen: Utc::now(),
                    current_job: None,
                },
                last_heartbeat: now,
                offline_since: None,
                pending_cancels: Vec::new(),
            },
        );
        orphaned
    }

    /// Refresh a runner's liveness and collect the jobs it should cancel.
    pub fn heartbeat(&self, runner_id: &str) -> Result<Vec<Uuid>, QueueError> {
        let mut runners = self.lock();
        let entry = runners
            .get_mut(runner_id)
            .ok_or_else(|| QueueError::UnknownRunner(runner_id.to_owned()))?;
        if entry.info.status == RunnerStatus::Offline {
            return Err(QueueError::RunnerOffline(runner_id.to_owned()));
        }

        entry.last_heartbeat = Instant::now();
        entry.info.last_seen = Utc::now();
        Ok(std::mem::take(&mut entry.pending_cancels))
    }

    /// Claim an idle runner for a dispatch attempt.  `advertised` tags, when
    /// non-empty, replace the registered ones.  Returns the tags to match.
    pub fn reserve(&self, runner_id: &str, advertised: &TagSet) -> Result<TagSet, QueueError> {
        let mut runners = self.lock();
        let entry = runners
            .get_mut(runner_id)
            .ok_or_else(|| QueueError::UnknownRunner(runner_id.to_owned()))?;

        match entry.info.status {
            RunnerStatus::Offline => Err(QueueError::RunnerOffline(runner_id.to_owned())),
            RunnerStatus::Busy => Err(QueueError::RunnerBusy(runner_id.to_owned())),
            RunnerStatus::Online => {
                if !advertised.is_empty() {
                    entry.info.tags = advertised.clone();
                }
                // A poll is proof of life too.
                entry.last_heartbeat = Instant::now();
                entry.info.last_seen = Utc::now();
                entry.info.status = RunnerStatus::Busy;
                Ok(entry.info.tags.clone())
            }
        }
    }

    /// Record the job a reserved runner was handed.
    pub fn bind(&self, runner_id: &str, job_id: Uuid) -> Result<(), QueueError> {
        let mut runners = self.lock();
        let entry = runners
            .get_mut(runner_id)
            .ok_or_else(|| QueueError::UnknownRunner(runner_id.to_owned()))?;
        if entry.info.status != RunnerStatus::Busy {
            return Err(QueueError::RunnerOffline(runner_id.to_owned()));
        }
        entry.info.current_job = Some(job_id);
        debug!(runner_id, %job_id, "runner bound to job");
        Ok(())
    }

    /// Return a busy runner to `Online`.
    ///
    /// With `job` set, only releases the runner if it still holds that job,
    /// so settling an old assignment cannot free a runner that has since
    /// taken a new one.
    pub fn release(&self, runner_id: &str, job: Option<Uuid>) {
        let mut runners = self.lock();
        let Some(entry) = runners.get_mut(runner_id) else {
            return;
        };
        if job.is_some() && entry.info.current_job != job {
            return;
        }
        if entry.info.status == RunnerStatus::Busy {
            entry.info.status = RunnerStatus::Online;
        }
        entry.info.current_job = None;
        entry.pending_cancels.retain(|id| Some(*id) != job);
    }

    /// Queue a cancellation signal, delivered with the runner's next
    /// heartbeat.
    pub fn request_cancel(&self, runner_id: &str, job_id: Uuid) {
        if let Some(entry) = self.lock().get_mut(runner_id) {
            if !entry.pending_cancels.contains(&job_id) {
                entry.pending_cancels.push(job_id);
            }
        }
    }

    /// Mark runners silent for a whole lease window as offline and forget
    /// runners that stayed offline past `retention`.
    pub fn sweep(&self) -> SweepOutcome {
        let mut runners = self.lock();
        let now = Instant::now();
        let window = self.config.lease_window();
        let mut outcome = SweepOutcome::default();

        for (id, entry) in runners.iter_mut() {
            if entry.info.status == RunnerStatus::Offline {
                continue;
            }
            let silent = now.duration_since(entry.last_heartbeat);
            if silent >= window {
                warn!(
                    runner_id = %id,
                    silent = ?silent,
                    job = ?entry.info.current_job,
                    "runner missed {} heartbeats, marking offline",
                    self.config.missed_heartbeats
                );
                entry.info.status = RunnerStatus::Offline;
                entry.offline_since = Some(now);
                entry.pending_cancels.clear();
                outcome
                    .offline
                    .push((id.clone(), entry.info.current_job.take()));
            }
        }

        let retention = self.config.retention;
        runners.retain(|id, entry| {
            let keep = entry
                .offline_since
                .map_or(true, |since| now.duration_since(since) < retention);
            if !keep {
                info!(runner_id = %id, "forgetting offline runner");
                outcome.removed.push(id.clone());
            }
            keep
        });

        outcome
    }

    pub fn get(&self, runner_id: &str) -> Option<RunnerInfo> {
        self.lock().get(runner_id).map(|e| e.info.clone())
    }

    /// Every known runner, sorted by id.
    pub fn list(&self) -> Vec<RunnerInfo> {
        let mut all: Vec<RunnerInfo> = self.lock().values().map(|e| e.info.clone()).collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }
}
