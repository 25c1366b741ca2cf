//! Messages exchanged between the orchestrator and runners.
//!
//! All of them are plain serde types so a network transport can carry them
//! unchanged; in-process runners pass them directly.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use queue::TagSet;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{JobSpec, JobStatus, LogLevel, StepAction, StepStatus};

/// A runner asking for work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollRequest {
    pub runner_id: String,
    /// Tags to match against; empty means "use the registered tags".
    #[serde(default)]
    pub tags: TagSet,
}

/// One step of an [`Assignment`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignedStep {
    pub step_id: Uuid,
    pub name: String,
    pub action: StepAction,
    pub env: BTreeMap<String, String>,
    pub working_directory: Option<String>,
    pub continue_on_error: bool,
    pub timeout: Option<Duration>,
}

/// A job handed to a runner.  Every result about it must echo `lease_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub run_id: Uuid,
    pub job_id: Uuid,
    pub lease_id: Uuid,
    pub workflow_name: String,
    pub job_name: String,
    /// The job as authored.
    pub job_spec: JobSpec,
    /// Run inputs (`INPUT_<KEY>`) overlaid with the job's own env.
    pub env: BTreeMap<String, String>,
    pub timeout: Option<Duration>,
    pub steps: Vec<AssignedStep>,
}

/// Progress or outcome of one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub job_id: Uuid,
    pub lease_id: Uuid,
    pub step_id: Uuid,
    pub status: StepStatus,
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub error: String,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Final outcome of a job, sent once every step has been reported.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: Uuid,
    pub lease_id: Uuid,
    pub status: JobStatus,
    pub error: Option<String>,
}

/// How the orchestrator treated a reported result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Ack {
    /// Recorded.
    Applied,
    /// Held until the steps before it are reported.
    Buffered,
    /// Ignored: stale lease, duplicate, or the job already settled.
    Discarded,
}

/// Reply to a heartbeat.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatAck {
    /// Jobs the runner must stop.
    pub cancel: Vec<Uuid>,
}

/// A log line as emitted by a runner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogIngest {
    pub step_id: Uuid,
    pub level: LogLevel,
    pub content: String,
}
