//! Row structs that map 1-to-1 onto database tables.
//!
//! They carry no behaviour.
//! Statuses are stored as their lowercase string form; the domain enums
//! live in the `engine` crate and convert via `Display` / `FromStr`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// runs
// ---------------------------------------------------------------------------

/// A persisted workflow run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct RunRow {
    pub id: Uuid,
    pub workflow_name: String,
    pub status: String,
    pub cancel_requested: bool,
    /// Run inputs as a JSON object of strings.
    pub inputs: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// jobs
// ---------------------------------------------------------------------------

/// A persisted job within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct JobRow {
    pub id: Uuid,
    pub run_id: Uuid,
    pub name: String,
    /// Declaration index within the workflow.
    pub position: i32,
    pub status: String,
    /// IDs of the jobs this job needs.
    pub needs: Vec<Uuid>,
    pub runner_id: Option<String>,
    pub lease_id: Option<Uuid>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// steps
// ---------------------------------------------------------------------------

/// A persisted step within a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct StepRow {
    pub id: Uuid,
    pub run_id: Uuid,
    pub job_id: Uuid,
    pub position: i32,
    pub name: String,
    pub command: String,
    pub continue_on_error: bool,
    pub status: String,
    pub exit_code: Option<i32>,
    pub output: String,
    pub error: String,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// runners
// ---------------------------------------------------------------------------

/// A persisted runner registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct RunnerRow {
    pub id: String,
    pub name: String,
    pub version: String,
    pub tags: Vec<String>,
    pub status: String,
    pub last_seen: DateTime<Utc>,
    pub current_job: Option<Uuid>,
}

// ---------------------------------------------------------------------------
// logs
// ---------------------------------------------------------------------------

/// A persisted log line.  `(run_id, seq)` is unique.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct LogRow {
    pub run_id: Uuid,
    pub job_id: Uuid,
    pub step_id: Uuid,
    pub seq: i64,
    pub level: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}
