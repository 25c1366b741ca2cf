//! Read-only snapshots of a run, its jobs and their steps.

use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use db::models::{JobRow, RunRow, StepRow};
use serde::Serialize;
use uuid::Uuid;

use crate::{
    models::{JobStatus, RunStatus, StepStatus},
    EngineError,
};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunView {
    pub id: Uuid,
    pub workflow_name: String,
    pub status: RunStatus,
    pub cancel_requested: bool,
    pub inputs: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Jobs in declaration order.
    pub jobs: Vec<JobView>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobView {
    pub id: Uuid,
    pub name: String,
    pub status: JobStatus,
    /// Names of the jobs this one needs.
    pub needs: Vec<String>,
    pub runner_id: Option<String>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub steps: Vec<StepView>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepView {
    pub id: Uuid,
    pub name: String,
    pub command: String,
    pub continue_on_error: bool,
    pub status: StepStatus,
    pub exit_code: Option<i32>,
    pub output: String,
    pub error: String,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunView {
    pub fn job(&self, name: &str) -> Option<&JobView> {
        self.jobs.iter().find(|j| j.name == name)
    }

    /// Rebuild a view from stored rows (jobs and steps in store order).
    pub fn from_rows(run: RunRow, jobs: Vec<JobRow>, steps: Vec<StepRow>) -> Result<Self, EngineError> {
        let names: HashMap<Uuid, String> = jobs.iter().map(|j| (j.id, j.name.clone())).collect();

        let mut by_job: HashMap<Uuid, Vec<StepView>> = HashMap::new();
        for step in steps {
            by_job.entry(step.job_id).or_default().push(StepView {
                id: step.id,
                status: parse_status(&step.status)?,
                name: step.name,
                command: step.command,
                continue_on_error: step.continue_on_error,
                exit_code: step.exit_code,
                output: step.output,
                error: step.error,
                started_at: step.started_at,
                finished_at: step.finished_at,
            });
        }

        let jobs = jobs
            .into_iter()
            .map(|job| {
                Ok(JobView {
                    id: job.id,
                    status: parse_status(&job.status)?,
                    needs: job
                        .needs
                        .iter()
                        .filter_map(|id| names.get(id).cloned())
                        .collect(),
                    steps: by_job.remove(&job.id).unwrap_or_default(),
                    name: job.name,
                    runner_id: job.runner_id,
                    error: job.error,
                    started_at: job.started_at,
                    finished_at: job.finished_at,
                })
            })
            .collect::<Result<Vec<_>, EngineError>>()?;

        let inputs = serde_json::from_value(run.inputs)
            .map_err(|e| EngineError::CorruptRecord(format!("inputs of run {}: {e}", run.id)))?;

        Ok(Self {
            id: run.id,
            status: parse_status(&run.status)?,
            workflow_name: run.workflow_name,
            cancel_requested: run.cancel_requested,
            inputs,
            created_at: run.created_at,
            started_at: run.started_at,
            finished_at: run.finished_at,
            jobs,
        })
    }
}

fn parse_status<T: FromStr<Err = String>>(text: &str) -> Result<T, EngineError> {
    text.parse().map_err(EngineError::CorruptRecord)
}
