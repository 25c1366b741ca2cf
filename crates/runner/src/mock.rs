//! `RecordingClient`: a [`SchedulerClient`] test double.
//!
//! Records everything a runner sends and serves assignments and
//! cancellations queued up by the test.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use db::DbError;
use engine::{
    Ack, Assignment, EngineError, HeartbeatAck, JobResult, LogIngest, PollRequest, StepResult,
};
use queue::{QueueError, Registration};
use uuid::Uuid;

use crate::{RunnerError, SchedulerClient};

#[derive(Default)]
struct Recorded {
    registrations: Vec<Registration>,
    heartbeats: usize,
    logs: Vec<LogIngest>,
    steps: Vec<StepResult>,
    jobs: Vec<JobResult>,
    assignments: VecDeque<Assignment>,
    cancels: Vec<Uuid>,
    /// Heartbeats left to reject with `RunnerOffline`.
    offline_heartbeats: usize,
    discard_reports: bool,
    /// Reports left to fail with a database error.
    failing_reports: usize,
}

impl Recorded {
    fn take_failure(&mut self) -> Result<(), RunnerError> {
        if self.failing_reports == 0 {
            return Ok(());
        }
        self.failing_reports -= 1;
        Err(EngineError::from(DbError::NotFound).into())
    }
}

#[derive(Default)]
pub struct RecordingClient {
    inner: Mutex<Recorded>,
}

impl RecordingClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Recorded> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Serve `assignment` on a later poll.
    pub fn assign(&self, assignment: Assignment) {
        self.lock().assignments.push_back(assignment);
    }

    /// Ask the runner to stop `job_id` on its next heartbeat.
    pub fn cancel(&self, job_id: Uuid) {
        self.lock().cancels.push(job_id);
    }

    /// Reject the next `n` heartbeats as if the runner had been declared
    /// offline.
    pub fn go_offline(&self, n: usize) {
        self.lock().offline_heartbeats = n;
    }

    /// Answer every report with [`Ack::Discarded`], as for a lost lease.
    pub fn discard_reports(&self) {
        self.lock().discard_reports = true;
    }

    /// Fail the next `n` step or job reports as a transient store error.
    pub fn fail_reports(&self, n: usize) {
        self.lock().failing_reports = n;
    }

    pub fn registrations(&self) -> Vec<Registration> {
        self.lock().registrations.clone()
    }

    pub fn heartbeats(&self) -> usize {
        self.lock().heartbeats
    }

    pub fn log_lines(&self) -> Vec<String> {
        self.lock().logs.iter().map(|l| l.content.clone()).collect()
    }

    pub fn logs(&self) -> Vec<LogIngest> {
        self.lock().logs.clone()
    }

    pub fn step_results(&self) -> Vec<StepResult> {
        self.lock().steps.clone()
    }

    pub fn job_results(&self) -> Vec<JobResult> {
        self.lock().jobs.clone()
    }
}

#[async_trait]
impl SchedulerClient for RecordingClient {
    async fn register(&self, registration: Registration) -> Result<(), RunnerError> {
        self.lock().registrations.push(registration);
        Ok(())
    }

    async fn heartbeat(&self, runner_id: &str) -> Result<HeartbeatAck, RunnerError> {
        let mut recorded = self.lock();
        recorded.heartbeats += 1;
        if recorded.offline_heartbeats > 0 {
            recorded.offline_heartbeats -= 1;
            let offline = QueueError::RunnerOffline(runner_id.to_owned());
            return Err(EngineError::from(offline).into());
        }
        Ok(HeartbeatAck {
            cancel: std::mem::take(&mut recorded.cancels),
        })
    }

    async fn poll(&self, _request: PollRequest) -> Result<Option<Assignment>, RunnerError> {
        Ok(self.lock().assignments.pop_front())
    }

    async fn report_step(&self, result: StepResult) -> Result<Ack, RunnerError> {
        let mut recorded = self.lock();
        recorded.take_failure()?;
        if recorded.discard_reports {
            return Ok(Ack::Discarded);
        }
        recorded.steps.push(result);
        Ok(Ack::Applied)
    }

    async fn report_job(&self, result: JobResult) -> Result<Ack, RunnerError> {
        let mut recorded = self.lock();
        recorded.take_failure()?;
        if recorded.discard_reports {
            return Ok(Ack::Discarded);
        }
        recorded.jobs.push(result);
        Ok(Ack::Applied)
    }

    async fn append_log(&self, line: LogIngest) -> Result<(), RunnerError> {
        self.lock().logs.push(line);
        Ok(())
    }
}
