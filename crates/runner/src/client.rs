//! The transport seam between a runner and the scheduler.

use async_trait::async_trait;
use engine::{
    Ack, Assignment, HeartbeatAck, JobResult, LogIngest, Orchestrator, PollRequest, StepResult,
};
use queue::Registration;

use crate::RunnerError;

/// Everything a runner can ask of the scheduler.
///
/// [`Orchestrator`] implements it directly for in-process runners; a remote
/// transport would implement it over the wire with the same message types.
#[async_trait]
pub trait SchedulerClient: Send + Sync {
    async fn register(&self, registration: Registration) -> Result<(), RunnerError>;

    /// Returns the jobs the runner must cancel.
    async fn heartbeat(&self, runner_id: &str) -> Result<HeartbeatAck, RunnerError>;

    async fn poll(&self, request: PollRequest) -> Result<Option<Assignment>, RunnerError>;

    async fn report_step(&self, result: StepResult) -> Result<Ack, RunnerError>;

    async fn report_job(&self, result: JobResult) -> Result<Ack, RunnerError>;

    async fn append_log(&self, line: LogIngest) -> Result<(), RunnerError>;
}

#[async_trait]
impl SchedulerClient for Orchestrator {
    async fn register(&self, registration: Registration) -> Result<(), RunnerError> {
        Ok(self.register_runner(registration).await?)
    }

    async fn heartbeat(&self, runner_id: &str) -> Result<HeartbeatAck, RunnerError> {
        Ok(Orchestrator::heartbeat(self, runner_id).await?)
    }

    async fn poll(&self, request: PollRequest) -> Result<Option<Assignment>, RunnerError> {
        Ok(Orchestrator::poll(self, request).await?)
    }

    async fn report_step(&self, result: StepResult) -> Result<Ack, RunnerError> {
        Ok(Orchestrator::report_step(self, result).await?)
    }

    async fn report_job(&self, result: JobResult) -> Result<Ack, RunnerError> {
        Ok(Orchestrator::report_job(self, result).await?)
    }

    async fn append_log(&self, line: LogIngest) -> Result<(), RunnerError> {
        Orchestrator::append_log(self, line).await?;
        Ok(())
    }
}
