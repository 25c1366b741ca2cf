//! Runs an assignment's steps in order and reports every outcome.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use engine::{Ack, AssignedStep, Assignment, JobResult, JobStatus, StepResult, StepStatus};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::{RunnerError, SchedulerClient, StepExecutor, StepOutcome};

/// How reports are retried when the scheduler fails transiently.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    /// Base delay for exponential back-off between attempts.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
        }
    }
}

/// The scheduler stopped accepting reports for this assignment.
struct Abandoned;

pub struct JobExecutor {
    client: Arc<dyn SchedulerClient>,
    steps: StepExecutor,
    retry: RetryPolicy,
}

impl JobExecutor {
    pub fn new(client: Arc<dyn SchedulerClient>) -> Self {
        Self {
            steps: StepExecutor::new(Arc::clone(&client)),
            client,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Execute `assignment` and report its result.
    ///
    /// Steps run strictly in order.  After a failure that is not
    /// continue-on-error, or a cancellation, the remaining steps are
    /// reported Skipped without running.  Returns the job result the
    /// scheduler accepted, or `None` once it started discarding this
    /// assignment's reports (the lease moved elsewhere).
    #[instrument(skip_all, fields(job = %assignment.job_name, job_id = %assignment.job_id))]
    pub async fn run(
        &self,
        assignment: &Assignment,
        cancel: &CancellationToken,
    ) -> Option<JobResult> {
        info!(steps = assignment.steps.len(), "job started");
        let deadline = assignment
            .timeout
            .and_then(|t| Instant::now().checked_add(t));
        // Set once the job's fate is decided; later steps are skipped.
        let mut settled: Option<(JobStatus, Option<String>)> = None;

        for step in &assignment.steps {
            if settled.is_none() && cancel.is_cancelled() {
                settled = Some((JobStatus::Cancelled, Some("cancelled".into())));
            }
            if settled.is_some() {
                let skipped = result(assignment, step, StepStatus::Skipped);
                self.report_step(skipped).await.ok()?;
                continue;
            }

            let mut running = result(assignment, step, StepStatus::Running);
            running.started_at = Some(Utc::now());
            self.report_step(running).await.ok()?;

            let outcome = self
                .steps
                .execute(step, &assignment.env, deadline, cancel)
                .await;
            let status = outcome.status;
            self.report_step(finished(assignment, step, outcome)).await.ok()?;

            let past_deadline = deadline.is_some_and(|d| Instant::now() >= d);
            match status {
                StepStatus::Failed if past_deadline => {
                    let limit = assignment.timeout.unwrap_or_default();
                    settled = Some((
                        JobStatus::Failed,
                        Some(format!("job timed out after {limit:?}")),
                    ));
                }
                StepStatus::Failed if step.continue_on_error => {
                    debug!(step = %step.name, "continuing past failed step");
                }
                StepStatus::Failed => settled = Some((JobStatus::Failed, None)),
                StepStatus::Cancelled if step.continue_on_error => {
                    settled = Some((JobStatus::Cancelled, None));
                }
                StepStatus::Cancelled => settled = Some((JobStatus::Failed, None)),
                _ => {}
            }
        }

        let (status, error) = settled.unwrap_or((JobStatus::Success, None));
        let job = JobResult {
            job_id: assignment.job_id,
            lease_id: assignment.lease_id,
            status,
            error,
        };
        match self.deliver(|| self.client.report_job(job.clone())).await {
            Ok(Ack::Discarded) => {
                warn!("job result discarded by the scheduler");
                None
            }
            Ok(_) => {
                info!(%status, "job finished");
                Some(job)
            }
            Err(e) => {
                error!(error = %e, "could not report job result");
                None
            }
        }
    }

    async fn report_step(&self, result: StepResult) -> Result<(), Abandoned> {
        let status = result.status;
        match self.deliver(|| self.client.report_step(result.clone())).await {
            Ok(Ack::Discarded) => {
                warn!(step_id = %result.step_id, %status, "step report discarded, abandoning job");
                Err(Abandoned)
            }
            Ok(_) => Ok(()),
            Err(e) => {
                // The job carries on; the scheduler's view of this step lags
                // until the next report lands.
                warn!(step_id = %result.step_id, %status, error = %e, "could not report step");
                Ok(())
            }
        }
    }

    /// Call `send`, retrying transient failures with exponential back-off.
    async fn deliver<T, F, Fut>(&self, mut send: F) -> Result<T, RunnerError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RunnerError>>,
    {
        let mut attempts = 0u32;
        loop {
            match send().await {
                Err(e) if e.is_transient() && attempts < self.retry.max_retries => {
                    attempts += 1;
                    let delay = self.retry.base_delay * 2u32.pow(attempts - 1);
                    warn!(attempts, ?delay, error = %e, "report failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }
}

fn result(assignment: &Assignment, step: &AssignedStep, status: StepStatus) -> StepResult {
    StepResult {
        job_id: assignment.job_id,
        lease_id: assignment.lease_id,
        step_id: step.step_id,
        status,
        exit_code: None,
        output: String::new(),
        error: String::new(),
        started_at: None,
        finished_at: None,
    }
}

fn finished(assignment: &Assignment, step: &AssignedStep, outcome: StepOutcome) -> StepResult {
    StepResult {
        exit_code: outcome.exit_code,
        output: outcome.output,
        error: outcome.error,
        started_at: Some(outcome.started_at),
        finished_at: Some(outcome.finished_at),
        ..result(assignment, step, outcome.status)
    }
}

// ============================================================
// Unit tests
// ============================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::RecordingClient;
    use engine::{JobSpec, StepAction};
    use std::collections::BTreeMap;
    use uuid::Uuid;

    fn assignment(steps: &[(&str, bool)]) -> Assignment {
        Assignment {
            run_id: Uuid::new_v4(),
            job_id: Uuid::new_v4(),
            lease_id: Uuid::new_v4(),
            workflow_name: "ci".into(),
            job_name: "build".into(),
            job_spec: JobSpec::default(),
            env: BTreeMap::new(),
            timeout: None,
            steps: steps
                .iter()
                .enumerate()
                .map(|(i, (command, continue_on_error))| AssignedStep {
                    step_id: Uuid::new_v4(),
                    name: format!("step {}", i + 1),
                    action: StepAction::Shell {
                        command: command.to_string(),
                    },
                    env: BTreeMap::new(),
                    working_directory: None,
                    continue_on_error: *continue_on_error,
                    timeout: None,
                })
                .collect(),
        }
    }

    fn executor() -> (Arc<RecordingClient>, JobExecutor) {
        let client = Arc::new(RecordingClient::new());
        (client.clone(), JobExecutor::new(client))
    }

    /// Final status reported for each step, in report order.
    fn settled_steps(client: &RecordingClient) -> Vec<StepStatus> {
        client
            .step_results()
            .into_iter()
            .map(|r| r.status)
            .filter(|s| *s != StepStatus::Running)
            .collect()
    }

    #[tokio::test]
    async fn steps_run_in_order() {
        let (client, executor) = executor();
        let job = assignment(&[("echo one", false), ("echo two", false)]);

        let result = executor.run(&job, &CancellationToken::new()).await.unwrap();
        assert_eq!(result.status, JobStatus::Success);
        assert_eq!(client.log_lines(), vec!["one", "two"]);

        let reported: Vec<(usize, StepStatus)> = client
            .step_results()
            .iter()
            .map(|r| {
                let index = job.steps.iter().position(|s| s.step_id == r.step_id).unwrap();
                (index, r.status)
            })
            .collect();
        assert_eq!(
            reported,
            vec![
                (0, StepStatus::Running),
                (0, StepStatus::Success),
                (1, StepStatus::Running),
                (1, StepStatus::Success),
            ]
        );
    }

    #[tokio::test]
    async fn failure_skips_the_remaining_steps() {
        let (client, executor) = executor();
        let job = assignment(&[("exit 1", false), ("echo never", false)]);

        let result = executor.run(&job, &CancellationToken::new()).await.unwrap();
        assert_eq!(result.status, JobStatus::Failed);
        assert_eq!(settled_steps(&client), vec![StepStatus::Failed, StepStatus::Skipped]);
        assert!(client.log_lines().is_empty());
    }

    #[tokio::test]
    async fn continue_on_error_keeps_going() {
        let (client, executor) = executor();
        let job = assignment(&[("exit 1", true), ("echo after", false)]);

        let result = executor.run(&job, &CancellationToken::new()).await.unwrap();
        assert_eq!(result.status, JobStatus::Success);
        assert_eq!(settled_steps(&client), vec![StepStatus::Failed, StepStatus::Success]);
        assert_eq!(client.log_lines(), vec!["after"]);
    }

    #[tokio::test]
    async fn cancellation_fails_the_job_and_skips_the_rest() {
        let (client, executor) = executor();
        let job = assignment(&[("sleep 30", false), ("echo never", false)]);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let result = executor.run(&job, &cancel).await.unwrap();
        assert_eq!(result.status, JobStatus::Failed);
        assert_eq!(settled_steps(&client), vec![StepStatus::Cancelled, StepStatus::Skipped]);
    }

    #[tokio::test]
    async fn cancelled_continue_on_error_step_cancels_the_job() {
        let (_, executor) = executor();
        let job = assignment(&[("sleep 30", true)]);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let result = executor.run(&job, &cancel).await.unwrap();
        assert_eq!(result.status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn job_timeout_fails_the_job() {
        let (client, executor) = executor();
        let mut job = assignment(&[("sleep 30", true), ("echo never", false)]);
        job.timeout = Some(Duration::from_millis(100));

        let result = executor.run(&job, &CancellationToken::new()).await.unwrap();
        assert_eq!(result.status, JobStatus::Failed);
        assert!(result.error.unwrap().starts_with("job timed out"));
        assert_eq!(settled_steps(&client), vec![StepStatus::Failed, StepStatus::Skipped]);
    }

    #[tokio::test]
    async fn huge_job_timeout_does_not_limit_the_job() {
        let (_, executor) = executor();
        let mut job = assignment(&[("true", false)]);
        job.timeout = Some(Duration::from_secs(u64::MAX / 2));

        let result = executor.run(&job, &CancellationToken::new()).await.unwrap();
        assert_eq!(result.status, JobStatus::Success);
    }

    #[tokio::test]
    async fn transient_report_failures_are_retried() {
        let (client, executor) = executor();
        let executor = executor.with_retry(RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(1),
        });
        client.fail_reports(2);
        let job = assignment(&[("true", false)]);

        let result = executor.run(&job, &CancellationToken::new()).await.unwrap();
        assert_eq!(result.status, JobStatus::Success);
        assert_eq!(settled_steps(&client), vec![StepStatus::Success]);
        assert_eq!(client.job_results().len(), 1);
    }

    #[tokio::test]
    async fn discarded_reports_abandon_the_job() {
        let (client, executor) = executor();
        client.discard_reports();
        let job = assignment(&[("echo never", false)]);

        assert!(executor.run(&job, &CancellationToken::new()).await.is_none());
        assert!(client.log_lines().is_empty());
        assert!(client.job_results().is_empty());
    }
}
