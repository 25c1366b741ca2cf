//! The state machine of one run.
//!
//! [`RunState`] is plain data: every transition is a synchronous method
//! that mutates the state and returns the [`Effect`]s the caller must carry
//! out against the dispatch queue and runner registry.  Jobs live in an
//! arena indexed by declaration order; `needs` and `dependents` are index
//! lists into that arena.
//!
//! The run actor applies each transition to a clone, persists the changed
//! rows (see [`RunState::diff`]) and only then swaps the clone in.

use std::collections::{BTreeMap, HashMap, VecDeque};

use chrono::{DateTime, Utc};
use db::{
    models::{JobRow, RunRow, StepRow},
    Transition,
};
use tracing::debug;
use uuid::Uuid;

use crate::{
    compiler::CompiledWorkflow,
    models::{JobStatus, RunStatus, StepStatus},
    protocol::{Ack, JobResult, StepResult},
    view::{JobView, RunView, StepView},
    EngineError,
};

// ---------------------------------------------------------------------------
// Effects
// ---------------------------------------------------------------------------

/// Work a transition hands back to the caller.  `job` is a declaration
/// index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Jobs that became ready together, lowest declaration index first.
    Enqueue(Vec<usize>),
    /// Ask the runner holding the job to stop, and start the grace timer.
    SignalCancel {
        job: usize,
        runner_id: String,
        lease_id: Uuid,
    },
    /// Drop the job's lease and free its runner.  `completed` is set when
    /// the runner delivered a result.
    ReleaseLease {
        job: usize,
        runner_id: String,
        lease_id: Uuid,
        completed: bool,
    },
    /// Put a job whose lease expired back in the queue.
    Requeue {
        job: usize,
        runner_id: String,
        lease_id: Uuid,
    },
    /// The run reached a terminal status.
    Finished(RunStatus),
}

/// What to do with a lease whose runner asked for work again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Redelivery {
    /// Nothing was reported yet; hand the same assignment out again.
    Resend,
    /// Every step had reported; the job was settled from its steps.
    Settled,
    /// The runner lost the job part way through; it went back to the queue.
    Requeued,
    /// The lease no longer holds the job.
    Stale,
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct StepState {
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

impl StepState {
    fn reset(&mut self) {
        self.status = StepStatus::Pending;
        self.exit_code = None;
        self.output.clear();
        self.error.clear();
        self.started_at = None;
        self.finished_at = None;
    }

    /// Whether this step's outcome fails its job.
    fn fails_job(&self) -> bool {
        !self.continue_on_error && matches!(self.status, StepStatus::Failed | StepStatus::Cancelled)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobState {
    pub id: Uuid,
    pub name: String,
    pub declared: usize,
    pub status: JobStatus,
    pub needs: Vec<usize>,
    pub dependents: Vec<usize>,
    pub runner_id: Option<String>,
    pub lease_id: Option<Uuid>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub steps: Vec<StepState>,
    /// Index of the first step without a terminal result.
    next_step: usize,
    /// Terminal step results that arrived ahead of `next_step`.
    buffered: BTreeMap<usize, StepResult>,
}

impl JobState {
    fn apply_step(&mut self, index: usize, result: StepResult, now: DateTime<Utc>) {
        let step = &mut self.steps[index];
        step.status = result.status;
        step.exit_code = result.exit_code;
        step.output = result.output;
        step.error = result.error;
        step.started_at = step.started_at.or(result.started_at).or(Some(now));
        step.finished_at = result.finished_at.or(Some(now));
        self.next_step = index + 1;
    }

    /// Give every step without a terminal result `status`.
    fn settle_steps(&mut self, status: StepStatus, now: DateTime<Utc>) {
        for step in self.steps.iter_mut().filter(|s| !s.status.is_terminal()) {
            step.status = status;
            step.finished_at = Some(now);
        }
        self.next_step = self.steps.len();
        self.buffered.clear();
    }

    /// The job holds a lease and may receive results.
    fn in_flight(&self) -> bool {
        matches!(self.status, JobStatus::Dispatched | JobStatus::Running)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunState {
    pub id: Uuid,
    pub workflow_name: String,
    pub status: RunStatus,
    pub cancel_requested: bool,
    pub inputs: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub jobs: Vec<JobState>,
    job_index: HashMap<Uuid, usize>,
    step_index: HashMap<Uuid, (usize, usize)>,
}

impl RunState {
    /// A fresh `Pending` run with every job and step `Pending`.
    pub fn new(
        id: Uuid,
        workflow: &CompiledWorkflow,
        inputs: BTreeMap<String, String>,
        now: DateTime<Utc>,
    ) -> Self {
        let jobs: Vec<JobState> = workflow
            .jobs
            .iter()
            .map(|job| JobState {
                id: Uuid::new_v4(),
                name: job.key.clone(),
                declared: job.declared,
                status: JobStatus::Pending,
                needs: job.needs.clone(),
                dependents: job.dependents.clone(),
                runner_id: None,
                lease_id: None,
                error: None,
                started_at: None,
                finished_at: None,
                steps: job
                    .steps
                    .iter()
                    .map(|step| StepState {
                        id: Uuid::new_v4(),
                        name: step.name.clone(),
                        command: step.action.describe().to_owned(),
                        continue_on_error: step.continue_on_error,
                        status: StepStatus::Pending,
                        exit_code: None,
                        output: String::new(),
                        error: String::new(),
                        started_at: None,
                        finished_at: None,
                    })
                    .collect(),
                next_step: 0,
                buffered: BTreeMap::new(),
            })
            .collect();

        let job_index = jobs.iter().enumerate().map(|(i, j)| (j.id, i)).collect();
        let step_index = jobs
            .iter()
            .enumerate()
            .flat_map(|(i, j)| j.steps.iter().enumerate().map(move |(s, step)| (step.id, (i, s))))
            .collect();

        Self {
            id,
            workflow_name: workflow.name().to_owned(),
            status: RunStatus::Pending,
            cancel_requested: false,
            inputs,
            created_at: now,
            started_at: None,
            finished_at: None,
            jobs,
            job_index,
            step_index,
        }
    }

    pub fn job_index(&self, job_id: Uuid) -> Option<usize> {
        self.job_index.get(&job_id).copied()
    }

    /// `(job index, step index)` of a step.
    pub fn step_location(&self, step_id: Uuid) -> Option<(usize, usize)> {
        self.step_index.get(&step_id).copied()
    }

    // -----------------------------------------------------------------------
    // Transitions
    // -----------------------------------------------------------------------

    /// Pending → Running.  Jobs without `needs` become Ready.
    pub fn start(&mut self, now: DateTime<Utc>) -> Result<Vec<Effect>, EngineError> {
        if self.status != RunStatus::Pending {
            return Err(self.invalid("start"));
        }
        self.status = RunStatus::Running;
        self.started_at = Some(now);

        let mut effects = Vec::new();
        let ready: Vec<usize> = (0..self.jobs.len())
            .filter(|&i| self.jobs[i].needs.is_empty())
            .collect();
        for &i in &ready {
            self.jobs[i].status = JobStatus::Ready;
        }
        if !ready.is_empty() {
            effects.push(Effect::Enqueue(ready));
        }
        self.check_finished(now, &mut effects);
        Ok(effects)
    }

    /// A runner was leased the job.  Returns whether the assignment stands;
    /// a refused assignment's lease must be released by the caller.
    pub fn dispatched(
        &mut self,
        job_id: Uuid,
        runner_id: &str,
        lease_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(bool, Vec<Effect>), EngineError> {
        let i = self.job_index(job_id).ok_or(EngineError::UnknownJob(job_id))?;
        let mut effects = Vec::new();

        if self.status.is_terminal() || self.jobs[i].status != JobStatus::Ready {
            return Ok((false, effects));
        }
        if self.cancel_requested {
            // Left the queue before cancellation could withdraw it.
            self.skip_job(i, now);
            self.cascade_skip(i, now);
            self.check_finished(now, &mut effects);
            return Ok((false, effects));
        }

        let job = &mut self.jobs[i];
        job.status = JobStatus::Dispatched;
        job.runner_id = Some(runner_id.to_owned());
        job.lease_id = Some(lease_id);
        Ok((true, effects))
    }

    /// Apply a step report.  Terminal results are applied in step order;
    /// one that arrives early is buffered until its predecessors land.
    pub fn step_report(&mut self, result: StepResult, now: DateTime<Utc>) -> Result<Ack, EngineError> {
        let (i, s) = self
            .step_location(result.step_id)
            .ok_or(EngineError::UnknownStep(result.step_id))?;
        if !self.accepts(i, result.job_id, result.lease_id) {
            return Ok(Ack::Discarded);
        }

        let job = &mut self.jobs[i];
        if job.status == JobStatus::Dispatched {
            job.status = JobStatus::Running;
            job.started_at = result.started_at.or(Some(now));
        }

        let ack = match result.status {
            StepStatus::Pending => Ack::Discarded,
            StepStatus::Running if s == job.next_step => {
                let step = &mut job.steps[s];
                step.status = StepStatus::Running;
                step.started_at = result.started_at.or(Some(now));
                Ack::Applied
            }
            StepStatus::Running => Ack::Discarded,
            _ if s < job.next_step => Ack::Discarded,
            _ if s > job.next_step => {
                debug!(job = %job.name, step = s, waiting_for = job.next_step, "step result buffered");
                job.buffered.insert(s, result);
                Ack::Buffered
            }
            _ => {
                job.apply_step(s, result, now);
                while let Some(next) = job.buffered.remove(&job.next_step) {
                    job.apply_step(job.next_step, next, now);
                }
                Ack::Applied
            }
        };
        Ok(ack)
    }

    /// Settle a job from its runner's final report.
    pub fn job_report(
        &mut self,
        result: JobResult,
        now: DateTime<Utc>,
    ) -> Result<(Ack, Vec<Effect>), EngineError> {
        let i = self
            .job_index(result.job_id)
            .ok_or(EngineError::UnknownJob(result.job_id))?;
        let mut effects = Vec::new();
        if !self.accepts(i, result.job_id, result.lease_id) {
            return Ok((Ack::Discarded, effects));
        }

        let job = &mut self.jobs[i];
        job.settle_steps(StepStatus::Skipped, now);

        let failed_step = job.steps.iter().find(|s| s.fails_job());
        let (status, error) = match (result.status, failed_step) {
            (_, Some(step)) => (
                JobStatus::Failed,
                result.error.or_else(|| Some(step_failure(step))),
            ),
            (JobStatus::Success, None) => (JobStatus::Success, None),
            (JobStatus::Cancelled, None) => (JobStatus::Cancelled, result.error),
            (JobStatus::Failed, None) => (JobStatus::Failed, result.error),
            (other, None) => (
                JobStatus::Failed,
                Some(format!("runner reported non-terminal job status '{other}'")),
            ),
        };

        job.status = status;
        job.error = error;
        job.finished_at = Some(now);
        job.started_at = job.started_at.or(Some(now));
        effects.push(Effect::ReleaseLease {
            job: i,
            runner_id: job.runner_id.clone().unwrap_or_default(),
            lease_id: result.lease_id,
            completed: true,
        });

        self.settle(i, now, &mut effects);
        Ok((Ack::Applied, effects))
    }

    /// Request cancellation.  `withdraw` is asked to pull each Ready job
    /// out of the dispatch queue; jobs it could not withdraw are refused
    /// when their dispatch is reported.
    pub fn cancel(
        &mut self,
        now: DateTime<Utc>,
        mut withdraw: impl FnMut(Uuid) -> bool,
    ) -> Result<Vec<Effect>, EngineError> {
        if self.status.is_terminal() {
            return Err(self.invalid("cancel"));
        }
        let mut effects = Vec::new();
        if self.cancel_requested {
            return Ok(effects);
        }
        self.cancel_requested = true;

        for i in 0..self.jobs.len() {
            match self.jobs[i].status {
                JobStatus::Pending => self.skip_job(i, now),
                JobStatus::Ready => {
                    if withdraw(self.jobs[i].id) {
                        self.skip_job(i, now);
                    }
                }
                JobStatus::Dispatched | JobStatus::Running => {
                    let job = &self.jobs[i];
                    if let (Some(runner_id), Some(lease_id)) = (job.runner_id.clone(), job.lease_id) {
                        effects.push(Effect::SignalCancel {
                            job: i,
                            runner_id,
                            lease_id,
                        });
                    }
                }
                _ => {}
            }
        }

        self.check_finished(now, &mut effects);
        Ok(effects)
    }

    /// The runner holding the job polled for work again, so whatever it was
    /// doing with the job is over.  A job it never started is handed out
    /// again; one whose steps all reported is settled from them, as if the
    /// job result had arrived; anything in between is re-queued.
    pub fn redeliver(
        &mut self,
        job_id: Uuid,
        lease_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(Redelivery, Vec<Effect>), EngineError> {
        let Some(i) = self.holding(job_id, lease_id) else {
            return Ok((Redelivery::Stale, Vec::new()));
        };

        let job = &self.jobs[i];
        if job.buffered.is_empty() && job.steps.iter().all(|s| s.status == StepStatus::Pending) {
            return Ok((Redelivery::Resend, Vec::new()));
        }

        if job.next_step == job.steps.len() {
            let cancelled = job.steps.iter().any(|s| s.status == StepStatus::Cancelled);
            let result = JobResult {
                job_id,
                lease_id,
                status: if cancelled {
                    JobStatus::Cancelled
                } else {
                    JobStatus::Success
                },
                error: None,
            };
            debug!(job = %job.name, "job settled from its step results");
            let (_, effects) = self.job_report(result, now)?;
            return Ok((Redelivery::Settled, effects));
        }

        let effects = self.lease_expired(job_id, lease_id, now);
        let outcome = if effects.iter().any(|e| matches!(e, Effect::Requeue { .. })) {
            Redelivery::Requeued
        } else {
            Redelivery::Settled
        };
        Ok((outcome, effects))
    }

    /// The job's runner went silent.  The job goes back to Ready (or is
    /// force-cancelled if the run is being cancelled).
    pub fn lease_expired(&mut self, job_id: Uuid, lease_id: Uuid, now: DateTime<Utc>) -> Vec<Effect> {
        let mut effects = Vec::new();
        let Some(i) = self.holding(job_id, lease_id) else {
            return effects;
        };

        if self.cancel_requested {
            self.force_cancel(i, "runner went offline during cancellation", now, &mut effects);
            return effects;
        }

        let job = &mut self.jobs[i];
        let runner_id = job.runner_id.take().unwrap_or_default();
        job.status = JobStatus::Ready;
        job.lease_id = None;
        job.started_at = None;
        job.error = None;
        job.next_step = 0;
        job.buffered.clear();
        for step in &mut job.steps {
            step.reset();
        }
        effects.push(Effect::Requeue {
            job: i,
            runner_id,
            lease_id,
        });
        effects
    }

    /// The cancellation grace period ran out without a job result.
    pub fn cancel_grace_elapsed(
        &mut self,
        job_id: Uuid,
        lease_id: Uuid,
        now: DateTime<Utc>,
    ) -> Vec<Effect> {
        let mut effects = Vec::new();
        if let Some(i) = self.holding(job_id, lease_id) {
            self.force_cancel(i, "runner did not acknowledge cancellation in time", now, &mut effects);
        }
        effects
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn invalid(&self, action: &'static str) -> EngineError {
        EngineError::InvalidTransition {
            entity: format!("run {}", self.id),
            status: self.status.to_string(),
            action,
        }
    }

    /// Results are only taken from the job's current lease while it is in
    /// flight and the run is still open.
    fn accepts(&self, i: usize, job_id: Uuid, lease_id: Uuid) -> bool {
        let job = &self.jobs[i];
        !self.status.is_terminal() && job.id == job_id && job.in_flight() && job.lease_id == Some(lease_id)
    }

    fn holding(&self, job_id: Uuid, lease_id: Uuid) -> Option<usize> {
        let i = self.job_index(job_id)?;
        let job = &self.jobs[i];
        (!self.status.is_terminal() && job.in_flight() && job.lease_id == Some(lease_id)).then_some(i)
    }

    fn force_cancel(&mut self, i: usize, reason: &str, now: DateTime<Utc>, effects: &mut Vec<Effect>) {
        let job = &mut self.jobs[i];
        job.settle_steps(StepStatus::Cancelled, now);
        job.status = JobStatus::Cancelled;
        job.error = Some(reason.to_owned());
        job.finished_at = Some(now);
        if let Some(lease_id) = job.lease_id {
            effects.push(Effect::ReleaseLease {
                job: i,
                runner_id: job.runner_id.clone().unwrap_or_default(),
                lease_id,
                completed: false,
            });
        }
        self.settle(i, now, effects);
    }

    fn skip_job(&mut self, i: usize, now: DateTime<Utc>) {
        let job = &mut self.jobs[i];
        job.status = JobStatus::Skipped;
        job.finished_at = Some(now);
        for step in job.steps.iter_mut().filter(|s| !s.status.is_terminal()) {
            step.status = StepStatus::Skipped;
        }
        job.next_step = job.steps.len();
    }

    /// Skip every Pending job downstream of `i`.
    fn cascade_skip(&mut self, i: usize, now: DateTime<Utc>) {
        let mut frontier: VecDeque<usize> = self.jobs[i].dependents.iter().copied().collect();
        while let Some(d) = frontier.pop_front() {
            if self.jobs[d].status == JobStatus::Pending {
                self.skip_job(d, now);
                frontier.extend(self.jobs[d].dependents.iter().copied());
            }
        }
    }

    /// Propagate a job reaching a terminal status to its dependents.
    fn settle(&mut self, i: usize, now: DateTime<Utc>, effects: &mut Vec<Effect>) {
        if self.jobs[i].status != JobStatus::Success {
            self.cascade_skip(i, now);
            self.check_finished(now, effects);
            return;
        }

        let mut ready = Vec::new();
        for d in self.jobs[i].dependents.clone() {
            if self.jobs[d].status != JobStatus::Pending {
                continue;
            }
            let needs = &self.jobs[d].needs;
            let blocked = needs.iter().any(|&n| {
                matches!(
                    self.jobs[n].status,
                    JobStatus::Failed | JobStatus::Skipped | JobStatus::Cancelled
                )
            });
            let satisfied = needs.iter().all(|&n| self.jobs[n].status == JobStatus::Success);

            if blocked || (satisfied && self.cancel_requested) {
                self.skip_job(d, now);
                self.cascade_skip(d, now);
            } else if satisfied {
                self.jobs[d].status = JobStatus::Ready;
                ready.push(d);
            }
        }

        if !ready.is_empty() {
            ready.sort_unstable();
            effects.push(Effect::Enqueue(ready));
        }
        self.check_finished(now, effects);
    }

    fn check_finished(&mut self, now: DateTime<Utc>, effects: &mut Vec<Effect>) {
        if self.status.is_terminal() || self.jobs.iter().any(|j| j.status.is_active()) {
            return;
        }
        self.status = if self.jobs.iter().any(|j| j.status == JobStatus::Failed) {
            RunStatus::Failed
        } else if self.cancel_requested {
            RunStatus::Cancelled
        } else {
            RunStatus::Success
        };
        self.finished_at = Some(now);
        effects.push(Effect::Finished(self.status));
    }

    // -----------------------------------------------------------------------
    // Rows and views
    // -----------------------------------------------------------------------

    pub fn run_row(&self) -> RunRow {
        RunRow {
            id: self.id,
            workflow_name: self.workflow_name.clone(),
            status: self.status.to_string(),
            cancel_requested: self.cancel_requested,
            inputs: serde_json::Value::Object(
                self.inputs
                    .iter()
                    .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
                    .collect(),
            ),
            created_at: self.created_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
        }
    }

    pub fn job_rows(&self) -> Vec<JobRow> {
        self.jobs
            .iter()
            .map(|job| JobRow {
                id: job.id,
                run_id: self.id,
                name: job.name.clone(),
                position: job.declared as i32,
                status: job.status.to_string(),
                needs: job.needs.iter().map(|&n| self.jobs[n].id).collect(),
                runner_id: job.runner_id.clone(),
                lease_id: job.lease_id,
                error: job.error.clone(),
                started_at: job.started_at,
                finished_at: job.finished_at,
            })
            .collect()
    }

    pub fn step_rows(&self) -> Vec<StepRow> {
        self.jobs
            .iter()
            .flat_map(|job| {
                job.steps.iter().enumerate().map(move |(position, step)| StepRow {
                    id: step.id,
                    run_id: self.id,
                    job_id: job.id,
                    position: position as i32,
                    name: step.name.clone(),
                    command: step.command.clone(),
                    continue_on_error: step.continue_on_error,
                    status: step.status.to_string(),
                    exit_code: step.exit_code,
                    output: step.output.clone(),
                    error: step.error.clone(),
                    started_at: step.started_at,
                    finished_at: step.finished_at,
                })
            })
            .collect()
    }

    /// The rows that differ between `before` and `self`.
    pub fn diff(&self, before: &RunState) -> Transition {
        let run = self.run_row();
        Transition {
            run: (run != before.run_row()).then_some(run),
            jobs: changed(self.job_rows(), before.job_rows()),
            steps: changed(self.step_rows(), before.step_rows()),
        }
    }

    pub fn view(&self) -> RunView {
        RunView {
            id: self.id,
            workflow_name: self.workflow_name.clone(),
            status: self.status,
            cancel_requested: self.cancel_requested,
            inputs: self.inputs.clone(),
            created_at: self.created_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
            jobs: self
                .jobs
                .iter()
                .map(|job| JobView {
                    id: job.id,
                    name: job.name.clone(),
                    status: job.status,
                    needs: job.needs.iter().map(|&n| self.jobs[n].name.clone()).collect(),
                    runner_id: job.runner_id.clone(),
                    error: job.error.clone(),
                    started_at: job.started_at,
                    finished_at: job.finished_at,
                    steps: job
                        .steps
                        .iter()
                        .map(|step| StepView {
                            id: step.id,
                            name: step.name.clone(),
                            command: step.command.clone(),
                            continue_on_error: step.continue_on_error,
                            status: step.status,
                            exit_code: step.exit_code,
                            output: step.output.clone(),
                            error: step.error.clone(),
                            started_at: step.started_at,
                            finished_at: step.finished_at,
                        })
                        .collect(),
                })
                .collect(),
        }
    }
}

fn changed<T: PartialEq>(after: Vec<T>, before: Vec<T>) -> Vec<T> {
    after
        .into_iter()
        .zip(before)
        .filter(|(a, b)| a != b)
        .map(|(a, _)| a)
        .collect()
}

fn step_failure(step: &StepState) -> String {
    match (step.status, step.exit_code) {
        (StepStatus::Cancelled, _) => format!("step '{}' was cancelled", step.name),
        (_, Some(code)) => format!("step '{}' failed with exit code {code}", step.name),
        _ if !step.error.is_empty() => format!("step '{}' failed: {}", step.name, step.error),
        _ => format!("step '{}' failed", step.name),
    }
}
