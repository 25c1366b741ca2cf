//! The task that owns one run.
//!
//! Every state change of a run is a [`RunCommand`] sent to its actor, so
//! transitions of one run are serialised while different runs proceed in
//! parallel.  A transition is applied to a copy of the state, written to the
//! store, and only then committed; a failed write leaves the state as it was.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use queue::QueuedJob;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::{
    compiler::CompiledWorkflow,
    models::RunStatus,
    orchestrator::Shared,
    protocol::{Ack, AssignedStep, Assignment, JobResult, StepResult},
    state::{Effect, Redelivery, RunState},
    view::RunView,
    EngineError,
};

type Reply<T> = oneshot::Sender<Result<T, EngineError>>;

/// Why a run is being cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CancelReason {
    Requested,
    TimedOut,
}

pub(crate) enum RunCommand {
    Start {
        reply: Reply<()>,
    },
    /// The queue leased one of this run's jobs to a runner.  Replies
    /// whether the assignment stands.
    Dispatched {
        job_id: Uuid,
        runner_id: String,
        lease_id: Uuid,
        reply: Reply<bool>,
    },
    /// The runner holding the lease polled for work again.
    Redeliver {
        job_id: Uuid,
        lease_id: Uuid,
        reply: Reply<Redelivery>,
    },
    StepReport {
        result: StepResult,
        reply: Reply<Ack>,
    },
    JobReport {
        result: JobResult,
        reply: Reply<Ack>,
    },
    Cancel {
        reason: CancelReason,
        reply: Option<Reply<()>>,
    },
    LeaseExpired {
        job_id: Uuid,
        lease_id: Uuid,
    },
    CancelGraceElapsed {
        job_id: Uuid,
        lease_id: Uuid,
    },
    Snapshot {
        reply: oneshot::Sender<RunView>,
    },
}

pub(crate) struct RunActor {
    state: RunState,
    workflow: Arc<CompiledWorkflow>,
    shared: Arc<Shared>,
    commands: mpsc::Receiver<RunCommand>,
    /// Weak so pending timers do not keep the actor alive.
    mailbox: mpsc::WeakSender<RunCommand>,
    status: watch::Sender<RunStatus>,
    timers: Vec<JoinHandle<()>>,
}

impl RunActor {
    /// Spawn the actor for a freshly created run.
    pub(crate) fn spawn(
        state: RunState,
        workflow: Arc<CompiledWorkflow>,
        shared: Arc<Shared>,
    ) -> (mpsc::Sender<RunCommand>, watch::Receiver<RunStatus>, JoinHandle<()>) {
        let (tx, commands) = mpsc::channel(shared.config.actor_mailbox.max(1));
        let (status, status_rx) = watch::channel(state.status);
        let actor = Self {
            state,
            workflow,
            shared,
            commands,
            mailbox: tx.downgrade(),
            status,
            timers: Vec::new(),
        };
        let task = tokio::spawn(actor.run());
        (tx, status_rx, task)
    }

    #[instrument(name = "run_actor", skip(self), fields(run_id = %self.state.id))]
    async fn run(mut self) {
        while let Some(command) = self.commands.recv().await {
            self.handle(command).await;
            if self.state.status.is_terminal() {
                break;
            }
        }

        // Whatever is still queued arrives after the run settled.
        self.commands.close();
        while let Some(command) = self.commands.recv().await {
            self.refuse(command);
        }

        for timer in self.timers.drain(..) {
            timer.abort();
        }
        self.shared.logs.close(self.state.id).await;
        let job_ids: Vec<Uuid> = self.state.jobs.iter().map(|j| j.id).collect();
        self.shared.forget_actor(self.state.id, &job_ids);
        debug!(status = %self.state.status, "run actor stopped");
    }

    async fn handle(&mut self, command: RunCommand) {
        match command {
            RunCommand::Start { reply } => {
                let result = self.start().await;
                let _ = reply.send(result);
            }
            RunCommand::Dispatched {
                job_id,
                runner_id,
                lease_id,
                reply,
            } => {
                let result = self.dispatched(job_id, runner_id, lease_id).await;
                let _ = reply.send(result);
            }
            RunCommand::Redeliver {
                job_id,
                lease_id,
                reply,
            } => {
                let result = self.redeliver(job_id, lease_id).await;
                let _ = reply.send(result);
            }
            RunCommand::StepReport { result, reply } => {
                let now = Utc::now();
                let step_id = result.step_id;
                let outcome = self.transition(|s| s.step_report(result, now)).await;
                if let Ok(ack) = &outcome {
                    debug!(%step_id, ?ack, "step report handled");
                }
                let _ = reply.send(outcome);
            }
            RunCommand::JobReport { result, reply } => {
                let now = Utc::now();
                let outcome = match self.transition(|s| s.job_report(result, now)).await {
                    Ok((ack, effects)) => {
                        self.perform(effects);
                        Ok(ack)
                    }
                    Err(e) => Err(e),
                };
                let _ = reply.send(outcome);
            }
            RunCommand::Cancel { reason, reply } => {
                let result = self.cancel(reason).await;
                if let Err(e) = &result {
                    if reply.is_none() {
                        warn!(error = %e, ?reason, "run cancellation failed");
                    }
                }
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
            RunCommand::LeaseExpired { job_id, lease_id } => {
                let now = Utc::now();
                match self.transition(|s| Ok(s.lease_expired(job_id, lease_id, now))).await {
                    Ok(effects) => self.perform(effects),
                    Err(e) => {
                        warn!(%job_id, error = %e, "could not record lease expiry, retrying");
                        let retry = self.shared.config.heartbeat_interval;
                        self.schedule(retry, RunCommand::LeaseExpired { job_id, lease_id });
                    }
                }
            }
            RunCommand::CancelGraceElapsed { job_id, lease_id } => {
                let now = Utc::now();
                match self
                    .transition(|s| Ok(s.cancel_grace_elapsed(job_id, lease_id, now)))
                    .await
                {
                    Ok(effects) => {
                        if !effects.is_empty() {
                            warn!(%job_id, "runner ignored cancellation, job force-cancelled");
                        }
                        self.perform(effects);
                    }
                    Err(e) => {
                        warn!(%job_id, error = %e, "could not force-cancel job, retrying");
                        let retry = self.shared.config.heartbeat_interval;
                        self.schedule(retry, RunCommand::CancelGraceElapsed { job_id, lease_id });
                    }
                }
            }
            RunCommand::Snapshot { reply } => {
                let _ = reply.send(self.state.view());
            }
        }
    }

    /// Answer a command that arrived after the run settled.
    fn refuse(&self, command: RunCommand) {
        let closed = || EngineError::InvalidTransition {
            entity: format!("run {}", self.state.id),
            status: self.state.status.to_string(),
            action: "modify",
        };
        match command {
            RunCommand::Start { reply } => {
                let _ = reply.send(Err(closed()));
            }
            RunCommand::Cancel { reply, .. } => {
                if let Some(reply) = reply {
                    let _ = reply.send(Err(closed()));
                }
            }
            RunCommand::Dispatched { reply, .. } => {
                let _ = reply.send(Ok(false));
            }
            RunCommand::Redeliver { reply, .. } => {
                let _ = reply.send(Ok(Redelivery::Stale));
            }
            RunCommand::StepReport { reply, .. } | RunCommand::JobReport { reply, .. } => {
                let _ = reply.send(Ok(Ack::Discarded));
            }
            RunCommand::Snapshot { reply } => {
                let _ = reply.send(self.state.view());
            }
            RunCommand::LeaseExpired { .. } | RunCommand::CancelGraceElapsed { .. } => {}
        }
    }

    // -----------------------------------------------------------------------
    // Command handlers
    // -----------------------------------------------------------------------

    async fn start(&mut self) -> Result<(), EngineError> {
        let now = Utc::now();
        let effects = self.transition(|s| s.start(now)).await?;
        info!(
            workflow = %self.state.workflow_name,
            jobs = self.state.jobs.len(),
            "run started"
        );

        if let Some(limit) = self.workflow.timeout.or(self.shared.config.run_timeout) {
            self.schedule(
                limit,
                RunCommand::Cancel {
                    reason: CancelReason::TimedOut,
                    reply: None,
                },
            );
        }
        self.perform(effects);
        Ok(())
    }

    async fn dispatched(
        &mut self,
        job_id: Uuid,
        runner_id: String,
        lease_id: Uuid,
    ) -> Result<bool, EngineError> {
        let now = Utc::now();
        let (accepted, effects) = self
            .transition(|s| s.dispatched(job_id, &runner_id, lease_id, now))
            .await?;
        if accepted {
            info!(%job_id, %runner_id, "job dispatched");
        } else {
            debug!(%job_id, %runner_id, "assignment refused");
        }
        self.perform(effects);
        Ok(accepted)
    }

    async fn redeliver(&mut self, job_id: Uuid, lease_id: Uuid) -> Result<Redelivery, EngineError> {
        let now = Utc::now();
        let (outcome, effects) = self.transition(|s| s.redeliver(job_id, lease_id, now)).await?;
        match outcome {
            Redelivery::Resend | Redelivery::Stale => debug!(%job_id, ?outcome, "runner polled while holding a lease"),
            Redelivery::Settled => info!(%job_id, "job settled from step results after a lost job report"),
            Redelivery::Requeued => {
                // Requeue only takes expired leases.
                self.shared.queue.expire(job_id, lease_id);
                warn!(%job_id, "runner abandoned its job, re-queueing");
            }
        }
        self.perform(effects);
        Ok(outcome)
    }

    async fn cancel(&mut self, reason: CancelReason) -> Result<(), EngineError> {
        let now = Utc::now();
        let queue = Arc::clone(&self.shared.queue);
        let mut withdrawn = Vec::new();
        let outcome = self
            .transition(|s| {
                s.cancel(now, |job_id| match queue.withdraw(job_id) {
                    Some(pulled) => {
                        withdrawn.push(pulled);
                        true
                    }
                    None => false,
                })
            })
            .await;

        let effects = match outcome {
            Ok(effects) => effects,
            Err(e) => {
                // The state still lists them as Ready, so they go back.
                self.shared.queue.reinstate(withdrawn);
                return Err(e);
            }
        };

        match reason {
            CancelReason::Requested => info!("run cancellation requested"),
            CancelReason::TimedOut => warn!("run timed out, cancelling"),
        }
        self.perform(effects);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Plumbing
    // -----------------------------------------------------------------------

    /// Apply `f` to a copy of the state, persist the changed rows, then
    /// commit the copy.
    async fn transition<T>(
        &mut self,
        f: impl FnOnce(&mut RunState) -> Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        let mut next = self.state.clone();
        let out = f(&mut next)?;

        let changes = next.diff(&self.state);
        if !changes.is_empty() {
            if let Err(e) = self.shared.store.apply(&changes).await {
                warn!(error = %e, "store rejected run transition, state unchanged");
                return Err(e.into());
            }
        }
        self.state = next;
        Ok(out)
    }

    fn perform(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Enqueue(jobs) => self.enqueue(jobs),
                Effect::SignalCancel {
                    job,
                    runner_id,
                    lease_id,
                } => {
                    let job_id = self.state.jobs[job].id;
                    self.shared.registry.request_cancel(&runner_id, job_id);
                    let grace = self.shared.config.cancel_grace;
                    self.schedule(grace, RunCommand::CancelGraceElapsed { job_id, lease_id });
                    debug!(%job_id, %runner_id, "cancellation signalled");
                }
                Effect::ReleaseLease {
                    job,
                    runner_id,
                    lease_id,
                    completed,
                } => {
                    let job = &self.state.jobs[job];
                    let queue = &self.shared.queue;
                    if !(completed && queue.complete(job.id, lease_id).is_ok()) {
                        queue.release(job.id, lease_id);
                    }
                    self.shared.registry.release(&runner_id, Some(job.id));
                    info!(
                        job = %job.name,
                        status = %job.status,
                        %runner_id,
                        "job settled"
                    );
                }
                Effect::Requeue {
                    job,
                    runner_id,
                    lease_id,
                } => {
                    let job = &self.state.jobs[job];
                    if !self.shared.queue.requeue(job.id, lease_id) {
                        error!(job = %job.name, %lease_id, "expired lease missing from queue");
                    }
                    self.shared.registry.release(&runner_id, Some(job.id));
                    warn!(job = %job.name, %runner_id, "lease expired, job re-queued");
                }
                Effect::Finished(status) => {
                    info!(%status, "run finished");
                    self.status.send_replace(status);
                }
            }
        }
    }

    fn enqueue(&self, jobs: Vec<usize>) {
        if jobs.is_empty() {
            return;
        }
        let batch = jobs
            .iter()
            .map(|&i| QueuedJob {
                job_id: self.state.jobs[i].id,
                run_id: self.state.id,
                declared: self.state.jobs[i].declared,
                tags: self.workflow.jobs[i].tags.clone(),
                payload: Arc::new(self.assignment(i)),
            })
            .collect();
        match self.shared.queue.enqueue(batch) {
            Ok(()) => {
                for &i in &jobs {
                    info!(job = %self.state.jobs[i].name, "job ready");
                }
            }
            Err(e) => error!(error = %e, "could not enqueue ready jobs"),
        }
    }

    /// What a runner receives for job `i`, without a lease yet.
    fn assignment(&self, i: usize) -> Assignment {
        let compiled = &self.workflow.jobs[i];
        let job = &self.state.jobs[i];

        let mut env: BTreeMap<String, String> = self
            .state
            .inputs
            .iter()
            .map(|(k, v)| (input_var(k), v.clone()))
            .collect();
        env.extend(compiled.env.clone());

        Assignment {
            run_id: self.state.id,
            job_id: job.id,
            lease_id: Uuid::nil(),
            workflow_name: self.state.workflow_name.clone(),
            job_name: compiled.name.clone(),
            job_spec: self.workflow.spec.jobs[i].1.clone(),
            env,
            timeout: compiled.timeout,
            steps: compiled
                .steps
                .iter()
                .zip(&job.steps)
                .map(|(step, state)| AssignedStep {
                    step_id: state.id,
                    name: step.name.clone(),
                    action: step.action.clone(),
                    env: step.env.clone(),
                    working_directory: step.working_directory.clone(),
                    continue_on_error: step.continue_on_error,
                    timeout: step.timeout,
                })
                .collect(),
        }
    }

    /// Deliver `command` to this actor after `after`.
    fn schedule(&mut self, after: Duration, command: RunCommand) {
        self.timers.retain(|t| !t.is_finished());
        let mailbox = self.mailbox.clone();
        self.timers.push(tokio::spawn(async move {
            tokio::time::sleep(after).await;
            if let Some(tx) = mailbox.upgrade() {
                let _ = tx.send(command).await;
            }
        }));
    }
}

/// `INPUT_<KEY>`, upper-cased, with anything but letters and digits as `_`.
fn input_var(key: &str) -> String {
    let name: String = key
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect();
    format!("INPUT_{name}")
}
