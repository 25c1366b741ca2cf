//! The scheduler facade.
//!
//! [`Orchestrator`] owns the run actors and fronts the dispatch queue, the
//! runner registry, the log stream and the store.  Runners talk to it only
//! through the poll / report / heartbeat / log calls; callers create, start,
//! cancel and observe runs.
//!
//! It is cheap to clone: every clone shares the same state.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use dashmap::DashMap;
use db::{models::RunnerRow, DbError, Store};
use futures_util::stream::BoxStream;
use queue::{JobDispatchQueue, Lease, QueueError, Registration, RunnerInfo, RunnerRegistry};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::{
    actor::{CancelReason, RunActor, RunCommand},
    compiler::CompiledWorkflow,
    config::SchedulerConfig,
    logstream::{LogEntry, LogStream},
    models::RunStatus,
    protocol::{Ack, Assignment, HeartbeatAck, JobResult, LogIngest, PollRequest, StepResult},
    state::{Redelivery, RunState},
    view::RunView,
    EngineError,
};

/// The queue of ready jobs, carrying each job's assignment template.
pub type DispatchQueue = JobDispatchQueue<Arc<Assignment>>;

struct RunHandle {
    commands: mpsc::Sender<RunCommand>,
    task: JoinHandle<()>,
}

/// State shared between the facade, the actors and the reaper.
pub(crate) struct Shared {
    pub(crate) store: Arc<dyn Store>,
    pub(crate) queue: Arc<DispatchQueue>,
    pub(crate) registry: Arc<RunnerRegistry>,
    pub(crate) logs: LogStream,
    pub(crate) config: SchedulerConfig,
    runs: DashMap<Uuid, RunHandle>,
    statuses: DashMap<Uuid, watch::Receiver<RunStatus>>,
    /// When each settled run's actor stopped.
    finished: DashMap<Uuid, Instant>,
    /// job id → run id, for routing runner reports.
    routes: DashMap<Uuid, Uuid>,
    shutdown: CancellationToken,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    /// Called by an actor on its way out.
    pub(crate) fn forget_actor(&self, run_id: Uuid, job_ids: &[Uuid]) {
        self.runs.remove(&run_id);
        if self.statuses.get(&run_id).is_some_and(|s| s.borrow().is_terminal()) {
            self.finished.insert(run_id, Instant::now());
        }
        for job_id in job_ids {
            self.routes.remove(job_id);
        }
    }
}

#[derive(Clone)]
pub struct Orchestrator {
    shared: Arc<Shared>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn Store>,
        queue: Arc<DispatchQueue>,
        registry: Arc<RunnerRegistry>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                logs: LogStream::new(Arc::clone(&store)),
                store,
                queue,
                registry,
                config,
                runs: DashMap::new(),
                statuses: DashMap::new(),
                finished: DashMap::new(),
                routes: DashMap::new(),
                shutdown: CancellationToken::new(),
                reaper: Mutex::new(None),
            }),
        }
    }

    /// An orchestrator with its own queue and a registry configured from
    /// `config`.
    pub fn with_store(store: Arc<dyn Store>, config: SchedulerConfig) -> Self {
        let registry = Arc::new(RunnerRegistry::new(config.lease_config()));
        Self::new(store, Arc::new(DispatchQueue::new()), registry, config)
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.shared.config
    }

    pub fn queue(&self) -> &DispatchQueue {
        &self.shared.queue
    }

    pub fn registry(&self) -> &RunnerRegistry {
        &self.shared.registry
    }

    // -----------------------------------------------------------------------
    // Runs
    // -----------------------------------------------------------------------

    /// Persist a new `Pending` run of `workflow` and spawn its actor.
    #[instrument(skip(self, workflow, inputs), fields(workflow = %workflow.name()))]
    pub async fn create_run(
        &self,
        workflow: Arc<CompiledWorkflow>,
        inputs: BTreeMap<String, String>,
    ) -> Result<Uuid, EngineError> {
        let run_id = Uuid::new_v4();
        let state = RunState::new(run_id, &workflow, inputs, Utc::now());
        self.shared
            .store
            .create_run(&state.run_row(), &state.job_rows(), &state.step_rows())
            .await?;

        let steps: HashMap<Uuid, Uuid> = state
            .jobs
            .iter()
            .flat_map(|job| job.steps.iter().map(move |step| (step.id, job.id)))
            .collect();
        self.shared.logs.open(run_id, steps);
        for job in &state.jobs {
            self.shared.routes.insert(job.id, run_id);
        }

        let jobs = state.jobs.len();
        let (commands, status, task) = RunActor::spawn(state, workflow, Arc::clone(&self.shared));
        self.shared.runs.insert(run_id, RunHandle { commands, task });
        self.shared.statuses.insert(run_id, status);

        info!(%run_id, jobs, "run created");
        Ok(run_id)
    }

    pub async fn start(&self, run_id: Uuid) -> Result<(), EngineError> {
        match self.request(run_id, |reply| RunCommand::Start { reply }).await {
            Err(EngineError::ActorGone(_)) => Err(self.settled(run_id, "start").await),
            other => other.and_then(|r| r),
        }
    }

    /// Create and start a run.
    pub async fn submit(
        &self,
        workflow: Arc<CompiledWorkflow>,
        inputs: BTreeMap<String, String>,
    ) -> Result<Uuid, EngineError> {
        let run_id = self.create_run(workflow, inputs).await?;
        self.start(run_id).await?;
        Ok(run_id)
    }

    #[instrument(skip(self))]
    pub async fn cancel(&self, run_id: Uuid) -> Result<(), EngineError> {
        let sent = self
            .request(run_id, |reply| RunCommand::Cancel {
                reason: CancelReason::Requested,
                reply: Some(reply),
            })
            .await;
        match sent {
            Err(EngineError::ActorGone(_)) => Err(self.settled(run_id, "cancel").await),
            other => other.and_then(|r| r),
        }
    }

    /// The run with every job and step.  Finished runs are read back from
    /// the store.
    pub async fn snapshot(&self, run_id: Uuid) -> Result<RunView, EngineError> {
        match self.request(run_id, |reply| RunCommand::Snapshot { reply }).await {
            Err(EngineError::ActorGone(_)) => self.stored_view(run_id).await,
            other => other,
        }
    }

    /// Resolve once the run reaches a terminal status.
    pub async fn wait(&self, run_id: Uuid) -> Result<RunStatus, EngineError> {
        let watching = self.shared.statuses.get(&run_id).map(|s| s.value().clone());
        if let Some(mut status) = watching {
            let settled = status
                .wait_for(|s| s.is_terminal())
                .await
                .map(|s| *s)
                .map_err(|_| EngineError::ActorGone(run_id))?;
            return Ok(settled);
        }

        let status = self.stored_view(run_id).await?.status;
        if status.is_terminal() {
            Ok(status)
        } else {
            Err(EngineError::ActorGone(run_id))
        }
    }

    /// Drop what is kept in memory for a finished run.  Its snapshot and
    /// logs stay readable from the store.
    pub fn forget(&self, run_id: Uuid) -> bool {
        let finished = self
            .shared
            .statuses
            .get(&run_id)
            .is_some_and(|s| s.borrow().is_terminal());
        if finished {
            self.shared.statuses.remove(&run_id);
            self.shared.finished.remove(&run_id);
            self.shared.logs.evict(run_id);
        }
        finished
    }

    /// Whether the run's status is still held in memory.
    pub fn is_tracked(&self, run_id: Uuid) -> bool {
        self.shared.statuses.contains_key(&run_id)
    }

    // -----------------------------------------------------------------------
    // Runners
    // -----------------------------------------------------------------------

    #[instrument(skip(self, registration), fields(runner_id = %registration.runner_id))]
    pub async fn register_runner(&self, registration: Registration) -> Result<(), EngineError> {
        let runner_id = registration.runner_id.clone();
        if let Some(job_id) = self.shared.registry.register(registration) {
            warn!(%job_id, "runner re-registered while holding a job, reclaiming it");
        }
        // A registering runner holds nothing; any live lease it had is void.
        for (job_id, lease_id) in self.shared.queue.expire_runner(&runner_id) {
            self.lease_expired(job_id, lease_id).await;
        }
        self.persist_runner(&runner_id).await;
        Ok(())
    }

    pub async fn heartbeat(&self, runner_id: &str) -> Result<HeartbeatAck, EngineError> {
        let cancel = self.shared.registry.heartbeat(runner_id)?;
        if !cancel.is_empty() {
            debug!(runner_id, jobs = ?cancel, "delivering cancellation");
        }
        Ok(HeartbeatAck { cancel })
    }

    /// Hand the runner its next job, if one fits.
    ///
    /// The dispatch runs in its own task: a caller that gives up half way
    /// cannot leave a lease behind that no one recorded.
    pub async fn poll(&self, request: PollRequest) -> Result<Option<Assignment>, EngineError> {
        let orchestrator = self.clone();
        match tokio::spawn(async move { orchestrator.dispatch(request).await }).await {
            Ok(result) => result,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(_) => Ok(None),
        }
    }

    #[instrument(skip(self, request), fields(runner_id = %request.runner_id))]
    async fn dispatch(&self, request: PollRequest) -> Result<Option<Assignment>, EngineError> {
        let shared = &self.shared;
        let runner_id = request.runner_id.as_str();

        // Polling while holding a lease: either the last reply was lost or
        // the runner is done with the job, reported or not.
        if let Some(lease) = shared.queue.leased_to(runner_id) {
            let (job_id, lease_id) = (lease.job.job_id, lease.lease_id);
            let outcome = self
                .request(lease.job.run_id, |reply| RunCommand::Redeliver {
                    job_id,
                    lease_id,
                    reply,
                })
                .await
                .and_then(|r| r);
            match outcome {
                Ok(Redelivery::Resend) => {
                    debug!(%job_id, "re-delivering assignment");
                    return Ok(Some(leased_assignment(&lease)));
                }
                Ok(Redelivery::Settled | Redelivery::Requeued) => {}
                Ok(Redelivery::Stale) | Err(EngineError::ActorGone(_)) => {
                    shared.queue.release(job_id, lease_id);
                    shared.registry.release(runner_id, Some(job_id));
                }
                Err(e) => return Err(e),
            }
        }

        let tags = match shared.registry.reserve(runner_id, &request.tags) {
            Ok(tags) => tags,
            Err(QueueError::RunnerBusy(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        loop {
            let Some(lease) = shared.queue.dispatch(runner_id, &tags) else {
                shared.registry.release(runner_id, None);
                return Ok(None);
            };
            let (job_id, lease_id) = (lease.job.job_id, lease.lease_id);

            let recorded = self
                .request(lease.job.run_id, |reply| RunCommand::Dispatched {
                    job_id,
                    runner_id: runner_id.to_owned(),
                    lease_id,
                    reply,
                })
                .await
                .and_then(|r| r);

            match recorded {
                Ok(true) => {
                    if let Err(e) = shared.registry.bind(runner_id, job_id) {
                        warn!(%job_id, error = %e, "runner changed state while being assigned");
                    }
                    return Ok(Some(leased_assignment(&lease)));
                }
                Ok(false) | Err(EngineError::ActorGone(_)) => {
                    shared.queue.release(job_id, lease_id);
                }
                Err(e) => {
                    shared.queue.restore(job_id, lease_id);
                    shared.registry.release(runner_id, None);
                    return Err(e);
                }
            }
        }
    }

    pub async fn report_step(&self, result: StepResult) -> Result<Ack, EngineError> {
        let Some(run_id) = self.live_route(result.job_id, result.lease_id) else {
            return Ok(Ack::Discarded);
        };
        self.forward(run_id, |reply| RunCommand::StepReport { result, reply })
            .await
    }

    pub async fn report_job(&self, result: JobResult) -> Result<Ack, EngineError> {
        let Some(run_id) = self.live_route(result.job_id, result.lease_id) else {
            return Ok(Ack::Discarded);
        };
        self.forward(run_id, |reply| RunCommand::JobReport { result, reply })
            .await
    }

    pub async fn append_log(&self, ingest: LogIngest) -> Result<LogEntry, EngineError> {
        self.shared
            .logs
            .append(ingest.step_id, ingest.level, ingest.content)
            .await
    }

    /// Log entries of a run with `seq > since`.  The stream ends once the
    /// run finished and everything was delivered.
    pub async fn subscribe_logs(
        &self,
        run_id: Uuid,
        since: u64,
    ) -> Result<BoxStream<'static, LogEntry>, EngineError> {
        self.shared.logs.subscribe(run_id, since).await
    }

    pub fn runners(&self) -> Vec<RunnerInfo> {
        self.shared.registry.list()
    }

    // -----------------------------------------------------------------------
    // Reaper and shutdown
    // -----------------------------------------------------------------------

    /// One reaper pass: expire silent runners' leases, forget long-gone
    /// runners and runs, and log jobs nobody can take.
    pub async fn reap(&self) {
        let shared = &self.shared;
        let outcome = shared.registry.sweep();

        for (runner_id, _) in &outcome.offline {
            for (job_id, lease_id) in shared.queue.expire_runner(runner_id) {
                warn!(%runner_id, "{}", QueueError::LeaseExpired { job_id, lease_id });
                self.lease_expired(job_id, lease_id).await;
            }
            self.persist_runner(runner_id).await;
        }
        for runner_id in &outcome.removed {
            if let Err(e) = shared.store.delete_runner(runner_id).await {
                warn!(%runner_id, error = %e, "could not delete runner row");
            }
        }
        for stale in shared.queue.stale(shared.config.assignment_warn_after) {
            warn!("{stale}");
        }

        let retention = shared.config.run_retention;
        let expired: Vec<Uuid> = shared
            .finished
            .iter()
            .filter(|f| f.value().elapsed() >= retention)
            .map(|f| *f.key())
            .collect();
        for run_id in expired {
            shared.finished.remove(&run_id);
            if self.forget(run_id) {
                debug!(%run_id, "finished run evicted from memory");
            }
        }
    }

    /// Run [`Orchestrator::reap`] every heartbeat interval until shutdown.
    pub fn spawn_reaper(&self) {
        let orchestrator = self.clone();
        let token = self.shared.shutdown.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(orchestrator.shared.config.heartbeat_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => orchestrator.reap().await,
                }
            }
            debug!("reaper stopped");
        });

        let previous = self
            .shared
            .reaper
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Stop the reaper, close every run actor's channel and join them.
    /// Unfinished runs stay as they are in the store.
    pub async fn shutdown(&self) {
        self.shared.shutdown.cancel();
        let reaper = self
            .shared
            .reaper
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(reaper) = reaper {
            let _ = reaper.await;
        }

        let run_ids: Vec<Uuid> = self.shared.runs.iter().map(|r| *r.key()).collect();
        let tasks: Vec<JoinHandle<()>> = run_ids
            .into_iter()
            .filter_map(|id| self.shared.runs.remove(&id))
            .map(|(_, handle)| handle.task)
            .collect();
        let count = tasks.len();
        for task in tasks {
            if let Err(e) = task.await {
                error!(error = %e, "run actor ended abnormally");
            }
        }
        info!(actors = count, "orchestrator shut down");
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    /// Send a command to a run's actor and wait for its reply.
    async fn request<T>(
        &self,
        run_id: Uuid,
        command: impl FnOnce(oneshot::Sender<T>) -> RunCommand,
    ) -> Result<T, EngineError> {
        let commands = self
            .shared
            .runs
            .get(&run_id)
            .map(|r| r.commands.clone())
            .ok_or(EngineError::ActorGone(run_id))?;
        let (reply, response) = oneshot::channel();
        commands
            .send(command(reply))
            .await
            .map_err(|_| EngineError::ActorGone(run_id))?;
        response.await.map_err(|_| EngineError::ActorGone(run_id))
    }

    /// Forward a runner report; reports for runs that already settled are
    /// discarded.
    async fn forward(
        &self,
        run_id: Uuid,
        command: impl FnOnce(oneshot::Sender<Result<Ack, EngineError>>) -> RunCommand,
    ) -> Result<Ack, EngineError> {
        match self.request(run_id, command).await {
            Err(EngineError::ActorGone(_)) => Ok(Ack::Discarded),
            other => other.and_then(|r| r),
        }
    }

    /// The run a report belongs to, if its lease is still live.
    fn live_route(&self, job_id: Uuid, lease_id: Uuid) -> Option<Uuid> {
        let run_id = self.shared.routes.get(&job_id).map(|r| *r.value());
        match run_id {
            Some(run_id) if self.shared.queue.is_live(job_id, lease_id) => Some(run_id),
            Some(_) => {
                warn!("discarding report: {}", QueueError::LeaseExpired { job_id, lease_id });
                None
            }
            None => {
                debug!(%job_id, "discarding report for a settled run");
                None
            }
        }
    }

    async fn lease_expired(&self, job_id: Uuid, lease_id: Uuid) {
        let run_id = self.shared.routes.get(&job_id).map(|r| *r.value());
        let delivered = match run_id {
            Some(run_id) => {
                let commands = self.shared.runs.get(&run_id).map(|r| r.commands.clone());
                match commands {
                    Some(commands) => commands
                        .send(RunCommand::LeaseExpired { job_id, lease_id })
                        .await
                        .is_ok(),
                    None => false,
                }
            }
            None => false,
        };
        if !delivered {
            // Nobody is left to re-queue it.
            self.shared.queue.release(job_id, lease_id);
        }
    }

    async fn persist_runner(&self, runner_id: &str) {
        let Some(info) = self.shared.registry.get(runner_id) else {
            return;
        };
        let row = RunnerRow {
            id: info.id,
            name: info.name,
            version: info.version,
            tags: info.tags.into_iter().collect(),
            status: info.status.to_string(),
            last_seen: info.last_seen,
            current_job: info.current_job,
        };
        if let Err(e) = self.shared.store.upsert_runner(&row).await {
            warn!(runner_id, error = %e, "could not persist runner");
        }
    }

    /// The error for a start/cancel of a run whose actor is gone.
    async fn settled(&self, run_id: Uuid, action: &'static str) -> EngineError {
        match self.shared.store.get_run(run_id).await {
            Ok(run) => EngineError::InvalidTransition {
                entity: format!("run {run_id}"),
                status: run.status,
                action,
            },
            Err(DbError::NotFound) => EngineError::UnknownRun(run_id),
            Err(e) => e.into(),
        }
    }

    async fn stored_view(&self, run_id: Uuid) -> Result<RunView, EngineError> {
        let store = &self.shared.store;
        let run = store.get_run(run_id).await.map_err(|e| match e {
            DbError::NotFound => EngineError::UnknownRun(run_id),
            other => other.into(),
        })?;
        let jobs = store.list_jobs(run_id).await?;
        let steps = store.list_steps(run_id).await?;
        RunView::from_rows(run, jobs, steps)
    }
}

/// The assignment template of a lease, stamped with its lease id.
fn leased_assignment(lease: &Lease<Arc<Assignment>>) -> Assignment {
    let mut assignment = Assignment::clone(&lease.job.payload);
    assignment.lease_id = lease.lease_id;
    assignment
}
