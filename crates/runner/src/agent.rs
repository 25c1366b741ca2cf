//! The runner's main loop: register, heartbeat, poll, execute.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use engine::{Assignment, PollRequest};
use queue::{Registration, TagSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::{JobExecutor, RunnerError, SchedulerClient};

/// Identity and timing of one runner.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub runner_id: String,
    pub name: String,
    pub version: String,
    pub tags: TagSet,
    /// Pause between polls that found no work.
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        let runner_id = format!("runner-{}", Uuid::new_v4());
        Self {
            name: runner_id.clone(),
            runner_id,
            version: env!("CARGO_PKG_VERSION").to_string(),
            tags: ["linux", "shell"].iter().map(|t| t.to_string()).collect(),
            poll_interval: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(10),
        }
    }
}

/// The job currently executing, and how to stop it.
type Active = Arc<Mutex<Option<(Uuid, CancellationToken)>>>;

pub struct Agent {
    config: AgentConfig,
    client: Arc<dyn SchedulerClient>,
    jobs: JobExecutor,
    active: Active,
}

impl Agent {
    pub fn new(config: AgentConfig, client: Arc<dyn SchedulerClient>) -> Self {
        Self {
            jobs: JobExecutor::new(Arc::clone(&client)),
            config,
            client,
            active: Arc::new(Mutex::new(None)),
        }
    }

    /// Serve jobs until `shutdown` fires.  A job in progress at shutdown is
    /// cancelled and reported before this returns.
    ///
    /// # Errors
    /// Only the first registration is fatal; later failures are logged and
    /// retried.
    #[instrument(skip_all, fields(runner_id = %self.config.runner_id))]
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), RunnerError> {
        register(self.client.as_ref(), &self.config).await?;
        info!(tags = ?self.config.tags, "runner online");

        let beating = shutdown.child_token();
        let heartbeat = tokio::spawn(heartbeat_loop(
            Arc::clone(&self.client),
            self.config.clone(),
            Arc::clone(&self.active),
            beating.clone(),
        ));

        let request = PollRequest {
            runner_id: self.config.runner_id.clone(),
            tags: self.config.tags.clone(),
        };
        loop {
            let polled = tokio::select! {
                _ = shutdown.cancelled() => break,
                polled = self.client.poll(request.clone()) => polled,
            };
            match polled {
                Ok(Some(assignment)) => self.execute(assignment, &shutdown).await,
                Ok(None) => {
                    if idle(&shutdown, self.config.poll_interval).await {
                        break;
                    }
                }
                Err(e) if e.needs_registration() => {
                    warn!(error = %e, "scheduler forgot this runner, registering again");
                    if let Err(e) = register(self.client.as_ref(), &self.config).await {
                        warn!(error = %e, "registration failed");
                    }
                }
                Err(e) => {
                    warn!(error = %e, "poll failed");
                    if idle(&shutdown, self.config.poll_interval).await {
                        break;
                    }
                }
            }
        }

        beating.cancel();
        if let Err(e) = heartbeat.await {
            warn!(error = %e, "heartbeat task ended abnormally");
        }
        info!("runner stopped");
        Ok(())
    }

    async fn execute(&self, assignment: Assignment, shutdown: &CancellationToken) {
        let cancel = shutdown.child_token();
        *lock(&self.active) = Some((assignment.job_id, cancel.clone()));

        let outcome = self.jobs.run(&assignment, &cancel).await;
        *lock(&self.active) = None;
        if outcome.is_none() {
            debug!(job_id = %assignment.job_id, "assignment abandoned");
        }
    }
}

async fn heartbeat_loop(
    client: Arc<dyn SchedulerClient>,
    config: AgentConfig,
    active: Active,
    stop: CancellationToken,
) {
    let mut ticker = tokio::time::interval(config.heartbeat_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {}
        }
        match client.heartbeat(&config.runner_id).await {
            Ok(ack) => {
                let running = lock(&active).clone();
                for job_id in ack.cancel {
                    match &running {
                        Some((current, token)) if *current == job_id => {
                            info!(%job_id, "cancellation received");
                            token.cancel();
                        }
                        _ => debug!(%job_id, "cancellation for a job not running here"),
                    }
                }
            }
            Err(e) if e.needs_registration() => {
                warn!(error = %e, "heartbeat rejected, registering again");
                // The scheduler has already reclaimed whatever was running.
                if let Some((_, token)) = lock(&active).as_ref() {
                    token.cancel();
                }
                if let Err(e) = register(client.as_ref(), &config).await {
                    warn!(error = %e, "registration failed");
                }
            }
            Err(e) => warn!(error = %e, "heartbeat failed"),
        }
    }
}

async fn register(client: &dyn SchedulerClient, config: &AgentConfig) -> Result<(), RunnerError> {
    client
        .register(Registration {
            runner_id: config.runner_id.clone(),
            name: config.name.clone(),
            version: config.version.clone(),
            tags: config.tags.clone(),
        })
        .await
}

/// Sleep for `period`; true if `shutdown` fired meanwhile.
async fn idle(shutdown: &CancellationToken, period: Duration) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => true,
        _ = tokio::time::sleep(period) => false,
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
