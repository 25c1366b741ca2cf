//! The durable store the orchestrator writes through.
//!
//! The engine treats persistence as an abstract collaborator: every state
//! transition of a run is handed to [`Store::apply`] as one [`Transition`],
//! and the engine only commits the transition to memory once `apply`
//! returned `Ok`.

use async_trait::async_trait;
use tracing::debug;
use uuid::Uuid;

use crate::{
    models::{JobRow, LogRow, RunRow, RunnerRow, StepRow},
    repository, DbError, DbPool,
};

/// The rows changed by one run state transition.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Transition {
    pub run: Option<RunRow>,
    pub jobs: Vec<JobRow>,
    pub steps: Vec<StepRow>,
}

impl Transition {
    pub fn is_empty(&self) -> bool {
        self.run.is_none() && self.jobs.is_empty() && self.steps.is_empty()
    }
}

/// Create/read/update/query over runs, jobs, steps, runners and logs.
#[async_trait]
pub trait Store: Send + Sync {
    /// Persist a freshly created run with all of its jobs and steps.
    async fn create_run(
        &self,
        run: &RunRow,
        jobs: &[JobRow],
        steps: &[StepRow],
    ) -> Result<(), DbError>;

    /// Persist every row of `transition` atomically.
    async fn apply(&self, transition: &Transition) -> Result<(), DbError>;

    async fn get_run(&self, id: Uuid) -> Result<RunRow, DbError>;

    /// Jobs of a run in declaration order.
    async fn list_jobs(&self, run_id: Uuid) -> Result<Vec<JobRow>, DbError>;

    /// Steps of a run, grouped by job declaration order then step position.
    async fn list_steps(&self, run_id: Uuid) -> Result<Vec<StepRow>, DbError>;

    async fn upsert_runner(&self, runner: &RunnerRow) -> Result<(), DbError>;

    async fn delete_runner(&self, id: &str) -> Result<(), DbError>;

    async fn append_log(&self, entry: &LogRow) -> Result<(), DbError>;

    /// Log lines of a run with `seq > since_seq`, in sequence order.
    async fn list_logs(&self, run_id: Uuid, since_seq: i64) -> Result<Vec<LogRow>, DbError>;
}

// ---------------------------------------------------------------------------
// Postgres
// ---------------------------------------------------------------------------

/// [`Store`] backed by the Postgres repository functions.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

#[async_trait]
impl Store for PgStore {
    async fn create_run(
        &self,
        run: &RunRow,
        jobs: &[JobRow],
        steps: &[StepRow],
    ) -> Result<(), DbError> {
        let mut tx = self.pool.begin().await?;
        repository::runs::insert_run(&mut tx, run).await?;
        for job in jobs {
            repository::jobs::insert_job(&mut tx, job).await?;
        }
        for step in steps {
            repository::jobs::insert_step(&mut tx, step).await?;
        }
        tx.commit().await?;

        debug!(run_id = %run.id, jobs = jobs.len(), steps = steps.len(), "run persisted");
        Ok(())
    }

    async fn apply(&self, transition: &Transition) -> Result<(), DbError> {
        if transition.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        if let Some(run) = &transition.run {
            repository::runs::update_run(&mut tx, run).await?;
        }
        for job in &transition.jobs {
            repository::jobs::update_job(&mut tx, job).await?;
        }
        for step in &transition.steps {
            repository::jobs::update_step(&mut tx, step).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get_run(&self, id: Uuid) -> Result<RunRow, DbError> {
        repository::runs::get_run(&self.pool, id).await
    }

    async fn list_jobs(&self, run_id: Uuid) -> Result<Vec<JobRow>, DbError> {
        repository::jobs::list_jobs(&self.pool, run_id).await
    }

    async fn list_steps(&self, run_id: Uuid) -> Result<Vec<StepRow>, DbError> {
        repository::jobs::list_steps(&self.pool, run_id).await
    }

    async fn upsert_runner(&self, runner: &RunnerRow) -> Result<(), DbError> {
        repository::runners::upsert_runner(&self.pool, runner).await
    }

    async fn delete_runner(&self, id: &str) -> Result<(), DbError> {
        repository::runners::delete_runner(&self.pool, id).await
    }

    async fn append_log(&self, entry: &LogRow) -> Result<(), DbError> {
        repository::logs::insert_log(&self.pool, entry).await
    }

    async fn list_logs(&self, run_id: Uuid, since_seq: i64) -> Result<Vec<LogRow>, DbError> {
        repository::logs::list_logs(&self.pool, run_id, since_seq).await
    }
}
