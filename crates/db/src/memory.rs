//! In-process [`Store`] used by tests and by the CLI when no database URL
//! is configured.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use uuid::Uuid;

use crate::{
    models::{JobRow, LogRow, RunRow, RunnerRow, StepRow},
    DbError, Store, Transition,
};

#[derive(Default)]
struct Tables {
    runs: HashMap<Uuid, RunRow>,
    jobs: HashMap<Uuid, JobRow>,
    steps: HashMap<Uuid, StepRow>,
    runners: BTreeMap<String, RunnerRow>,
    logs: HashMap<Uuid, BTreeMap<i64, LogRow>>,
}

/// A `HashMap`-backed store.  Writes are all-or-nothing per call, like the
/// transactions of [`crate::PgStore`].
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail until switched back off.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<(), DbError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(DbError::Sqlx(sqlx::Error::PoolClosed));
        }
        Ok(())
    }

    fn tables(&self) -> std::sync::MutexGuard<'_, Tables> {
        // A panic while holding the lock leaves plain data behind; keep serving it.
        self.tables.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_run(
        &self,
        run: &RunRow,
        jobs: &[JobRow],
        steps: &[StepRow],
    ) -> Result<(), DbError> {
        self.check_writable()?;
        let mut tables = self.tables();
        if tables.runs.contains_key(&run.id) {
            return Err(DbError::Conflict(format!("run {}", run.id)));
        }
        tables.runs.insert(run.id, run.clone());
        for job in jobs {
            tables.jobs.insert(job.id, job.clone());
        }
        for step in steps {
            tables.steps.insert(step.id, step.clone());
        }
        Ok(())
    }

    async fn apply(&self, transition: &Transition) -> Result<(), DbError> {
        self.check_writable()?;
        let mut tables = self.tables();

        // Validate first so a missing row leaves nothing half-written.
        if let Some(run) = &transition.run {
            if !tables.runs.contains_key(&run.id) {
                return Err(DbError::NotFound);
            }
        }
        if transition.jobs.iter().any(|j| !tables.jobs.contains_key(&j.id))
            || transition.steps.iter().any(|s| !tables.steps.contains_key(&s.id))
        {
            return Err(DbError::NotFound);
        }

        if let Some(run) = &transition.run {
            tables.runs.insert(run.id, run.clone());
        }
        for job in &transition.jobs {
            tables.jobs.insert(job.id, job.clone());
        }
        for step in &transition.steps {
            tables.steps.insert(step.id, step.clone());
        }
        Ok(())
    }

    async fn get_run(&self, id: Uuid) -> Result<RunRow, DbError> {
        self.tables().runs.get(&id).cloned().ok_or(DbError::NotFound)
    }

    async fn list_jobs(&self, run_id: Uuid) -> Result<Vec<JobRow>, DbError> {
        let tables = self.tables();
        let mut jobs: Vec<JobRow> = tables
            .jobs
            .values()
            .filter(|j| j.run_id == run_id)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.position);
        Ok(jobs)
    }

    async fn list_steps(&self, run_id: Uuid) -> Result<Vec<StepRow>, DbError> {
        let tables = self.tables();
        let job_position = |job_id: &Uuid| tables.jobs.get(job_id).map_or(i32::MAX, |j| j.position);
        let mut steps: Vec<StepRow> = tables
            .steps
            .values()
            .filter(|s| s.run_id == run_id)
            .cloned()
            .collect();
        steps.sort_by_key(|s| (job_position(&s.job_id), s.position));
        Ok(steps)
    }

    async fn upsert_runner(&self, runner: &RunnerRow) -> Result<(), DbError> {
        self.check_writable()?;
        self.tables().runners.insert(runner.id.clone(), runner.clone());
        Ok(())
    }

    async fn delete_runner(&self, id: &str) -> Result<(), DbError> {
        self.check_writable()?;
        self.tables().runners.remove(id);
        Ok(())
    }

    async fn append_log(&self, entry: &LogRow) -> Result<(), DbError> {
        self.check_writable()?;
        let mut tables = self.tables();
        let lines = tables.logs.entry(entry.run_id).or_default();
        if lines.contains_key(&entry.seq) {
            return Err(DbError::Conflict(format!(
                "log seq {} of run {}",
                entry.seq, entry.run_id
            )));
        }
        lines.insert(entry.seq, entry.clone());
        Ok(())
    }

    async fn list_logs(&self, run_id: Uuid, since_seq: i64) -> Result<Vec<LogRow>, DbError> {
        let tables = self.tables();
        Ok(tables
            .logs
            .get(&run_id)
            .map(|lines| {
                lines
                    .range(since_seq.saturating_add(1)..)
                    .map(|(_, row)| row.clone())
                    .collect()
            })
            .unwrap_or_default())
    }
}
