//! Per-run, append-only log sequences with resumable subscriptions.
//!
//! Every run gets a buffer when it is created.  An appended line is written
//! to the store first and only then becomes visible to subscribers, so a
//! consumer that reconnects with its last seen `seq` can always resume from
//! either the buffer or the store without gaps.

use std::collections::HashMap;
use std::sync::Arc;

use async_stream::stream;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use db::{models::LogRow, Store};
use futures_util::stream::{BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use tracing::debug;
use uuid::Uuid;

use crate::{
    models::{LogLevel, RunStatus},
    EngineError,
};

/// One line of output, numbered within its run starting at 1.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub run_id: Uuid,
    pub job_id: Uuid,
    pub step_id: Uuid,
    pub seq: u64,
    pub level: LogLevel,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl LogEntry {
    fn to_row(&self) -> LogRow {
        LogRow {
            run_id: self.run_id,
            job_id: self.job_id,
            step_id: self.step_id,
            seq: self.seq as i64,
            level: self.level.to_string(),
            content: self.content.clone(),
            timestamp: self.timestamp,
        }
    }

    fn from_row(row: LogRow) -> Result<Self, EngineError> {
        Ok(Self {
            level: row.level.parse().map_err(EngineError::CorruptRecord)?,
            run_id: row.run_id,
            job_id: row.job_id,
            step_id: row.step_id,
            seq: row.seq.max(0) as u64,
            content: row.content,
            timestamp: row.timestamp,
        })
    }
}

#[derive(Default)]
struct Buffer {
    entries: Vec<LogEntry>,
    closed: bool,
}

struct RunLog {
    buffer: Mutex<Buffer>,
    /// Bumped after every append and on close.
    notify: watch::Sender<u64>,
}

pub struct LogStream {
    store: Arc<dyn Store>,
    runs: DashMap<Uuid, Arc<RunLog>>,
    /// step id → (run id, job id)
    steps: DashMap<Uuid, (Uuid, Uuid)>,
}

impl LogStream {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            runs: DashMap::new(),
            steps: DashMap::new(),
        }
    }

    /// Start buffering a run.  `steps` maps each step id to its job id.
    pub fn open(&self, run_id: Uuid, steps: HashMap<Uuid, Uuid>) {
        for (step_id, job_id) in steps {
            self.steps.insert(step_id, (run_id, job_id));
        }
        let (notify, _) = watch::channel(0);
        self.runs.insert(
            run_id,
            Arc::new(RunLog {
                buffer: Mutex::new(Buffer::default()),
                notify,
            }),
        );
    }

    /// Stop accepting lines for a run; live subscriptions finish once they
    /// have drained the buffer.
    pub async fn close(&self, run_id: Uuid) {
        let Some(log) = self.runs.get(&run_id).map(|l| Arc::clone(l.value())) else {
            return;
        };
        let mut buffer = log.buffer.lock().await;
        buffer.closed = true;
        log.notify.send_modify(|v| *v += 1);
        debug!(%run_id, lines = buffer.entries.len(), "log stream closed");
    }

    /// Drop a closed run's buffer.  Later subscriptions replay from the store.
    pub fn evict(&self, run_id: Uuid) {
        self.runs.remove(&run_id);
        self.steps.retain(|_, (run, _)| *run != run_id);
    }

    /// Append a line for `step_id` and return it with its sequence number.
    pub async fn append(
        &self,
        step_id: Uuid,
        level: LogLevel,
        content: String,
    ) -> Result<LogEntry, EngineError> {
        let (run_id, job_id) = self
            .steps
            .get(&step_id)
            .map(|e| *e.value())
            .ok_or(EngineError::UnknownStep(step_id))?;
        let log = self
            .runs
            .get(&run_id)
            .map(|l| Arc::clone(l.value()))
            .ok_or(EngineError::UnknownRun(run_id))?;

        let mut buffer = log.buffer.lock().await;
        if buffer.closed {
            return Err(EngineError::InvalidTransition {
                entity: format!("log stream of run {run_id}"),
                status: "closed".into(),
                action: "append to",
            });
        }

        let entry = LogEntry {
            run_id,
            job_id,
            step_id,
            seq: buffer.entries.len() as u64 + 1,
            level,
            content,
            timestamp: Utc::now(),
        };
        self.store.append_log(&entry.to_row()).await?;

        buffer.entries.push(entry.clone());
        log.notify.send_modify(|v| *v += 1);
        Ok(entry)
    }

    /// Every entry of `run_id` with `seq > since`, in order.  The stream
    /// stays open until the run's buffer is closed and drained.
    ///
    /// Runs no longer buffered are replayed from the store if they finished;
    /// the stream then ends after the last stored line.
    pub async fn subscribe(
        &self,
        run_id: Uuid,
        since: u64,
    ) -> Result<BoxStream<'static, LogEntry>, EngineError> {
        let live = self.runs.get(&run_id).map(|l| Arc::clone(l.value()));
        let Some(log) = live else {
            return self.replay(run_id, since).await;
        };

        let mut changes = log.notify.subscribe();
        Ok(stream! {
            let mut cursor = since;
            loop {
                changes.borrow_and_update();
                let (batch, closed) = {
                    let buffer = log.buffer.lock().await;
                    let from = (cursor as usize).min(buffer.entries.len());
                    (buffer.entries[from..].to_vec(), buffer.closed)
                };
                for entry in batch {
                    cursor = entry.seq;
                    yield entry;
                }
                if closed || changes.changed().await.is_err() {
                    break;
                }
            }
        }
        .boxed())
    }

    async fn replay(&self, run_id: Uuid, since: u64) -> Result<BoxStream<'static, LogEntry>, EngineError> {
        let run = self.store.get_run(run_id).await.map_err(|e| match e {
            db::DbError::NotFound => EngineError::UnknownRun(run_id),
            other => other.into(),
        })?;
        let status: RunStatus = run.status.parse().map_err(EngineError::CorruptRecord)?;
        if !status.is_terminal() {
            // Open but not buffered here: no one owns it.
            debug!(%run_id, %status, "log subscription to an unowned open run");
            return Err(EngineError::ActorGone(run_id));
        }

        let entries = self
            .store
            .list_logs(run_id, since as i64)
            .await?
            .into_iter()
            .map(LogEntry::from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(futures_util::stream::iter(entries).boxed())
    }
}
