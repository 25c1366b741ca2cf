//! Runner-level error type.

use std::time::Duration;

use engine::EngineError;
use queue::QueueError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RunnerError {
    /// The scheduler rejected or failed a call.
    #[error(transparent)]
    Scheduler(#[from] EngineError),

    /// The step's process could not be started.
    #[error("failed to start `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// The command ran and exited non-zero.
    #[error("command exited with code {code}")]
    Execution { code: i32 },

    /// The process died from a signal.
    #[error("command was terminated by a signal")]
    Terminated,

    /// Waiting on the process failed.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("cancelled")]
    Cancelled,
}

impl RunnerError {
    /// The scheduler no longer knows this runner; it has to register again.
    pub fn needs_registration(&self) -> bool {
        matches!(
            self,
            Self::Scheduler(EngineError::Queue(
                QueueError::UnknownRunner(_) | QueueError::RunnerOffline(_)
            ))
        )
    }

    /// Worth sending again after a pause.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Scheduler(EngineError::Database(_) | EngineError::Queue(QueueError::RunnerBusy(_)))
        )
    }
}
