//! Engine-level error types.

use thiserror::Error;
use uuid::Uuid;

/// Errors produced by the orchestrator (compilation + scheduling).
#[derive(Debug, Error)]
pub enum EngineError {
    // ------ Compilation errors ------

    /// The document could not be parsed, or is structurally invalid.
    #[error("invalid workflow spec: {0}")]
    InvalidSpec(String),

    /// Two jobs share the same key.
    #[error("duplicate job '{0}'")]
    DuplicateJob(String),

    /// A job `needs` a job that is not declared.
    #[error("job '{job}' needs unknown job '{missing}'")]
    UnknownDependency { job: String, missing: String },

    /// The `needs` graph is not acyclic.  `jobs` lists every job that could
    /// not be ordered, in declaration order.
    #[error("dependency cycle between jobs: {}", jobs.join(", "))]
    CycleDetected { jobs: Vec<String> },

    /// A step declares neither `run` nor `uses`.
    #[error("step '{step}' of job '{job}' has no command")]
    MissingCommand { job: String, step: String },

    /// A step references a marketplace action, which is not supported.
    #[error("step '{step}' of job '{job}' uses unsupported action '{uses}'")]
    UnsupportedStep {
        job: String,
        step: String,
        uses: String,
    },

    /// A timeout of zero.
    #[error("invalid timeout for {context}: must be greater than zero")]
    InvalidTimeout { context: String },

    // ------ Scheduling errors ------

    #[error("unknown run {0}")]
    UnknownRun(Uuid),

    #[error("unknown job {0}")]
    UnknownJob(Uuid),

    #[error("unknown step {0}")]
    UnknownStep(Uuid),

    /// The requested operation is not allowed from the current status.
    #[error("cannot {action} {entity} in status '{status}'")]
    InvalidTransition {
        entity: String,
        status: String,
        action: &'static str,
    },

    /// The run's actor has stopped (run finished or orchestrator shut down).
    #[error("run {0} is no longer accepting commands")]
    ActorGone(Uuid),

    /// A stored row holds a value this version cannot read.
    #[error("corrupt record: {0}")]
    CorruptRecord(String),

    /// Dispatch queue or runner registry rejection.
    #[error(transparent)]
    Queue(#[from] queue::QueueError),

    /// Persistence error from the db crate.
    #[error("database error: {0}")]
    Database(#[from] db::DbError),
}

impl EngineError {
    /// Whether this error came out of compiling a workflow document.
    pub fn is_compile_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidSpec(_)
                | Self::DuplicateJob(_)
                | Self::UnknownDependency { .. }
                | Self::CycleDetected { .. }
                | Self::MissingCommand { .. }
                | Self::UnsupportedStep { .. }
                | Self::InvalidTimeout { .. }
        )
    }
}
