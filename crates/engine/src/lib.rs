//! `engine` crate: workflow compilation and the run scheduler.
//!
//! [`compile_str`] turns a workflow document into a [`CompiledWorkflow`];
//! an [`Orchestrator`] runs compiled workflows by handing their jobs to
//! runners and folding the runners' reports back into each run's state.

pub mod compiler;
pub mod config;
pub mod error;
pub mod logstream;
pub mod models;
pub mod orchestrator;
pub mod protocol;
pub mod state;
pub mod view;

mod actor;

pub use compiler::{compile, compile_str, CompiledJob, CompiledStep, CompiledWorkflow};
pub use config::SchedulerConfig;
pub use error::EngineError;
pub use logstream::{LogEntry, LogStream};
pub use models::{JobSpec, JobStatus, LogLevel, RunStatus, StepAction, StepSpec, StepStatus, WorkflowSpec};
pub use orchestrator::{DispatchQueue, Orchestrator};
pub use protocol::{Ack, AssignedStep, Assignment, HeartbeatAck, JobResult, LogIngest, PollRequest, StepResult};
pub use view::{JobView, RunView, StepView};

#[cfg(test)]
mod scheduler_tests;
