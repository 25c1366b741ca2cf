//! `runner` crate: the worker side of the orchestrator.
//!
//! An [`Agent`] registers with the scheduler, heartbeats, polls for
//! assignments and hands each one to a [`JobExecutor`], which runs the
//! job's steps in order through a [`StepExecutor`].  All traffic goes
//! through the [`SchedulerClient`] trait.

pub mod agent;
pub mod client;
pub mod error;
pub mod job;
pub mod mock;
pub mod step;

pub use agent::{Agent, AgentConfig};
pub use client::SchedulerClient;
pub use error::RunnerError;
pub use job::{JobExecutor, RetryPolicy};
pub use step::{StepExecutor, StepOutcome};
