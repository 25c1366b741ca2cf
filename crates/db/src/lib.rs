//! `db` crate: persistence for runs, jobs, steps, runners and logs.
//!
//! Provides typed row structs, the [`Store`] trait the orchestrator writes
//! through, an in-memory store, and a Postgres store backed by repository
//! functions.  No business logic lives here.

pub mod error;
pub mod memory;
pub mod models;
pub mod pool;
pub mod repository;
pub mod store;

pub use error::DbError;
pub use memory::MemoryStore;
pub use pool::DbPool;
pub use store::{PgStore, Store, Transition};
