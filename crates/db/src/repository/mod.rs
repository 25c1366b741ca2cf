//! Repository functions: one function per database operation.
//!
//! Reads take a `&PgPool`; writes take a `&mut PgConnection` so the store
//! can group the rows of one state transition into a single transaction.
//! Plain SQL with no domain types.

pub mod jobs;
pub mod logs;
pub mod runners;
pub mod runs;
