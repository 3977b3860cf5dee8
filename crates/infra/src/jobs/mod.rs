//! Durable background job system.
//!
//! ## Design
//!
//! - Job records are persisted before they run and removed when they finish
//! - Jobs sharing a queue key run one at a time in submission order
//! - Constraints gate dispatch; satisfied constraints wake the dispatcher
//! - Retry with exponential backoff, bounded by max attempts and lifespan
//! - Per-factory concurrency caps
//!
//! ## Components
//!
//! - `JobStore`: persistence for job records (in-memory or SQLite)
//! - `ConstraintRegistry`: named dispatch preconditions
//! - `Job` / `JobRegistry`: uniform job contract and factory-key dispatch
//! - `JobManager`: dispatcher + worker pool
//! - `definitions`: the concrete jobs and migrations

pub mod constraints;
pub mod definitions;
pub mod executor;
pub mod job;
pub mod sqlite_store;
pub mod store;
pub mod types;

#[cfg(test)]
mod scenario_tests;

pub use constraints::{
    Constraint, ConstraintNotifier, ConstraintRegistry, ConstraintState, FlagConstraint,
};
pub use executor::{
    FailureReason, JobEvent, JobManager, JobManagerError, JobManagerStats, JobOutcome,
};
pub use job::{describe, Job, JobError, JobFactory, JobRegistry};
pub use sqlite_store::SqliteJobStore;
pub use store::{InMemoryJobStore, JobStore, JobStoreError, MigrationMarkerStore};
pub use types::{
    select_runnable, BackoffPolicy, BackoffStrategy, JobDescriptor, JobId, JobParameters,
    JobState, Selection,
};
