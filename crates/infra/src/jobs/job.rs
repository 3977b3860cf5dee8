//! The uniform job contract and the factory registry.

use std::collections::HashMap;

use thiserror::Error;

use super::types::{JobDescriptor, JobParameters};

/// Failure of a single job attempt, classified for retry decisions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobError {
    #[error("network failure: {0}")]
    Network(String),
    #[error("retry later: {0}")]
    RetryLater(String),
    #[error("i/o failure: {0}")]
    Io(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("serialization failure: {0}")]
    Serialization(String),
    #[error("protocol failure: {0}")]
    Protocol(String),
    #[error("{0}")]
    Permanent(String),
}

impl JobError {
    /// Network failures and explicit "retry later" signals.
    pub fn is_transient(&self) -> bool {
        matches!(self, JobError::Network(_) | JobError::RetryLater(_))
    }
}

impl From<serde_json::Error> for JobError {
    fn from(err: serde_json::Error) -> Self {
        JobError::Serialization(err.to_string())
    }
}

/// A unit of background work.
///
/// A job is rebuilt from its descriptor by the factory registered under its
/// `factory_key`, run on one worker to completion, and either removed,
/// rescheduled or failed depending on `should_retry`.
pub trait Job: Send {
    fn factory_key(&self) -> &str;

    fn parameters(&self) -> JobParameters {
        JobParameters::default()
    }

    /// Payload stored in the descriptor; decoded again by the factory.
    fn serialize(&self) -> Result<Option<Vec<u8>>, JobError>;

    fn run(&mut self) -> Result<(), JobError>;

    fn should_retry(&self, error: &JobError) -> bool {
        error.is_transient()
    }

    /// Called exactly once when the job fails permanently or expires.
    fn on_failure(&mut self) {}
}

/// Build a fresh descriptor for `job`.
pub fn describe<J: Job + ?Sized>(job: &J) -> Result<JobDescriptor, JobError> {
    Ok(JobDescriptor::new(
        job.factory_key(),
        job.serialize()?,
        job.parameters(),
    ))
}

pub type JobFactory = Box<dyn Fn(&JobDescriptor) -> Result<Box<dyn Job>, JobError> + Send + Sync>;

/// Maps factory keys to the code that rebuilds jobs from descriptors.
#[derive(Default)]
pub struct JobRegistry {
    factories: HashMap<String, JobFactory>,
}

impl std::fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRegistry")
            .field("factory_keys", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, factory_key: impl Into<String>, factory: F)
    where
        F: Fn(&JobDescriptor) -> Result<Box<dyn Job>, JobError> + Send + Sync + 'static,
    {
        self.factories.insert(factory_key.into(), Box::new(factory));
    }

    pub fn contains(&self, factory_key: &str) -> bool {
        self.factories.contains_key(factory_key)
    }

    /// `None` if no factory is registered for the descriptor's key.
    pub fn create(&self, descriptor: &JobDescriptor) -> Option<Result<Box<dyn Job>, JobError>> {
        self.factories
            .get(&descriptor.factory_key)
            .map(|factory| factory(descriptor))
    }
}
