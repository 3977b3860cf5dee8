//! Versioned application migrations run through the job manager.
//!
//! Every pending migration is enqueued on the single `migrations` queue in
//! version order, followed by a [`MigrationCompleteJob`]. Each step moves the
//! persisted marker past its own version when it terminates, so a step that
//! finished before a restart is never scheduled again. A failed migration is
//! logged and does not hold the marker back.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use courier_protocol::{ProtocolStore, SessionLock};

use crate::jobs::executor::{JobManager, JobManagerError, JobOutcome};
use crate::jobs::job::{Job, JobError, JobRegistry};
use crate::jobs::store::{JobStore, JobStoreError, MigrationMarkerStore};
use crate::jobs::types::{JobDescriptor, JobId, JobParameters};

pub const QUEUE: &str = "migrations";
pub const COMPLETE_KEY: &str = "MigrationCompleteJob";

/// One versioned, idempotent migration step.
pub trait Migration: Send + Sync {
    fn version(&self) -> u32;

    /// Unique name; also the factory key of its job.
    fn name(&self) -> &str;

    /// The application must wait for this migration before showing UI.
    fn is_ui_blocking(&self) -> bool {
        false
    }

    fn perform(&self) -> anyhow::Result<()>;
}

/// Runs a single migration. Never retried.
pub struct MigrationJob {
    migration: Arc<dyn Migration>,
    markers: Arc<dyn MigrationMarkerStore>,
}

impl MigrationJob {
    pub fn new(migration: Arc<dyn Migration>, markers: Arc<dyn MigrationMarkerStore>) -> Self {
        Self { migration, markers }
    }
}

impl Job for MigrationJob {
    fn factory_key(&self) -> &str {
        self.migration.name()
    }

    fn parameters(&self) -> JobParameters {
        JobParameters::default().with_queue(QUEUE)
    }

    fn serialize(&self) -> Result<Option<Vec<u8>>, JobError> {
        Ok(None)
    }

    fn run(&mut self) -> Result<(), JobError> {
        info!(migration = self.migration.name(), version = self.migration.version(), "running migration");
        let result = self
            .migration
            .perform()
            .map_err(|e| JobError::Permanent(format!("{e:#}")));
        // Success or failure, this step is done for good.
        advance_marker(self.markers.as_ref(), self.migration.version())?;
        result
    }

    fn should_retry(&self, _error: &JobError) -> bool {
        false
    }

    fn on_failure(&mut self) {
        error!(
            migration = self.migration.name(),
            version = self.migration.version(),
            "migration failed"
        );
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CompleteData {
    version: u32,
}

/// Advances the migration marker to `version` (never backwards).
pub struct MigrationCompleteJob {
    version: u32,
    markers: Arc<dyn MigrationMarkerStore>,
}

impl MigrationCompleteJob {
    pub fn new(markers: Arc<dyn MigrationMarkerStore>, version: u32) -> Self {
        Self { version, markers }
    }
}

impl Job for MigrationCompleteJob {
    fn factory_key(&self) -> &str {
        COMPLETE_KEY
    }

    fn parameters(&self) -> JobParameters {
        JobParameters::default()
            .with_queue(QUEUE)
            .with_max_attempts(COMPLETE_MAX_ATTEMPTS)
    }

    fn serialize(&self) -> Result<Option<Vec<u8>>, JobError> {
        Ok(Some(serde_json::to_vec(&CompleteData {
            version: self.version,
        })?))
    }

    fn run(&mut self) -> Result<(), JobError> {
        advance_marker(self.markers.as_ref(), self.version)?;
        info!(version = self.version, "migrations complete");
        Ok(())
    }

    fn should_retry(&self, error: &JobError) -> bool {
        matches!(error, JobError::Io(_))
    }
}

const COMPLETE_MAX_ATTEMPTS: u32 = 3;

/// Move the marker up to `version`. Never moves it backwards.
fn advance_marker(markers: &dyn MigrationMarkerStore, version: u32) -> Result<(), JobError> {
    let current = markers.version().map_err(store_error)?;
    if version > current {
        markers.set_version(version).map_err(store_error)?;
        debug!(from = current, to = version, "migration marker advanced");
    }
    Ok(())
}

fn store_error(err: JobStoreError) -> JobError {
    JobError::Io(err.to_string())
}

pub(crate) fn register_completion(
    registry: &mut JobRegistry,
    markers: Arc<dyn MigrationMarkerStore>,
) {
    registry.register(COMPLETE_KEY, move |descriptor: &JobDescriptor| {
        let data = descriptor
            .serialized_data
            .as_deref()
            .ok_or_else(|| JobError::Serialization("missing payload".to_string()))?;
        let data: CompleteData = serde_json::from_slice(data)?;
        Ok(Box::new(MigrationCompleteJob::new(markers.clone(), data.version)) as Box<dyn Job>)
    });
}

/// What [`ApplicationMigrations::schedule`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationSchedule {
    UpToDate,
    /// Enqueued; the completion job will advance the marker in the background.
    Background { completion: JobId },
    /// A UI-blocking migration was pending and the batch has finished.
    Completed(JobOutcome),
}

/// The application's migration set plus the persisted marker.
pub struct ApplicationMigrations {
    migrations: Vec<Arc<dyn Migration>>,
    markers: Arc<dyn MigrationMarkerStore>,
}

impl std::fmt::Debug for ApplicationMigrations {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApplicationMigrations")
            .field(
                "migrations",
                &self.migrations.iter().map(|m| m.name()).collect::<Vec<_>>(),
            )
            .finish_non_exhaustive()
    }
}

impl ApplicationMigrations {
    pub fn new(markers: Arc<dyn MigrationMarkerStore>) -> Self {
        Self {
            migrations: Vec::new(),
            markers,
        }
    }

    pub fn with(mut self, migration: Arc<dyn Migration>) -> Self {
        self.migrations.push(migration);
        self.migrations.sort_by_key(|m| m.version());
        self
    }

    pub fn latest_version(&self) -> u32 {
        self.migrations.last().map_or(0, |m| m.version())
    }

    /// Migrations newer than the persisted marker, oldest first.
    pub fn pending(&self) -> Result<Vec<Arc<dyn Migration>>, JobStoreError> {
        let current = self.markers.version()?;
        Ok(self
            .migrations
            .iter()
            .filter(|m| m.version() > current)
            .cloned()
            .collect())
    }

    /// Register a factory for each migration so records survive restarts.
    pub fn register_factories(&self, registry: &mut JobRegistry) {
        for migration in &self.migrations {
            let migration = migration.clone();
            let markers = self.markers.clone();
            registry.register(migration.name().to_string(), move |_: &JobDescriptor| {
                Ok(Box::new(MigrationJob::new(migration.clone(), markers.clone())) as Box<dyn Job>)
            });
        }
    }

    /// Enqueue pending migrations and their completion job.
    ///
    /// Steps still queued by an earlier process are left where they are, and
    /// a stale completion job is replaced. Blocks up to `timeout` when any
    /// pending migration is UI-blocking.
    pub fn schedule(
        &self,
        manager: &JobManager,
        timeout: Duration,
    ) -> Result<MigrationSchedule, JobManagerError> {
        // Snapshot the queue before reading the marker: a step advances the
        // marker before its record is removed.
        let queued: Vec<JobDescriptor> = manager
            .store()
            .all()?
            .into_iter()
            .filter(|d| d.queue_key.as_deref() == Some(QUEUE))
            .collect();
        let pending = self.pending()?;
        let Some(target) = pending.last().map(|m| m.version()) else {
            return Ok(MigrationSchedule::UpToDate);
        };
        let blocking = pending.iter().any(|m| m.is_ui_blocking());

        let already_queued: HashSet<&str> =
            queued.iter().map(|d| d.factory_key.as_str()).collect();
        info!(
            pending = pending.len(),
            already_queued = already_queued.len(),
            target,
            blocking,
            "scheduling migrations"
        );
        for migration in pending {
            if already_queued.contains(migration.name()) {
                debug!(migration = migration.name(), "migration already queued");
                continue;
            }
            manager.enqueue(&MigrationJob::new(migration, self.markers.clone()))?;
        }
        for stale in queued.iter().filter(|d| d.factory_key == COMPLETE_KEY) {
            manager.cancel(stale.id)?;
        }

        let completion = MigrationCompleteJob::new(self.markers.clone(), target);
        if blocking {
            let outcome = manager.run_synchronously(&completion, timeout)?;
            return Ok(MigrationSchedule::Completed(outcome));
        }
        let id = manager.enqueue(&completion)?;
        Ok(MigrationSchedule::Background { completion: id })
    }
}

/// Archives every session so the next message starts fresh ones.
pub struct SessionArchiveMigration {
    version: u32,
    store: Arc<dyn ProtocolStore>,
    session_lock: Arc<SessionLock>,
}

impl SessionArchiveMigration {
    pub const NAME: &'static str = "SessionArchiveMigration";

    pub fn new(version: u32, store: Arc<dyn ProtocolStore>, session_lock: Arc<SessionLock>) -> Self {
        Self {
            version,
            store,
            session_lock,
        }
    }
}

impl Migration for SessionArchiveMigration {
    fn version(&self) -> u32 {
        self.version
    }

    fn name(&self) -> &str {
        Self::NAME
    }

    fn perform(&self) -> anyhow::Result<()> {
        let guard = self.session_lock.acquire();
        let archived = self.store.archive_all_sessions(&guard)?;
        info!(archived, "archived sessions");
        Ok(())
    }
}
