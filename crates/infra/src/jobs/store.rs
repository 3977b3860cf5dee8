//! Job storage implementations.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};

use super::types::{select_runnable, JobDescriptor, JobId, JobState, Selection};

/// Durable store of job records.
///
/// Every mutation is atomic. Implementations serialize writers; workers and
/// the enqueue path may call concurrently.
pub trait JobStore: Send + Sync {
    /// Persist a new record. Assigns and returns its submission sequence.
    fn insert(&self, descriptor: JobDescriptor) -> Result<JobDescriptor, JobStoreError>;

    /// Delete a record. Returns false if it did not exist.
    fn remove(&self, id: JobId) -> Result<bool, JobStoreError>;

    fn get(&self, id: JobId) -> Result<Option<JobDescriptor>, JobStoreError>;

    /// All records in submission order.
    fn all(&self) -> Result<Vec<JobDescriptor>, JobStoreError>;

    /// Record a failed attempt and schedule the next one.
    fn update_attempt(
        &self,
        id: JobId,
        attempt_count: u32,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<(), JobStoreError>;

    /// Transition a record to `Running`. Returns false if it is missing or
    /// already running.
    fn mark_running(&self, id: JobId) -> Result<bool, JobStoreError>;

    /// Delete a record only if it is not running.
    fn remove_pending(&self, id: JobId) -> Result<bool, JobStoreError>;

    /// Return records left `Running` by a previous process to `Pending`.
    fn reset_running(&self) -> Result<usize, JobStoreError>;

    /// Jobs whose constraints hold at `now`, one per queue, within factory caps.
    fn next_runnable(
        &self,
        now: DateTime<Utc>,
        is_satisfied: &dyn Fn(&str) -> bool,
        is_known: &dyn Fn(&str) -> bool,
    ) -> Result<Selection, JobStoreError> {
        let jobs = self.all()?;
        Ok(select_runnable(&jobs, now, is_satisfied, is_known))
    }
}

/// Persisted migration-version marker.
pub trait MigrationMarkerStore: Send + Sync {
    /// Last fully applied migration version (0 if none).
    fn version(&self) -> Result<u32, JobStoreError>;

    fn set_version(&self, version: u32) -> Result<(), JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("corrupt job record: {0}")]
    Corrupt(String),
    #[error("storage error: {0}")]
    Storage(String),
}

#[derive(Debug, Default)]
struct Table {
    next_sequence: u64,
    jobs: BTreeMap<u64, JobDescriptor>,
    migration_version: u32,
}

impl Table {
    fn find_mut(&mut self, id: JobId) -> Option<&mut JobDescriptor> {
        self.jobs.values_mut().find(|job| job.id == id)
    }

    fn sequence_of(&self, id: JobId) -> Option<u64> {
        self.jobs.values().find(|job| job.id == id).map(|job| job.sequence)
    }
}

/// In-memory job store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    table: RwLock<Table>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Table>, JobStoreError> {
        self.table
            .read()
            .map_err(|_| JobStoreError::Storage("job table lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Table>, JobStoreError> {
        self.table
            .write()
            .map_err(|_| JobStoreError::Storage("job table lock poisoned".to_string()))
    }
}

impl JobStore for InMemoryJobStore {
    fn insert(&self, mut descriptor: JobDescriptor) -> Result<JobDescriptor, JobStoreError> {
        let mut table = self.write()?;
        if table.sequence_of(descriptor.id).is_some() {
            return Err(JobStoreError::AlreadyExists(descriptor.id));
        }
        table.next_sequence += 1;
        descriptor.sequence = table.next_sequence;
        table.jobs.insert(descriptor.sequence, descriptor.clone());
        Ok(descriptor)
    }

    fn remove(&self, id: JobId) -> Result<bool, JobStoreError> {
        let mut table = self.write()?;
        Ok(match table.sequence_of(id) {
            Some(seq) => table.jobs.remove(&seq).is_some(),
            None => false,
        })
    }

    fn get(&self, id: JobId) -> Result<Option<JobDescriptor>, JobStoreError> {
        let table = self.read()?;
        Ok(table.jobs.values().find(|job| job.id == id).cloned())
    }

    fn all(&self) -> Result<Vec<JobDescriptor>, JobStoreError> {
        Ok(self.read()?.jobs.values().cloned().collect())
    }

    fn update_attempt(
        &self,
        id: JobId,
        attempt_count: u32,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<(), JobStoreError> {
        let mut table = self.write()?;
        let job = table.find_mut(id).ok_or(JobStoreError::NotFound(id))?;
        job.attempt_count = attempt_count;
        job.next_run_at = next_run_at;
        job.state = JobState::RetryPending;
        Ok(())
    }

    fn mark_running(&self, id: JobId) -> Result<bool, JobStoreError> {
        let mut table = self.write()?;
        Ok(match table.find_mut(id) {
            Some(job) if job.state != JobState::Running => {
                job.state = JobState::Running;
                true
            }
            _ => false,
        })
    }

    fn remove_pending(&self, id: JobId) -> Result<bool, JobStoreError> {
        let mut table = self.write()?;
        let seq = table
            .jobs
            .values()
            .find(|job| job.id == id && job.state != JobState::Running)
            .map(|job| job.sequence);
        Ok(match seq {
            Some(seq) => table.jobs.remove(&seq).is_some(),
            None => false,
        })
    }

    fn reset_running(&self) -> Result<usize, JobStoreError> {
        let mut table = self.write()?;
        let mut reset = 0;
        for job in table.jobs.values_mut() {
            if job.state == JobState::Running {
                job.state = JobState::Pending;
                reset += 1;
            }
        }
        Ok(reset)
    }
}

impl MigrationMarkerStore for InMemoryJobStore {
    fn version(&self) -> Result<u32, JobStoreError> {
        Ok(self.read()?.migration_version)
    }

    fn set_version(&self, version: u32) -> Result<(), JobStoreError> {
        self.write()?.migration_version = version;
        Ok(())
    }
}

impl<S: JobStore + ?Sized> JobStore for Arc<S> {
    fn insert(&self, descriptor: JobDescriptor) -> Result<JobDescriptor, JobStoreError> {
        (**self).insert(descriptor)
    }

    fn remove(&self, id: JobId) -> Result<bool, JobStoreError> {
        (**self).remove(id)
    }

    fn get(&self, id: JobId) -> Result<Option<JobDescriptor>, JobStoreError> {
        (**self).get(id)
    }

    fn all(&self) -> Result<Vec<JobDescriptor>, JobStoreError> {
        (**self).all()
    }

    fn update_attempt(
        &self,
        id: JobId,
        attempt_count: u32,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<(), JobStoreError> {
        (**self).update_attempt(id, attempt_count, next_run_at)
    }

    fn mark_running(&self, id: JobId) -> Result<bool, JobStoreError> {
        (**self).mark_running(id)
    }

    fn remove_pending(&self, id: JobId) -> Result<bool, JobStoreError> {
        (**self).remove_pending(id)
    }

    fn reset_running(&self) -> Result<usize, JobStoreError> {
        (**self).reset_running()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::types::JobParameters;

    fn descriptor(queue: &str) -> JobDescriptor {
        JobDescriptor::new("Test", None, JobParameters::default().with_queue(queue))
    }

    #[test]
    fn insert_assigns_increasing_sequence() {
        let store = InMemoryJobStore::new();
        let a = store.insert(descriptor("q")).unwrap();
        let b = store.insert(descriptor("q")).unwrap();
        assert!(a.sequence < b.sequence);

        let all = store.all().unwrap();
        assert_eq!(all.iter().map(|j| j.id).collect::<Vec<_>>(), vec![a.id, b.id]);
    }

    #[test]
    fn duplicate_insert_is_rejected() {
        let store = InMemoryJobStore::new();
        let job = descriptor("q");
        store.insert(job.clone()).unwrap();
        assert_eq!(
            store.insert(job.clone()),
            Err(JobStoreError::AlreadyExists(job.id))
        );
    }

    #[test]
    fn mark_running_is_exclusive() {
        let store = InMemoryJobStore::new();
        let job = store.insert(descriptor("q")).unwrap();

        assert!(store.mark_running(job.id).unwrap());
        assert!(!store.mark_running(job.id).unwrap());
        assert!(!store.remove_pending(job.id).unwrap());

        assert_eq!(store.reset_running().unwrap(), 1);
        assert!(store.remove_pending(job.id).unwrap());
        assert!(store.get(job.id).unwrap().is_none());
    }

    #[test]
    fn update_attempt_schedules_retry() {
        let store = InMemoryJobStore::new();
        let job = store.insert(descriptor("q")).unwrap();
        let at = Utc::now();

        store.mark_running(job.id).unwrap();
        store.update_attempt(job.id, 1, Some(at)).unwrap();

        let stored = store.get(job.id).unwrap().unwrap();
        assert_eq!(stored.attempt_count, 1);
        assert_eq!(stored.next_run_at, Some(at));
        assert_eq!(stored.state, JobState::RetryPending);

        let missing = JobId::new();
        assert_eq!(
            store.update_attempt(missing, 1, None),
            Err(JobStoreError::NotFound(missing))
        );
    }

    #[test]
    fn next_runnable_uses_queue_order() {
        let store = InMemoryJobStore::new();
        let first = store.insert(descriptor("q")).unwrap();
        store.insert(descriptor("q")).unwrap();

        let selection = store
            .next_runnable(Utc::now(), &|_| true, &|_| true)
            .unwrap();
        assert_eq!(
            selection.runnable.iter().map(|j| j.id).collect::<Vec<_>>(),
            vec![first.id]
        );
    }

    #[test]
    fn migration_marker_defaults_to_zero() {
        let store = InMemoryJobStore::new();
        assert_eq!(store.version().unwrap(), 0);
        store.set_version(3).unwrap();
        assert_eq!(store.version().unwrap(), 3);
    }
}
