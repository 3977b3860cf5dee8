//! Job manager: dispatcher thread plus a bounded worker pool.
//!
//! The dispatcher owns scheduling. Each round it asks the store for runnable
//! records, fails expired ones, marks the rest `Running` and hands them to
//! idle workers. It sleeps until the earliest backoff/expiry deadline, the
//! poll interval, or a signal (enqueue, cancel, worker finished, constraint
//! satisfied), whichever comes first.
//!
//! Workers run a job to completion, then classify the outcome:
//! success removes the record; a retryable error with attempts and lifespan
//! left reschedules it with backoff; anything else calls `on_failure` and
//! removes it. Panics inside a job count as permanent failures.

use std::collections::HashSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{mpsc, Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::JobManagerConfig;

use super::constraints::{ConstraintNotifier, ConstraintRegistry};
use super::job::{describe, Job, JobError, JobRegistry};
use super::store::{JobStore, JobStoreError};
use super::types::{JobDescriptor, JobId};

/// Wake-up reasons for the dispatcher.
#[derive(Debug)]
pub(crate) enum Signal {
    Poll,
    Finished,
    Shutdown,
}

/// Why a job ended without succeeding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "detail")]
pub enum FailureReason {
    /// `run` failed and the job chose not to (or could not) retry.
    Error(String),
    /// The lifespan elapsed before the job could complete.
    LifespanExceeded,
    /// The stored payload could not be turned back into a job.
    Undecodable(String),
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::Error(e) => write!(f, "{e}"),
            FailureReason::LifespanExceeded => write!(f, "lifespan exceeded"),
            FailureReason::Undecodable(e) => write!(f, "undecodable record: {e}"),
        }
    }
}

/// Terminal outcome of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome", content = "reason")]
pub enum JobOutcome {
    Succeeded,
    PermanentlyFailed(FailureReason),
    Cancelled,
}

/// Side-channel notifications for UI layers and synchronous callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum JobEvent {
    RetryScheduled {
        id: JobId,
        factory_key: String,
        attempt: u32,
        next_run_at: DateTime<Utc>,
        error: String,
    },
    Completed {
        id: JobId,
        factory_key: String,
        outcome: JobOutcome,
    },
}

impl JobEvent {
    pub fn id(&self) -> JobId {
        match self {
            JobEvent::RetryScheduled { id, .. } | JobEvent::Completed { id, .. } => *id,
        }
    }
}

#[derive(Debug, Error)]
pub enum JobManagerError {
    #[error(transparent)]
    Store(#[from] JobStoreError),
    #[error("failed to serialize job: {0}")]
    Serialization(#[from] JobError),
    #[error("no factory registered for {0}")]
    UnknownFactory(String),
    #[error("job {0} did not finish within the timeout")]
    Timeout(JobId),
    #[error("failed to spawn {0} thread: {1}")]
    Spawn(String, String),
    #[error("job manager has shut down")]
    ShutDown,
}

/// Aggregate health counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobManagerStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_retried: u64,
    pub jobs_permanently_failed: u64,
    pub jobs_expired: u64,
    pub jobs_cancelled: u64,
    pub current_running: usize,
    pub uptime_secs: u64,
}

struct Shared {
    config: JobManagerConfig,
    store: Arc<dyn JobStore>,
    registry: JobRegistry,
    constraints: ConstraintRegistry,
    stats: Mutex<JobManagerStats>,
    subscribers: Mutex<Vec<mpsc::Sender<JobEvent>>>,
    started_at: Instant,
}

impl Shared {
    fn stats(&self) -> std::sync::MutexGuard<'_, JobManagerStats> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: JobEvent) {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn complete(&self, descriptor: &JobDescriptor, outcome: JobOutcome) {
        self.emit(JobEvent::Completed {
            id: descriptor.id,
            factory_key: descriptor.factory_key.clone(),
            outcome,
        });
    }
}

struct WorkItem {
    descriptor: JobDescriptor,
    job: Box<dyn Job>,
}

/// Durable, constraint-gated job manager.
///
/// Dropping the manager (or calling [`shutdown`](Self::shutdown)) stops
/// dispatch, lets running jobs finish and joins every thread. Records still
/// pending stay in the store for the next process.
pub struct JobManager {
    shared: Arc<Shared>,
    signal_tx: mpsc::Sender<Signal>,
    threads: Vec<thread::JoinHandle<()>>,
}

impl std::fmt::Debug for JobManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobManager")
            .field("name", &self.shared.config.name)
            .field("threads", &self.threads.len())
            .finish()
    }
}

impl JobManager {
    /// Recover records left running by a dead process and start dispatching.
    pub fn start(
        config: JobManagerConfig,
        store: Arc<dyn JobStore>,
        registry: JobRegistry,
        constraints: ConstraintRegistry,
    ) -> Result<Self, JobManagerError> {
        let recovered = store.reset_running()?;
        if recovered > 0 {
            warn!(executor = %config.name, recovered, "reset jobs left running by a previous process");
        }

        let (signal_tx, signal_rx) = mpsc::channel::<Signal>();
        let (work_tx, work_rx) = mpsc::channel::<WorkItem>();
        let work_rx = Arc::new(Mutex::new(work_rx));

        constraints.register_notifier(&ConstraintNotifier::new(signal_tx.clone()));

        let shared = Arc::new(Shared {
            config,
            store,
            registry,
            constraints,
            stats: Mutex::new(JobManagerStats::default()),
            subscribers: Mutex::new(Vec::new()),
            started_at: Instant::now(),
        });

        let mut manager = Self {
            shared: shared.clone(),
            signal_tx: signal_tx.clone(),
            threads: Vec::new(),
        };

        let name = shared.config.name.clone();
        for index in 0..shared.config.worker_count.max(1) {
            let thread_name = format!("{name}-worker-{index}");
            let worker_shared = shared.clone();
            let worker_rx = work_rx.clone();
            let worker_signal = signal_tx.clone();
            let handle = thread::Builder::new()
                .name(thread_name.clone())
                .spawn(move || worker_loop(worker_shared, worker_rx, worker_signal))
                .map_err(|e| JobManagerError::Spawn(thread_name, e.to_string()))?;
            manager.threads.push(handle);
        }

        let dispatcher_name = format!("{name}-dispatcher");
        let handle = thread::Builder::new()
            .name(dispatcher_name.clone())
            .spawn(move || dispatcher_loop(shared, signal_rx, work_tx))
            .map_err(|e| JobManagerError::Spawn(dispatcher_name, e.to_string()))?;
        manager.threads.push(handle);

        Ok(manager)
    }

    /// Persist a job and wake the dispatcher.
    pub fn enqueue<J: Job + ?Sized>(&self, job: &J) -> Result<JobId, JobManagerError> {
        let descriptor = describe(job)?;
        self.enqueue_descriptor(descriptor)
    }

    pub fn enqueue_descriptor(&self, descriptor: JobDescriptor) -> Result<JobId, JobManagerError> {
        if !self.shared.registry.contains(&descriptor.factory_key) {
            return Err(JobManagerError::UnknownFactory(descriptor.factory_key));
        }
        let stored = self.shared.store.insert(descriptor)?;
        debug!(
            executor = %self.shared.config.name,
            job_id = %stored.id,
            factory_key = %stored.factory_key,
            queue = ?stored.queue_key,
            "enqueued job"
        );
        self.signal_tx
            .send(Signal::Poll)
            .map_err(|_| JobManagerError::ShutDown)?;
        Ok(stored.id)
    }

    /// Remove a job that has not started. Running jobs are not interrupted;
    /// returns false for them and for unknown ids.
    pub fn cancel(&self, id: JobId) -> Result<bool, JobManagerError> {
        let Some(descriptor) = self.shared.store.get(id)? else {
            return Ok(false);
        };
        if !self.shared.store.remove_pending(id)? {
            return Ok(false);
        }

        info!(executor = %self.shared.config.name, job_id = %id, "job cancelled");
        self.shared.stats().jobs_cancelled += 1;
        self.shared.complete(&descriptor, JobOutcome::Cancelled);
        let _ = self.signal_tx.send(Signal::Poll);
        Ok(true)
    }

    /// Enqueue a job and block until it reaches a terminal outcome.
    ///
    /// On timeout the job stays queued and will still run.
    pub fn run_synchronously<J: Job + ?Sized>(
        &self,
        job: &J,
        timeout: Duration,
    ) -> Result<JobOutcome, JobManagerError> {
        let events = self.subscribe();
        let id = self.enqueue(job)?;
        let deadline = Instant::now() + timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match events.recv_timeout(remaining) {
                Ok(JobEvent::Completed {
                    id: done, outcome, ..
                }) if done == id => return Ok(outcome),
                Ok(_) => continue,
                Err(mpsc::RecvTimeoutError::Timeout) => return Err(JobManagerError::Timeout(id)),
                Err(mpsc::RecvTimeoutError::Disconnected) => return Err(JobManagerError::ShutDown),
            }
        }
    }

    /// Receive every subsequent [`JobEvent`].
    pub fn subscribe(&self) -> mpsc::Receiver<JobEvent> {
        let (tx, rx) = mpsc::channel();
        self.shared
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    pub fn stats(&self) -> JobManagerStats {
        let mut stats = self.shared.stats().clone();
        stats.uptime_secs = self.shared.started_at.elapsed().as_secs();
        stats
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.shared.store
    }

    /// Stop dispatching, wait for running jobs and join all threads.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if self.threads.is_empty() {
            return;
        }
        let _ = self.signal_tx.send(Signal::Shutdown);
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                error!(executor = %self.shared.config.name, "job manager thread panicked");
            }
        }
        info!(executor = %self.shared.config.name, "job manager stopped");
    }
}

impl Drop for JobManager {
    fn drop(&mut self) {
        self.stop();
    }
}

fn dispatcher_loop(
    shared: Arc<Shared>,
    signal_rx: mpsc::Receiver<Signal>,
    work_tx: mpsc::Sender<WorkItem>,
) {
    let name = shared.config.name.clone();
    info!(executor = %name, workers = shared.config.worker_count, "job manager started");

    let capacity = shared.config.worker_count.max(1);
    let mut in_flight = 0usize;
    let mut reported_unknown: HashSet<JobId> = HashSet::new();

    'outer: loop {
        let wakeup = match dispatch_round(
            &shared,
            &work_tx,
            capacity.saturating_sub(in_flight),
            &mut in_flight,
            &mut reported_unknown,
        ) {
            Ok(wakeup) => wakeup,
            Err(e) => {
                error!(executor = %name, error = %e, "dispatch round failed");
                None
            }
        };

        let mut timeout = shared.config.poll_interval;
        if let Some(at) = wakeup {
            let until = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            timeout = timeout.min(until);
        }

        let first = match signal_rx.recv_timeout(timeout) {
            Ok(signal) => Some(signal),
            Err(mpsc::RecvTimeoutError::Timeout) => None,
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        };

        for signal in first.into_iter().chain(std::iter::from_fn(|| signal_rx.try_recv().ok())) {
            match signal {
                Signal::Shutdown => break 'outer,
                Signal::Finished => in_flight = in_flight.saturating_sub(1),
                Signal::Poll => {}
            }
        }
    }

    // Dropping `work_tx` lets idle workers exit once queued work is drained.
    drop(work_tx);
    debug!(executor = %name, in_flight, "dispatcher exiting");
}

/// One scheduling pass. Returns the next instant worth waking up for.
fn dispatch_round(
    shared: &Shared,
    work_tx: &mpsc::Sender<WorkItem>,
    mut idle: usize,
    in_flight: &mut usize,
    reported_unknown: &mut HashSet<JobId>,
) -> Result<Option<DateTime<Utc>>, JobStoreError> {
    let now = Utc::now();
    let selection = shared.store.next_runnable(
        now,
        &|key| shared.constraints.is_satisfied(key),
        &|key| shared.registry.contains(key),
    )?;

    for descriptor in &selection.unknown {
        if reported_unknown.insert(descriptor.id) {
            warn!(
                executor = %shared.config.name,
                job_id = %descriptor.id,
                factory_key = %descriptor.factory_key,
                "no factory registered; leaving job in place"
            );
        }
    }

    for descriptor in selection.expired {
        if shared.store.remove_pending(descriptor.id)? {
            warn!(
                executor = %shared.config.name,
                job_id = %descriptor.id,
                factory_key = %descriptor.factory_key,
                "job lifespan exceeded"
            );
            if let Some(Ok(mut job)) = shared.registry.create(&descriptor) {
                run_failure_hook(shared, &descriptor, job.as_mut());
            }
            {
                let mut stats = shared.stats();
                stats.jobs_expired += 1;
                stats.jobs_permanently_failed += 1;
            }
            shared.complete(
                &descriptor,
                JobOutcome::PermanentlyFailed(FailureReason::LifespanExceeded),
            );
        }
    }

    for descriptor in selection.runnable {
        if idle == 0 {
            break;
        }

        let job = match shared.registry.create(&descriptor) {
            Some(Ok(job)) => job,
            Some(Err(e)) => {
                error!(
                    executor = %shared.config.name,
                    job_id = %descriptor.id,
                    factory_key = %descriptor.factory_key,
                    error = %e,
                    "failed to rebuild job; dropping record"
                );
                shared.store.remove(descriptor.id)?;
                shared.stats().jobs_permanently_failed += 1;
                shared.complete(
                    &descriptor,
                    JobOutcome::PermanentlyFailed(FailureReason::Undecodable(e.to_string())),
                );
                continue;
            }
            None => continue,
        };

        if !shared.store.mark_running(descriptor.id)? {
            continue;
        }

        debug!(
            executor = %shared.config.name,
            job_id = %descriptor.id,
            factory_key = %descriptor.factory_key,
            attempt = descriptor.attempt_count + 1,
            "dispatching job"
        );

        if work_tx.send(WorkItem { descriptor, job }).is_err() {
            return Err(JobStoreError::Storage("worker pool is gone".to_string()));
        }
        idle -= 1;
        *in_flight += 1;
        shared.stats().current_running += 1;
    }

    if idle == 0 {
        // Saturated: wait for a worker to finish rather than the next deadline.
        return Ok(None);
    }
    Ok(selection.next_wakeup)
}

fn worker_loop(
    shared: Arc<Shared>,
    work_rx: Arc<Mutex<mpsc::Receiver<WorkItem>>>,
    signal_tx: mpsc::Sender<Signal>,
) {
    loop {
        let item = {
            let rx = work_rx.lock().unwrap_or_else(PoisonError::into_inner);
            rx.recv()
        };
        let Ok(WorkItem { descriptor, mut job }) = item else {
            break;
        };

        execute(&shared, &descriptor, job.as_mut());

        {
            let mut stats = shared.stats();
            stats.jobs_processed += 1;
            stats.current_running = stats.current_running.saturating_sub(1);
        }
        let _ = signal_tx.send(Signal::Finished);
    }
}

fn execute(shared: &Shared, descriptor: &JobDescriptor, job: &mut dyn Job) {
    let name = &shared.config.name;
    let result = catch_unwind(AssertUnwindSafe(|| job.run()))
        .unwrap_or_else(|panic| Err(JobError::Permanent(format!("job panicked: {}", panic_message(panic.as_ref())))));

    let error = match result {
        Ok(()) => {
            debug!(executor = %name, job_id = %descriptor.id, "job completed successfully");
            if let Err(e) = shared.store.remove(descriptor.id) {
                error!(executor = %name, job_id = %descriptor.id, error = %e, "failed to remove completed job");
            }
            shared.stats().jobs_succeeded += 1;
            shared.complete(descriptor, JobOutcome::Succeeded);
            return;
        }
        Err(error) => error,
    };

    let attempt = descriptor.attempt_count.saturating_add(1);
    let now = Utc::now();
    let retry = job.should_retry(&error)
        && descriptor.allows_another_attempt(attempt)
        && !descriptor.is_expired(now);

    if retry {
        let delay = shared.config.backoff.delay_for_attempt(attempt);
        let next_run_at = now + TimeDelta::from_std(delay).unwrap_or(TimeDelta::zero());
        match shared.store.update_attempt(descriptor.id, attempt, Some(next_run_at)) {
            Ok(()) => {
                warn!(
                    executor = %name,
                    job_id = %descriptor.id,
                    factory_key = %descriptor.factory_key,
                    attempt,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %error,
                    "job failed; retry scheduled"
                );
                shared.stats().jobs_retried += 1;
                shared.emit(JobEvent::RetryScheduled {
                    id: descriptor.id,
                    factory_key: descriptor.factory_key.clone(),
                    attempt,
                    next_run_at,
                    error: error.to_string(),
                });
                return;
            }
            Err(e) => {
                error!(executor = %name, job_id = %descriptor.id, error = %e, "failed to schedule retry");
            }
        }
    }

    error!(
        executor = %name,
        job_id = %descriptor.id,
        factory_key = %descriptor.factory_key,
        attempt,
        error = %error,
        "job permanently failed"
    );
    run_failure_hook(shared, descriptor, job);
    if let Err(e) = shared.store.remove(descriptor.id) {
        error!(executor = %name, job_id = %descriptor.id, error = %e, "failed to remove failed job");
    }
    shared.stats().jobs_permanently_failed += 1;
    shared.complete(
        descriptor,
        JobOutcome::PermanentlyFailed(FailureReason::Error(error.to_string())),
    );
}

fn run_failure_hook(shared: &Shared, descriptor: &JobDescriptor, job: &mut dyn Job) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(|| job.on_failure())) {
        error!(
            executor = %shared.config.name,
            job_id = %descriptor.id,
            panic = %panic_message(panic.as_ref()),
            "on_failure panicked"
        );
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
