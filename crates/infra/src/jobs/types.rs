//! Core job types, scheduling parameters and policies.

use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::from_str(s).map(Self)
    }
}

/// Persisted execution state of a job record.
///
/// Terminal states are not stored: a finished, failed or cancelled job is
/// removed from the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Queued, waiting to be picked up
    Pending,
    /// Handed to a worker
    Running,
    /// Failed with a retryable error; runnable again at `next_run_at`
    RetryPending,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::RetryPending => "retry_pending",
        }
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobState::Pending),
            "running" => Ok(JobState::Running),
            "retry_pending" => Ok(JobState::RetryPending),
            other => Err(format!("invalid job state: {other}")),
        }
    }
}

/// Scheduling parameters a job declares for itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobParameters {
    pub queue: Option<String>,
    pub constraints: Vec<String>,
    /// `None` means unlimited.
    pub max_attempts: Option<u32>,
    /// `None` means the job never expires.
    pub lifespan: Option<Duration>,
    /// `None` means no per-factory concurrency cap.
    pub max_instances_for_factory: Option<usize>,
}

impl Default for JobParameters {
    fn default() -> Self {
        Self {
            queue: None,
            constraints: Vec::new(),
            max_attempts: Some(1),
            lifespan: None,
            max_instances_for_factory: None,
        }
    }
}

impl JobParameters {
    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn with_constraint(mut self, key: impl Into<String>) -> Self {
        self.constraints.push(key.into());
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_unlimited_attempts(mut self) -> Self {
        self.max_attempts = None;
        self
    }

    pub fn with_lifespan(mut self, lifespan: Duration) -> Self {
        self.lifespan = Some(lifespan);
        self
    }

    pub fn with_max_instances_for_factory(mut self, max: usize) -> Self {
        self.max_instances_for_factory = Some(max);
        self
    }
}

/// A persisted unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDescriptor {
    pub id: JobId,
    pub factory_key: String,
    pub queue_key: Option<String>,
    pub serialized_data: Option<Vec<u8>>,
    pub constraints: Vec<String>,
    pub max_attempts: Option<u32>,
    pub lifespan: Option<Duration>,
    pub max_instances_for_factory: Option<usize>,
    pub created_at: DateTime<Utc>,
    /// Number of failed attempts so far.
    pub attempt_count: u32,
    /// Earliest time of the next attempt (set after a retryable failure).
    pub next_run_at: Option<DateTime<Utc>>,
    /// Submission order, assigned by the store on insert.
    pub sequence: u64,
    pub state: JobState,
}

impl JobDescriptor {
    pub fn new(
        factory_key: impl Into<String>,
        serialized_data: Option<Vec<u8>>,
        parameters: JobParameters,
    ) -> Self {
        Self {
            id: JobId::new(),
            factory_key: factory_key.into(),
            queue_key: parameters.queue,
            serialized_data,
            constraints: parameters.constraints,
            max_attempts: parameters.max_attempts,
            lifespan: parameters.lifespan,
            max_instances_for_factory: parameters.max_instances_for_factory,
            created_at: Utc::now(),
            attempt_count: 0,
            next_run_at: None,
            sequence: 0,
            state: JobState::Pending,
        }
    }

    /// Instant after which the job is abandoned, if it has a lifespan.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        let lifespan = TimeDelta::from_std(self.lifespan?).ok()?;
        self.created_at.checked_add_signed(lifespan)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at().is_some_and(|at| now >= at)
    }

    pub fn is_in_backoff(&self, now: DateTime<Utc>) -> bool {
        self.next_run_at.is_some_and(|at| at > now)
    }

    /// Whether a job that has failed `attempts` times may run again.
    pub fn allows_another_attempt(&self, attempts: u32) -> bool {
        self.max_attempts.is_none_or(|max| attempts < max)
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^(attempt-1)
    #[default]
    Exponential,
}

/// Delay between a retryable failure and the next attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Base delay between retries
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0)
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::exponential(Duration::from_secs(1), Duration::from_secs(60))
    }
}

impl BackoffPolicy {
    pub fn fixed(delay: Duration) -> Self {
        Self {
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    pub fn exponential(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }

    /// Calculate delay for a given attempt number (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let exp = 2_f64.powi(attempt.saturating_sub(1).min(62) as i32);
                (base_ms * exp).min(max_ms)
            }
        };

        // Deterministic jitter derived from the attempt number
        let jitter_range = delay_ms * self.jitter;
        let jitter = if jitter_range > 0.0 {
            let pseudo_random = ((attempt as f64 * 17.0) % 100.0) / 100.0;
            jitter_range * (pseudo_random - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).clamp(0.0, max_ms.max(base_ms)) as u64)
    }
}

/// Result of one scheduling pass over the job table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Selection {
    /// Jobs that may be dispatched now, in submission order.
    pub runnable: Vec<JobDescriptor>,
    /// Queue heads whose lifespan has elapsed; they must be failed, not run.
    pub expired: Vec<JobDescriptor>,
    /// Queue heads whose factory key is not registered in this process.
    pub unknown: Vec<JobDescriptor>,
    /// Earliest instant at which a currently blocked head may change state.
    pub next_wakeup: Option<DateTime<Utc>>,
}

impl Selection {
    fn wake_at(&mut self, at: DateTime<Utc>) {
        self.next_wakeup = Some(self.next_wakeup.map_or(at, |cur| cur.min(at)));
    }
}

/// Pick the jobs that may run at `now`.
///
/// Walks jobs in submission order. Only the first record of each queue is
/// considered; it blocks the rest of its queue whether it is running,
/// backing off, gated by constraints or of an unknown factory. Factory caps
/// count jobs already running plus jobs selected in this pass.
pub fn select_runnable(
    jobs: &[JobDescriptor],
    now: DateTime<Utc>,
    is_satisfied: impl Fn(&str) -> bool,
    is_known: impl Fn(&str) -> bool,
) -> Selection {
    let mut ordered: Vec<&JobDescriptor> = jobs.iter().collect();
    ordered.sort_by_key(|job| job.sequence);

    let mut per_factory: HashMap<&str, usize> = HashMap::new();
    for job in ordered.iter().filter(|j| j.state == JobState::Running) {
        *per_factory.entry(job.factory_key.as_str()).or_default() += 1;
    }

    let mut selection = Selection::default();
    let mut seen_queues: HashSet<&str> = HashSet::new();

    for job in ordered {
        if let Some(queue) = job.queue_key.as_deref() {
            if !seen_queues.insert(queue) {
                continue;
            }
        }

        if job.state == JobState::Running {
            continue;
        }

        if !is_known(&job.factory_key) {
            selection.unknown.push(job.clone());
            continue;
        }

        if job.is_expired(now) {
            selection.expired.push(job.clone());
            continue;
        }

        if let Some(at) = job.expires_at() {
            selection.wake_at(at);
        }

        if job.is_in_backoff(now) {
            if let Some(at) = job.next_run_at {
                selection.wake_at(at);
            }
            continue;
        }

        if !job.constraints.iter().all(|key| is_satisfied(key)) {
            continue;
        }

        if let Some(cap) = job.max_instances_for_factory {
            let running = per_factory.entry(job.factory_key.as_str()).or_default();
            if *running >= cap {
                continue;
            }
            *running += 1;
        }

        selection.runnable.push(job.clone());
    }

    selection
}
