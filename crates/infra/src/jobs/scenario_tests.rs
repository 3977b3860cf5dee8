//! End-to-end scenarios for the job manager with real threads and stores.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{TimeDelta, Utc};
use proptest::prelude::*;
use serde::{Deserialize, Serialize};

use courier_core::{DeviceId, RecipientId, ServiceId};
use courier_protocol::{Content, ContentHint, Recipient, ResendRequest};

use crate::config::JobManagerConfig;

use super::constraints::{ConstraintRegistry, FlagConstraint};
use super::definitions::{
    self, fixtures, AccountError, AccountManager, ApplicationMigrations, InMemoryAttachmentStore,
    JobEnvironment, LocalAccount, MigrationSchedule, ProcessState, ResendMessageJob,
};
use super::executor::{FailureReason, JobEvent, JobManager, JobOutcome};
use super::job::{describe, Job, JobError, JobRegistry};
use super::sqlite_store::SqliteJobStore;
use super::store::{InMemoryJobStore, JobStore, MigrationMarkerStore};
use super::types::{select_runnable, BackoffPolicy, JobDescriptor, JobId, JobParameters, JobState};

const PROBE: &str = "Probe";
const GATE: &str = "gate";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct ProbeSpec {
    label: String,
    queue: Option<String>,
    constraints: Vec<String>,
    fail: bool,
    retry: bool,
    sleep_ms: u64,
    max_instances: Option<usize>,
}

impl ProbeSpec {
    fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            ..Default::default()
        }
    }

    fn queue(mut self, queue: &str) -> Self {
        self.queue = Some(queue.to_string());
        self
    }

    fn gated(mut self) -> Self {
        self.constraints.push(GATE.to_string());
        self
    }
}

#[derive(Debug, Default)]
struct Recorder {
    runs: Mutex<Vec<String>>,
    failures: Mutex<Vec<String>>,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl Recorder {
    fn runs(&self) -> Vec<String> {
        self.runs.lock().unwrap().clone()
    }

    fn failures(&self) -> Vec<String> {
        self.failures.lock().unwrap().clone()
    }
}

struct Probe {
    spec: ProbeSpec,
    recorder: Arc<Recorder>,
}

impl Job for Probe {
    fn factory_key(&self) -> &str {
        PROBE
    }

    fn parameters(&self) -> JobParameters {
        let mut params = JobParameters::default().with_max_attempts(3);
        if let Some(queue) = &self.spec.queue {
            params = params.with_queue(queue.clone());
        }
        for key in &self.spec.constraints {
            params = params.with_constraint(key.clone());
        }
        if let Some(max) = self.spec.max_instances {
            params = params.with_max_instances_for_factory(max);
        }
        params
    }

    fn serialize(&self) -> Result<Option<Vec<u8>>, JobError> {
        Ok(Some(serde_json::to_vec(&self.spec)?))
    }

    fn run(&mut self) -> Result<(), JobError> {
        let active = self.recorder.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.recorder.peak.fetch_max(active, Ordering::SeqCst);
        self.recorder.runs.lock().unwrap().push(self.spec.label.clone());
        thread::sleep(Duration::from_millis(self.spec.sleep_ms));
        self.recorder.active.fetch_sub(1, Ordering::SeqCst);

        if self.spec.fail {
            return Err(JobError::Network(format!("{} failed", self.spec.label)));
        }
        Ok(())
    }

    fn should_retry(&self, error: &JobError) -> bool {
        self.spec.retry && error.is_transient()
    }

    fn on_failure(&mut self) {
        self.recorder.failures.lock().unwrap().push(self.spec.label.clone());
    }
}

fn probe(spec: ProbeSpec, recorder: &Arc<Recorder>) -> Probe {
    Probe {
        spec,
        recorder: recorder.clone(),
    }
}

fn registry(recorder: &Arc<Recorder>) -> JobRegistry {
    let recorder = recorder.clone();
    let mut registry = JobRegistry::new();
    registry.register(PROBE, move |descriptor: &JobDescriptor| {
        let data = descriptor.serialized_data.as_deref().unwrap_or(&b"{}"[..]);
        Ok(Box::new(Probe {
            spec: serde_json::from_slice(data)?,
            recorder: recorder.clone(),
        }) as Box<dyn Job>)
    });
    registry
}

fn config(workers: usize) -> JobManagerConfig {
    JobManagerConfig::default()
        .with_worker_count(workers)
        .with_poll_interval(Duration::from_millis(20))
        .with_backoff(BackoffPolicy::fixed(Duration::ZERO))
}

fn start(
    store: Arc<dyn JobStore>,
    recorder: &Arc<Recorder>,
    workers: usize,
    gate: &FlagConstraint,
) -> JobManager {
    JobManager::start(
        config(workers),
        store,
        registry(recorder),
        ConstraintRegistry::new().with(gate.clone()),
    )
    .unwrap()
}

/// Collect `count` terminal outcomes in completion order.
fn completions(events: &mpsc::Receiver<JobEvent>, count: usize) -> Vec<(JobId, JobOutcome)> {
    let deadline = Instant::now() + Duration::from_secs(10);
    let mut done = Vec::new();
    while done.len() < count {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match events.recv_timeout(remaining) {
            Ok(JobEvent::Completed { id, outcome, .. }) => done.push((id, outcome)),
            Ok(_) => {}
            Err(e) => panic!("waited for {count} completions, got {}: {e:?}", done.len()),
        }
    }
    done
}

fn temp_db() -> std::path::PathBuf {
    std::env::temp_dir().join(format!("courier-scenario-{}.db", uuid::Uuid::new_v4()))
}

fn remove_db(path: &std::path::Path) {
    for suffix in ["", "-wal", "-shm"] {
        let mut file = path.as_os_str().to_owned();
        file.push(suffix);
        let _ = std::fs::remove_file(file);
    }
}

#[test]
fn queue_order_survives_restart() {
    let path = temp_db();
    let recorder = Arc::new(Recorder::default());
    let gated = |label: &str| ProbeSpec {
        sleep_ms: 10,
        ..ProbeSpec::new(label).queue("q").gated()
    };

    {
        let gate = FlagConstraint::new(GATE, false);
        let store: Arc<dyn JobStore> = Arc::new(SqliteJobStore::open(&path).unwrap());
        let manager = start(store, &recorder, 4, &gate);
        manager.enqueue(&probe(gated("a"), &recorder)).unwrap();
        manager.shutdown();
    }
    assert!(recorder.runs().is_empty());

    let gate = FlagConstraint::new(GATE, false);
    let store: Arc<dyn JobStore> = Arc::new(SqliteJobStore::open(&path).unwrap());
    assert_eq!(store.all().unwrap().len(), 1);

    let manager = start(store.clone(), &recorder, 4, &gate);
    let events = manager.subscribe();
    for label in ["b", "c"] {
        manager.enqueue(&probe(gated(label), &recorder)).unwrap();
    }
    gate.set(true);

    let done = completions(&events, 3);
    assert!(done.iter().all(|(_, outcome)| *outcome == JobOutcome::Succeeded));
    assert_eq!(recorder.runs(), vec!["a", "b", "c"]);
    assert!(store.all().unwrap().is_empty());

    manager.shutdown();
    drop(store);
    remove_db(&path);
}

#[test]
fn job_declining_retry_is_not_rescheduled() {
    let recorder = Arc::new(Recorder::default());
    let gate = FlagConstraint::new(GATE, true);
    let manager = start(InMemoryJobStore::arc(), &recorder, 2, &gate);

    let spec = ProbeSpec {
        fail: true,
        retry: false,
        ..ProbeSpec::new("once")
    };
    let outcome = manager
        .run_synchronously(&probe(spec, &recorder), Duration::from_secs(5))
        .unwrap();

    assert!(matches!(outcome, JobOutcome::PermanentlyFailed(FailureReason::Error(_))));
    assert_eq!(recorder.runs(), vec!["once"]);
    assert_eq!(recorder.failures(), vec!["once"]);
    assert_eq!(manager.stats().jobs_retried, 0);
    assert!(manager.store().all().unwrap().is_empty());
}

#[test]
fn retryable_job_runs_until_it_succeeds_or_exhausts() {
    let recorder = Arc::new(Recorder::default());
    let gate = FlagConstraint::new(GATE, true);
    let manager = start(InMemoryJobStore::arc(), &recorder, 1, &gate);
    let events = manager.subscribe();

    let spec = ProbeSpec {
        fail: true,
        retry: true,
        ..ProbeSpec::new("flaky")
    };
    let id = manager.enqueue(&probe(spec, &recorder)).unwrap();

    let mut attempts = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        match events.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
            Ok(JobEvent::RetryScheduled { id: retried, attempt, .. }) => {
                assert_eq!(retried, id);
                attempts.push(attempt);
            }
            Ok(JobEvent::Completed { outcome, .. }) => {
                assert!(matches!(outcome, JobOutcome::PermanentlyFailed(_)));
                break;
            }
            Err(e) => panic!("no terminal outcome: {e:?}"),
        }
    }

    assert_eq!(attempts, vec![1, 2]);
    assert_eq!(recorder.runs().len(), 3);
    assert_eq!(recorder.failures(), vec!["flaky"]);
}

#[test]
fn expired_job_fails_without_running() {
    let recorder = Arc::new(Recorder::default());
    let gate = FlagConstraint::new(GATE, false);
    let manager = start(InMemoryJobStore::arc(), &recorder, 2, &gate);
    let events = manager.subscribe();

    let mut descriptor = describe(&probe(ProbeSpec::new("stale").gated(), &recorder)).unwrap();
    descriptor.lifespan = Some(Duration::from_secs(1));
    descriptor.created_at = Utc::now() - TimeDelta::seconds(10);
    let id = manager.enqueue_descriptor(descriptor).unwrap();

    let done = completions(&events, 1);
    assert_eq!(
        done,
        vec![(id, JobOutcome::PermanentlyFailed(FailureReason::LifespanExceeded))]
    );
    assert!(recorder.runs().is_empty());
    assert_eq!(recorder.failures(), vec!["stale"]);
    assert_eq!(manager.stats().jobs_expired, 1);
}

#[test]
fn factory_cap_limits_concurrency() {
    let recorder = Arc::new(Recorder::default());
    let gate = FlagConstraint::new(GATE, true);
    let manager = start(InMemoryJobStore::arc(), &recorder, 4, &gate);
    let events = manager.subscribe();

    for label in ["1", "2", "3", "4"] {
        let spec = ProbeSpec {
            sleep_ms: 30,
            max_instances: Some(1),
            ..ProbeSpec::new(label)
        };
        manager.enqueue(&probe(spec, &recorder)).unwrap();
    }

    completions(&events, 4);
    assert_eq!(recorder.runs().len(), 4);
    assert_eq!(recorder.peak.load(Ordering::SeqCst), 1);
}

#[test]
fn unqueued_jobs_run_in_parallel() {
    let recorder = Arc::new(Recorder::default());
    let gate = FlagConstraint::new(GATE, true);
    let manager = start(InMemoryJobStore::arc(), &recorder, 3, &gate);
    let events = manager.subscribe();

    for label in ["x", "y", "z"] {
        let spec = ProbeSpec {
            sleep_ms: 200,
            ..ProbeSpec::new(label)
        };
        manager.enqueue(&probe(spec, &recorder)).unwrap();
    }

    completions(&events, 3);
    assert!(recorder.peak.load(Ordering::SeqCst) >= 2);
}

#[test]
fn permanent_failure_unblocks_the_next_queued_job() {
    let recorder = Arc::new(Recorder::default());
    let gate = FlagConstraint::new(GATE, false);
    let manager = start(InMemoryJobStore::arc(), &recorder, 2, &gate);
    let events = manager.subscribe();

    let first = ProbeSpec {
        fail: true,
        ..ProbeSpec::new("first").queue("q").gated()
    };
    let a = manager.enqueue(&probe(first, &recorder)).unwrap();
    let b = manager
        .enqueue(&probe(ProbeSpec::new("second").queue("q"), &recorder))
        .unwrap();
    gate.set(true);

    let done = completions(&events, 2);
    assert!(matches!(done[0], (id, JobOutcome::PermanentlyFailed(_)) if id == a));
    assert_eq!(done[1], (b, JobOutcome::Succeeded));
    assert_eq!(recorder.runs(), vec!["first", "second"]);
}

#[test]
fn satisfied_constraint_wakes_the_dispatcher() {
    let recorder = Arc::new(Recorder::default());
    let network = FlagConstraint::network(false);
    let manager = JobManager::start(
        config(1).with_poll_interval(Duration::from_secs(60)),
        InMemoryJobStore::arc(),
        registry(&recorder),
        ConstraintRegistry::new().with(network.clone()),
    )
    .unwrap();
    let events = manager.subscribe();

    let mut spec = ProbeSpec::new("online");
    spec.constraints.push(super::constraints::NETWORK.to_string());
    manager.enqueue(&probe(spec, &recorder)).unwrap();

    thread::sleep(Duration::from_millis(100));
    assert!(recorder.runs().is_empty());

    let started = Instant::now();
    network.set(true);
    completions(&events, 1);
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(recorder.runs(), vec!["online"]);
}

#[test]
fn cancel_removes_pending_job_without_failure_hook() {
    let recorder = Arc::new(Recorder::default());
    let gate = FlagConstraint::new(GATE, false);
    let manager = start(InMemoryJobStore::arc(), &recorder, 1, &gate);
    let events = manager.subscribe();

    let id = manager
        .enqueue(&probe(ProbeSpec::new("doomed").gated(), &recorder))
        .unwrap();
    assert!(manager.cancel(id).unwrap());
    assert!(!manager.cancel(id).unwrap());

    assert_eq!(completions(&events, 1), vec![(id, JobOutcome::Cancelled)]);
    assert!(recorder.failures().is_empty());
    assert!(manager.store().get(id).unwrap().is_none());
    assert_eq!(manager.stats().jobs_cancelled, 1);
}

#[test]
fn unknown_factory_holds_its_queue_position() {
    let recorder = Arc::new(Recorder::default());
    let store = InMemoryJobStore::arc();
    let future = store
        .insert(JobDescriptor::new(
            "FromTheFuture",
            None,
            JobParameters::default().with_queue("q"),
        ))
        .unwrap();

    let gate = FlagConstraint::new(GATE, true);
    let manager = start(store.clone(), &recorder, 2, &gate);
    let events = manager.subscribe();

    manager
        .enqueue(&probe(ProbeSpec::new("blocked").queue("q"), &recorder))
        .unwrap();
    let free = manager
        .enqueue(&probe(ProbeSpec::new("free"), &recorder))
        .unwrap();

    assert_eq!(completions(&events, 1), vec![(free, JobOutcome::Succeeded)]);
    thread::sleep(Duration::from_millis(100));
    assert_eq!(recorder.runs(), vec!["free"]);
    assert!(store.get(future.id).unwrap().is_some());
    assert_eq!(store.all().unwrap().len(), 2);
}

#[test]
fn jobs_left_running_by_a_dead_process_run_again() {
    let recorder = Arc::new(Recorder::default());
    let store = InMemoryJobStore::arc();
    let stored = store
        .insert(describe(&probe(ProbeSpec::new("orphan").gated(), &recorder)).unwrap())
        .unwrap();
    assert!(store.mark_running(stored.id).unwrap());

    let gate = FlagConstraint::new(GATE, false);
    let manager = start(store.clone(), &recorder, 1, &gate);
    let events = manager.subscribe();

    let recovered = store.get(stored.id).unwrap().unwrap();
    assert_eq!(recovered.state, JobState::Pending);
    assert_eq!(recovered.attempt_count, 0);

    gate.set(true);
    assert_eq!(completions(&events, 1), vec![(stored.id, JobOutcome::Succeeded)]);
    assert_eq!(recorder.runs(), vec!["orphan"]);
}

struct Unregistered;

impl AccountManager for Unregistered {
    fn local_account(&self) -> Result<LocalAccount, AccountError> {
        Ok(LocalAccount {
            registered: false,
            attributes: Default::default(),
        })
    }

    fn set_account_attributes(
        &self,
        _attributes: &definitions::AccountAttributes,
    ) -> Result<(), AccountError> {
        Err(AccountError::Rejected("not registered".into()))
    }
}

#[test]
fn registered_definitions_run_through_the_manager() {
    let resend = fixtures::resend(Ok(vec![DeviceId::PRIMARY]));
    let store = InMemoryJobStore::arc();
    let env = Arc::new(JobEnvironment {
        resender: resend.resender.clone(),
        accounts: Arc::new(Unregistered),
        attachments: Arc::new(InMemoryAttachmentStore::new()),
        protocol_store: resend.store.clone(),
        session_lock: resend.lock.clone(),
        migration_markers: store.clone(),
        process: Arc::new(ProcessState::new()),
    });

    let migrations =
        ApplicationMigrations::new(store.clone()).with(env.session_archive_migration(1));
    let mut registry = JobRegistry::new();
    definitions::register_all(&mut registry, env.clone());
    migrations.register_factories(&mut registry);

    let manager = JobManager::start(
        config(2),
        store.clone(),
        registry,
        ConstraintRegistry::new().with(FlagConstraint::network(true)),
    )
    .unwrap();

    let recipient_id = RecipientId::new(3);
    resend
        .directory
        .upsert_recipient(Recipient::new(recipient_id, ServiceId::new()))
        .unwrap();
    let request = ResendRequest {
        recipient_id,
        sent_timestamp: 1_700_000_000_000,
        content: Content::data(b"again".to_vec()).to_bytes().unwrap(),
        content_hint: ContentHint::Resendable,
        urgent: true,
        group_id: None,
        distribution_id: None,
    };
    let outcome = manager
        .run_synchronously(
            &ResendMessageJob::new(env.resender.clone(), request),
            Duration::from_secs(5),
        )
        .unwrap();
    assert_eq!(outcome, JobOutcome::Succeeded);
    assert_eq!(resend.transport.sent().len(), 1);

    let scheduled = migrations.schedule(&manager, Duration::from_secs(5)).unwrap();
    assert!(matches!(scheduled, MigrationSchedule::Background { .. }));
    let deadline = Instant::now() + Duration::from_secs(5);
    while store.version().unwrap() < 1 {
        assert!(Instant::now() < deadline, "migration marker never advanced");
        thread::sleep(Duration::from_millis(10));
    }
}

fn arb_table() -> impl Strategy<Value = Vec<JobDescriptor>> {
    prop::collection::vec((prop::option::of(0u8..3), 0u8..3, any::<bool>()), 0..40).prop_map(
        |rows| {
            rows.into_iter()
                .enumerate()
                .map(|(index, (queue, factory, running))| {
                    let mut params = JobParameters::default();
                    if let Some(q) = queue {
                        params = params.with_queue(format!("q{q}"));
                    }
                    if let Some(cap) = factory_cap(factory) {
                        params = params.with_max_instances_for_factory(cap);
                    }
                    let mut job = JobDescriptor::new(format!("f{factory}"), None, params);
                    job.sequence = index as u64 + 1;
                    if running {
                        job.state = JobState::Running;
                    }
                    job
                })
                .collect()
        },
    )
}

fn factory_cap(factory: u8) -> Option<usize> {
    match factory {
        0 => Some(1),
        1 => Some(2),
        _ => None,
    }
}

proptest! {
    #[test]
    fn selection_respects_queue_heads_and_caps(jobs in arb_table()) {
        let selection = select_runnable(&jobs, Utc::now(), |_| true, |_| true);

        let mut queues = std::collections::HashSet::new();
        for job in &selection.runnable {
            prop_assert_eq!(job.state, JobState::Pending);
            if let Some(queue) = job.queue_key.as_deref() {
                prop_assert!(queues.insert(queue.to_string()), "two jobs from {}", queue);
                let head = jobs
                    .iter()
                    .filter(|j| j.queue_key.as_deref() == Some(queue))
                    .map(|j| j.sequence)
                    .min();
                prop_assert_eq!(head, Some(job.sequence));
            }
        }

        for factory in 0u8..3 {
            let Some(cap) = factory_cap(factory) else { continue };
            let key = format!("f{factory}");
            let selected = selection.runnable.iter().filter(|j| j.factory_key == key).count();
            let running = jobs
                .iter()
                .filter(|j| j.factory_key == key && j.state == JobState::Running)
                .count();
            if selected > 0 {
                prop_assert!(running + selected <= cap);
            }
        }
    }
}
