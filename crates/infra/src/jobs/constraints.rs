//! Constraint evaluator: named predicates gating job dispatch.
//!
//! A constraint can be polled (`is_satisfied`) and can push a wake-up to the
//! dispatcher through the [`ConstraintNotifier`] it receives in `register`.
//! Notifiers only trigger a re-poll; no job logic runs on the notifying
//! thread.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex, PoisonError};

use tracing::{debug, warn};

use super::executor::Signal;

pub const NETWORK: &str = "network";
pub const CHARGING: &str = "charging";
pub const DECRYPTIONS_DRAINED: &str = "decryptions_drained";

/// Handle a constraint uses to wake the dispatcher.
#[derive(Debug, Clone)]
pub struct ConstraintNotifier {
    tx: mpsc::Sender<Signal>,
}

impl ConstraintNotifier {
    pub(crate) fn new(tx: mpsc::Sender<Signal>) -> Self {
        Self { tx }
    }

    /// Ask the dispatcher to re-evaluate blocked jobs.
    pub fn notify(&self) {
        // The manager may already be gone; nothing to wake then.
        let _ = self.tx.send(Signal::Poll);
    }
}

/// A named precondition for running a job.
pub trait Constraint: Send + Sync {
    fn key(&self) -> &str;

    fn is_satisfied(&self) -> bool;

    /// Receive a notifier to call whenever the constraint becomes satisfied.
    fn register(&self, _notifier: ConstraintNotifier) {}
}

/// In-memory flag plus the notifiers waiting on it.
#[derive(Debug, Default)]
pub struct ConstraintState {
    satisfied: AtomicBool,
    notifiers: Mutex<Vec<ConstraintNotifier>>,
}

impl ConstraintState {
    pub fn new(satisfied: bool) -> Self {
        Self {
            satisfied: AtomicBool::new(satisfied),
            notifiers: Mutex::new(Vec::new()),
        }
    }

    pub fn get(&self) -> bool {
        self.satisfied.load(Ordering::SeqCst)
    }

    /// Update the flag; a false -> true transition wakes every notifier.
    pub fn set(&self, satisfied: bool) {
        let was = self.satisfied.swap(satisfied, Ordering::SeqCst);
        if satisfied && !was {
            let notifiers = self
                .notifiers
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            for notifier in notifiers.iter() {
                notifier.notify();
            }
        }
    }

    pub fn add_notifier(&self, notifier: ConstraintNotifier) {
        self.notifiers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(notifier);
    }
}

/// A constraint backed by a flag the application flips.
///
/// Clones share state, so the application keeps one handle and the registry
/// another.
#[derive(Debug, Clone)]
pub struct FlagConstraint {
    key: &'static str,
    state: Arc<ConstraintState>,
}

impl FlagConstraint {
    pub fn new(key: &'static str, initially: bool) -> Self {
        Self {
            key,
            state: Arc::new(ConstraintState::new(initially)),
        }
    }

    /// Network reachable.
    pub fn network(initially: bool) -> Self {
        Self::new(NETWORK, initially)
    }

    /// Device charging.
    pub fn charging(initially: bool) -> Self {
        Self::new(CHARGING, initially)
    }

    /// The websocket has drained all queued decryptions.
    pub fn decryptions_drained(initially: bool) -> Self {
        Self::new(DECRYPTIONS_DRAINED, initially)
    }

    pub fn set(&self, satisfied: bool) {
        debug!(constraint = self.key, satisfied, "constraint changed");
        self.state.set(satisfied);
    }
}

impl Constraint for FlagConstraint {
    fn key(&self) -> &str {
        self.key
    }

    fn is_satisfied(&self) -> bool {
        self.state.get()
    }

    fn register(&self, notifier: ConstraintNotifier) {
        self.state.add_notifier(notifier);
    }
}

/// Registry of constraint implementations by key.
#[derive(Default)]
pub struct ConstraintRegistry {
    constraints: HashMap<String, Arc<dyn Constraint>>,
    warned: Mutex<HashSet<String>>,
}

impl std::fmt::Debug for ConstraintRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConstraintRegistry")
            .field("keys", &self.constraints.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ConstraintRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, constraint: Arc<dyn Constraint>) {
        self.constraints
            .insert(constraint.key().to_string(), constraint);
    }

    pub fn with(mut self, constraint: impl Constraint + 'static) -> Self {
        self.register(Arc::new(constraint));
        self
    }

    /// Unknown keys are never satisfied.
    pub fn is_satisfied(&self, key: &str) -> bool {
        match self.constraints.get(key) {
            Some(constraint) => constraint.is_satisfied(),
            None => {
                let mut warned = self.warned.lock().unwrap_or_else(PoisonError::into_inner);
                if warned.insert(key.to_string()) {
                    warn!(constraint = key, "unknown constraint key; jobs requiring it will not run");
                }
                false
            }
        }
    }

    pub(crate) fn register_notifier(&self, notifier: &ConstraintNotifier) {
        for constraint in self.constraints.values() {
            constraint.register(notifier.clone());
        }
    }
}
