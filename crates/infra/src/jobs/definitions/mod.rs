//! Concrete jobs and the collaborators they run against.
//!
//! Each job serializes its own payload as JSON and is rebuilt from the stored
//! descriptor by the factory registered in [`register_all`].

pub mod attachment_mark_uploaded;
pub mod migrations;
pub mod refresh_attributes;
pub mod resend_message;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use courier_protocol::{MessageResender, ProtocolStore, SessionLock};

use super::job::JobRegistry;
use super::store::MigrationMarkerStore;

pub use attachment_mark_uploaded::{
    AttachmentError, AttachmentMarkUploadedJob, AttachmentRecord, AttachmentStore,
    InMemoryAttachmentStore,
};
pub use migrations::{
    ApplicationMigrations, Migration, MigrationCompleteJob, MigrationJob, MigrationSchedule,
    SessionArchiveMigration,
};
pub use refresh_attributes::{
    AccountAttributes, AccountError, AccountManager, LocalAccount, RefreshAttributesJob,
};
pub use resend_message::ResendMessageJob;

/// Every job kind this crate knows how to rebuild.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum JobKind {
    ResendMessage,
    RefreshAttributes,
    AttachmentMarkUploaded,
    MigrationComplete,
}

impl JobKind {
    pub const ALL: [JobKind; 4] = [
        JobKind::ResendMessage,
        JobKind::RefreshAttributes,
        JobKind::AttachmentMarkUploaded,
        JobKind::MigrationComplete,
    ];

    pub fn factory_key(self) -> &'static str {
        match self {
            JobKind::ResendMessage => resend_message::KEY,
            JobKind::RefreshAttributes => refresh_attributes::KEY,
            JobKind::AttachmentMarkUploaded => attachment_mark_uploaded::KEY,
            JobKind::MigrationComplete => migrations::COMPLETE_KEY,
        }
    }

    pub fn from_factory_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.factory_key() == key)
    }
}

/// Per-process flags that are deliberately not persisted.
#[derive(Debug, Default)]
pub struct ProcessState {
    attributes_refreshed: AtomicBool,
}

impl ProcessState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attributes_refreshed(&self) -> bool {
        self.attributes_refreshed.load(Ordering::SeqCst)
    }

    pub fn mark_attributes_refreshed(&self) {
        self.attributes_refreshed.store(true, Ordering::SeqCst);
    }
}

/// Collaborators shared by every job factory.
#[derive(Clone)]
pub struct JobEnvironment {
    pub resender: MessageResender,
    pub accounts: Arc<dyn AccountManager>,
    pub attachments: Arc<dyn AttachmentStore>,
    pub protocol_store: Arc<dyn ProtocolStore>,
    pub session_lock: Arc<SessionLock>,
    pub migration_markers: Arc<dyn MigrationMarkerStore>,
    pub process: Arc<ProcessState>,
}

impl std::fmt::Debug for JobEnvironment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobEnvironment")
            .field("process", &self.process)
            .finish_non_exhaustive()
    }
}

impl JobEnvironment {
    /// A [`SessionArchiveMigration`] over this environment's protocol store.
    pub fn session_archive_migration(&self, version: u32) -> Arc<dyn Migration> {
        Arc::new(SessionArchiveMigration::new(
            version,
            self.protocol_store.clone(),
            self.session_lock.clone(),
        ))
    }
}

/// Register a factory for every [`JobKind`].
///
/// Migration jobs are registered separately by
/// [`ApplicationMigrations::register_factories`], since their set depends
/// on the application.
pub fn register_all(registry: &mut JobRegistry, env: Arc<JobEnvironment>) {
    resend_message::register(registry, env.resender.clone());
    refresh_attributes::register(registry, env.accounts.clone(), env.process.clone());
    attachment_mark_uploaded::register(registry, env.attachments.clone());
    migrations::register_completion(registry, env.migration_markers.clone());
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn factory_keys_round_trip() {
        for kind in JobKind::ALL {
            assert_eq!(JobKind::from_factory_key(kind.factory_key()), Some(kind));
        }
        assert_eq!(JobKind::from_factory_key("PushGroupSendJob"), None);
    }

    #[test]
    fn process_state_starts_unrefreshed() {
        let state = ProcessState::new();
        assert!(!state.attributes_refreshed());
        state.mark_attributes_refreshed();
        assert!(state.attributes_refreshed());
    }
}
