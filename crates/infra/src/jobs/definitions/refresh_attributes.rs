//! Pushes the local account's attributes to the service.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::jobs::constraints::NETWORK;
use crate::jobs::job::{Job, JobError, JobRegistry};
use crate::jobs::types::{JobDescriptor, JobParameters};

use super::ProcessState;

pub const KEY: &str = "RefreshAttributesJob";

const LIFESPAN: Duration = Duration::from_secs(30 * 24 * 60 * 60);
const MAX_INSTANCES: usize = 2;

/// Attributes the service keeps about this account.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountAttributes {
    pub registration_id: u32,
    pub pni_registration_id: u32,
    pub fetches_messages: bool,
    pub unidentified_access_key: Option<[u8; 16]>,
    pub universal_unidentified_access: bool,
    pub discoverable_by_phone_number: bool,
    pub device_name: Option<String>,
    pub recovery_password: Option<String>,
    pub capabilities: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalAccount {
    pub registered: bool,
    pub attributes: AccountAttributes,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AccountError {
    #[error("network failure: {0}")]
    Network(String),
    #[error("rejected by service: {0}")]
    Rejected(String),
    #[error("account storage error: {0}")]
    Storage(String),
}

impl From<AccountError> for JobError {
    fn from(err: AccountError) -> Self {
        match err {
            AccountError::Network(e) => JobError::Network(e),
            AccountError::Rejected(e) => JobError::Permanent(e),
            AccountError::Storage(e) => JobError::Io(e),
        }
    }
}

/// Local account state and the service endpoint that stores it.
pub trait AccountManager: Send + Sync {
    fn local_account(&self) -> Result<LocalAccount, AccountError>;

    fn set_account_attributes(&self, attributes: &AccountAttributes) -> Result<(), AccountError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct RefreshData {
    #[serde(default = "default_forced")]
    forced: bool,
}

fn default_forced() -> bool {
    true
}

/// Refreshes account attributes once per process, or every time when forced.
pub struct RefreshAttributesJob {
    forced: bool,
    accounts: Arc<dyn AccountManager>,
    process: Arc<ProcessState>,
}

impl std::fmt::Debug for RefreshAttributesJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshAttributesJob")
            .field("forced", &self.forced)
            .finish_non_exhaustive()
    }
}

impl RefreshAttributesJob {
    pub fn new(accounts: Arc<dyn AccountManager>, process: Arc<ProcessState>, forced: bool) -> Self {
        Self {
            forced,
            accounts,
            process,
        }
    }
}

impl Job for RefreshAttributesJob {
    fn factory_key(&self) -> &str {
        KEY
    }

    fn parameters(&self) -> JobParameters {
        JobParameters::default()
            .with_queue(KEY)
            .with_constraint(NETWORK)
            .with_max_instances_for_factory(MAX_INSTANCES)
            .with_lifespan(LIFESPAN)
            .with_unlimited_attempts()
    }

    fn serialize(&self) -> Result<Option<Vec<u8>>, JobError> {
        Ok(Some(serde_json::to_vec(&RefreshData {
            forced: self.forced,
        })?))
    }

    fn run(&mut self) -> Result<(), JobError> {
        let account = self.accounts.local_account()?;
        if !account.registered {
            warn!("not registered, skipping attribute refresh");
            return Ok(());
        }
        if !self.forced && self.process.attributes_refreshed() {
            info!("attributes already refreshed this run, skipping");
            return Ok(());
        }

        self.accounts.set_account_attributes(&account.attributes)?;
        self.process.mark_attributes_refreshed();
        info!(
            registration_id = account.attributes.registration_id,
            capabilities = account.attributes.capabilities.len(),
            "account attributes refreshed"
        );
        Ok(())
    }

    fn should_retry(&self, error: &JobError) -> bool {
        matches!(error, JobError::Network(_))
    }

    fn on_failure(&mut self) {
        warn!("failed to refresh account attributes");
    }
}

pub(crate) fn register(
    registry: &mut JobRegistry,
    accounts: Arc<dyn AccountManager>,
    process: Arc<ProcessState>,
) {
    registry.register(KEY, move |descriptor: &JobDescriptor| {
        let forced = match descriptor.serialized_data.as_deref() {
            Some(data) => serde_json::from_slice::<RefreshData>(data)?.forced,
            None => default_forced(),
        };
        Ok(Box::new(RefreshAttributesJob::new(accounts.clone(), process.clone(), forced))
            as Box<dyn Job>)
    });
}
