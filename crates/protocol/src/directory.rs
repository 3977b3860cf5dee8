//! Recipient directory: delivery addresses, registration and group membership.

use std::collections::HashMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use courier_core::{DistributionId, GroupId, RecipientId, ServiceId};

use crate::error::DirectoryError;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RegistrationState {
    #[default]
    Unknown,
    Registered,
    NotRegistered,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    pub id: RecipientId,
    pub service_id: Option<ServiceId>,
    pub registered: RegistrationState,
}

impl Recipient {
    pub fn new(id: RecipientId, service_id: ServiceId) -> Self {
        Self {
            id,
            service_id: Some(service_id),
            registered: RegistrationState::Registered,
        }
    }

    pub fn is_unregistered(&self) -> bool {
        self.registered == RegistrationState::NotRegistered
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupRecord {
    pub group_id: GroupId,
    pub distribution_id: DistributionId,
    pub members: Vec<RecipientId>,
}

impl GroupRecord {
    pub fn is_member(&self, recipient_id: RecipientId) -> bool {
        self.members.contains(&recipient_id)
    }
}

/// A broadcast list: sender-key scope without a group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributionListRecord {
    pub name: String,
    pub distribution_id: DistributionId,
    pub members: Vec<RecipientId>,
}

impl DistributionListRecord {
    pub fn is_member(&self, recipient_id: RecipientId) -> bool {
        self.members.contains(&recipient_id)
    }
}

/// Sealed-sender credentials for delivering without revealing the sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnidentifiedAccess {
    pub access_key: [u8; 16],
    pub certificate: Vec<u8>,
}

/// Lookups the resend path needs.
pub trait RecipientDirectory: Send + Sync {
    fn resolve(&self, recipient_id: RecipientId) -> Result<Recipient, DirectoryError>;

    fn group_by_distribution_id(
        &self,
        distribution_id: DistributionId,
    ) -> Result<Option<GroupRecord>, DirectoryError>;

    fn distribution_list_by_distribution_id(
        &self,
        distribution_id: DistributionId,
    ) -> Result<Option<DistributionListRecord>, DirectoryError>;

    fn unidentified_access(
        &self,
        recipient_id: RecipientId,
    ) -> Result<Option<UnidentifiedAccess>, DirectoryError>;
}

#[derive(Debug, Default)]
struct DirectoryState {
    recipients: HashMap<RecipientId, Recipient>,
    groups: HashMap<DistributionId, GroupRecord>,
    lists: HashMap<DistributionId, DistributionListRecord>,
    access: HashMap<RecipientId, UnidentifiedAccess>,
}

/// In-memory directory for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryRecipientDirectory {
    state: RwLock<DirectoryState>,
}

impl InMemoryRecipientDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_write<R>(&self, f: impl FnOnce(&mut DirectoryState) -> R) -> Result<R, DirectoryError> {
        let mut state = self
            .state
            .write()
            .map_err(|_| DirectoryError::Storage("lock poisoned".to_string()))?;
        Ok(f(&mut state))
    }

    fn with_read<R>(&self, f: impl FnOnce(&DirectoryState) -> R) -> Result<R, DirectoryError> {
        let state = self
            .state
            .read()
            .map_err(|_| DirectoryError::Storage("lock poisoned".to_string()))?;
        Ok(f(&state))
    }

    pub fn upsert_recipient(&self, recipient: Recipient) -> Result<(), DirectoryError> {
        self.with_write(|s| {
            s.recipients.insert(recipient.id, recipient);
        })
    }

    pub fn set_registered(
        &self,
        recipient_id: RecipientId,
        registered: RegistrationState,
    ) -> Result<(), DirectoryError> {
        self.with_write(|s| match s.recipients.get_mut(&recipient_id) {
            Some(recipient) => {
                recipient.registered = registered;
                Ok(())
            }
            None => Err(DirectoryError::RecipientNotFound(recipient_id)),
        })?
    }

    pub fn upsert_group(&self, group: GroupRecord) -> Result<(), DirectoryError> {
        self.with_write(|s| {
            s.groups.insert(group.distribution_id, group);
        })
    }

    pub fn upsert_distribution_list(
        &self,
        list: DistributionListRecord,
    ) -> Result<(), DirectoryError> {
        self.with_write(|s| {
            s.lists.insert(list.distribution_id, list);
        })
    }

    pub fn set_unidentified_access(
        &self,
        recipient_id: RecipientId,
        access: UnidentifiedAccess,
    ) -> Result<(), DirectoryError> {
        self.with_write(|s| {
            s.access.insert(recipient_id, access);
        })
    }
}

impl RecipientDirectory for InMemoryRecipientDirectory {
    fn resolve(&self, recipient_id: RecipientId) -> Result<Recipient, DirectoryError> {
        self.with_read(|s| s.recipients.get(&recipient_id).cloned())?
            .ok_or(DirectoryError::RecipientNotFound(recipient_id))
    }

    fn group_by_distribution_id(
        &self,
        distribution_id: DistributionId,
    ) -> Result<Option<GroupRecord>, DirectoryError> {
        self.with_read(|s| s.groups.get(&distribution_id).cloned())
    }

    fn distribution_list_by_distribution_id(
        &self,
        distribution_id: DistributionId,
    ) -> Result<Option<DistributionListRecord>, DirectoryError> {
        self.with_read(|s| s.lists.get(&distribution_id).cloned())
    }

    fn unidentified_access(
        &self,
        recipient_id: RecipientId,
    ) -> Result<Option<UnidentifiedAccess>, DirectoryError> {
        self.with_read(|s| s.access.get(&recipient_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_unknown_recipient_fails() {
        let directory = InMemoryRecipientDirectory::new();
        assert_eq!(
            directory.resolve(RecipientId::new(9)),
            Err(DirectoryError::RecipientNotFound(RecipientId::new(9)))
        );
    }

    #[test]
    fn registration_state_updates_in_place() {
        let directory = InMemoryRecipientDirectory::new();
        let id = RecipientId::new(1);
        directory
            .upsert_recipient(Recipient::new(id, ServiceId::new()))
            .unwrap();
        assert!(!directory.resolve(id).unwrap().is_unregistered());

        directory
            .set_registered(id, RegistrationState::NotRegistered)
            .unwrap();
        assert!(directory.resolve(id).unwrap().is_unregistered());
    }

    #[test]
    fn groups_and_lists_are_keyed_by_distribution_id() {
        let directory = InMemoryRecipientDirectory::new();
        let distribution_id = DistributionId::new();
        directory
            .upsert_distribution_list(DistributionListRecord {
                name: "friends".into(),
                distribution_id,
                members: vec![RecipientId::new(3)],
            })
            .unwrap();

        assert!(directory
            .group_by_distribution_id(distribution_id)
            .unwrap()
            .is_none());
        let list = directory
            .distribution_list_by_distribution_id(distribution_id)
            .unwrap()
            .unwrap();
        assert!(list.is_member(RecipientId::new(3)));
        assert!(!list.is_member(RecipientId::new(4)));
    }
}
