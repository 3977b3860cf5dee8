//! Protocol store: sessions, identities and sender-key state.
//!
//! Every method takes a [`SessionGuard`] so callers must hold the
//! [`SessionLock`]. Concurrent encrypt/decrypt on the same session corrupts
//! ratchet state. Implementations reject guards from any lock other than the
//! one they were built with.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

use rand::RngCore;
use serde::{Deserialize, Serialize};

use courier_core::{DistributionId, ProtocolAddress, ServiceId};

use crate::content::SenderKeyDistributionMessage;
use crate::error::ProtocolError;
use crate::session_lock::{SessionGuard, SessionLock};

/// Public identity key of a peer.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdentityKey(pub [u8; 32]);

/// Manual verification state of a peer identity.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum VerifiedStatus {
    #[default]
    Default,
    Verified,
    Unverified,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityRecord {
    pub identity_key: IdentityKey,
    pub verified: VerifiedStatus,
    /// True until the key has been replaced at least once.
    pub first_use: bool,
}

/// Result of [`ProtocolStore::save_identity`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum IdentityChange {
    New,
    Unchanged,
    Replaced,
}

/// Serialized ratchet state for one device, plus archived previous states.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub current: Option<Vec<u8>>,
    pub previous: Vec<Vec<u8>>,
}

impl SessionRecord {
    const MAX_ARCHIVED_STATES: usize = 40;

    pub fn new(state: Vec<u8>) -> Self {
        Self {
            current: Some(state),
            previous: Vec::new(),
        }
    }

    pub fn has_current_state(&self) -> bool {
        self.current.is_some()
    }

    /// Move the current state into the archive. Returns false if there was none.
    pub fn archive_current_state(&mut self) -> bool {
        match self.current.take() {
            Some(state) => {
                self.previous.insert(0, state);
                self.previous.truncate(Self::MAX_ARCHIVED_STATES);
                true
            }
            None => false,
        }
    }
}

/// Storage for session, identity and sender-key state.
pub trait ProtocolStore: Send + Sync {
    fn load_session(
        &self,
        guard: &SessionGuard<'_>,
        address: &ProtocolAddress,
    ) -> Result<Option<SessionRecord>, ProtocolError>;

    fn store_session(
        &self,
        guard: &SessionGuard<'_>,
        address: &ProtocolAddress,
        record: SessionRecord,
    ) -> Result<(), ProtocolError>;

    /// Archive every device session of one peer. Returns the number archived.
    fn archive_sessions(
        &self,
        guard: &SessionGuard<'_>,
        service_id: ServiceId,
    ) -> Result<usize, ProtocolError>;

    /// Archive every session in the store. Returns the number archived.
    fn archive_all_sessions(&self, guard: &SessionGuard<'_>) -> Result<usize, ProtocolError>;

    fn identity(
        &self,
        guard: &SessionGuard<'_>,
        service_id: ServiceId,
    ) -> Result<Option<IdentityRecord>, ProtocolError>;

    /// Save a peer identity key.
    ///
    /// A replaced key archives the peer's sessions and forgets which of its
    /// devices already hold our sender keys.
    fn save_identity(
        &self,
        guard: &SessionGuard<'_>,
        service_id: ServiceId,
        identity_key: IdentityKey,
    ) -> Result<IdentityChange, ProtocolError>;

    fn set_verified(
        &self,
        guard: &SessionGuard<'_>,
        service_id: ServiceId,
        status: VerifiedStatus,
    ) -> Result<(), ProtocolError>;

    /// Trust-on-first-use: unknown peers are trusted; known peers must match
    /// the stored key and not be explicitly unverified.
    fn is_trusted_identity(
        &self,
        guard: &SessionGuard<'_>,
        service_id: ServiceId,
        identity_key: &IdentityKey,
    ) -> Result<bool, ProtocolError>;

    /// Fetch our sender-key distribution message for `distribution_id`,
    /// creating fresh sender-key state if none exists yet.
    fn sender_key_distribution_message(
        &self,
        guard: &SessionGuard<'_>,
        distribution_id: DistributionId,
    ) -> Result<SenderKeyDistributionMessage, ProtocolError>;

    /// Record (append-only) that `addresses` now hold our sender key.
    fn mark_sender_key_shared_with(
        &self,
        guard: &SessionGuard<'_>,
        distribution_id: DistributionId,
        addresses: &[ProtocolAddress],
    ) -> Result<(), ProtocolError>;

    fn sender_key_shared_with(
        &self,
        guard: &SessionGuard<'_>,
        distribution_id: DistributionId,
    ) -> Result<BTreeSet<ProtocolAddress>, ProtocolError>;
}

#[derive(Debug, Default)]
struct StoreState {
    sessions: HashMap<ProtocolAddress, SessionRecord>,
    identities: HashMap<ServiceId, IdentityRecord>,
    sender_keys: HashMap<DistributionId, SenderKeyDistributionMessage>,
    shared_with: HashMap<DistributionId, BTreeSet<ProtocolAddress>>,
}

/// In-memory protocol store for tests/dev.
#[derive(Debug)]
pub struct InMemoryProtocolStore {
    lock: Arc<SessionLock>,
    state: RwLock<StoreState>,
}

impl InMemoryProtocolStore {
    /// A store guarded by `lock`.
    pub fn new(lock: Arc<SessionLock>) -> Self {
        Self {
            lock,
            state: RwLock::new(StoreState::default()),
        }
    }

    pub fn session_lock(&self) -> &Arc<SessionLock> {
        &self.lock
    }

    fn check(&self, guard: &SessionGuard<'_>) -> Result<(), ProtocolError> {
        if guard.is_for(&self.lock) {
            Ok(())
        } else {
            Err(ProtocolError::ForeignGuard)
        }
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, StoreState>, ProtocolError> {
        self.state
            .read()
            .map_err(|_| ProtocolError::Storage("lock poisoned".to_string()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, StoreState>, ProtocolError> {
        self.state
            .write()
            .map_err(|_| ProtocolError::Storage("lock poisoned".to_string()))
    }
}

fn archive_matching(state: &mut StoreState, service_id: Option<ServiceId>) -> usize {
    let mut archived = 0;
    for (address, record) in state.sessions.iter_mut() {
        if service_id.is_some_and(|s| address.service_id != s) {
            continue;
        }
        if record.archive_current_state() {
            archived += 1;
        }
    }
    archived
}

impl ProtocolStore for InMemoryProtocolStore {
    fn load_session(
        &self,
        guard: &SessionGuard<'_>,
        address: &ProtocolAddress,
    ) -> Result<Option<SessionRecord>, ProtocolError> {
        self.check(guard)?;
        Ok(self.read()?.sessions.get(address).cloned())
    }

    fn store_session(
        &self,
        guard: &SessionGuard<'_>,
        address: &ProtocolAddress,
        record: SessionRecord,
    ) -> Result<(), ProtocolError> {
        self.check(guard)?;
        self.write()?.sessions.insert(*address, record);
        Ok(())
    }

    fn archive_sessions(
        &self,
        guard: &SessionGuard<'_>,
        service_id: ServiceId,
    ) -> Result<usize, ProtocolError> {
        self.check(guard)?;
        Ok(archive_matching(&mut *self.write()?, Some(service_id)))
    }

    fn archive_all_sessions(&self, guard: &SessionGuard<'_>) -> Result<usize, ProtocolError> {
        self.check(guard)?;
        Ok(archive_matching(&mut *self.write()?, None))
    }

    fn identity(
        &self,
        guard: &SessionGuard<'_>,
        service_id: ServiceId,
    ) -> Result<Option<IdentityRecord>, ProtocolError> {
        self.check(guard)?;
        Ok(self.read()?.identities.get(&service_id).cloned())
    }

    fn save_identity(
        &self,
        guard: &SessionGuard<'_>,
        service_id: ServiceId,
        identity_key: IdentityKey,
    ) -> Result<IdentityChange, ProtocolError> {
        self.check(guard)?;
        let mut state = self.write()?;

        let change = match state.identities.get(&service_id) {
            None => IdentityChange::New,
            Some(existing) if existing.identity_key == identity_key => IdentityChange::Unchanged,
            Some(_) => IdentityChange::Replaced,
        };

        match change {
            IdentityChange::Unchanged => {}
            IdentityChange::New => {
                state.identities.insert(
                    service_id,
                    IdentityRecord {
                        identity_key,
                        verified: VerifiedStatus::Default,
                        first_use: true,
                    },
                );
            }
            IdentityChange::Replaced => {
                state.identities.insert(
                    service_id,
                    IdentityRecord {
                        identity_key,
                        verified: VerifiedStatus::Default,
                        first_use: false,
                    },
                );
                archive_matching(&mut state, Some(service_id));
                for shared in state.shared_with.values_mut() {
                    shared.retain(|address| address.service_id != service_id);
                }
            }
        }

        Ok(change)
    }

    fn set_verified(
        &self,
        guard: &SessionGuard<'_>,
        service_id: ServiceId,
        status: VerifiedStatus,
    ) -> Result<(), ProtocolError> {
        self.check(guard)?;
        let mut state = self.write()?;
        let record = state
            .identities
            .get_mut(&service_id)
            .ok_or(ProtocolError::UnknownIdentity(service_id))?;
        record.verified = status;
        Ok(())
    }

    fn is_trusted_identity(
        &self,
        guard: &SessionGuard<'_>,
        service_id: ServiceId,
        identity_key: &IdentityKey,
    ) -> Result<bool, ProtocolError> {
        self.check(guard)?;
        Ok(match self.read()?.identities.get(&service_id) {
            None => true,
            Some(record) => {
                record.identity_key == *identity_key
                    && record.verified != VerifiedStatus::Unverified
            }
        })
    }

    fn sender_key_distribution_message(
        &self,
        guard: &SessionGuard<'_>,
        distribution_id: DistributionId,
    ) -> Result<SenderKeyDistributionMessage, ProtocolError> {
        self.check(guard)?;
        let mut state = self.write()?;
        let message = state
            .sender_keys
            .entry(distribution_id)
            .or_insert_with(|| {
                let mut rng = rand::thread_rng();
                let mut chain_key = [0u8; 32];
                rng.fill_bytes(&mut chain_key);
                SenderKeyDistributionMessage {
                    distribution_id,
                    chain_id: rng.next_u32() & 0x7fff_ffff,
                    iteration: 0,
                    chain_key,
                }
            });
        Ok(message.clone())
    }

    fn mark_sender_key_shared_with(
        &self,
        guard: &SessionGuard<'_>,
        distribution_id: DistributionId,
        addresses: &[ProtocolAddress],
    ) -> Result<(), ProtocolError> {
        self.check(guard)?;
        self.write()?
            .shared_with
            .entry(distribution_id)
            .or_default()
            .extend(addresses.iter().copied());
        Ok(())
    }

    fn sender_key_shared_with(
        &self,
        guard: &SessionGuard<'_>,
        distribution_id: DistributionId,
    ) -> Result<BTreeSet<ProtocolAddress>, ProtocolError> {
        self.check(guard)?;
        Ok(self
            .read()?
            .shared_with
            .get(&distribution_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session_lock::SessionLock;
    use courier_core::DeviceId;

    fn address(service_id: ServiceId, device: u32) -> ProtocolAddress {
        ProtocolAddress::new(service_id, DeviceId::new(device))
    }

    #[test]
    fn sender_key_state_is_created_once() {
        let lock = Arc::new(SessionLock::new());
        let store = InMemoryProtocolStore::new(lock.clone());
        let distribution_id = DistributionId::new();

        let guard = lock.acquire();
        let first = store
            .sender_key_distribution_message(&guard, distribution_id)
            .unwrap();
        let second = store
            .sender_key_distribution_message(&guard, distribution_id)
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(first.distribution_id, distribution_id);
    }

    #[test]
    fn shared_with_is_append_only() {
        let lock = Arc::new(SessionLock::new());
        let store = InMemoryProtocolStore::new(lock.clone());
        let distribution_id = DistributionId::new();
        let peer = ServiceId::new();

        let guard = lock.acquire();
        store
            .mark_sender_key_shared_with(&guard, distribution_id, &[address(peer, 1)])
            .unwrap();
        store
            .mark_sender_key_shared_with(&guard, distribution_id, &[address(peer, 2)])
            .unwrap();

        let shared = store.sender_key_shared_with(&guard, distribution_id).unwrap();
        assert_eq!(
            shared.into_iter().collect::<Vec<_>>(),
            vec![address(peer, 1), address(peer, 2)]
        );
    }

    #[test]
    fn replaced_identity_archives_sessions_and_forgets_sender_keys() {
        let lock = Arc::new(SessionLock::new());
        let store = InMemoryProtocolStore::new(lock.clone());
        let distribution_id = DistributionId::new();
        let peer = ServiceId::new();
        let other = ServiceId::new();

        let guard = lock.acquire();
        assert_eq!(
            store.save_identity(&guard, peer, IdentityKey([1; 32])).unwrap(),
            IdentityChange::New
        );
        store
            .store_session(&guard, &address(peer, 1), SessionRecord::new(vec![1, 2, 3]))
            .unwrap();
        store
            .mark_sender_key_shared_with(
                &guard,
                distribution_id,
                &[address(peer, 1), address(other, 1)],
            )
            .unwrap();

        assert_eq!(
            store.save_identity(&guard, peer, IdentityKey([1; 32])).unwrap(),
            IdentityChange::Unchanged
        );
        assert_eq!(
            store.save_identity(&guard, peer, IdentityKey([2; 32])).unwrap(),
            IdentityChange::Replaced
        );

        let session = store.load_session(&guard, &address(peer, 1)).unwrap().unwrap();
        assert!(!session.has_current_state());
        assert_eq!(session.previous, vec![vec![1, 2, 3]]);

        let shared = store.sender_key_shared_with(&guard, distribution_id).unwrap();
        assert_eq!(shared.into_iter().collect::<Vec<_>>(), vec![address(other, 1)]);

        let record = store.identity(&guard, peer).unwrap().unwrap();
        assert!(!record.first_use);
    }

    #[test]
    fn trust_follows_verification_state() {
        let lock = Arc::new(SessionLock::new());
        let store = InMemoryProtocolStore::new(lock.clone());
        let peer = ServiceId::new();
        let key = IdentityKey([5; 32]);

        let guard = lock.acquire();
        assert!(store.is_trusted_identity(&guard, peer, &key).unwrap());
        assert!(matches!(
            store.set_verified(&guard, peer, VerifiedStatus::Verified),
            Err(ProtocolError::UnknownIdentity(_))
        ));

        store.save_identity(&guard, peer, key).unwrap();
        assert!(store.is_trusted_identity(&guard, peer, &key).unwrap());
        assert!(!store.is_trusted_identity(&guard, peer, &IdentityKey([6; 32])).unwrap());

        store.set_verified(&guard, peer, VerifiedStatus::Unverified).unwrap();
        assert!(!store.is_trusted_identity(&guard, peer, &key).unwrap());
    }

    #[test]
    fn archive_all_sessions_counts_live_sessions() {
        let lock = Arc::new(SessionLock::new());
        let store = InMemoryProtocolStore::new(lock.clone());
        let guard = lock.acquire();

        for device in 1..=3 {
            store
                .store_session(
                    &guard,
                    &address(ServiceId::new(), device),
                    SessionRecord::new(vec![device as u8]),
                )
                .unwrap();
        }
        store
            .store_session(&guard, &address(ServiceId::new(), 1), SessionRecord::default())
            .unwrap();

        assert_eq!(store.archive_all_sessions(&guard).unwrap(), 3);
        assert_eq!(store.archive_all_sessions(&guard).unwrap(), 0);
    }

    #[test]
    fn guard_from_another_lock_is_rejected() {
        let lock = Arc::new(SessionLock::new());
        let store = InMemoryProtocolStore::new(lock.clone());
        let address = address(ServiceId::new(), 1);

        let stranger = SessionLock::new();
        let foreign = stranger.acquire();
        assert_eq!(
            store.store_session(&foreign, &address, SessionRecord::new(vec![9])),
            Err(ProtocolError::ForeignGuard)
        );
        assert!(!lock.is_held());
        assert_eq!(
            store.archive_all_sessions(&foreign),
            Err(ProtocolError::ForeignGuard)
        );
        drop(foreign);

        let guard = store.session_lock().acquire();
        assert_eq!(store.load_session(&guard, &address).unwrap(), None);
    }
}
