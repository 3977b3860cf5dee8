//! Process-wide lock over the protocol store.
//!
//! Every operation on [`ProtocolStore`](crate::store::ProtocolStore) takes a
//! `&SessionGuard`, and a store only accepts guards minted by the lock it was
//! built with (see [`SessionGuard::is_for`]). Code that
//! already owns a guard passes it down instead of acquiring again; nested
//! `acquire()` calls on the owning thread are still allowed and release the
//! lock only when the outermost guard drops.
//!
//! There is no timeout: critical sections never wait on I/O.

use parking_lot::{ReentrantMutex, ReentrantMutexGuard};

/// Reentrant mutual-exclusion guard over session/identity/sender-key state.
#[derive(Debug, Default)]
pub struct SessionLock {
    inner: ReentrantMutex<()>,
}

impl SessionLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until the lock is available and return a scoped guard.
    pub fn acquire(&self) -> SessionGuard<'_> {
        SessionGuard {
            lock: self,
            _guard: self.inner.lock(),
        }
    }

    /// Whether any thread currently holds the lock.
    pub fn is_held(&self) -> bool {
        self.inner.is_locked()
    }

    pub fn is_held_by_current_thread(&self) -> bool {
        self.inner.is_owned_by_current_thread()
    }
}

/// Proof that the [`SessionLock`] is held by the current thread.
///
/// Not `Send`: a guard can never leave the thread that acquired it.
#[must_use = "the session lock is released as soon as the guard is dropped"]
pub struct SessionGuard<'a> {
    lock: &'a SessionLock,
    _guard: ReentrantMutexGuard<'a, ()>,
}

impl SessionGuard<'_> {
    /// Whether this guard was acquired from `lock`.
    pub fn is_for(&self, lock: &SessionLock) -> bool {
        std::ptr::eq(self.lock, lock)
    }
}

impl core::fmt::Debug for SessionGuard<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("SessionGuard")
    }
}
