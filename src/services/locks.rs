use std::{
    collections::HashMap,
    sync::{Arc, Mutex as StdMutex, PoisonError},
};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

type LockMap = Arc<StdMutex<HashMap<Uuid, Arc<Mutex<()>>>>>;

/// One async mutex per session id. An entry lives only while someone holds or
/// waits for it, so ids that never existed leave nothing behind.
#[derive(Clone, Default)]
pub struct SessionLocks {
    inner: LockMap,
}

/// Exclusive access to one session. Dropping it releases the session and removes
/// the map entry when nobody else is waiting.
pub struct SessionGuard {
    id: Uuid,
    map: LockMap,
    guard: Option<OwnedMutexGuard<()>>,
}

impl SessionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `id`.
    pub async fn acquire(&self, id: Uuid) -> SessionGuard {
        let lock = {
            let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            map.entry(id).or_default().clone()
        };
        SessionGuard {
            id,
            map: self.inner.clone(),
            guard: Some(lock.lock_owned().await),
        }
    }

    /// Number of sessions currently held or awaited.
    pub fn tracked(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut map = self.map.lock().unwrap_or_else(PoisonError::into_inner);
        // Waiters hold their own clone of the Arc; only the map's copy is left when idle.
        if map.get(&self.id).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            map.remove(&self.id);
        }
    }
}

type TokenMap = Arc<StdMutex<HashMap<Uuid, CancellationToken>>>;

/// Cancellation tokens of the work currently running for each session, so a cancel
/// can interrupt it without waiting for the session lock.
#[derive(Clone, Default)]
pub struct CancelRegistry {
    inner: TokenMap,
}

/// A registered token. Dropping it unregisters the session.
pub struct Registration {
    id: Uuid,
    token: CancellationToken,
    map: TokenMap,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `token` for `id`. Callers hold the session lock, so one token per
    /// session is live at a time.
    pub fn register(&self, id: Uuid, token: CancellationToken) -> Registration {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, token.clone());
        Registration {
            id,
            token,
            map: self.inner.clone(),
        }
    }

    /// Cancel the work registered for `id`. Returns false when nothing was running.
    pub fn cancel(&self, id: Uuid) -> bool {
        let map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        match map.get(&id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn tracked(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Registration {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.map
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}
