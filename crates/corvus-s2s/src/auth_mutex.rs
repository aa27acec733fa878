use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

/// Interner of per-remote-domain authentication locks.
///
/// Two tasks authenticating against the same remote domain must not run
/// their handshakes concurrently: interleaved dialback exchanges confuse
/// peers and produce duplicate sessions. Tasks targeting distinct
/// remotes proceed in parallel.
///
/// The table only holds weak references; a lock lives exactly as long as
/// some task holds the `Arc` returned by [`RemoteAuthMutex::lock_for`],
/// and dead entries are swept whenever a new lock is minted.
///
/// Holders must not attempt to take the lock of a different remote while
/// holding one, or two tasks can deadlock against each other.
#[derive(Default)]
pub struct RemoteAuthMutex {
    locks: Mutex<HashMap<String, Weak<tokio::sync::Mutex<()>>>>,
}

impl RemoteAuthMutex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire or create the lock interned for `domain`. Callers with
    /// equal domains (case-insensitively) receive the same lock object.
    pub fn lock_for(&self, domain: &str) -> Arc<tokio::sync::Mutex<()>> {
        let key = domain.to_ascii_lowercase();
        let mut locks = self.locks.lock();
        if let Some(existing) = locks.get(&key).and_then(Weak::upgrade) {
            return existing;
        }
        locks.retain(|_, weak| weak.strong_count() > 0);
        let lock = Arc::new(tokio::sync::Mutex::new(()));
        locks.insert(key, Arc::downgrade(&lock));
        lock
    }

    /// Number of live interned entries, for diagnostics.
    pub fn interned_count(&self) -> usize {
        self.locks
            .lock()
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }
}
