pub mod atomic;
pub mod keystore;

use std::sync::{Arc, Mutex, MutexGuard};

/// Process-wide lock around read-modify-write sequences on the configuration
/// file and the order key store. Constructed once at startup and handed to
/// every store that needs it.
#[derive(Clone, Default)]
pub struct StateLock {
    inner: Arc<Mutex<()>>,
}

impl StateLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// A poisoned lock only means another writer panicked mid-sequence; every
    /// write is atomic on disk, so the guard is still safe to reuse.
    pub fn acquire(&self) -> MutexGuard<'_, ()> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
