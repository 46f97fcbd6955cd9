use std::sync::{PoisonError, RwLock};

use log::debug;
use zeroize::{Zeroize, Zeroizing};

use super::{MasterKeyStoreTrait, store::SecretStoreError};

/// Caches the master key in memory and provides explicit lock/unlock control.
pub struct MasterKeyVault {
    store: Box<dyn MasterKeyStoreTrait>,
    cached: RwLock<Option<Zeroizing<Vec<u8>>>>,
}

impl MasterKeyVault {
    pub fn new(store: Box<dyn MasterKeyStoreTrait>) -> Self {
        Self {
            store,
            cached: RwLock::new(None),
        }
    }

    pub fn is_unlocked(&self) -> bool {
        self.cached
            .read()
            .map(|guard| guard.is_some())
            .unwrap_or(false)
    }

    pub fn unlock(&self) -> Result<(), SecretStoreError> {
        if self.is_unlocked() {
            return Ok(());
        }
        debug!("[vault] unlock: loading master key");
        let key = self.store.get_or_create()?;
        let mut guard = self.cached.write().map_err(map_poison)?;
        if let Some(mut existing) = guard.take() {
            existing.zeroize();
        }
        *guard = Some(key);
        Ok(())
    }

    pub fn lock(&self) {
        if let Ok(mut guard) = self.cached.write() {
            if let Some(mut key) = guard.take() {
                key.zeroize();
            }
        }
    }

    /// Runs `f` with the master key, unlocking the vault first if needed.
    pub fn with_key<T, F>(&self, f: F) -> Result<T, SecretStoreError>
    where
        F: FnOnce(&[u8]) -> Result<T, SecretStoreError>,
    {
        self.unlock()?;
        let guard = self.cached.read().map_err(map_poison)?;
        let key = guard
            .as_ref()
            .ok_or_else(|| SecretStoreError::Locked("vault is locked".into()))?;
        f(key)
    }
}

fn map_poison<T>(err: PoisonError<T>) -> SecretStoreError {
    SecretStoreError::Store(format!("vault state poisoned: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secrets::store::generate_master_key;
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    struct CountingStore {
        calls: Arc<AtomicUsize>,
    }

    impl MasterKeyStoreTrait for CountingStore {
        fn get_or_create(&self) -> Result<Zeroizing<Vec<u8>>, SecretStoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(generate_master_key())
        }
    }

    #[test]
    fn loads_master_key_once_until_locked() {
        let calls = Arc::new(AtomicUsize::new(0));
        let vault = MasterKeyVault::new(Box::new(CountingStore { calls: calls.clone() }));
        assert!(!vault.is_unlocked());

        vault.with_key(|key| Ok(key.len())).expect("first use");
        vault.with_key(|key| Ok(key.len())).expect("second use");
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        vault.lock();
        assert!(!vault.is_unlocked());
        vault.with_key(|_| Ok(())).expect("after relock");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
