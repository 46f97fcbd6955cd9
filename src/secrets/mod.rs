pub mod file_store;
pub mod keyring_store;
pub mod store;
pub mod vault;

use std::path::Path;

use serde::{Deserialize, Serialize};

/// Trait for master key storage backends.
pub trait MasterKeyStoreTrait: Send + Sync {
    fn get_or_create(&self) -> Result<zeroize::Zeroizing<Vec<u8>>, store::SecretStoreError>;
}

/// Where the master key that seals order private keys is kept.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MasterKeyBackend {
    /// OS keyring entry for the running account.
    #[default]
    Keyring,
    /// Owner-only `master.key` file inside the data directory.
    File,
}

/// Create the master key store selected by configuration.
pub fn create_master_key_store(
    backend: MasterKeyBackend,
    service: &str,
    data_dir: &Path,
) -> Box<dyn MasterKeyStoreTrait> {
    match backend {
        MasterKeyBackend::Keyring => {
            log::info!("[secrets] using OS keyring master key store (service {service})");
            Box::new(keyring_store::MasterKeyStore::new(service))
        }
        MasterKeyBackend::File => {
            let path = data_dir.join("master.key");
            log::info!("[secrets] using file master key store at {}", path.display());
            Box::new(file_store::FileMasterKeyStore::new(path))
        }
    }
}
