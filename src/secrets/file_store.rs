use std::{fs, path::PathBuf};

use log::info;
use zeroize::Zeroizing;

use super::{
    MasterKeyStoreTrait,
    store::{MASTER_KEY_LEN, SecretStoreError, generate_master_key},
};
use crate::storage::atomic::{ensure_private_dir, write_atomic};

/// Master key kept in an owner-only file, for service accounts without a
/// usable keyring session.
pub struct FileMasterKeyStore {
    path: PathBuf,
}

impl FileMasterKeyStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl MasterKeyStoreTrait for FileMasterKeyStore {
    fn get_or_create(&self) -> Result<Zeroizing<Vec<u8>>, SecretStoreError> {
        match fs::read(&self.path) {
            Ok(bytes) => {
                let key = Zeroizing::new(bytes);
                if key.len() != MASTER_KEY_LEN {
                    return Err(SecretStoreError::Store(format!(
                        "master key file {} has length {}, expected {}",
                        self.path.display(),
                        key.len(),
                        MASTER_KEY_LEN
                    )));
                }
                Ok(key)
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                info!("[secrets] creating master key file {}", self.path.display());
                if let Some(parent) = self.path.parent() {
                    ensure_private_dir(parent)
                        .map_err(|err| SecretStoreError::Unavailable(err.to_string()))?;
                }
                let key = generate_master_key();
                write_atomic(&self.path, &key)
                    .map_err(|err| SecretStoreError::Store(err.to_string()))?;
                Ok(key)
            }
            Err(err) => Err(SecretStoreError::Unavailable(format!(
                "cannot read master key file {}: {err}",
                self.path.display()
            ))),
        }
    }
}
