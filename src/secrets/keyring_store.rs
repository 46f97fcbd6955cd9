use base64::{Engine as _, engine::general_purpose};
use keyring::Entry;
use log::info;
use zeroize::Zeroizing;

use super::{
    MasterKeyStoreTrait,
    store::{MASTER_KEY_LEN, SecretStoreError, generate_master_key},
};

const MASTER_KEY_ACCOUNT: &str = "order-key-master";

/// Master key held in the OS keyring (Credential Manager/Keychain/Secret Service).
pub struct MasterKeyStore {
    service: String,
}

impl MasterKeyStore {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(&self) -> Result<Entry, SecretStoreError> {
        Entry::new(&self.service, MASTER_KEY_ACCOUNT).map_err(map_error)
    }
}

impl MasterKeyStoreTrait for MasterKeyStore {
    fn get_or_create(&self) -> Result<Zeroizing<Vec<u8>>, SecretStoreError> {
        let entry = self.entry()?;
        match entry.get_password() {
            Ok(encoded) => {
                let encoded = Zeroizing::new(encoded);
                let key = Zeroizing::new(general_purpose::STANDARD.decode(encoded.as_bytes()).map_err(
                    |err| SecretStoreError::Store(format!("keyring master key is not base64: {err}")),
                )?);
                if key.len() != MASTER_KEY_LEN {
                    return Err(SecretStoreError::Store(format!(
                        "keyring master key has length {}, expected {}",
                        key.len(),
                        MASTER_KEY_LEN
                    )));
                }
                Ok(key)
            }
            Err(keyring::Error::NoEntry) => {
                info!("[secrets] creating master key in OS keyring ({})", self.service);
                let key = generate_master_key();
                let encoded = Zeroizing::new(general_purpose::STANDARD.encode(key.as_slice()));
                entry.set_password(&encoded).map_err(map_error)?;
                Ok(key)
            }
            Err(err) => Err(map_error(err)),
        }
    }
}

fn map_error(err: keyring::Error) -> SecretStoreError {
    match err {
        keyring::Error::NoEntry => SecretStoreError::NotFound(MASTER_KEY_ACCOUNT.to_string()),
        keyring::Error::NoStorageAccess(_) | keyring::Error::PlatformFailure(_) => {
            SecretStoreError::Unavailable(err.to_string())
        }
        other => SecretStoreError::Store(other.to_string()),
    }
}
