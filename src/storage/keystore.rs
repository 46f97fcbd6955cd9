//! Per-order key material on local disk.
//!
//! Each order id owns one directory under `<data_dir>/orders/` holding the
//! sealed private key, the certificate and chain PEM files and a JSON metadata
//! file. A private key present in a record always belongs to the record's
//! certificate; storing a certificate that does not match the key is refused so
//! the caller can drop the record and request a fresh one.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::Zeroizing;

use super::{
    StateLock,
    atomic::{ensure_private_dir, write_atomic},
};
use crate::{
    issuance::{certificate, issuer::CertStatus},
    secrets::{
        store::{SecretStoreError, open, seal},
        vault::MasterKeyVault,
    },
};

const KEY_FILENAME: &str = "private.key.enc";
const CERT_FILENAME: &str = "cert.pem";
const CHAIN_FILENAME: &str = "chain.pem";
const META_FILENAME: &str = "meta.json";

#[derive(Debug, Error)]
pub enum KeyStoreError {
    #[error("key store I/O error: {0}")]
    Io(String),
    #[error(transparent)]
    Secret(#[from] SecretStoreError),
    #[error("order {0} record is corrupt: {1}")]
    Corrupt(u64, String),
    #[error("stored private key for order {0} does not match its certificate")]
    KeyMismatch(u64),
    #[error("invalid order id {0}")]
    InvalidOrder(u64),
}

fn io_err(context: impl std::fmt::Display, err: impl std::fmt::Display) -> KeyStoreError {
    KeyStoreError::Io(format!("{context}: {err}"))
}

/// Non-secret metadata kept next to each order's key material.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderMeta {
    pub order_id: u64,
    pub domains: Vec<String>,
    pub status: CertStatus,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub thumbprint: Option<String>,
    #[serde(default)]
    pub fingerprint: Option<String>,
    /// Thumbprint most recently bound by a successful deployment.
    #[serde(default)]
    pub deployed_thumbprint: Option<String>,
    #[serde(default)]
    pub last_deployed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl OrderMeta {
    fn new(order_id: u64, domains: Vec<String>, status: CertStatus) -> Self {
        Self {
            order_id,
            domains,
            status,
            expires_at: None,
            thumbprint: None,
            fingerprint: None,
            deployed_thumbprint: None,
            last_deployed_at: None,
            updated_at: Utc::now(),
        }
    }
}

/// Outcome of checking a stored key against a certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyCheck {
    Matches,
    Mismatch,
    /// No private key is held locally for this order.
    Missing,
}

/// File-backed store of order keys, certificates and metadata.
#[derive(Clone)]
pub struct KeyStore {
    root: PathBuf,
    vault: Arc<MasterKeyVault>,
    lock: StateLock,
}

impl KeyStore {
    pub fn open(
        data_dir: &Path,
        vault: Arc<MasterKeyVault>,
        lock: StateLock,
    ) -> Result<Self, KeyStoreError> {
        let root = data_dir.join("orders");
        ensure_private_dir(&root).map_err(|err| io_err(root.display(), err))?;
        Ok(Self { root, vault, lock })
    }

    fn order_dir(&self, order_id: u64) -> Result<PathBuf, KeyStoreError> {
        if order_id == 0 {
            return Err(KeyStoreError::InvalidOrder(order_id));
        }
        Ok(self.root.join(order_id.to_string()))
    }

    /// Persists a newly generated private key for `order_id`. Any certificate
    /// previously stored for the order is removed since it cannot match the new key.
    pub fn store_private_key(
        &self,
        order_id: u64,
        domains: &[String],
        private_key_pem: &str,
        status: CertStatus,
    ) -> Result<(), KeyStoreError> {
        let dir = self.order_dir(order_id)?;
        let sealed = self
            .vault
            .with_key(|key| seal(key, &seal_context(order_id), private_key_pem.as_bytes()))?;

        let _guard = self.lock.acquire();
        ensure_private_dir(&dir).map_err(|err| io_err(dir.display(), err))?;
        for stale in [CERT_FILENAME, CHAIN_FILENAME] {
            remove_if_exists(&dir.join(stale))?;
        }
        write_atomic(&dir.join(KEY_FILENAME), sealed.as_bytes())
            .map_err(|err| io_err("write private key", err))?;
        let meta = OrderMeta::new(order_id, domains.to_vec(), status);
        self.write_meta(&dir, &meta)?;
        info!("[keystore] stored new private key for order {order_id}");
        Ok(())
    }

    /// Stores an issued certificate. When the order holds a private key it must
    /// match the certificate, otherwise [`KeyStoreError::KeyMismatch`] is returned
    /// and nothing is written.
    pub fn store_certificate(
        &self,
        order_id: u64,
        domains: &[String],
        certificate_pem: &str,
        chain_pem: Option<&str>,
        status: CertStatus,
    ) -> Result<OrderMeta, KeyStoreError> {
        let dir = self.order_dir(order_id)?;
        let info = certificate::inspect(certificate_pem)
            .map_err(|err| KeyStoreError::Corrupt(order_id, err.to_string()))?;

        let _guard = self.lock.acquire();
        ensure_private_dir(&dir).map_err(|err| io_err(dir.display(), err))?;
        if let Some(key) = self.read_private_key(&dir, order_id)? {
            let matches = certificate::key_matches_certificate(&key, certificate_pem)
                .map_err(|err| KeyStoreError::Corrupt(order_id, err.to_string()))?;
            if !matches {
                return Err(KeyStoreError::KeyMismatch(order_id));
            }
        }

        write_atomic(&dir.join(CERT_FILENAME), certificate_pem.as_bytes())
            .map_err(|err| io_err("write certificate", err))?;
        match chain_pem.filter(|chain| !chain.trim().is_empty()) {
            Some(chain) => write_atomic(&dir.join(CHAIN_FILENAME), chain.as_bytes())
                .map_err(|err| io_err("write chain", err))?,
            None => remove_if_exists(&dir.join(CHAIN_FILENAME))?,
        }

        let mut meta = self
            .read_meta(&dir, order_id)?
            .unwrap_or_else(|| OrderMeta::new(order_id, domains.to_vec(), status));
        meta.domains = domains.to_vec();
        meta.status = status;
        meta.expires_at = Some(info.not_after);
        meta.thumbprint = Some(info.thumbprint);
        meta.fingerprint = Some(info.fingerprint);
        meta.updated_at = Utc::now();
        self.write_meta(&dir, &meta)?;
        debug!("[keystore] stored certificate for order {order_id}");
        Ok(meta)
    }

    /// Records that `thumbprint` is now bound on the host.
    pub fn mark_deployed(
        &self,
        order_id: u64,
        thumbprint: &str,
        at: DateTime<Utc>,
    ) -> Result<(), KeyStoreError> {
        let dir = self.order_dir(order_id)?;
        let _guard = self.lock.acquire();
        let Some(mut meta) = self.read_meta(&dir, order_id)? else {
            warn!("[keystore] no metadata for order {order_id}; deployment not recorded");
            return Ok(());
        };
        meta.deployed_thumbprint = Some(thumbprint.to_string());
        meta.last_deployed_at = Some(at);
        meta.updated_at = Utc::now();
        self.write_meta(&dir, &meta)
    }

    pub fn meta(&self, order_id: u64) -> Result<Option<OrderMeta>, KeyStoreError> {
        let dir = self.order_dir(order_id)?;
        let _guard = self.lock.acquire();
        self.read_meta(&dir, order_id)
    }

    pub fn private_key(&self, order_id: u64) -> Result<Option<Zeroizing<String>>, KeyStoreError> {
        let dir = self.order_dir(order_id)?;
        let _guard = self.lock.acquire();
        self.read_private_key(&dir, order_id)
    }

    /// Checks the locally held key for `order_id` against `certificate_pem`.
    pub fn check_key(&self, order_id: u64, certificate_pem: &str) -> Result<KeyCheck, KeyStoreError> {
        let Some(key) = self.private_key(order_id)? else {
            return Ok(KeyCheck::Missing);
        };
        match certificate::key_matches_certificate(&key, certificate_pem) {
            Ok(true) => Ok(KeyCheck::Matches),
            Ok(false) => Ok(KeyCheck::Mismatch),
            Err(err) => {
                warn!("[keystore] order {order_id}: key check failed: {err}");
                Ok(KeyCheck::Mismatch)
            }
        }
    }

    pub fn delete(&self, order_id: u64) -> Result<(), KeyStoreError> {
        let dir = self.order_dir(order_id)?;
        let _guard = self.lock.acquire();
        match fs::remove_dir_all(&dir) {
            Ok(()) => {
                info!("[keystore] deleted record for order {order_id}");
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(io_err(dir.display(), err)),
        }
    }

    /// Order ids with a record on disk, ascending.
    pub fn order_ids(&self) -> Result<Vec<u64>, KeyStoreError> {
        let _guard = self.lock.acquire();
        let entries = fs::read_dir(&self.root).map_err(|err| io_err(self.root.display(), err))?;
        let mut ids: Vec<u64> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_dir())
            .filter_map(|entry| entry.file_name().to_str().and_then(|n| n.parse().ok()))
            .filter(|id| *id != 0)
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    fn read_private_key(
        &self,
        dir: &Path,
        order_id: u64,
    ) -> Result<Option<Zeroizing<String>>, KeyStoreError> {
        let Some(sealed) = read_optional(&dir.join(KEY_FILENAME))? else {
            return Ok(None);
        };
        let plaintext = self
            .vault
            .with_key(|key| open(key, &seal_context(order_id), &sealed))?;
        let pem = std::str::from_utf8(&plaintext)
            .map_err(|_| KeyStoreError::Corrupt(order_id, "private key is not UTF-8".into()))?;
        Ok(Some(Zeroizing::new(pem.to_string())))
    }

    fn read_meta(&self, dir: &Path, order_id: u64) -> Result<Option<OrderMeta>, KeyStoreError> {
        let Some(raw) = read_optional(&dir.join(META_FILENAME))? else {
            return Ok(None);
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|err| KeyStoreError::Corrupt(order_id, format!("metadata: {err}")))
    }

    fn write_meta(&self, dir: &Path, meta: &OrderMeta) -> Result<(), KeyStoreError> {
        let json = serde_json::to_vec_pretty(meta)
            .map_err(|err| KeyStoreError::Corrupt(meta.order_id, err.to_string()))?;
        write_atomic(&dir.join(META_FILENAME), &json).map_err(|err| io_err("write metadata", err))
    }
}

fn seal_context(order_id: u64) -> String {
    format!("order-key:{order_id}")
}

fn read_optional(path: &Path) -> Result<Option<String>, KeyStoreError> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(Some(content)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(io_err(path.display(), err)),
    }
}

fn remove_if_exists(path: &Path) -> Result<(), KeyStoreError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_err(path.display(), err)),
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::temp_keystore;
    use super::*;
    use crate::issuance::certificate::test_support::sample_certificate;

    fn domains() -> Vec<String> {
        vec!["example.com".to_string()]
    }

    fn stored_file(dir: &Path, order_id: u64, name: &str) -> Option<String> {
        fs::read_to_string(dir.join("orders").join(order_id.to_string()).join(name)).ok()
    }

    #[test]
    fn private_key_is_sealed_at_rest() {
        let (store, dir) = temp_keystore();
        let sample = sample_certificate(&["example.com"]);
        store
            .store_private_key(7, &domains(), &sample.key_pem, CertStatus::Processing)
            .expect("store key");

        let raw = fs::read_to_string(dir.join("orders/7").join(KEY_FILENAME)).expect("raw");
        assert!(!raw.contains("PRIVATE KEY"));
        let key = store.private_key(7).expect("load").expect("present");
        assert_eq!(key.as_str(), sample.key_pem);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn stores_matching_certificate_and_metadata() {
        let (store, dir) = temp_keystore();
        let sample = sample_certificate(&["example.com"]);
        store
            .store_private_key(8, &domains(), &sample.key_pem, CertStatus::Processing)
            .expect("store key");
        let meta = store
            .store_certificate(8, &domains(), &sample.cert_pem, Some(&sample.chain_pem), CertStatus::Active)
            .expect("store cert");

        assert_eq!(meta.status, CertStatus::Active);
        assert!(meta.thumbprint.is_some());
        assert_eq!(stored_file(&dir, 8, CERT_FILENAME), Some(sample.cert_pem.clone()));
        assert_eq!(stored_file(&dir, 8, CHAIN_FILENAME), Some(sample.chain_pem.clone()));
        assert_eq!(store.check_key(8, &sample.cert_pem).expect("check"), KeyCheck::Matches);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn refuses_certificate_for_another_key() {
        let (store, dir) = temp_keystore();
        let ours = sample_certificate(&["example.com"]);
        let theirs = sample_certificate(&["example.com"]);
        store
            .store_private_key(9, &domains(), &ours.key_pem, CertStatus::Processing)
            .expect("store key");

        let err = store
            .store_certificate(9, &domains(), &theirs.cert_pem, None, CertStatus::Active)
            .expect_err("mismatch");
        assert!(matches!(err, KeyStoreError::KeyMismatch(9)));
        assert_eq!(store.check_key(9, &theirs.cert_pem).expect("check"), KeyCheck::Mismatch);
        assert!(stored_file(&dir, 9, CERT_FILENAME).is_none());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn new_key_drops_stale_certificate() {
        let (store, dir) = temp_keystore();
        let first = sample_certificate(&["example.com"]);
        let second = sample_certificate(&["example.com"]);
        store
            .store_private_key(10, &domains(), &first.key_pem, CertStatus::Processing)
            .expect("first key");
        store
            .store_certificate(10, &domains(), &first.cert_pem, None, CertStatus::Active)
            .expect("first cert");
        store
            .store_private_key(10, &domains(), &second.key_pem, CertStatus::Processing)
            .expect("second key");

        assert!(stored_file(&dir, 10, CERT_FILENAME).is_none());
        let meta = store.meta(10).expect("meta").expect("present");
        assert_eq!(meta.status, CertStatus::Processing);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn records_deployment_and_deletes() {
        let (store, dir) = temp_keystore();
        let sample = sample_certificate(&["example.com"]);
        store
            .store_certificate(11, &domains(), &sample.cert_pem, None, CertStatus::Active)
            .expect("store cert without key");
        assert_eq!(store.check_key(11, &sample.cert_pem).expect("check"), KeyCheck::Missing);

        store.mark_deployed(11, "ABCD", Utc::now()).expect("mark");
        let meta = store.meta(11).expect("meta").expect("present");
        assert_eq!(meta.deployed_thumbprint.as_deref(), Some("ABCD"));
        assert_eq!(store.order_ids().expect("ids"), vec![11]);

        store.delete(11).expect("delete");
        assert!(store.meta(11).expect("meta").is_none());
        assert!(store.order_ids().expect("ids").is_empty());
        store.delete(11).expect("delete twice");
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn rejects_order_zero() {
        let (store, dir) = temp_keystore();
        assert!(matches!(store.meta(0), Err(KeyStoreError::InvalidOrder(0))));
        let _ = fs::remove_dir_all(&dir);
    }
}
