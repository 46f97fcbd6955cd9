//! Configuration file model and store.
//!
//! The file is JSON. It is loaded and validated once per pass; the engine
//! writes back only order ids and cached expiries, always under the shared
//! [`StateLock`] and with an atomic rename.

use std::{
    fs,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::types::{BindRule, CertificateConfig};
use crate::{
    domain::{self, host_matches},
    renewal::policy::check_validation_method,
    secrets::MasterKeyBackend,
    storage::{StateLock, atomic::write_atomic},
};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration I/O error: {0}")]
    Io(String),
    #[error("configuration parse error: {0}")]
    Parse(String),
    #[error("invalid renewal thresholds: {0}")]
    Thresholds(String),
    #[error("certificate {domain}: {reason}")]
    Certificate { domain: String, reason: String },
    #[error("certificate entry {0} changed on disk during the pass")]
    Stale(usize),
}

fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssuerSettings {
    pub base_url: String,
    #[serde(default)]
    pub token: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

/// Day thresholds that open the renewal windows. They must satisfy
/// `renew_days_local > renew_days_fetch > issuer_auto_renew_days` so local
/// renewal never races the issuer's own auto-renewal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RenewalThresholds {
    pub renew_days_local: i64,
    pub renew_days_fetch: i64,
    pub issuer_auto_renew_days: i64,
}

impl Default for RenewalThresholds {
    fn default() -> Self {
        Self {
            renew_days_local: 30,
            renew_days_fetch: 20,
            issuer_auto_renew_days: 15,
        }
    }
}

impl RenewalThresholds {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.issuer_auto_renew_days < 0 {
            return Err(ConfigError::Thresholds(
                "issuer_auto_renew_days must not be negative".into(),
            ));
        }
        if self.renew_days_fetch <= self.issuer_auto_renew_days {
            return Err(ConfigError::Thresholds(format!(
                "renew_days_fetch ({}) must be greater than issuer_auto_renew_days ({})",
                self.renew_days_fetch, self.issuer_auto_renew_days
            )));
        }
        if self.renew_days_local <= self.renew_days_fetch {
            return Err(ConfigError::Thresholds(format!(
                "renew_days_local ({}) must be greater than renew_days_fetch ({})",
                self.renew_days_local, self.renew_days_fetch
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleSettings {
    pub interval_secs: u64,
}

impl Default for ScheduleSettings {
    fn default() -> Self {
        Self {
            interval_secs: 6 * 60 * 60,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifySettings {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for NotifySettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 2_000,
            max_backoff_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub issuer: IssuerSettings,
    #[serde(default)]
    pub renewal: RenewalThresholds,
    #[serde(default)]
    pub schedule: ScheduleSettings,
    #[serde(default)]
    pub notify: NotifySettings,
    /// Force the single-listener binding mode of hosts without SNI support.
    /// Detected from the host when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub legacy_binding: Option<bool>,
    /// Defaults to a `data` directory beside the configuration file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
    #[serde(default)]
    pub master_key: MasterKeyBackend,
    #[serde(default)]
    pub certificates: Vec<CertificateConfig>,
}

impl AppConfig {
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let mut config: AppConfig =
            serde_json::from_str(raw).map_err(|err| ConfigError::Parse(err.to_string()))?;
        config.renewal.validate()?;
        for cert in &mut config.certificates {
            normalize_certificate(cert);
        }
        Ok(config)
    }

    /// Checks one certificate entry. Errors here are fatal for that entry only.
    pub fn validate_certificate(cert: &CertificateConfig) -> Result<(), ConfigError> {
        let fail = |reason: String| ConfigError::Certificate {
            domain: cert.domain.clone(),
            reason,
        };
        let all = cert.all_domains();
        for name in &all {
            domain::normalize_domain(name).map_err(|err| fail(format!("{name}: {err}")))?;
        }
        check_validation_method(cert).map_err(|err| fail(err.to_string()))?;
        if !cert.auto_bind && cert.bind_rules.is_empty() {
            return Err(fail("auto_bind is off and no bind_rules are configured".into()));
        }
        for rule in &cert.bind_rules {
            validate_bind_rule(rule, &all).map_err(fail)?;
        }
        Ok(())
    }
}

fn validate_bind_rule(rule: &BindRule, domains: &[String]) -> Result<(), String> {
    if rule.domain.trim().is_empty() {
        return Err("bind rule has an empty domain".into());
    }
    if rule.port == 0 {
        return Err(format!("bind rule for {} has port 0", rule.domain));
    }
    if domain::is_ip_literal(&rule.domain) {
        return Ok(());
    }
    if !domains.iter().any(|name| host_matches(name, &rule.domain)) {
        return Err(format!(
            "bind rule domain {} is not covered by the certificate",
            rule.domain
        ));
    }
    Ok(())
}

fn normalize_certificate(cert: &mut CertificateConfig) {
    let normalize = |name: &str| domain::normalize_domain(name).unwrap_or_else(|_| name.to_string());
    cert.domain = normalize(&cert.domain);
    cert.domains = cert.domains.iter().map(|d| normalize(d)).collect();
    for rule in &mut cert.bind_rules {
        rule.domain = normalize(&rule.domain);
    }
}

/// Handle on the configuration file.
#[derive(Clone)]
pub struct ConfigStore {
    path: PathBuf,
    lock: StateLock,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>, lock: StateLock) -> Self {
        Self {
            path: path.into(),
            lock,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The lock shared with every other store touching on-disk state.
    pub fn lock(&self) -> &StateLock {
        &self.lock
    }

    /// Data directory from the file, or `data/` beside it.
    pub fn data_dir(&self, config: &AppConfig) -> PathBuf {
        match &config.data_dir {
            Some(dir) => dir.clone(),
            None => self
                .path
                .parent()
                .map(|parent| parent.join("data"))
                .unwrap_or_else(|| PathBuf::from("data")),
        }
    }

    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let _guard = self.lock.acquire();
        self.read()
    }

    fn read(&self) -> Result<AppConfig, ConfigError> {
        let raw = fs::read_to_string(&self.path)
            .map_err(|err| ConfigError::Io(format!("{}: {err}", self.path.display())))?;
        let config = AppConfig::parse(&raw)?;
        debug!(
            "[config] loaded {} certificate entries from {}",
            config.certificates.len(),
            self.path.display()
        );
        Ok(config)
    }

    /// Read-modify-write of the whole file under the state lock.
    pub fn update<F>(&self, mutate: F) -> Result<AppConfig, ConfigError>
    where
        F: FnOnce(&mut AppConfig) -> Result<(), ConfigError>,
    {
        let _guard = self.lock.acquire();
        let mut config = self.read()?;
        mutate(&mut config)?;
        let json = serde_json::to_vec_pretty(&config)
            .map_err(|err| ConfigError::Parse(err.to_string()))?;
        write_atomic(&self.path, &json).map_err(|err| ConfigError::Io(err.to_string()))?;
        Ok(config)
    }

    /// Records a newly assigned order id on the entry at `index`, provided the
    /// entry still names `domain`.
    pub fn set_order_id(&self, index: usize, domain: &str, order_id: u64) -> Result<(), ConfigError> {
        self.update(|config| {
            let entry = entry_mut(config, index, domain)?;
            entry.order_id = order_id;
            Ok(())
        })?;
        info!("[config] {domain}: recorded order id {order_id}");
        Ok(())
    }

    pub fn set_expires_at(
        &self,
        index: usize,
        domain: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), ConfigError> {
        self.update(|config| {
            let entry = entry_mut(config, index, domain)?;
            entry.expires_at = Some(expires_at);
            Ok(())
        })?;
        Ok(())
    }
}

fn entry_mut<'a>(
    config: &'a mut AppConfig,
    index: usize,
    domain: &str,
) -> Result<&'a mut CertificateConfig, ConfigError> {
    match config.certificates.get_mut(index) {
        Some(entry) if entry.domain.eq_ignore_ascii_case(domain) => Ok(entry),
        _ => Err(ConfigError::Stale(index)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::ValidationMethod;
    use uuid::Uuid;

    const SAMPLE: &str = r#"{
        "issuer": { "base_url": "https://issuer.test/api", "token": "t" },
        "certificates": [
            {
                "domain": "Example.COM.",
                "domains": ["example.com", "www.example.com"],
                "use_local_key": true,
                "auto_bind": true
            },
            {
                "order_id": 12,
                "domain": "*.example.org",
                "validation_method": "file",
                "bind_rules": [{ "domain": "www.example.org", "port": 443 }]
            }
        ]
    }"#;

    fn temp_store(content: &str) -> (ConfigStore, PathBuf) {
        let dir = std::env::temp_dir().join(format!("certbinder-config-{}", Uuid::new_v4()));
        fs::create_dir_all(&dir).expect("dir");
        let path = dir.join("config.json");
        fs::write(&path, content).expect("seed");
        (ConfigStore::new(&path, StateLock::new()), dir)
    }

    #[test]
    fn parses_defaults_and_normalizes_domains() {
        let config = AppConfig::parse(SAMPLE).expect("parse");
        assert_eq!(config.renewal, RenewalThresholds::default());
        assert_eq!(config.certificates[0].domain, "example.com");
        assert!(config.certificates[0].enabled);
        assert_eq!(config.certificates[1].order_id, 12);
        assert_eq!(
            config.certificates[1].validation_method,
            ValidationMethod::File
        );
    }

    #[test]
    fn rejects_threshold_ordering_violations() {
        let bad = RenewalThresholds {
            renew_days_local: 20,
            renew_days_fetch: 20,
            issuer_auto_renew_days: 10,
        };
        assert!(matches!(bad.validate(), Err(ConfigError::Thresholds(_))));
        let bad = RenewalThresholds {
            renew_days_local: 30,
            renew_days_fetch: 10,
            issuer_auto_renew_days: 10,
        };
        assert!(bad.validate().is_err());

        let raw = r#"{ "issuer": { "base_url": "x" },
            "renewal": { "renew_days_local": 5, "renew_days_fetch": 10, "issuer_auto_renew_days": 1 } }"#;
        assert!(matches!(AppConfig::parse(raw), Err(ConfigError::Thresholds(_))));
    }

    #[test]
    fn file_validation_for_wildcard_is_a_certificate_error() {
        let config = AppConfig::parse(SAMPLE).expect("parse");
        assert!(AppConfig::validate_certificate(&config.certificates[0]).is_ok());
        let err = AppConfig::validate_certificate(&config.certificates[1]).expect_err("wildcard");
        assert!(matches!(err, ConfigError::Certificate { .. }));
        assert!(err.to_string().contains("wildcard"));
    }

    #[test]
    fn bind_rules_must_be_covered_and_present() {
        let mut config = AppConfig::parse(SAMPLE).expect("parse");
        let cert = &mut config.certificates[0];
        cert.auto_bind = false;
        assert!(AppConfig::validate_certificate(cert).is_err());

        cert.bind_rules = vec![BindRule {
            domain: "api.other.net".into(),
            port: 443,
            site_name: None,
        }];
        assert!(AppConfig::validate_certificate(cert).is_err());

        cert.bind_rules = vec![
            BindRule { domain: "www.example.com".into(), port: 443, site_name: None },
            BindRule { domain: "10.1.2.3".into(), port: 8443, site_name: None },
        ];
        assert!(AppConfig::validate_certificate(cert).is_ok());
    }

    #[test]
    fn persists_order_id_atomically() {
        let (store, dir) = temp_store(SAMPLE);
        store.set_order_id(0, "example.com", 99).expect("set order");
        let reloaded = store.load().expect("reload");
        assert_eq!(reloaded.certificates[0].order_id, 99);
        assert_eq!(reloaded.certificates[1].order_id, 12);

        let err = store.set_order_id(1, "example.com", 5).expect_err("stale");
        assert!(matches!(err, ConfigError::Stale(1)));
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn data_dir_defaults_beside_config() {
        let (store, dir) = temp_store(SAMPLE);
        let config = store.load().expect("load");
        assert_eq!(store.data_dir(&config), dir.join("data"));
        let _ = fs::remove_dir_all(&dir);
    }
}
