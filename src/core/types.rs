use std::{fmt, net::IpAddr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain;

/// How the issuer proves control of each domain.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ValidationMethod {
    /// Unset: picked per certificate from the shape of its domains.
    #[default]
    Auto,
    File,
    Delegation,
}

impl ValidationMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationMethod::Auto => "auto",
            ValidationMethod::File => "file",
            ValidationMethod::Delegation => "delegation",
        }
    }
}

/// Where a certificate's private key is generated and held.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Key and CSR are generated here; the issuer only signs.
    LocalKey,
    /// The issuer owns the key; this host fetches and deploys what it serves.
    RemoteKey,
}

/// An explicit listener binding requested for a certificate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BindRule {
    pub domain: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site_name: Option<String>,
}

fn default_enabled() -> bool {
    true
}

/// One declared certificate intent from the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificateConfig {
    /// Issuer order id; 0 until the first request succeeds.
    #[serde(default)]
    pub order_id: u64,
    /// Primary domain, also used as the certificate's common name.
    pub domain: String,
    /// Full SAN set. The primary domain is implied when missing.
    #[serde(default)]
    pub domains: Vec<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub use_local_key: bool,
    #[serde(default)]
    pub validation_method: ValidationMethod,
    /// Bind to whatever listeners already reference these domains.
    #[serde(default)]
    pub auto_bind: bool,
    #[serde(default)]
    pub bind_rules: Vec<BindRule>,
    /// Cached expiry of the last certificate seen for this order.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl CertificateConfig {
    pub fn strategy(&self) -> Strategy {
        if self.use_local_key {
            Strategy::LocalKey
        } else {
            Strategy::RemoteKey
        }
    }

    /// Primary domain first, then the remaining SANs without duplicates.
    pub fn all_domains(&self) -> Vec<String> {
        let mut all = vec![self.domain.clone()];
        for name in &self.domains {
            if !all.iter().any(|existing| existing.eq_ignore_ascii_case(name)) {
                all.push(name.clone());
            }
        }
        all
    }

    /// Domains this configuration claims on the host's listeners.
    pub fn bind_domains(&self) -> Vec<String> {
        if self.auto_bind {
            return self.all_domains();
        }
        let mut domains: Vec<String> = Vec::new();
        for rule in &self.bind_rules {
            if !domains.iter().any(|d| d.eq_ignore_ascii_case(&rule.domain)) {
                domains.push(rule.domain.clone());
            }
        }
        domains
    }

    /// Resolves `Auto` to a concrete method from the domain shapes.
    pub fn effective_validation_method(&self) -> ValidationMethod {
        match self.validation_method {
            ValidationMethod::Auto => {
                if self.all_domains().iter().any(|d| domain::is_wildcard(d)) {
                    ValidationMethod::Delegation
                } else {
                    ValidationMethod::File
                }
            }
            method => method,
        }
    }
}

/// Listener address a certificate is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BindEndpoint {
    /// Non-SNI binding keyed by IP:port.
    Ip(IpAddr),
    /// SNI binding keyed by hostname:port.
    Sni(String),
}

/// A resolved install target for one domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingTarget {
    /// Domain reported in the deployment result.
    pub domain: String,
    pub endpoint: BindEndpoint,
    pub port: u16,
    pub site_name: Option<String>,
}

impl BindingTarget {
    pub fn ip(domain: impl Into<String>, ip: IpAddr, port: u16) -> Self {
        Self {
            domain: domain.into(),
            endpoint: BindEndpoint::Ip(ip),
            port,
            site_name: None,
        }
    }

    pub fn sni(domain: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            domain: domain.into(),
            endpoint: BindEndpoint::Sni(host.into()),
            port,
            site_name: None,
        }
    }

    pub fn is_sni(&self) -> bool {
        matches!(self.endpoint, BindEndpoint::Sni(_))
    }
}

impl fmt::Display for BindingTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.endpoint {
            BindEndpoint::Ip(IpAddr::V6(ip)) => write!(f, "ipport=[{ip}]:{}", self.port),
            BindEndpoint::Ip(ip) => write!(f, "ipport={ip}:{}", self.port),
            BindEndpoint::Sni(host) => write!(f, "hostnameport={host}:{}", self.port),
        }
    }
}

/// Outcome for one domain acted upon during a pass. Never persisted.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DeploymentResult {
    pub domain: String,
    pub success: bool,
    pub message: String,
    pub thumbprint: Option<String>,
    pub order_id: u64,
}

impl DeploymentResult {
    pub fn ok(
        domain: impl Into<String>,
        order_id: u64,
        thumbprint: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            domain: domain.into(),
            success: true,
            message: message.into(),
            thumbprint: Some(thumbprint.into()),
            order_id,
        }
    }

    pub fn failed(domain: impl Into<String>, order_id: u64, message: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            success: false,
            message: message.into(),
            thumbprint: None,
            order_id,
        }
    }
}
