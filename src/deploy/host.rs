//! Capabilities the deployer needs from the host. Production implementations
//! live in `platform`; tests substitute in-memory fakes.

use std::{net::IpAddr, path::PathBuf};

use super::{CertificateMaterial, DeployError};
use crate::core::types::BindEndpoint;

pub trait CertificateConverter: Send + Sync {
    /// Builds a password-protected PFX holding key, leaf and chain.
    fn to_pfx(
        &self,
        material: &CertificateMaterial,
        password: &str,
        friendly_name: &str,
    ) -> Result<Vec<u8>, DeployError>;
}

pub trait CertificateInstaller: Send + Sync {
    /// Imports the PFX into the machine-wide personal store. Importing the same
    /// certificate again replaces the existing entry.
    fn install(&self, pfx: &[u8], password: &str, thumbprint: &str) -> Result<(), DeployError>;
    fn is_installed(&self, thumbprint: &str) -> Result<bool, DeployError>;
    fn set_friendly_name(&self, thumbprint: &str, name: &str) -> Result<(), DeployError>;
}

pub trait BindingTable: Send + Sync {
    /// Thumbprint currently bound to `endpoint:port`, if any.
    fn query(&self, endpoint: &BindEndpoint, port: u16) -> Result<Option<String>, DeployError>;
    fn remove(&self, endpoint: &BindEndpoint, port: u16) -> Result<(), DeployError>;
    fn add(&self, endpoint: &BindEndpoint, port: u16, thumbprint: &str) -> Result<(), DeployError>;
}

/// A listener declared on a web site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteBinding {
    pub protocol: String,
    /// `None` for all-unassigned (`*`).
    pub ip: Option<IpAddr>,
    pub port: u16,
    /// Empty when the listener has no host header.
    pub host: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Site {
    pub name: String,
    pub physical_path: PathBuf,
    pub bindings: Vec<SiteBinding>,
}

pub trait SiteInventory: Send + Sync {
    fn sites(&self) -> Result<Vec<Site>, DeployError>;
}
