pub mod binder;
pub mod conflict;
pub mod convert;
pub mod host;
pub mod targets;
pub mod verify;

use thiserror::Error;
use zeroize::Zeroizing;

/// PEM key material for one certificate.
pub struct CertificateMaterial {
    pub certificate_pem: String,
    pub private_key_pem: Zeroizing<String>,
    pub chain_pem: Option<String>,
}

#[derive(Debug, Error)]
pub enum DeployError {
    #[error("certificate conversion failed: {0}")]
    Conversion(String),
    #[error("certificate install failed: {0}")]
    Install(String),
    #[error("install reported success but certificate {0} is not in the machine store")]
    InstallUnverified(String),
    #[error("binding {target} failed: {reason}")]
    Bind { target: String, reason: String },
    #[error(
        "binding {target} reported success but unverified: expected {expected}, live table shows {found}"
    )]
    BindUnverified {
        target: String,
        expected: String,
        found: String,
    },
    #[error("listener discovery failed: {0}")]
    Discovery(String),
}

impl DeployError {
    /// True for failures where the platform claimed success but re-reading shows otherwise.
    pub fn is_platform_inconsistency(&self) -> bool {
        matches!(
            self,
            DeployError::InstallUnverified(_) | DeployError::BindUnverified { .. }
        )
    }
}
