use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::types::ValidationMethod;

/// Operations the engine needs from the remote certificate-issuing service.
pub trait IssuerApi: Send + Sync {
    fn get_certificate(&self, order_id: u64) -> Result<CertData, IssuerError>;
    fn submit_signing_request(&self, request: &SigningRequest)
    -> Result<SubmitResponse, IssuerError>;
    fn notify(
        &self,
        order_id: u64,
        domain: &str,
        status: CallbackStatus,
        message: &str,
    ) -> Result<(), IssuerError>;
}

/// Issuance state of an order as reported by the issuer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CertStatus {
    Processing,
    Active,
    Failed,
    Expired,
    Cancelled,
    #[serde(other)]
    Unknown,
}

/// A file the issuer expects to fetch over plain HTTP to prove domain control.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileChallenge {
    pub domain: String,
    /// Path relative to the site root, e.g. `.well-known/pki-validation/abc.txt`.
    pub path: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertData {
    pub status: CertStatus,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub certificate: Option<String>,
    #[serde(default)]
    pub chain: Option<String>,
    /// Present only when the issuer holds the key (remote-key orders).
    #[serde(default)]
    pub private_key: Option<String>,
    #[serde(default)]
    pub file_challenges: Vec<FileChallenge>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SigningRequest {
    /// Existing order to reissue, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_id: Option<u64>,
    pub domain: String,
    pub domains: Vec<String>,
    /// Absent for remote-key orders, where the issuer generates the key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub csr: Option<String>,
    pub validation_method: ValidationMethod,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubmitResponse {
    pub order_id: u64,
    pub status: CertStatus,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CallbackStatus {
    Success,
    Failure,
}

impl From<bool> for CallbackStatus {
    fn from(success: bool) -> Self {
        if success {
            CallbackStatus::Success
        } else {
            CallbackStatus::Failure
        }
    }
}

#[derive(Error, Debug)]
pub enum IssuerError {
    #[error("issuer unavailable: {0}")]
    Unavailable(String),
    #[error("issuer rejected request: {0}")]
    Rejected(String),
    #[error("issuer response invalid: {0}")]
    InvalidResponse(String),
    #[error("order not found: {0}")]
    NotFound(u64),
}

impl IssuerError {
    /// Whether another attempt later could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, IssuerError::Unavailable(_))
    }
}
