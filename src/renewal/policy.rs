//! Renewal decisions.
//!
//! [`RenewalPolicy::decide`] is a pure function of the certificate state, the
//! order's strategy and the current time. Local-key orders open their window
//! at `renew_days_local`, remote-key orders at `renew_days_fetch`; the ordering
//! of the two against the issuer's own auto-renewal is enforced by
//! [`RenewalThresholds::validate`].

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::{
    core::{
        config::{ConfigError, RenewalThresholds},
        types::{CertificateConfig, Strategy, ValidationMethod},
    },
    domain,
    issuance::issuer::CertStatus,
};

/// Whether the locally held key verifies against the live certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyState {
    Matches,
    Mismatch,
    Missing,
}

/// Everything the policy looks at for one certificate configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertState {
    /// `None` when no order exists yet.
    pub status: Option<CertStatus>,
    pub expires_at: Option<DateTime<Utc>>,
    pub key: KeyState,
    /// The live certificate's thumbprint is the one last bound on this host.
    pub already_deployed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    NotYetDue { days_left: i64 },
    AwaitingIssuance,
    RemoteNotReady(CertStatus),
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::NotYetDue { days_left } => write!(f, "not yet due ({days_left} days left)"),
            SkipReason::AwaitingIssuance => write!(f, "awaiting issuance"),
            SkipReason::RemoteNotReady(status) => write!(f, "issuer reports {status:?}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestReason {
    NoOrder,
    NotActive(CertStatus),
    KeyMismatch,
    KeyMissing,
    RenewalDue { days_left: i64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Skip(SkipReason),
    RequestNew(RequestReason),
    Deploy,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationMethodError {
    #[error("file validation cannot be used for wildcard domain {0}")]
    FileForWildcard(String),
    #[error("delegation validation cannot be used for IP address {0}")]
    DelegationForIp(String),
}

/// Rejects validation methods that cannot work for the configured domain shapes.
pub fn check_validation_method(cert: &CertificateConfig) -> Result<(), ValidationMethodError> {
    let method = cert.effective_validation_method();
    for name in cert.all_domains() {
        match method {
            ValidationMethod::File if domain::is_wildcard(&name) => {
                return Err(ValidationMethodError::FileForWildcard(name));
            }
            ValidationMethod::Delegation if domain::is_ip_literal(&name) => {
                return Err(ValidationMethodError::DelegationForIp(name));
            }
            _ => {}
        }
    }
    Ok(())
}

pub fn days_until(expires_at: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    (expires_at - now).num_days()
}

#[derive(Debug, Clone, Copy)]
pub struct RenewalPolicy {
    thresholds: RenewalThresholds,
}

impl RenewalPolicy {
    pub fn new(thresholds: RenewalThresholds) -> Result<Self, ConfigError> {
        thresholds.validate()?;
        Ok(Self { thresholds })
    }

    pub fn thresholds(&self) -> RenewalThresholds {
        self.thresholds
    }

    pub fn decide(&self, state: &CertState, strategy: Strategy, now: DateTime<Utc>) -> Decision {
        match strategy {
            Strategy::LocalKey => self.decide_local(state, now),
            Strategy::RemoteKey => self.decide_fetch(state, now),
        }
    }

    fn decide_local(&self, state: &CertState, now: DateTime<Utc>) -> Decision {
        match state.status {
            None => return Decision::RequestNew(RequestReason::NoOrder),
            Some(CertStatus::Active) => {}
            Some(CertStatus::Processing) => return Decision::Skip(SkipReason::AwaitingIssuance),
            Some(other) => return Decision::RequestNew(RequestReason::NotActive(other)),
        }

        let days_left = state.expires_at.map(|at| days_until(at, now)).unwrap_or(0);
        let in_window = days_left <= self.thresholds.renew_days_local;
        if !in_window && state.already_deployed {
            return Decision::Skip(SkipReason::NotYetDue { days_left });
        }
        match state.key {
            KeyState::Mismatch => Decision::RequestNew(RequestReason::KeyMismatch),
            KeyState::Missing => Decision::RequestNew(RequestReason::KeyMissing),
            // The live certificate is the one already serving and it is ageing out.
            KeyState::Matches if in_window && state.already_deployed => {
                Decision::RequestNew(RequestReason::RenewalDue { days_left })
            }
            KeyState::Matches => Decision::Deploy,
        }
    }

    fn decide_fetch(&self, state: &CertState, now: DateTime<Utc>) -> Decision {
        match state.status {
            None => return Decision::RequestNew(RequestReason::NoOrder),
            Some(CertStatus::Active) => {}
            Some(CertStatus::Processing) => return Decision::Skip(SkipReason::AwaitingIssuance),
            Some(other) => return Decision::Skip(SkipReason::RemoteNotReady(other)),
        }
        let days_left = state.expires_at.map(|at| days_until(at, now)).unwrap_or(0);
        if days_left > self.thresholds.renew_days_fetch && state.already_deployed {
            return Decision::Skip(SkipReason::NotYetDue { days_left });
        }
        Decision::Deploy
    }
}
