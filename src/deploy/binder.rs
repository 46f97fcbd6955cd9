//! Installs a certificate into the machine store and binds it to listeners.
//!
//! Every write is followed by a read of the live host state: the platform can
//! report success for an install or a binding change that never takes effect,
//! and that case is surfaced as its own error rather than as success.

use std::{
    collections::HashMap,
    net::{IpAddr, Ipv4Addr},
    sync::Arc,
};

use log::{debug, info, warn};
use rand::RngCore;
use zeroize::Zeroizing;

use super::{
    CertificateMaterial, DeployError,
    host::{BindingTable, CertificateConverter, CertificateInstaller},
    verify::{VerifyPolicy, wait_until},
};
use crate::{
    core::types::{BindEndpoint, BindingTarget, DeploymentResult},
    domain::wildcard_label,
    issuance::certificate,
};

pub struct Deployer {
    converter: Arc<dyn CertificateConverter>,
    installer: Arc<dyn CertificateInstaller>,
    bindings: Arc<dyn BindingTable>,
    /// Host cannot bind by hostname; everything goes to `0.0.0.0:port`.
    legacy: bool,
    verify: VerifyPolicy,
}

impl Deployer {
    pub fn new(
        converter: Arc<dyn CertificateConverter>,
        installer: Arc<dyn CertificateInstaller>,
        bindings: Arc<dyn BindingTable>,
        legacy: bool,
    ) -> Self {
        Self {
            converter,
            installer,
            bindings,
            legacy,
            verify: VerifyPolicy::default(),
        }
    }

    pub fn with_verify_policy(mut self, verify: VerifyPolicy) -> Self {
        self.verify = verify;
        self
    }

    /// Installs `material` once and binds it to every target. Returns one
    /// result per target; listeners succeed or fail independently.
    pub fn deploy(
        &self,
        order_id: u64,
        material: &CertificateMaterial,
        targets: &[BindingTarget],
    ) -> Vec<DeploymentResult> {
        if targets.is_empty() {
            debug!("[deploy] order {} has no bind targets", order_id);
            return Vec::new();
        }

        let thumbprint = match self.install(material) {
            Ok(thumbprint) => thumbprint,
            Err(err) => {
                warn!("[deploy] order {} install failed: {}", order_id, err);
                let message = err.to_string();
                return targets
                    .iter()
                    .map(|target| DeploymentResult::failed(&target.domain, order_id, &message))
                    .collect();
            }
        };

        // Several domains can share one listener in legacy mode; each listener
        // is bound once and its outcome reported for every domain on it.
        let mut outcomes: HashMap<(BindEndpoint, u16), Result<String, String>> = HashMap::new();
        targets
            .iter()
            .map(|target| {
                let target = self.effective_target(target);
                let key = (target.endpoint.clone(), target.port);
                let outcome = match outcomes.get(&key) {
                    Some(outcome) => {
                        debug!("[deploy] {} shares binding {}", target.domain, target);
                        outcome.clone()
                    }
                    None => {
                        let outcome = self.bind(&target, &thumbprint).map_err(|err| {
                            if err.is_platform_inconsistency() {
                                warn!("[deploy] platform inconsistency on {}: {}", target, err);
                            } else {
                                warn!("[deploy] {} failed: {}", target, err);
                            }
                            err.to_string()
                        });
                        outcomes.insert(key, outcome.clone());
                        outcome
                    }
                };
                match outcome {
                    Ok(message) => {
                        info!("[deploy] {} -> {}: {}", target, thumbprint, message);
                        DeploymentResult::ok(&target.domain, order_id, &thumbprint, message)
                    }
                    Err(message) => DeploymentResult::failed(&target.domain, order_id, message),
                }
            })
            .collect()
    }

    /// Converts and imports the certificate, returning its thumbprint once
    /// the store confirms it.
    fn install(&self, material: &CertificateMaterial) -> Result<String, DeployError> {
        let thumbprint = certificate::thumbprint(&material.certificate_pem)
            .map_err(|err| DeployError::Conversion(err.to_string()))?;
        let primary = certificate::inspect(&material.certificate_pem)
            .ok()
            .and_then(|info| info.subjects.into_iter().next())
            .unwrap_or_else(|| thumbprint.clone());
        let friendly_name = if self.legacy {
            wildcard_label(&primary)
        } else {
            primary.clone()
        };

        let password = pfx_password();
        let pfx = self.converter.to_pfx(material, &password, &friendly_name)?;
        self.installer.install(&pfx, &password, &thumbprint)?;

        let installed = wait_until(&thumbprint, "install", self.verify, || {
            self.installer.is_installed(&thumbprint)
        })?;
        if !installed {
            return Err(DeployError::InstallUnverified(thumbprint));
        }

        if self.legacy {
            // The host picks a certificate for a shared IP binding by label.
            if let Err(err) = self.installer.set_friendly_name(&thumbprint, &friendly_name) {
                warn!(
                    "[deploy] could not label {} as {}: {}",
                    thumbprint, friendly_name, err
                );
            }
        }
        Ok(thumbprint)
    }

    fn bind(&self, target: &BindingTarget, thumbprint: &str) -> Result<String, DeployError> {
        let current = self.bindings.query(&target.endpoint, target.port)?;
        if current
            .as_deref()
            .is_some_and(|live| live.eq_ignore_ascii_case(thumbprint))
        {
            return Ok("already bound".to_string());
        }

        if current.is_some() {
            self.bindings.remove(&target.endpoint, target.port)?;
        }
        self.bindings.add(&target.endpoint, target.port, thumbprint)?;

        let mut last_seen = None;
        let verified = wait_until(&target.to_string(), "bind", self.verify, || {
            last_seen = self.bindings.query(&target.endpoint, target.port)?;
            Ok::<_, DeployError>(
                last_seen
                    .as_deref()
                    .is_some_and(|live| live.eq_ignore_ascii_case(thumbprint)),
            )
        })?;
        if !verified {
            return Err(DeployError::BindUnverified {
                target: target.to_string(),
                expected: thumbprint.to_string(),
                found: last_seen.unwrap_or_else(|| "no binding".to_string()),
            });
        }

        Ok(if current.is_some() {
            "binding replaced".to_string()
        } else {
            "binding added".to_string()
        })
    }

    /// In legacy mode hostname targets move to the shared `0.0.0.0:port` binding.
    fn effective_target(&self, target: &BindingTarget) -> BindingTarget {
        let mut target = target.clone();
        if self.legacy && target.is_sni() {
            target.endpoint = BindEndpoint::Ip(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        }
        target
    }
}

fn pfx_password() -> Zeroizing<String> {
    let mut bytes = [0u8; 24];
    rand::thread_rng().fill_bytes(&mut bytes);
    Zeroizing::new(hex::encode(bytes))
}
