//! One renewal and deployment pass over every configured certificate.
//!
//! Certificates are handled one after another. Each decision comes from
//! [`RenewalPolicy`]; a failure is confined to the certificate (or the single
//! domain) it concerns and is reported as a failed [`DeploymentResult`] rather
//! than aborting the pass.

use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use zeroize::Zeroizing;

use crate::{
    challenge::ChallengeResponder,
    core::{
        config::{AppConfig, ConfigError, ConfigStore},
        types::{BindingTarget, CertificateConfig, DeploymentResult, Strategy, ValidationMethod},
    },
    deploy::{
        CertificateMaterial, binder::Deployer, conflict, host::SiteInventory,
        targets::resolve_targets,
    },
    domain::host_matches,
    issuance::{
        certificate, csr,
        issuer::{CertData, CertStatus, IssuerApi, IssuerError, SigningRequest},
    },
    notify::CallbackSink,
    renewal::policy::{CertState, Decision, KeyState, RenewalPolicy, RequestReason, SkipReason},
    storage::keystore::{KeyCheck, KeyStore, KeyStoreError},
};

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("a pass is already running")]
    AlreadyRunning,
    #[error(transparent)]
    Config(#[from] ConfigError),
}

struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Everything one certificate's processing needs from the surrounding pass.
struct PassContext<'a> {
    configs: &'a [CertificateConfig],
    conflicts: &'a BTreeMap<String, Vec<usize>>,
    policy: RenewalPolicy,
    now: DateTime<Utc>,
}

pub struct Orchestrator {
    config: ConfigStore,
    keystore: KeyStore,
    issuer: Arc<dyn IssuerApi>,
    deployer: Deployer,
    inventory: Arc<dyn SiteInventory>,
    challenges: ChallengeResponder,
    callbacks: Arc<dyn CallbackSink>,
    running: AtomicBool,
}

impl Orchestrator {
    pub fn new(
        config: ConfigStore,
        keystore: KeyStore,
        issuer: Arc<dyn IssuerApi>,
        deployer: Deployer,
        inventory: Arc<dyn SiteInventory>,
        callbacks: Arc<dyn CallbackSink>,
    ) -> Self {
        Self {
            config,
            keystore,
            issuer,
            deployer,
            challenges: ChallengeResponder::new(inventory.clone()),
            inventory,
            callbacks,
            running: AtomicBool::new(false),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Runs one pass. Returns one result per domain acted upon; certificates
    /// that were skipped contribute nothing. Cancellation is observed between
    /// certificates and yields the results gathered so far.
    pub fn run_pass(
        &self,
        cancel: &CancellationToken,
        now: DateTime<Utc>,
    ) -> Result<Vec<DeploymentResult>, OrchestratorError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!("[orchestrator] pass requested while another is running");
            return Err(OrchestratorError::AlreadyRunning);
        }
        let _guard = RunGuard(&self.running);

        let app = self.config.load()?;
        let conflicts = conflict::conflicts(&app.certificates);
        for (domain, claimants) in &conflicts {
            debug!("[orchestrator] {} claimed by entries {:?}", domain, claimants);
        }
        let ctx = PassContext {
            configs: &app.certificates,
            conflicts: &conflicts,
            policy: RenewalPolicy::new(app.renewal)?,
            now,
        };

        let mut results = Vec::new();
        for (index, cert) in app.certificates.iter().enumerate() {
            if cancel.is_cancelled() {
                info!(
                    "[orchestrator] pass cancelled after {} of {} certificates",
                    index,
                    app.certificates.len()
                );
                break;
            }
            if !cert.enabled {
                debug!("[orchestrator] {} is disabled", cert.domain);
                continue;
            }
            for result in self.process(index, cert, &ctx) {
                if result.order_id != 0 {
                    self.callbacks.notify(
                        result.order_id,
                        &result.domain,
                        result.success,
                        &result.message,
                    );
                }
                results.push(result);
            }
        }

        let failed = results.iter().filter(|r| !r.success).count();
        info!(
            "[orchestrator] pass finished: {} succeeded, {} failed",
            results.len() - failed,
            failed
        );
        Ok(results)
    }

    fn process(
        &self,
        index: usize,
        cert: &CertificateConfig,
        ctx: &PassContext<'_>,
    ) -> Vec<DeploymentResult> {
        let fail = |message: String| {
            warn!("[orchestrator] {}: {}", cert.domain, message);
            vec![DeploymentResult::failed(&cert.domain, cert.order_id, message)]
        };

        if let Err(err) = AppConfig::validate_certificate(cert) {
            return fail(err.to_string());
        }

        let data = if cert.order_id == 0 {
            None
        } else {
            match self.issuer.get_certificate(cert.order_id) {
                Ok(data) => Some(data),
                Err(IssuerError::NotFound(id)) => {
                    warn!(
                        "[orchestrator] {}: issuer does not know order {}",
                        cert.domain, id
                    );
                    None
                }
                Err(err) => return fail(err.to_string()),
            }
        };
        if let Some(data) = &data {
            if data.status == CertStatus::Active && data.certificate.is_none() {
                return fail(format!(
                    "issuer reports order {} active without a certificate",
                    cert.order_id
                ));
            }
        }

        let state = match self.cert_state(cert, data.as_ref()) {
            Ok(state) => state,
            Err(err) => return fail(err.to_string()),
        };
        let decision = ctx.policy.decide(&state, cert.strategy(), ctx.now);
        debug!("[policy] {}: {:?} -> {:?}", cert.domain, state, decision);

        match decision {
            Decision::Skip(reason) => {
                info!("[orchestrator] {}: skipped, {}", cert.domain, reason);
                match (&reason, &data) {
                    (SkipReason::AwaitingIssuance, Some(data)) => {
                        self.answer_challenges(cert, cert.order_id, data)
                    }
                    _ => Vec::new(),
                }
            }
            Decision::RequestNew(reason) => self.request_new(index, cert, reason, ctx),
            Decision::Deploy => match &data {
                Some(data) => self.deploy(index, cert, cert.order_id, data, ctx),
                None => Vec::new(),
            },
        }
    }

    fn cert_state(
        &self,
        cert: &CertificateConfig,
        data: Option<&CertData>,
    ) -> Result<CertState, KeyStoreError> {
        let Some(data) = data else {
            return Ok(CertState {
                status: None,
                expires_at: None,
                key: KeyState::Missing,
                already_deployed: false,
            });
        };

        let mut state = CertState {
            status: Some(data.status),
            expires_at: data.expires_at,
            key: KeyState::Missing,
            already_deployed: false,
        };
        let Some(pem) = data.certificate.as_deref() else {
            return Ok(state);
        };

        if let Ok(info) = certificate::inspect(pem) {
            state.expires_at = Some(info.not_after);
            let deployed = self
                .keystore
                .meta(cert.order_id)?
                .and_then(|meta| meta.deployed_thumbprint);
            state.already_deployed = deployed
                .as_deref()
                .is_some_and(|t| t.eq_ignore_ascii_case(&info.thumbprint));
        }
        if cert.strategy() == Strategy::LocalKey {
            state.key = match self.keystore.check_key(cert.order_id, pem)? {
                KeyCheck::Matches => KeyState::Matches,
                KeyCheck::Mismatch => KeyState::Mismatch,
                KeyCheck::Missing => KeyState::Missing,
            };
        }
        Ok(state)
    }

    fn request_new(
        &self,
        index: usize,
        cert: &CertificateConfig,
        reason: RequestReason,
        ctx: &PassContext<'_>,
    ) -> Vec<DeploymentResult> {
        let order_id = cert.order_id;
        let fail = |order_id: u64, message: String| {
            warn!("[orchestrator] {}: {}", cert.domain, message);
            vec![DeploymentResult::failed(&cert.domain, order_id, message)]
        };

        if reason == RequestReason::KeyMismatch {
            warn!(
                "[orchestrator] {}: stored private key for order {} does not match the issued certificate; discarding the record and requesting a new certificate",
                cert.domain, order_id
            );
            if let Err(err) = self.keystore.delete(order_id) {
                return fail(order_id, err.to_string());
            }
        } else {
            info!(
                "[orchestrator] {}: requesting a new certificate ({:?})",
                cert.domain, reason
            );
        }

        let domains = cert.all_domains();
        let generated = match cert.strategy() {
            Strategy::LocalKey => match csr::generate_signing_request(&domains) {
                Ok(generated) => Some(generated),
                Err(err) => return fail(order_id, err.to_string()),
            },
            Strategy::RemoteKey => None,
        };
        let request = SigningRequest {
            order_id: (order_id != 0).then_some(order_id),
            domain: cert.domain.clone(),
            domains: domains.clone(),
            csr: generated.as_ref().map(|g| g.csr_pem.clone()),
            validation_method: cert.effective_validation_method(),
        };
        let response = match self.issuer.submit_signing_request(&request) {
            Ok(response) if response.order_id != 0 => response,
            Ok(_) => return fail(order_id, "issuer returned no order id".into()),
            Err(err) => return fail(order_id, err.to_string()),
        };
        let new_id = response.order_id;
        info!(
            "[orchestrator] {}: order {} submitted, issuer reports {:?}",
            cert.domain, new_id, response.status
        );

        if let Some(generated) = &generated {
            if let Err(err) = self.keystore.store_private_key(
                new_id,
                &domains,
                &generated.private_key_pem,
                response.status,
            ) {
                return fail(new_id, err.to_string());
            }
        }
        if new_id != order_id {
            if let Err(err) = self.config.set_order_id(index, &cert.domain, new_id) {
                return fail(new_id, err.to_string());
            }
        }

        let wants_challenges = response.status == CertStatus::Processing
            && cert.effective_validation_method() == ValidationMethod::File;
        if response.status != CertStatus::Active && !wants_challenges {
            return Vec::new();
        }
        match self.issuer.get_certificate(new_id) {
            Ok(data) if data.status == CertStatus::Active && data.certificate.is_some() => {
                self.deploy(index, cert, new_id, &data, ctx)
            }
            Ok(data) => self.answer_challenges(cert, new_id, &data),
            Err(err) => fail(new_id, err.to_string()),
        }
    }

    /// Places file-validation artifacts for a pending order. Only failures
    /// produce results.
    fn answer_challenges(
        &self,
        cert: &CertificateConfig,
        order_id: u64,
        data: &CertData,
    ) -> Vec<DeploymentResult> {
        if cert.effective_validation_method() != ValidationMethod::File {
            return Vec::new();
        }
        data.file_challenges
            .iter()
            .filter_map(|challenge| {
                match self.challenges.respond_to_file_challenge(
                    &challenge.domain,
                    &challenge.path,
                    &challenge.content,
                ) {
                    Ok(_) => None,
                    Err(err) => {
                        warn!(
                            "[orchestrator] {}: file challenge failed: {}",
                            challenge.domain, err
                        );
                        Some(DeploymentResult::failed(
                            &challenge.domain,
                            order_id,
                            format!("file challenge failed: {err}"),
                        ))
                    }
                }
            })
            .collect()
    }

    fn deploy(
        &self,
        index: usize,
        cert: &CertificateConfig,
        order_id: u64,
        data: &CertData,
        ctx: &PassContext<'_>,
    ) -> Vec<DeploymentResult> {
        let fail = |message: String| {
            warn!("[orchestrator] {}: {}", cert.domain, message);
            vec![DeploymentResult::failed(&cert.domain, order_id, message)]
        };
        let Some(certificate_pem) = data.certificate.as_deref() else {
            return fail(format!("issuer returned no certificate for order {order_id}"));
        };

        let private_key = match cert.strategy() {
            Strategy::LocalKey => match self.keystore.private_key(order_id) {
                Ok(Some(key)) => key,
                Ok(None) => return fail(format!("no local private key for order {order_id}")),
                Err(err) => return fail(err.to_string()),
            },
            Strategy::RemoteKey => match data.private_key.as_deref() {
                Some(key) => Zeroizing::new(key.to_string()),
                None => return fail(format!("issuer returned no private key for order {order_id}")),
            },
        };

        let domains = cert.all_domains();
        let meta = match self.keystore.store_certificate(
            order_id,
            &domains,
            certificate_pem,
            data.chain.as_deref(),
            data.status,
        ) {
            Ok(meta) => meta,
            Err(KeyStoreError::KeyMismatch(id)) => {
                warn!(
                    "[orchestrator] {}: stored private key for order {} does not match the issued certificate; discarding the record",
                    cert.domain, id
                );
                if let Err(err) = self.keystore.delete(id) {
                    warn!("[orchestrator] failed to discard order {}: {}", id, err);
                }
                return fail(KeyStoreError::KeyMismatch(id).to_string());
            }
            Err(err) => return fail(err.to_string()),
        };
        if let Some(expires_at) = meta.expires_at {
            if cert.expires_at != Some(expires_at) {
                if let Err(err) = self.config.set_expires_at(index, &cert.domain, expires_at) {
                    warn!("[orchestrator] {}: could not record expiry: {}", cert.domain, err);
                }
            }
        }

        let targets = match resolve_targets(cert, self.inventory.as_ref()) {
            Ok(targets) => targets,
            Err(err) => return fail(err.to_string()),
        };
        if targets.is_empty() {
            return fail("no listeners found for the certificate's domains".into());
        }
        let owned: Vec<BindingTarget> = targets
            .into_iter()
            .filter(|target| {
                let owned = owns_target(index, cert, target, ctx);
                if !owned {
                    info!(
                        "[orchestrator] {}: {} belongs to another configuration this pass",
                        cert.domain, target
                    );
                }
                owned
            })
            .collect();
        if owned.is_empty() {
            return Vec::new();
        }

        let material = CertificateMaterial {
            certificate_pem: certificate_pem.to_string(),
            private_key_pem: private_key,
            chain_pem: data.chain.clone(),
        };
        let results = self.deployer.deploy(order_id, &material, &owned);
        if results.iter().all(|r| r.success) {
            if let Some(thumbprint) = results.iter().find_map(|r| r.thumbprint.as_deref()) {
                if let Err(err) = self.keystore.mark_deployed(order_id, thumbprint, ctx.now) {
                    warn!("[orchestrator] {}: could not record deployment: {}", cert.domain, err);
                }
            }
        }
        results
    }
}

/// A target is ours unless one of the bind claims covering it belongs to
/// another configuration.
fn owns_target(
    index: usize,
    cert: &CertificateConfig,
    target: &BindingTarget,
    ctx: &PassContext<'_>,
) -> bool {
    cert.bind_domains()
        .iter()
        .filter(|claim| host_matches(claim, &target.domain))
        .all(|claim| conflict::owns(index, claim, ctx.conflicts, ctx.configs))
}
