//! Command-line surface: one pass, the background service, status and config check.

use std::{collections::BTreeSet, path::PathBuf, process::ExitCode, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use log::{error, info, warn};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::{
    core::{
        config::{AppConfig, ConfigStore, NotifySettings},
        types::DeploymentResult,
    },
    deploy::{binder::Deployer, convert::OpensslPfxConverter},
    issuance::{client::HttpIssuerClient, issuer::IssuerApi},
    notify::CallbackNotifier,
    orchestrator::Orchestrator,
    platform::{
        command::{CommandRunner, SystemCommandRunner},
        iis::{IisHost, detect_legacy},
    },
    renewal::policy::days_until,
    scheduler::Scheduler,
    secrets::{create_master_key_store, vault::MasterKeyVault},
    storage::{StateLock, keystore::KeyStore},
};

const SERVICE_NAME: &str = "certbinder";
const CALLBACK_DRAIN_TIMEOUT: Duration = Duration::from_secs(120);

/// Certificate renewal and binding agent
#[derive(Parser, Debug)]
#[command(name = "certbinder", version)]
#[command(about = "Renews, installs and binds TLS certificates for this host", long_about = None)]
pub struct Cli {
    /// Path to the JSON configuration file
    #[arg(short, long, env = "CERTBINDER_CONFIG", default_value = "certbinder.json")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one pass and exit; non-zero exit if any domain failed
    Run,
    /// Run passes on the configured interval until stopped.
    /// Any line on stdin triggers a pass, `quit` exits.
    Serve,
    /// Show configured certificates, their orders and days left
    Status,
    /// Validate the configuration file and exit
    Check,
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cli.log_level))
        .init();

    match execute(cli) {
        Ok(code) => code,
        Err(err) => {
            error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

fn execute(cli: Cli) -> Result<ExitCode> {
    let store = ConfigStore::new(&cli.config, StateLock::new());
    match cli.command {
        Commands::Check => check(&store),
        Commands::Status => status(&store),
        Commands::Run => run_once(&store),
        Commands::Serve => serve(&store),
    }
}

fn check(store: &ConfigStore) -> Result<ExitCode> {
    let app = store
        .load()
        .with_context(|| format!("invalid configuration {}", store.path().display()))?;
    let mut invalid = 0;
    for cert in &app.certificates {
        match AppConfig::validate_certificate(cert) {
            Ok(()) => println!("ok       {}", cert.domain),
            Err(err) => {
                invalid += 1;
                println!("invalid  {err}");
            }
        }
    }
    println!(
        "{} certificate entries, {} invalid",
        app.certificates.len(),
        invalid
    );
    Ok(if invalid == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn status(store: &ConfigStore) -> Result<ExitCode> {
    let app = store.load()?;
    let keystore = open_keystore(store, &app)?;
    let now = Utc::now();
    for cert in &app.certificates {
        let meta = if cert.order_id == 0 {
            None
        } else {
            keystore.meta(cert.order_id)?
        };
        let expires_at = meta
            .as_ref()
            .and_then(|meta| meta.expires_at)
            .or(cert.expires_at);
        let days = expires_at
            .map(|at| days_until(at, now).to_string())
            .unwrap_or_else(|| "-".to_string());
        let deployed = meta
            .and_then(|meta| meta.deployed_thumbprint)
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<40} order {:<10} {:<8} days left {:<6} deployed {}",
            cert.domain,
            cert.order_id,
            if cert.enabled { "enabled" } else { "disabled" },
            days,
            deployed
        );
    }

    let referenced = app.certificates.iter().map(|cert| cert.order_id);
    for order_id in orphaned_orders(keystore.order_ids()?, referenced) {
        let domains = keystore
            .meta(order_id)?
            .map(|meta| meta.domains.join(","))
            .unwrap_or_else(|| "-".to_string());
        println!("orphaned record for order {order_id:<10} domains {domains}");
    }
    Ok(ExitCode::SUCCESS)
}

/// Stored order ids no configuration entry refers to, ascending.
fn orphaned_orders(stored: Vec<u64>, referenced: impl IntoIterator<Item = u64>) -> Vec<u64> {
    let referenced: BTreeSet<u64> = referenced.into_iter().collect();
    stored
        .into_iter()
        .filter(|id| !referenced.contains(id))
        .collect()
}

fn open_keystore(store: &ConfigStore, app: &AppConfig) -> Result<KeyStore> {
    let data_dir = store.data_dir(app);
    let vault = Arc::new(MasterKeyVault::new(create_master_key_store(
        app.master_key,
        SERVICE_NAME,
        &data_dir,
    )));
    KeyStore::open(&data_dir, vault, store.lock().clone())
        .with_context(|| format!("failed to open key store in {}", data_dir.display()))
}

/// Long-lived collaborators shared by `run` and `serve`. Built outside the
/// async runtime because the issuer client is blocking.
struct Services {
    store: ConfigStore,
    app: AppConfig,
    keystore: KeyStore,
    issuer: Arc<dyn IssuerApi>,
    host: Arc<IisHost>,
    legacy: bool,
}

impl Services {
    fn build(store: &ConfigStore) -> Result<Self> {
        let app = store.load()?;
        let keystore = open_keystore(store, &app)?;
        let issuer: Arc<dyn IssuerApi> = Arc::new(
            HttpIssuerClient::new(
                &app.issuer.base_url,
                &app.issuer.token,
                Duration::from_secs(app.issuer.timeout_secs),
            )
            .context("failed to build issuer client")?,
        );
        let runner: Arc<dyn CommandRunner> = Arc::new(SystemCommandRunner);
        let legacy = match app.legacy_binding {
            Some(legacy) => legacy,
            None => detect_legacy(runner.as_ref()).unwrap_or_else(|err| {
                warn!("[deploy] could not detect SNI support, assuming it is available: {err:#}");
                false
            }),
        };
        info!(
            "[deploy] binding mode: {}",
            if legacy { "legacy (shared IP)" } else { "SNI" }
        );
        Ok(Self {
            store: store.clone(),
            app,
            keystore,
            issuer,
            host: Arc::new(IisHost::new(runner)),
            legacy,
        })
    }

    /// Must be called inside the runtime: starts the callback worker.
    fn orchestrator(&self) -> (Arc<Orchestrator>, CallbackWorker) {
        let (notifier, worker) = CallbackWorker::start(self.issuer.clone(), self.app.notify);
        let deployer = Deployer::new(
            Arc::new(OpensslPfxConverter::new(self.legacy)),
            self.host.clone(),
            self.host.clone(),
            self.legacy,
        );
        let orchestrator = Orchestrator::new(
            self.store.clone(),
            self.keystore.clone(),
            self.issuer.clone(),
            deployer,
            self.host.clone(),
            Arc::new(notifier),
        );
        (Arc::new(orchestrator), worker)
    }
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")
}

/// The callback worker and the token that stops it. Interrupts and `quit`
/// never reach this token; only [`CallbackWorker::drain`] cancels it.
struct CallbackWorker {
    handle: JoinHandle<()>,
    stop: CancellationToken,
}

impl CallbackWorker {
    fn start(api: Arc<dyn IssuerApi>, settings: NotifySettings) -> (CallbackNotifier, Self) {
        let stop = CancellationToken::new();
        let (notifier, handle) = CallbackNotifier::spawn(api, settings, stop.clone());
        (notifier, Self { handle, stop })
    }

    /// Waits for the queue to empty once every notifier handle is dropped.
    /// Callbacks still queued after `timeout` are dropped.
    async fn drain(self, timeout: Duration) {
        let abort = self.handle.abort_handle();
        if tokio::time::timeout(timeout, self.handle).await.is_err() {
            warn!("[notify] callbacks still pending at shutdown; dropping them");
            self.stop.cancel();
            abort.abort();
        }
    }
}

fn spawn_ctrl_c(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            cancel.cancel();
        }
    });
}

fn print_results(results: &[DeploymentResult]) {
    for result in results {
        println!(
            "{}  {:<40} order {:<10} {}",
            if result.success { "ok  " } else { "FAIL" },
            result.domain,
            result.order_id,
            result.message
        );
    }
}

fn run_once(store: &ConfigStore) -> Result<ExitCode> {
    let services = Services::build(store)?;
    let runtime = runtime()?;
    let results = runtime.block_on(async {
        let cancel = CancellationToken::new();
        spawn_ctrl_c(cancel.clone());
        let (orchestrator, worker) = services.orchestrator();

        let pass_cancel = cancel.clone();
        let results = tokio::task::spawn_blocking(move || {
            orchestrator.run_pass(&pass_cancel, Utc::now())
        })
        .await
        .context("pass aborted")??;

        worker.drain(CALLBACK_DRAIN_TIMEOUT).await;
        Ok::<_, anyhow::Error>(results)
    })?;
    drop(runtime);

    print_results(&results);
    Ok(if results.iter().all(|r| r.success) {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn serve(store: &ConfigStore) -> Result<ExitCode> {
    let services = Services::build(store)?;
    let runtime = runtime()?;
    runtime.block_on(async {
        let cancel = CancellationToken::new();
        spawn_ctrl_c(cancel.clone());
        let (orchestrator, worker) = services.orchestrator();

        let scheduler = Scheduler::new(
            orchestrator,
            Duration::from_secs(services.app.schedule.interval_secs),
            cancel.clone(),
        );
        let trigger = scheduler.trigger();
        let stdin_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            loop {
                tokio::select! {
                    _ = stdin_cancel.cancelled() => break,
                    line = lines.next_line() => match line {
                        Ok(Some(line)) if line.trim().eq_ignore_ascii_case("quit") => {
                            stdin_cancel.cancel();
                            break;
                        }
                        Ok(Some(_)) => trigger.notify_one(),
                        Ok(None) | Err(_) => break,
                    },
                }
            }
        });

        // The scheduler owns the orchestrator, so its notifier is gone once `run` returns.
        scheduler.run().await;
        cancel.cancel();
        worker.drain(CALLBACK_DRAIN_TIMEOUT).await;
    });
    runtime.shutdown_timeout(Duration::from_secs(5));
    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::issuance::issuer::{
        CallbackStatus, CertData, IssuerError, SigningRequest, SubmitResponse,
    };
    use crate::notify::CallbackSink;
    use clap::CommandFactory;
    use std::{ffi::OsStr, sync::Mutex};

    #[derive(Default)]
    struct RecordingIssuer {
        delivered: Mutex<Vec<(u64, String)>>,
    }

    impl IssuerApi for RecordingIssuer {
        fn get_certificate(&self, order_id: u64) -> Result<CertData, IssuerError> {
            Err(IssuerError::NotFound(order_id))
        }

        fn submit_signing_request(
            &self,
            _request: &SigningRequest,
        ) -> Result<SubmitResponse, IssuerError> {
            Err(IssuerError::Rejected("unused".into()))
        }

        fn notify(
            &self,
            order_id: u64,
            domain: &str,
            _status: CallbackStatus,
            _message: &str,
        ) -> Result<(), IssuerError> {
            std::thread::sleep(Duration::from_millis(10));
            self.delivered
                .lock()
                .unwrap()
                .push((order_id, domain.to_string()));
            Ok(())
        }
    }

    #[test]
    fn command_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn config_path_reads_from_environment_variable() {
        let command = Cli::command();
        let config = command
            .get_arguments()
            .find(|arg| arg.get_id() == "config")
            .expect("config argument");
        assert_eq!(config.get_env(), Some(OsStr::new("CERTBINDER_CONFIG")));

        let cli = Cli::try_parse_from(["certbinder", "--config", "/etc/cb.json", "status"])
            .expect("parse");
        assert_eq!(cli.config, PathBuf::from("/etc/cb.json"));
        assert!(matches!(cli.command, Commands::Status));
        assert_eq!(cli.log_level, "info");
    }

    #[test]
    fn orphaned_orders_are_those_without_configuration() {
        assert_eq!(orphaned_orders(vec![3, 7, 12, 40], [12, 0, 3, 99]), vec![7, 40]);
        assert!(orphaned_orders(vec![5], [5]).is_empty());
    }

    #[tokio::test]
    async fn shutdown_still_delivers_queued_callbacks() {
        let issuer = Arc::new(RecordingIssuer::default());
        let shutdown = CancellationToken::new();
        let (notifier, worker) = CallbackWorker::start(issuer.clone(), NotifySettings::default());

        for order_id in 1..=3 {
            notifier.notify(order_id, &format!("d{order_id}.example.com"), true, "deployed");
        }
        shutdown.cancel();
        drop(notifier);
        worker.drain(Duration::from_secs(5)).await;

        let delivered = issuer.delivered.lock().unwrap();
        assert_eq!(
            delivered.iter().map(|(id, _)| *id).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
    }

    #[tokio::test]
    async fn drain_gives_up_while_a_notifier_is_still_held() {
        let issuer = Arc::new(RecordingIssuer::default());
        let (notifier, worker) = CallbackWorker::start(issuer.clone(), NotifySettings::default());
        let stop = worker.stop.clone();

        tokio::time::timeout(Duration::from_secs(5), worker.drain(Duration::from_millis(50)))
            .await
            .expect("drain returns after its timeout");
        assert!(stop.is_cancelled());
        notifier.notify(1, "late.example.com", true, "deployed");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(issuer.delivered.lock().unwrap().is_empty());
    }
}
