//! Windows/IIS host: machine certificate store through `certutil` and
//! PowerShell, HTTP.sys bindings through `netsh http`, sites through the
//! WebAdministration module.

use std::{net::IpAddr, path::PathBuf, sync::Arc};

use anyhow::{Context, Result, anyhow};
use log::{debug, info, warn};
use serde::Deserialize;
use uuid::Uuid;

use super::command::CommandRunner;
use crate::{
    core::types::BindEndpoint,
    deploy::{
        DeployError,
        host::{BindingTable, CertificateInstaller, Site, SiteBinding, SiteInventory},
    },
    storage::atomic::write_atomic,
};

/// Application id IIS itself registers its HTTP.sys certificate bindings under.
const IIS_APP_ID: &str = "{4dc3e181-e14b-4a21-b022-59fc669b0914}";

pub struct IisHost {
    runner: Arc<dyn CommandRunner>,
}

impl IisHost {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    fn powershell(&self, script: &str) -> Result<String> {
        self.runner.run_combined(
            "powershell",
            &[
                "-NoProfile".to_string(),
                "-NonInteractive".to_string(),
                "-Command".to_string(),
                script.to_string(),
            ],
        )
    }
}

fn checked_thumbprint(thumbprint: &str) -> Result<&str, DeployError> {
    if thumbprint.len() == 40 && thumbprint.chars().all(|c| c.is_ascii_hexdigit()) {
        Ok(thumbprint)
    } else {
        Err(DeployError::Install(format!("invalid thumbprint {thumbprint:?}")))
    }
}

/// `ipport=1.2.3.4:443`, `ipport=[::1]:443` or `hostnameport=host:443`.
fn binding_key(endpoint: &BindEndpoint, port: u16) -> String {
    match endpoint {
        BindEndpoint::Ip(IpAddr::V6(ip)) => format!("ipport=[{ip}]:{port}"),
        BindEndpoint::Ip(ip) => format!("ipport={ip}:{port}"),
        BindEndpoint::Sni(host) => format!("hostnameport={host}:{port}"),
    }
}

impl CertificateInstaller for IisHost {
    fn install(&self, pfx: &[u8], password: &str, thumbprint: &str) -> Result<(), DeployError> {
        checked_thumbprint(thumbprint)?;
        let path = std::env::temp_dir().join(format!("certbinder-{}.pfx", Uuid::new_v4()));
        write_atomic(&path, pfx).map_err(|err| DeployError::Install(err.to_string()))?;

        let result = self.runner.run_combined(
            "certutil",
            &[
                "-f".to_string(),
                "-p".to_string(),
                password.to_string(),
                "-importPFX".to_string(),
                "My".to_string(),
                path.to_string_lossy().to_string(),
            ],
        );
        if let Err(err) = std::fs::remove_file(&path) {
            warn!("[deploy] failed to remove {}: {}", path.display(), err);
        }
        result.map_err(|err| DeployError::Install(err.to_string()))?;
        info!("[deploy] imported certificate {}", thumbprint);
        Ok(())
    }

    fn is_installed(&self, thumbprint: &str) -> Result<bool, DeployError> {
        let thumbprint = checked_thumbprint(thumbprint)?;
        let output = self
            .powershell(&format!("Test-Path Cert:\\LocalMachine\\My\\{thumbprint}"))
            .map_err(|err| DeployError::Install(err.to_string()))?;
        Ok(output.trim().eq_ignore_ascii_case("true"))
    }

    fn set_friendly_name(&self, thumbprint: &str, name: &str) -> Result<(), DeployError> {
        let thumbprint = checked_thumbprint(thumbprint)?;
        let script = format!(
            "(Get-Item Cert:\\LocalMachine\\My\\{thumbprint}).FriendlyName = '{}'",
            name.replace('\'', "''")
        );
        self.powershell(&script)
            .map(|_| ())
            .map_err(|err| DeployError::Install(err.to_string()))
    }
}

/// Reads the `Certificate Hash` field out of `netsh http show sslcert`.
fn parse_certificate_hash(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let (label, value) = line.split_once(':')?;
        if label.trim().eq_ignore_ascii_case("Certificate Hash") {
            let value = value.trim();
            (!value.is_empty()).then(|| value.to_ascii_uppercase())
        } else {
            None
        }
    })
}

impl BindingTable for IisHost {
    fn query(&self, endpoint: &BindEndpoint, port: u16) -> Result<Option<String>, DeployError> {
        let key = binding_key(endpoint, port);
        let output = self
            .runner
            .run(
                "netsh",
                &["http".into(), "show".into(), "sslcert".into(), key.clone()],
            )
            .map_err(|err| DeployError::Bind {
                target: key.clone(),
                reason: err.to_string(),
            })?;
        let hash = parse_certificate_hash(&output.stdout);
        if hash.is_none() && !output.success {
            // netsh exits non-zero when nothing is bound to the key.
            debug!("[deploy] no binding at {}: {}", key, output.combined());
        }
        Ok(hash)
    }

    fn remove(&self, endpoint: &BindEndpoint, port: u16) -> Result<(), DeployError> {
        let key = binding_key(endpoint, port);
        self.runner
            .run_combined(
                "netsh",
                &["http".into(), "delete".into(), "sslcert".into(), key.clone()],
            )
            .map(|_| ())
            .map_err(|err| DeployError::Bind {
                target: key,
                reason: err.to_string(),
            })
    }

    fn add(&self, endpoint: &BindEndpoint, port: u16, thumbprint: &str) -> Result<(), DeployError> {
        let thumbprint = checked_thumbprint(thumbprint)?;
        let key = binding_key(endpoint, port);
        self.runner
            .run_combined(
                "netsh",
                &[
                    "http".into(),
                    "add".into(),
                    "sslcert".into(),
                    key.clone(),
                    format!("certhash={thumbprint}"),
                    format!("appid={IIS_APP_ID}"),
                    "certstorename=MY".into(),
                ],
            )
            .map(|_| ())
            .map_err(|err| DeployError::Bind {
                target: key,
                reason: err.to_string(),
            })
    }
}

/// `ConvertTo-Json` emits a bare object instead of a one-element array.
#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    Many(Vec<T>),
    One(T),
}

impl<T> OneOrMany<T> {
    fn into_vec(self) -> Vec<T> {
        match self {
            OneOrMany::Many(items) => items,
            OneOrMany::One(item) => vec![item],
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSite {
    name: String,
    #[serde(default)]
    physical_path: String,
    #[serde(default)]
    bindings: Option<OneOrMany<RawBinding>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawBinding {
    protocol: String,
    binding_information: String,
}

const SITES_SCRIPT: &str = "Import-Module WebAdministration; \
Get-Website | Select-Object name, physicalPath, \
@{n='bindings';e={$_.bindings.Collection | Select-Object protocol, bindingInformation}} \
| ConvertTo-Json -Depth 4";

/// Splits IIS `bindingInformation` (`ip:port:host`). Returns `None` for
/// non-HTTP bindings such as `808:*`.
fn parse_binding_information(protocol: &str, info: &str) -> Option<SiteBinding> {
    let mut parts = info.rsplitn(3, ':');
    let host = parts.next()?;
    let port = parts.next()?.parse().ok()?;
    let ip = parts.next()?;
    let ip = match ip.trim_matches(|c| c == '[' || c == ']') {
        "" | "*" => None,
        literal => Some(literal.parse().ok()?),
    };
    Some(SiteBinding {
        protocol: protocol.to_ascii_lowercase(),
        ip,
        port,
        host: host.to_ascii_lowercase(),
    })
}

/// Expands `%VAR%` references the way IIS stores physical paths.
fn expand_env_vars(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(start) = rest.find('%') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        match after.find('%') {
            Some(end) => {
                let name = &after[..end];
                match std::env::var(name) {
                    Ok(value) if !name.is_empty() => out.push_str(&value),
                    _ => {
                        out.push('%');
                        out.push_str(name);
                        out.push('%');
                    }
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

fn parse_sites(json: &str) -> Result<Vec<Site>> {
    if json.trim().is_empty() {
        return Ok(Vec::new());
    }
    let raw: OneOrMany<RawSite> =
        serde_json::from_str(json).context("failed to parse site list")?;
    Ok(raw
        .into_vec()
        .into_iter()
        .map(|site| Site {
            physical_path: PathBuf::from(expand_env_vars(&site.physical_path)),
            bindings: site
                .bindings
                .map(OneOrMany::into_vec)
                .unwrap_or_default()
                .iter()
                .filter_map(|b| parse_binding_information(&b.protocol, &b.binding_information))
                .collect(),
            name: site.name,
        })
        .collect())
}

impl SiteInventory for IisHost {
    fn sites(&self) -> Result<Vec<Site>, DeployError> {
        self.powershell(SITES_SCRIPT)
            .and_then(|json| parse_sites(&json))
            .map_err(|err| DeployError::Discovery(err.to_string()))
    }
}

/// True when the host predates SNI support (Windows 7 / Server 2008 R2 and older).
pub fn detect_legacy(runner: &dyn CommandRunner) -> Result<bool> {
    let output = runner.run_combined(
        "powershell",
        &[
            "-NoProfile".to_string(),
            "-Command".to_string(),
            "[Environment]::OSVersion.Version.ToString()".to_string(),
        ],
    )?;
    let mut parts = output.trim().split('.');
    let major: u32 = parts
        .next()
        .and_then(|p| p.parse().ok())
        .ok_or_else(|| anyhow!("unexpected OS version {output:?}"))?;
    let minor: u32 = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    Ok(major < 6 || (major == 6 && minor < 2))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::command::CommandOutput;
    use std::{collections::VecDeque, sync::Mutex};

    #[derive(Default)]
    struct ScriptedRunner {
        calls: Mutex<Vec<(String, Vec<String>)>>,
        replies: Mutex<VecDeque<CommandOutput>>,
    }

    impl ScriptedRunner {
        fn reply(self, success: bool, stdout: &str) -> Self {
            self.replies.lock().unwrap().push_back(CommandOutput {
                success,
                code: Some(if success { 0 } else { 1 }),
                stdout: stdout.to_string(),
                stderr: String::new(),
            });
            self
        }
    }

    impl CommandRunner for ScriptedRunner {
        fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
            self.calls
                .lock()
                .unwrap()
                .push((program.to_string(), args.to_vec()));
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| anyhow!("unexpected call to {program}"))
        }
    }

    const THUMB: &str = "0123456789ABCDEF0123456789ABCDEF01234567";

    #[test]
    fn query_reads_certificate_hash() {
        let show = "\r\nSSL Certificate bindings:\r\n-------------------------\r\n\r\n    Hostname:port                : www.example.com:443\r\n    Certificate Hash             : 0123456789abcdef0123456789abcdef01234567\r\n    Application ID               : {4dc3e181-e14b-4a21-b022-59fc669b0914}\r\n";
        let runner = Arc::new(ScriptedRunner::default().reply(true, show).reply(
            false,
            "SSL Certificate delete failed, Error: 2\nThe system cannot find the file specified.",
        ));
        let host = IisHost::new(runner.clone());

        let sni = BindEndpoint::Sni("www.example.com".into());
        assert_eq!(host.query(&sni, 443).unwrap().as_deref(), Some(THUMB));
        let ip = BindEndpoint::Ip("::1".parse().unwrap());
        assert_eq!(host.query(&ip, 443).unwrap(), None);

        let calls = runner.calls.lock().unwrap();
        assert_eq!(calls[0].1[3], "hostnameport=www.example.com:443");
        assert_eq!(calls[1].1[3], "ipport=[::1]:443");
    }

    #[test]
    fn add_passes_hash_and_app_id() {
        let runner = Arc::new(ScriptedRunner::default().reply(true, "SSL Certificate successfully added"));
        let host = IisHost::new(runner.clone());
        host.add(&BindEndpoint::Ip("0.0.0.0".parse().unwrap()), 443, THUMB)
            .expect("add");
        let calls = runner.calls.lock().unwrap();
        assert_eq!(calls[0].0, "netsh");
        assert!(calls[0].1.contains(&"ipport=0.0.0.0:443".to_string()));
        assert!(calls[0].1.contains(&format!("certhash={THUMB}")));
        assert!(calls[0].1.contains(&format!("appid={IIS_APP_ID}")));

        assert!(host.add(&BindEndpoint::Sni("x".into()), 443, "nothex").is_err());
    }

    #[test]
    fn install_removes_temporary_pfx() {
        let runner = Arc::new(ScriptedRunner::default().reply(false, "CertUtil: -importPFX command FAILED"));
        let host = IisHost::new(runner.clone());
        let err = host.install(b"pfx", "pw", THUMB).unwrap_err();
        assert!(matches!(err, DeployError::Install(_)));

        let calls = runner.calls.lock().unwrap();
        let pfx_path = PathBuf::from(calls[0].1.last().unwrap());
        assert!(!pfx_path.exists());
    }

    #[test]
    fn parses_sites_from_single_and_multiple_objects() {
        let many = r#"[
            {"name": "Default Web Site", "physicalPath": "C:\\inetpub\\wwwroot",
             "bindings": [
                {"protocol": "http", "bindingInformation": "*:80:"},
                {"protocol": "https", "bindingInformation": "10.0.0.5:443:WWW.Example.com"},
                {"protocol": "net.tcp", "bindingInformation": "808:*"}
             ]},
            {"name": "Empty", "physicalPath": "D:\\sites\\empty", "bindings": null}
        ]"#;
        let sites = parse_sites(many).expect("sites");
        assert_eq!(sites.len(), 2);
        assert_eq!(sites[0].bindings.len(), 2);
        assert_eq!(sites[0].bindings[0].ip, None);
        assert_eq!(sites[0].bindings[1].host, "www.example.com");
        assert_eq!(sites[0].bindings[1].ip, Some("10.0.0.5".parse().unwrap()));
        assert!(sites[1].bindings.is_empty());

        let one = r#"{"name": "Api", "physicalPath": "C:\\api",
            "bindings": {"protocol": "https", "bindingInformation": "[::1]:8443:"}}"#;
        let sites = parse_sites(one).expect("single");
        assert_eq!(sites[0].bindings[0].port, 8443);
        assert_eq!(sites[0].bindings[0].ip, Some("::1".parse().unwrap()));
    }

    #[test]
    fn expands_known_variables_only() {
        let path = std::env::var("PATH").unwrap_or_default();
        assert_eq!(expand_env_vars("%PATH%\\x"), format!("{path}\\x"));
        assert_eq!(
            expand_env_vars("%CERTBINDER_SURELY_UNSET%\\wwwroot"),
            "%CERTBINDER_SURELY_UNSET%\\wwwroot"
        );
        assert_eq!(expand_env_vars("100%"), "100%");
    }

    #[test]
    fn legacy_detection_uses_os_version() {
        let runner = ScriptedRunner::default()
            .reply(true, "6.1.7601.65536\r\n")
            .reply(true, "10.0.20348.0");
        assert!(detect_legacy(&runner).unwrap());
        assert!(!detect_legacy(&runner).unwrap());
    }
}
