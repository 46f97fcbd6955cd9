//! File-based domain validation: places the issuer's proof file under the
//! web root of the site that serves the domain.

use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
};

use log::{debug, info, warn};
use thiserror::Error;

use crate::{
    deploy::{
        DeployError,
        host::{Site, SiteInventory},
    },
    storage::atomic::write_atomic_readable,
};

const WELL_KNOWN: &str = ".well-known";

/// Extensions a web server may execute or treat as configuration.
const BLOCKED_EXTENSIONS: &[&str] = &[
    "asa", "asax", "ascx", "ashx", "asmx", "asp", "aspx", "bat", "cer", "cgi", "cmd", "com",
    "config", "cshtml", "dll", "exe", "js", "msi", "php", "pl", "ps1", "py", "scr", "sh",
    "shtml", "vbs", "vbhtml",
];

const MIME_WEB_CONFIG: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<configuration>
  <system.webServer>
    <staticContent>
      <mimeMap fileExtension="." mimeType="text/plain" />
    </staticContent>
  </system.webServer>
</configuration>
"#;

#[derive(Debug, Error)]
pub enum ChallengeError {
    #[error("no site serves {0}")]
    NoSite(String),
    #[error("cannot choose a site for {domain}: catch-all candidates {candidates:?}")]
    AmbiguousSite {
        domain: String,
        candidates: Vec<String>,
    },
    #[error("rejected challenge path {path:?}: {reason}")]
    InvalidPath { path: String, reason: &'static str },
    #[error("challenge path {0} resolves outside the site root")]
    SymlinkEscape(PathBuf),
    #[error("site discovery failed: {0}")]
    Discovery(#[from] DeployError),
    #[error("challenge file write failed: {0}")]
    Io(String),
}

pub struct ChallengeResponder {
    inventory: Arc<dyn SiteInventory>,
}

impl ChallengeResponder {
    pub fn new(inventory: Arc<dyn SiteInventory>) -> Self {
        Self { inventory }
    }

    /// Writes `content` at `path` below the web root serving `domain` and
    /// returns the file's resolved location.
    pub fn respond_to_file_challenge(
        &self,
        domain: &str,
        path: &str,
        content: &str,
    ) -> Result<PathBuf, ChallengeError> {
        let segments = validate_path(path)?;
        let sites = self.inventory.sites()?;
        let site = site_for(domain, &sites)?;
        debug!("[challenge] {} served by site {}", domain, site.name);

        let root = fs::canonicalize(&site.physical_path).map_err(|err| {
            ChallengeError::Io(format!("{}: {}", site.physical_path.display(), err))
        })?;
        let Some((file_name, dirs)) = segments.split_last() else {
            return Err(ChallengeError::InvalidPath {
                path: path.to_string(),
                reason: "path names no file",
            });
        };

        let mut created = Vec::new();
        let result = place_file(&root, dirs, file_name, content, &mut created);
        if result.is_err() {
            for dir in created.iter().rev() {
                if let Err(err) = fs::remove_dir(dir) {
                    warn!("[challenge] failed to remove {}: {}", dir.display(), err);
                }
            }
        }
        let (dir, resolved) = result?;

        ensure_mime_config(&dir);
        info!("[challenge] wrote {} for {}", resolved.display(), domain);
        Ok(resolved)
    }
}

/// Descends from `root` one segment at a time, resolving every existing
/// prefix before anything below it is created. Directories made here are
/// recorded in `created`. Returns the directory and the written file.
fn place_file(
    root: &Path,
    dirs: &[String],
    file_name: &str,
    content: &str,
    created: &mut Vec<PathBuf>,
) -> Result<(PathBuf, PathBuf), ChallengeError> {
    let io = |path: &Path, err: std::io::Error| {
        ChallengeError::Io(format!("{}: {}", path.display(), err))
    };

    let mut dir = root.to_path_buf();
    for segment in dirs {
        let next = dir.join(segment);
        match fs::symlink_metadata(&next) {
            Ok(_) => {
                let resolved = fs::canonicalize(&next).map_err(|err| io(&next, err))?;
                if !resolved.starts_with(root) {
                    warn!(
                        "[challenge] {} resolves to {} outside {}",
                        next.display(),
                        resolved.display(),
                        root.display()
                    );
                    return Err(ChallengeError::SymlinkEscape(resolved));
                }
                if !resolved.is_dir() {
                    return Err(ChallengeError::Io(format!(
                        "{} is not a directory",
                        resolved.display()
                    )));
                }
                dir = resolved;
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                fs::create_dir(&next).map_err(|err| io(&next, err))?;
                created.push(next.clone());
                dir = next;
            }
            Err(err) => return Err(io(&next, err)),
        }
    }

    // The rename replaces a link at the final name rather than following it;
    // the resolved location is still checked before the file is accepted.
    let target = dir.join(file_name);
    write_atomic_readable(&target, content.as_bytes())
        .map_err(|err| ChallengeError::Io(err.to_string()))?;
    let resolved = match fs::canonicalize(&target) {
        Ok(resolved) => resolved,
        Err(err) => {
            let _ = fs::remove_file(&target);
            return Err(io(&target, err));
        }
    };
    if !resolved.starts_with(root) {
        if let Err(err) = fs::remove_file(&target) {
            warn!("[challenge] failed to remove {}: {}", target.display(), err);
        }
        warn!(
            "[challenge] {} escaped {} via {}",
            target.display(),
            root.display(),
            resolved.display()
        );
        return Err(ChallengeError::SymlinkEscape(resolved));
    }
    Ok((dir, resolved))
}

/// Splits a relative challenge path and rejects anything that could leave
/// `.well-known` or land an executable file.
fn validate_path(path: &str) -> Result<Vec<String>, ChallengeError> {
    let reject = |reason| ChallengeError::InvalidPath {
        path: path.to_string(),
        reason,
    };

    if path.starts_with('/') || path.starts_with('\\') {
        return Err(reject("rooted paths are not allowed"));
    }
    if path.contains(':') {
        return Err(reject("drive prefixes and streams are not allowed"));
    }
    if Path::new(path).is_absolute() {
        return Err(reject("absolute paths are not allowed"));
    }

    let segments: Vec<String> = path.split(['/', '\\']).map(str::to_string).collect();
    if segments.iter().any(|s| s == "..") {
        return Err(reject("parent directory segments are not allowed"));
    }
    if segments.iter().any(|s| s.is_empty() || s == ".") {
        return Err(reject("empty segments are not allowed"));
    }
    if segments.first().map(String::as_str) != Some(WELL_KNOWN) {
        return Err(reject("path must start with .well-known"));
    }
    if segments.len() < 2 {
        return Err(reject("path names no file"));
    }

    // Windows ignores trailing dots and spaces, so `x.aspx.` is `x.aspx`.
    let file_name = segments[segments.len() - 1].trim_end_matches(['.', ' ']);
    if let Some((_, extension)) = file_name.rsplit_once('.') {
        if BLOCKED_EXTENSIONS.contains(&extension.to_ascii_lowercase().as_str()) {
            return Err(reject("executable file extension"));
        }
    }
    Ok(segments)
}

/// The site bound to `domain`, else the single catch-all plain HTTP site.
fn site_for<'a>(domain: &str, sites: &'a [Site]) -> Result<&'a Site, ChallengeError> {
    if let Some(site) = sites.iter().find(|site| {
        site.bindings
            .iter()
            .any(|b| b.host.eq_ignore_ascii_case(domain))
    }) {
        return Ok(site);
    }

    let fallback: Vec<&Site> = sites
        .iter()
        .filter(|site| {
            site.bindings
                .iter()
                .any(|b| b.protocol == "http" && b.port == 80 && b.host.is_empty())
        })
        .collect();
    match fallback.as_slice() {
        [] => Err(ChallengeError::NoSite(domain.to_string())),
        [site] => Ok(*site),
        many => Err(ChallengeError::AmbiguousSite {
            domain: domain.to_string(),
            candidates: many.iter().map(|site| site.name.clone()).collect(),
        }),
    }
}

fn ensure_mime_config(dir: &Path) {
    let path = dir.join("web.config");
    if path.exists() {
        return;
    }
    match write_atomic_readable(&path, MIME_WEB_CONFIG.as_bytes()) {
        Ok(()) => debug!("[challenge] wrote {}", path.display()),
        Err(err) => warn!("[challenge] could not write {}: {}", path.display(), err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deploy::host::SiteBinding;
    use uuid::Uuid;

    struct Sites(Vec<Site>);

    impl SiteInventory for Sites {
        fn sites(&self) -> Result<Vec<Site>, DeployError> {
            Ok(self.0.clone())
        }
    }

    fn temp_root() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("certbinder-challenge-{}", Uuid::new_v4()));
        fs::create_dir_all(&dir).expect("create root");
        dir
    }

    fn site(name: &str, root: &Path, bindings: &[(&str, u16, &str)]) -> Site {
        Site {
            name: name.into(),
            physical_path: root.to_path_buf(),
            bindings: bindings
                .iter()
                .map(|(protocol, port, host)| SiteBinding {
                    protocol: protocol.to_string(),
                    ip: None,
                    port: *port,
                    host: host.to_string(),
                })
                .collect(),
        }
    }

    fn responder(sites: Vec<Site>) -> ChallengeResponder {
        ChallengeResponder::new(Arc::new(Sites(sites)))
    }

    #[test]
    fn writes_into_matching_site_with_mime_config() {
        let root = temp_root();
        let other = temp_root();
        let responder = responder(vec![
            site("Other", &other, &[("http", 80, "")]),
            site("Main", &root, &[("http", 80, "www.example.com")]),
        ]);

        let written = responder
            .respond_to_file_challenge(
                "WWW.example.com",
                ".well-known/pki-validation/ABC123.txt",
                "token",
            )
            .expect("write challenge");
        let root = fs::canonicalize(&root).unwrap();
        assert!(written.starts_with(&root));
        assert_eq!(fs::read_to_string(&written).unwrap(), "token");
        let config = root.join(".well-known/pki-validation/web.config");
        assert!(fs::read_to_string(config).unwrap().contains("text/plain"));

        fs::remove_dir_all(&root).ok();
        fs::remove_dir_all(&other).ok();
    }

    #[test]
    fn falls_back_to_single_catch_all_site() {
        let root = temp_root();
        let responder = responder(vec![
            site("Default", &root, &[("http", 80, ""), ("https", 443, "")]),
            site("Tls", &root, &[("https", 443, "")]),
        ]);
        responder
            .respond_to_file_challenge("unlisted.example.com", ".well-known/acme-challenge/tok", "t")
            .expect("fallback");
        fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn ambiguous_catch_all_is_an_error() {
        let a = temp_root();
        let b = temp_root();
        let responder = responder(vec![
            site("A", &a, &[("http", 80, "")]),
            site("B", &b, &[("http", 80, "")]),
        ]);
        let err = responder
            .respond_to_file_challenge("x.example.com", ".well-known/x.txt", "t")
            .unwrap_err();
        assert!(matches!(err, ChallengeError::AmbiguousSite { ref candidates, .. } if candidates.len() == 2));

        let none = ChallengeResponder::new(Arc::new(Sites(vec![])));
        assert!(matches!(
            none.respond_to_file_challenge("x.example.com", ".well-known/x.txt", "t"),
            Err(ChallengeError::NoSite(_))
        ));
        fs::remove_dir_all(&a).ok();
        fs::remove_dir_all(&b).ok();
    }

    #[test]
    fn rejects_unsafe_paths() {
        for path in [
            "../web.config",
            ".well-known/../../etc/passwd",
            "/.well-known/x.txt",
            "\\.well-known\\x.txt",
            "C:\\inetpub\\x.txt",
            "c:.well-known/x.txt",
            ".well-known/x.txt:stream",
            "well-known/x.txt",
            "pki-validation/x.txt",
            ".well-known/shell.aspx",
            ".well-known/run.PS1",
            ".well-known/trick.asp. ",
            ".well-known//x.txt",
            ".well-known",
        ] {
            assert!(
                matches!(validate_path(path), Err(ChallengeError::InvalidPath { .. })),
                "{path} should be rejected"
            );
        }
        assert!(validate_path(".well-known/pki-validation/fileauth.txt").is_ok());
        assert!(validate_path(".well-known\\acme-challenge\\TOKEN").is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn symlink_escape_is_detected_and_removed() {
        let root = temp_root();
        let outside = temp_root();
        std::os::unix::fs::symlink(&outside, root.join(".well-known")).expect("symlink");

        let responder = responder(vec![site("Main", &root, &[("http", 80, "www.example.com")])]);
        let err = responder
            .respond_to_file_challenge("www.example.com", ".well-known/x.txt", "t")
            .unwrap_err();
        assert!(matches!(err, ChallengeError::SymlinkEscape(_)));
        assert!(!outside.join("x.txt").exists());

        fs::remove_dir_all(&root).ok();
        fs::remove_dir_all(&outside).ok();
    }

    #[cfg(unix)]
    #[test]
    fn nested_escape_creates_nothing_outside_root() {
        let root = temp_root();
        let outside = temp_root();
        std::os::unix::fs::symlink(&outside, root.join(".well-known")).expect("symlink");

        let responder = responder(vec![site("Main", &root, &[("http", 80, "www.example.com")])]);
        let err = responder
            .respond_to_file_challenge("www.example.com", ".well-known/acme-challenge/deep/tok", "t")
            .unwrap_err();
        assert!(matches!(err, ChallengeError::SymlinkEscape(_)));
        assert!(!outside.join("acme-challenge").exists());
        assert_eq!(fs::read_dir(&outside).unwrap().count(), 0);

        fs::remove_dir_all(&root).ok();
        fs::remove_dir_all(&outside).ok();
    }

    #[test]
    fn failed_write_removes_directories_it_created() {
        let root = temp_root();
        fs::create_dir_all(root.join(".well-known")).unwrap();
        let responder = responder(vec![site("Main", &root, &[("http", 80, "www.example.com")])]);

        let too_long = format!(".well-known/fresh/nested/{}.txt", "a".repeat(300));
        let err = responder
            .respond_to_file_challenge("www.example.com", &too_long, "t")
            .unwrap_err();
        assert!(matches!(err, ChallengeError::Io(_)));
        assert!(root.join(".well-known").is_dir());
        assert!(!root.join(".well-known/fresh").exists());

        fs::remove_dir_all(&root).ok();
    }

    #[cfg(unix)]
    #[test]
    fn symlink_at_file_name_is_replaced_not_followed() {
        let root = temp_root();
        let outside = temp_root();
        fs::create_dir_all(root.join(".well-known")).unwrap();
        let victim = outside.join("victim.txt");
        fs::write(&victim, "original").unwrap();
        let link = root.join(".well-known/x.txt");
        std::os::unix::fs::symlink(&victim, &link).expect("symlink");

        let responder = responder(vec![site("Main", &root, &[("http", 80, "www.example.com")])]);
        let written = responder
            .respond_to_file_challenge("www.example.com", ".well-known/x.txt", "t")
            .expect("link replaced by a regular file");

        assert_eq!(fs::read_to_string(&victim).unwrap(), "original");
        assert!(written.starts_with(fs::canonicalize(&root).unwrap()));
        assert!(!fs::symlink_metadata(&link).unwrap().file_type().is_symlink());
        assert_eq!(fs::read_to_string(&link).unwrap(), "t");

        fs::remove_dir_all(&root).ok();
        fs::remove_dir_all(&outside).ok();
    }

    #[cfg(unix)]
    #[test]
    fn challenge_file_is_readable_by_the_web_server() {
        use std::os::unix::fs::PermissionsExt;

        let root = temp_root();
        let responder = responder(vec![site("Main", &root, &[("http", 80, "www.example.com")])]);
        let written = responder
            .respond_to_file_challenge("www.example.com", ".well-known/pki-validation/a.txt", "t")
            .expect("write challenge");
        let mode = fs::metadata(&written).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o644);

        fs::remove_dir_all(&root).ok();
    }
}
