use std::{
    fs::{self, OpenOptions},
    io::Write,
    path::Path,
};

use anyhow::{Context, Result, anyhow};
use uuid::Uuid;

#[cfg(unix)]
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
#[cfg(not(unix))]
use log::warn;

const OWNER_ONLY: u32 = 0o600;
const WORLD_READABLE: u32 = 0o644;

/// Writes `content` to a sibling temp file, syncs it and renames it over `path`,
/// so readers only ever observe the old or the new file. The file is readable
/// by the owning account only.
pub fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    replace_file(path, content, OWNER_ONLY)
}

/// [`write_atomic`] for files other accounts must read, such as content a web
/// server serves.
pub fn write_atomic_readable(path: &Path, content: &[u8]) -> Result<()> {
    replace_file(path, content, WORLD_READABLE)
}

fn replace_file(path: &Path, content: &[u8], mode: u32) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow!("{} has no parent directory", path.display()))?;
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| anyhow!("{} has no file name", path.display()))?;
    let tmp = parent.join(format!(".{file_name}.{}.tmp", Uuid::new_v4().as_simple()));

    let result = write_new_file(&tmp, content, mode).and_then(|_| {
        fs::rename(&tmp, path)
            .with_context(|| format!("failed to move {} into place", path.display()))
    });
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

fn write_new_file(path: &Path, content: &[u8], mode: u32) -> Result<()> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        options.mode(mode);
    }
    let mut file = options
        .open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    file.write_all(content)
        .with_context(|| format!("failed to write {}", path.display()))?;
    file.sync_all()
        .with_context(|| format!("failed to sync {}", path.display()))?;
    ensure_file_permissions(path, mode)
}

/// Creates `dir` (and parents) restricted to the owning account.
pub fn ensure_private_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir)
        .with_context(|| format!("failed to create directory {}", dir.display()))?;
    #[cfg(unix)]
    {
        let metadata = fs::metadata(dir)?;
        if metadata.permissions().mode() & 0o777 != 0o700 {
            fs::set_permissions(dir, fs::Permissions::from_mode(0o700)).with_context(|| {
                format!("failed to set restrictive permissions on {}", dir.display())
            })?;
        }
    }
    Ok(())
}

/// The umask can narrow the mode requested at open, so it is applied again.
fn ensure_file_permissions(path: &Path, mode: u32) -> Result<()> {
    #[cfg(unix)]
    {
        let metadata = fs::metadata(path)?;
        if metadata.permissions().mode() & 0o777 != mode {
            fs::set_permissions(path, fs::Permissions::from_mode(mode)).with_context(|| {
                format!("failed to set permissions {:o} on {}", mode, path.display())
            })?;
        }
    }
    #[cfg(not(unix))]
    {
        let _ = mode;
        if let Err(err) = fs::metadata(path) {
            warn!(
                "[storage] warning: unable to confirm permissions for {}: {}",
                path.display(),
                err
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("certbinder-atomic-{}", Uuid::new_v4()));
        fs::create_dir_all(&dir).expect("create temp dir");
        dir
    }

    #[test]
    fn replaces_existing_file_and_leaves_no_temp() {
        let dir = temp_dir();
        let path = dir.join("config.json");
        fs::write(&path, "old").expect("seed");

        write_atomic(&path, b"new").expect("atomic write");

        assert_eq!(fs::read_to_string(&path).expect("read"), "new");
        let leftovers: Vec<_> = fs::read_dir(&dir)
            .expect("list")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn written_files_are_owner_only() {
        let dir = temp_dir();
        let private = dir.join("orders");
        ensure_private_dir(&private).expect("private dir");
        let path = private.join("secret");
        write_atomic(&path, b"x").expect("write");

        let file_mode = fs::metadata(&path).expect("meta").permissions().mode() & 0o777;
        let dir_mode = fs::metadata(&private).expect("meta").permissions().mode() & 0o777;
        assert_eq!(file_mode, 0o600);
        assert_eq!(dir_mode, 0o700);
    }

    #[cfg(unix)]
    #[test]
    fn readable_files_are_world_readable() {
        let dir = temp_dir();
        let path = dir.join("token");
        write_atomic_readable(&path, b"proof").expect("write");

        let file_mode = fs::metadata(&path).expect("meta").permissions().mode() & 0o777;
        assert_eq!(file_mode, 0o644);
        assert_eq!(fs::read_to_string(&path).expect("read"), "proof");
        fs::remove_dir_all(&dir).ok();
    }
}
