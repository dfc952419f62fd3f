use std::{
    ffi::OsString,
    fs::{self, DirBuilder, OpenOptions},
    os::unix::{
        ffi::{OsStrExt, OsStringExt},
        fs::DirBuilderExt,
    },
    path::{Path, PathBuf},
};

use anyhow::{Result, bail, ensure};

use crate::defs::{FALLBACK_TEMP_DIR, TEMP_DIR_NAME, TMPFS_CANDIDATES};

/// Join `base` and a single path segment with exactly one `/` between them.
/// No normalisation: `.` and `..` pass through untouched. Fails when the
/// result would not fit in `PATH_MAX - 1` bytes.
pub fn path_join<P: AsRef<Path>>(base: P, name: &str) -> Result<PathBuf> {
    let base = base.as_ref();
    if name.is_empty() {
        return Ok(base.to_path_buf());
    }

    let mut buf = base.as_os_str().as_bytes().to_vec();
    if buf.last() != Some(&b'/') {
        buf.push(b'/');
    }
    buf.extend_from_slice(name.as_bytes());
    ensure!(
        buf.len() < libc::PATH_MAX as usize,
        "path {}/{} too long",
        base.display(),
        name
    );

    Ok(PathBuf::from(OsString::from_vec(buf)))
}

pub fn ensure_dir_exists<P: AsRef<Path>>(dir: P) -> Result<()> {
    DirBuilder::new()
        .recursive(true)
        .mode(0o755)
        .create(&dir)?;
    if !dir.as_ref().is_dir() {
        bail!("{} is not a directory", dir.as_ref().display());
    }
    Ok(())
}

fn is_tmpfs(path: &Path) -> bool {
    match rustix::fs::statfs(path) {
        Ok(st) => st.f_type == libc::TMPFS_MAGIC,
        Err(_) => false,
    }
}

fn dir_is_writable(dir: &Path) -> bool {
    let probe = dir.join(format!(".mm_probe.{}", std::process::id()));
    match OpenOptions::new().write(true).create_new(true).open(&probe) {
        Ok(_) => {
            fs::remove_file(&probe).ok();
            true
        }
        Err(_) => false,
    }
}

/// Pick a writable tmpfs-backed staging root. Candidates are probed in a
/// fixed order; the winner gets a private subdirectory name appended.
pub fn select_temp_dir() -> PathBuf {
    for candidate in TMPFS_CANDIDATES {
        let path = Path::new(candidate);
        if !path.is_dir() {
            log::debug!("temp candidate {candidate}: not a directory");
            continue;
        }
        if !is_tmpfs(path) {
            log::debug!("temp candidate {candidate}: not tmpfs");
            continue;
        }
        if !dir_is_writable(path) {
            log::debug!("temp candidate {candidate}: not writable");
            continue;
        }
        log::info!("using temp dir {candidate}/{TEMP_DIR_NAME}");
        return path.join(TEMP_DIR_NAME);
    }

    log::warn!("no tmpfs candidate usable, falling back to {FALLBACK_TEMP_DIR}");
    PathBuf::from(FALLBACK_TEMP_DIR)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn join_root() {
        assert_eq!(path_join("/", "x").unwrap(), PathBuf::from("/x"));
    }

    #[test]
    fn join_plain() {
        assert_eq!(path_join("/a", "b").unwrap(), PathBuf::from("/a/b"));
    }

    #[test]
    fn join_trailing_slash() {
        assert_eq!(path_join("/a/", "b").unwrap(), PathBuf::from("/a/b"));
    }

    #[test]
    fn join_empty_name() {
        assert_eq!(path_join("/a", "").unwrap(), PathBuf::from("/a"));
    }

    #[test]
    fn join_too_long() {
        let name = "x".repeat(libc::PATH_MAX as usize);
        assert!(path_join("/a", &name).is_err());
    }

    #[test]
    fn ensure_dir_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("a/b/c");
        ensure_dir_exists(&dir).unwrap();
        assert!(dir.is_dir());
        ensure_dir_exists(&dir).unwrap();
        assert!(dir.is_dir());
    }

    #[test]
    fn ensure_dir_rejects_file() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("f");
        fs::write(&file, b"x").unwrap();
        assert!(ensure_dir_exists(&file).is_err());
    }

    #[test]
    fn writable_probe() {
        let tmp = TempDir::new().unwrap();
        assert!(dir_is_writable(tmp.path()));
        assert!(!dir_is_writable(Path::new("/nonexistent/dir")));
    }
}
