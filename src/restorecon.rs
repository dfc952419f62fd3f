use std::path::Path;

use anyhow::{Context, Result};
use extattr::{Flags as XattrFlags, lgetxattr, lsetxattr};

pub const SELINUX_XATTR: &str = "security.selinux";

pub fn lsetfilecon<P: AsRef<Path>>(path: P, con: &str) -> Result<()> {
    if con.is_empty() {
        log::debug!("empty context for {}, skipping", path.as_ref().display());
        return Ok(());
    }
    lsetxattr(path.as_ref(), SELINUX_XATTR, con, XattrFlags::empty()).with_context(|| {
        format!(
            "Failed to change SELinux context for {}",
            path.as_ref().display()
        )
    })?;
    Ok(())
}

pub fn lgetfilecon<P: AsRef<Path>>(path: P) -> Result<String> {
    let con = lgetxattr(path.as_ref(), SELINUX_XATTR).with_context(|| {
        format!(
            "Failed to get SELinux context of {}",
            path.as_ref().display()
        )
    })?;
    Ok(String::from_utf8_lossy(&con).to_string())
}

pub fn lcopyfilecon<Src: AsRef<Path>, Dst: AsRef<Path>>(src: Src, dst: Dst) -> Result<()> {
    lsetfilecon(dst.as_ref(), lgetfilecon(src.as_ref())?.as_str())
}
