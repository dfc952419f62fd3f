use std::{
    ffi::CString,
    fs::File,
    io,
    os::{fd::AsRawFd, unix::ffi::OsStrExt},
    path::Path,
    sync::OnceLock,
};

use anyhow::{Result, bail};

use crate::defs::UNMOUNT_CTL_DEVICE;

// _IOW('K', 1, char *)
const MARK_UNMOUNTABLE: libc::c_ulong = 0x4008_4b01;

static CONTROL_FD: OnceLock<Option<File>> = OnceLock::new();

fn control_fd() -> Option<&'static File> {
    CONTROL_FD
        .get_or_init(|| match File::open(UNMOUNT_CTL_DEVICE) {
            Ok(file) => Some(file),
            Err(e) => {
                log::warn!("open {UNMOUNT_CTL_DEVICE}: {e}, unmountable marking unavailable");
                None
            }
        })
        .as_ref()
}

/// Tell the host kernel module that the mount at `path` may be hidden from
/// unprivileged namespaces. A missing control device turns this into a no-op.
pub fn send_unmountable<P: AsRef<Path>>(path: P) -> Result<()> {
    let Some(fd) = control_fd() else {
        return Ok(());
    };

    let path = CString::new(path.as_ref().as_os_str().as_bytes())?;
    let ret = unsafe { libc::ioctl(fd.as_raw_fd(), MARK_UNMOUNTABLE, path.as_ptr()) };
    if ret < 0 {
        bail!("mark unmountable: {}", io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_device_is_noop() {
        // Test hosts have no magic mount kernel module; the call must degrade
        // to a successful no-op rather than an error.
        if !Path::new(UNMOUNT_CTL_DEVICE).exists() {
            send_unmountable("/system/lib/libfoo.so").unwrap();
        }
    }
}
