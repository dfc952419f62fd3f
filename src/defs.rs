pub const DEFAULT_MODULE_DIR: &str = "/data/adb/modules";
pub const DEFAULT_MOUNT_SOURCE: &str = "KSU";
pub const DEFAULT_CONFIG_FILE: &str = "/data/adb/magic_mount/mm.conf";

pub const DISABLE_FILE_NAME: &str = "disable";
pub const REMOVE_FILE_NAME: &str = "remove";
pub const SKIP_MOUNT_FILE_NAME: &str = "skip_mount";

pub const REPLACE_DIR_XATTR: &str = "trusted.overlay.opaque";
pub const REPLACE_DIR_FILE_NAME: &str = ".replace";

/// Staging directory created under the selected tmpfs root.
pub const TEMP_DIR_NAME: &str = ".magic_mount";
pub const WORK_DIR_NAME: &str = "workdir";

/// Tmpfs-backed candidates for the staging directory, probed in order.
pub const TMPFS_CANDIDATES: &[&str] = &["/mnt/vendor", "/mnt", "/debug_ramdisk"];
pub const FALLBACK_TEMP_DIR: &str = "/dev/.magic_mount";

/// Control device exposed by the host kernel module for the unmountable list.
pub const UNMOUNT_CTL_DEVICE: &str = "/dev/magic_mount";
