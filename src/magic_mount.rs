use std::{
    cmp::PartialEq,
    fs::{self, DirEntry, Metadata, create_dir, create_dir_all, read_link},
    os::unix::fs::{FileTypeExt, MetadataExt, symlink},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, bail};
use extattr::lgetxattr;
use rustix::{
    fs::{Gid, Mode, Uid, chmod, chown},
    mount::{
        MountFlags, MountPropagationFlags, UnmountFlags, mount, mount_bind, mount_change,
        mount_move, mount_remount, unmount,
    },
};

use crate::{
    defs::{
        DEFAULT_MODULE_DIR, DEFAULT_MOUNT_SOURCE, DISABLE_FILE_NAME, REMOVE_FILE_NAME,
        REPLACE_DIR_FILE_NAME, REPLACE_DIR_XATTR, SKIP_MOUNT_FILE_NAME, WORK_DIR_NAME,
    },
    magic_mount::NodeFileType::{Directory, RegularFile, Symlink, Whiteout},
    restorecon::lcopyfilecon,
    try_umount::send_unmountable,
    utils::{ensure_dir_exists, path_join},
};

/// Builtin partitions that may live outside /system. The flag says whether
/// promotion additionally requires /system/<name> to be a symlink on the
/// live system; odm is promoted whenever /odm is a real directory.
const BUILTIN_PARTITIONS: [(&str, bool); 4] = [
    ("vendor", true),
    ("system_ext", true),
    ("product", true),
    ("odm", false),
];

/// First path segments that must never be registered as extra partitions.
/// Comparison is byte-exact; uppercase spellings bypass the list.
const EXTRA_PARTITION_BLACKLIST: [&str; 16] = [
    "bin",
    "etc",
    "data",
    "data_mirror",
    "sdcard",
    "tmp",
    "dev",
    "sys",
    "mnt",
    "proc",
    "d",
    "test",
    "product",
    "vendor",
    "system_ext",
    "odm",
];

#[derive(Debug, Default, Clone, Copy)]
pub struct MountStats {
    pub modules_total: usize,
    pub nodes_total: usize,
    pub nodes_mounted: usize,
    pub nodes_skipped: usize,
    pub nodes_whiteout: usize,
    pub nodes_fail: usize,
}

/// Process-wide mount context, owned by the orchestrating thread.
#[derive(Debug)]
pub struct MagicMount {
    pub module_dir: PathBuf,
    pub mount_source: String,
    pub extra_partitions: Vec<String>,
    pub enable_unmountable: bool,
    pub failed_modules: Vec<String>,
    pub stats: MountStats,
}

impl Default for MagicMount {
    fn default() -> Self {
        Self::new()
    }
}

impl MagicMount {
    pub fn new() -> Self {
        MagicMount {
            module_dir: PathBuf::from(DEFAULT_MODULE_DIR),
            mount_source: DEFAULT_MOUNT_SOURCE.to_string(),
            extra_partitions: Vec::new(),
            enable_unmountable: true,
            failed_modules: Vec::new(),
            stats: MountStats::default(),
        }
    }

    pub fn register_extra_partition(&mut self, name: &str) {
        let name = name.trim();
        if name.is_empty() {
            log::warn!("rejected empty extra partition name");
            return;
        }
        if extra_partition_blacklisted(name) {
            log::warn!("rejected extra partition '{name}' (blacklisted)");
            return;
        }
        if self.extra_partitions.iter().any(|p| p == name) {
            return;
        }
        log::info!("registered extra partition '{name}'");
        self.extra_partitions.push(name.to_string());
    }

    pub fn mark_failed(&mut self, module: &str) {
        if !self.failed_modules.iter().any(|m| m == module) {
            self.failed_modules.push(module.to_string());
        }
    }
}

fn extra_partition_blacklisted(name: &str) -> bool {
    let name = name.trim_start_matches('/');
    let first = name.split('/').next().unwrap_or("");
    EXTRA_PARTITION_BLACKLIST.contains(&first)
}

#[derive(PartialEq, Eq, Clone, Copy, Debug)]
enum NodeFileType {
    RegularFile,
    Directory,
    Symlink,
    Whiteout,
}

fn node_type_from_metadata(metadata: &Metadata) -> NodeFileType {
    let file_type = metadata.file_type();
    if file_type.is_char_device() && metadata.rdev() == 0 {
        Whiteout
    } else if file_type.is_file() {
        RegularFile
    } else if file_type.is_dir() {
        Directory
    } else if file_type.is_symlink() {
        Symlink
    } else {
        Whiteout
    }
}

#[derive(Debug)]
struct Node {
    name: String,
    file_type: NodeFileType,
    children: Vec<Node>,
    // absolute path of the entry inside the module that owns this node
    module_path: Option<PathBuf>,
    module_name: Option<String>,
    replace: bool,
    skip: bool,
}

fn dir_is_replace<P: AsRef<Path>>(path: P) -> bool {
    if let Ok(v) = lgetxattr(&path, REPLACE_DIR_XATTR) {
        if String::from_utf8_lossy(&v) == "y" {
            return true;
        }
    }
    path.as_ref().join(REPLACE_DIR_FILE_NAME).exists()
}

impl Node {
    fn new_root<T: ToString>(name: T) -> Self {
        Node {
            name: name.to_string(),
            file_type: Directory,
            children: Vec::new(),
            module_path: None,
            module_name: None,
            replace: false,
            skip: false,
        }
    }

    fn from_module_entry(
        name: &str,
        path: &Path,
        entry: &DirEntry,
        module_name: &str,
        stats: &mut MountStats,
    ) -> Option<Self> {
        let Ok(metadata) = entry.metadata() else {
            log::debug!("lstat {} failed, skipping entry", path.display());
            return None;
        };

        let file_type = metadata.file_type();
        if !(file_type.is_char_device()
            || file_type.is_file()
            || file_type.is_dir()
            || file_type.is_symlink())
        {
            log::debug!("unsupported file type at {}, skipping", path.display());
            return None;
        }

        let file_type = node_type_from_metadata(&metadata);
        let replace = file_type == Directory && dir_is_replace(path);
        stats.nodes_total += 1;

        Some(Node {
            name: name.to_string(),
            file_type,
            children: Vec::new(),
            module_path: Some(path.to_path_buf()),
            module_name: Some(module_name.to_string()),
            replace,
            skip: false,
        })
    }

    fn child(&self, name: &str) -> Option<&Node> {
        self.children.iter().find(|c| c.name == name)
    }

    fn detach_child(&mut self, name: &str) -> Option<Node> {
        let pos = self.children.iter().position(|c| c.name == name)?;
        Some(self.children.remove(pos))
    }

    /// Merge one module directory into this subtree. Children keep the
    /// identity given by the first module that contributed them; later
    /// modules only add descendants that did not exist yet. Returns whether
    /// anything under this node effectively contributes to the overlay.
    fn collect_module_files(
        &mut self,
        dir: &Path,
        module_name: &str,
        stats: &mut MountStats,
    ) -> Result<bool> {
        let mut has_file = false;
        let entries = match dir.read_dir() {
            Ok(entries) => entries,
            Err(e) => {
                log::error!("opendir {}: {e}, skipping subtree", dir.display());
                return Ok(false);
            }
        };
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            let path = path_join(dir, &name)?;

            let node = match self.children.iter().position(|c| c.name == name) {
                Some(pos) => Some(&mut self.children[pos]),
                None => match Node::from_module_entry(&name, &path, &entry, module_name, stats) {
                    Some(node) => {
                        self.children.push(node);
                        self.children.last_mut()
                    }
                    None => None,
                },
            };

            if let Some(node) = node {
                has_file |= if node.file_type == Directory {
                    node.collect_module_files(&path, module_name, stats)? || node.replace
                } else {
                    true
                }
            }
        }

        Ok(has_file)
    }
}

fn module_is_disabled(module_path: &Path) -> bool {
    [DISABLE_FILE_NAME, REMOVE_FILE_NAME, SKIP_MOUNT_FILE_NAME]
        .iter()
        .any(|marker| module_path.join(marker).exists())
}

/// Enumerate enabled modules in directory order: directories only, minus
/// anything carrying a disable/remove/skip_mount marker.
fn enumerate_modules(module_dir: &Path) -> Result<Vec<(String, PathBuf)>> {
    let mut modules = Vec::new();
    for entry in module_dir
        .read_dir()
        .with_context(|| format!("opendir {}", module_dir.display()))?
        .flatten()
    {
        let name = entry.file_name().to_string_lossy().to_string();
        let path = path_join(module_dir, &name)?;

        let Ok(metadata) = fs::metadata(&path) else {
            continue;
        };
        if !metadata.is_dir() {
            continue;
        }
        if module_is_disabled(&path) {
            log::info!("module {name} is disabled");
            continue;
        }
        modules.push((name, path));
    }
    Ok(modules)
}

/// A module symlink at system/<partition> is only replaced when it points
/// back at the partition itself, either relatively or through the module's
/// own directory. Trailing slashes on the target are ignored.
fn symlink_is_compatible(
    target: &Path,
    partition: &str,
    module_dir: &Path,
    module_name: Option<&str>,
) -> bool {
    use std::os::unix::ffi::OsStrExt;

    let bytes = target.as_os_str().as_bytes();
    let mut len = bytes.len();
    while len > 0 && bytes[len - 1] == b'/' {
        len -= 1;
    }
    if len == 0 {
        return false;
    }
    let target = &bytes[..len];

    let relative = format!("../{partition}");
    if target == relative.as_bytes() {
        return true;
    }

    if let Some(module_name) = module_name {
        if let Ok(module_path) = path_join(module_dir, module_name) {
            if let Ok(absolute) = path_join(&module_path, partition) {
                if target == absolute.as_os_str().as_bytes() {
                    return true;
                }
            }
        }
    }

    false
}

/// First enabled module that ships a real directory for `partition`.
fn find_real_partition_dir(
    module_dir: &Path,
    partition: &str,
) -> Result<Option<(String, PathBuf)>> {
    for (name, path) in enumerate_modules(module_dir)? {
        let part_dir = path.join(partition);
        if part_dir.is_dir() {
            return Ok(Some((name, part_dir)));
        }
    }
    Ok(None)
}

/// Devices may route a partition through a symlink system/<P> -> /<P>. When
/// a module ships such a symlink plus a real <module>/<P> directory, swap
/// the symlink node for a directory scanned from the first module that has
/// one; an incompatible or content-less replacement keeps the symlink.
fn resolve_partition_symlink(
    ctx: &mut MagicMount,
    system: &mut Node,
    partition: &str,
) -> Result<()> {
    let (module_path, module_name) = match system.child(partition) {
        Some(child) if child.file_type == Symlink => match &child.module_path {
            Some(path) => (path.clone(), child.module_name.clone()),
            None => return Ok(()),
        },
        _ => return Ok(()),
    };

    let target = match read_link(&module_path) {
        Ok(target) => target,
        Err(e) => {
            log::warn!("readlink {} failed: {e}", module_path.display());
            return Ok(());
        }
    };

    if !symlink_is_compatible(&target, partition, &ctx.module_dir, module_name.as_deref()) {
        log::debug!(
            "symlink {partition} -> {} (not compatible)",
            target.display()
        );
        return Ok(());
    }

    log::info!(
        "found compatible symlink: system/{partition} -> {}",
        target.display()
    );

    let Some((owner, part_dir)) = find_real_partition_dir(&ctx.module_dir, partition)? else {
        log::debug!("no real directory found for {partition}, keeping symlink");
        return Ok(());
    };

    let mut node = Node::new_root(partition);
    let has_any = node.collect_module_files(&part_dir, &owner, &mut ctx.stats)?;
    if !has_any {
        log::debug!("no content in {partition}, keeping symlink");
        return Ok(());
    }
    node.module_name = Some(owner.clone());

    system.detach_child(partition);
    system.children.push(node);
    log::info!("replaced symlink with directory node: {partition} (from module {owner})");
    Ok(())
}

fn resolve_partition_symlinks(ctx: &mut MagicMount, system: &mut Node) {
    let extras = ctx.extra_partitions.clone();
    let builtin = BUILTIN_PARTITIONS.iter().map(|(name, _)| *name);
    for partition in builtin.chain(extras.iter().map(String::as_str)) {
        if let Err(e) = resolve_partition_symlink(ctx, system, partition) {
            log::error!("symlink compatibility for {partition} failed: {e:#}");
        }
    }
}

fn promote_partition(root: &mut Node, system: &mut Node, partition: &str, require_symlink: bool) {
    let path_of_root = Path::new("/").join(partition);
    let path_of_system = Path::new("/system").join(partition);

    if !path_of_root.is_dir() {
        log::debug!("partition /{partition} does not exist or is not a directory");
        return;
    }
    if require_symlink && !path_of_system.is_symlink() {
        log::debug!("/system/{partition} is not a symlink, keeping under system");
        return;
    }

    if let Some(node) = system.detach_child(partition) {
        log::debug!("partition /{partition} will be mounted separately");
        root.children.push(node);
    }
}

/// Populate an extra-partition node from every enabled module's <module>/<P>
/// directory, in module enumeration order.
fn scan_partition_from_modules(
    ctx: &mut MagicMount,
    partition: &str,
    node: &mut Node,
) -> Result<bool> {
    let mut has_any = false;
    for (name, path) in enumerate_modules(&ctx.module_dir)? {
        let part_dir = path.join(partition);
        if !part_dir.is_dir() {
            continue;
        }
        log::debug!("collecting partition {partition} from module {name}");
        has_any |= node.collect_module_files(&part_dir, &name, &mut ctx.stats)?;
    }
    Ok(has_any)
}

fn collect_module_files(ctx: &mut MagicMount) -> Result<Option<Node>> {
    let mut root = Node::new_root("");
    let mut system = Node::new_root("system");
    let mut has_file = false;

    for (name, path) in enumerate_modules(&ctx.module_dir)? {
        let mod_system = path.join("system");
        if !mod_system.is_dir() {
            continue;
        }

        log::debug!("collecting {}", path.display());
        ctx.stats.modules_total += 1;
        has_file |= system.collect_module_files(&mod_system, &name, &mut ctx.stats)?;
    }

    if !has_file {
        return Ok(None);
    }
    // synthetic root and system nodes
    ctx.stats.nodes_total += 2;

    resolve_partition_symlinks(ctx, &mut system);

    for (partition, require_symlink) in BUILTIN_PARTITIONS {
        promote_partition(&mut root, &mut system, partition, require_symlink);
    }

    let extras = ctx.extra_partitions.clone();
    for partition in &extras {
        let path_of_root = Path::new("/").join(partition);
        if !path_of_root.is_dir() {
            log::debug!("extra partition /{partition} is not a directory, skipping");
            continue;
        }

        let mut node = Node::new_root(partition);
        if scan_partition_from_modules(ctx, partition, &mut node)? {
            log::info!("collected extra partition /{partition}");
            root.children.push(node);
        } else {
            log::debug!("no content for extra partition /{partition}, dropping");
        }
    }

    root.children.push(system);
    Ok(Some(root))
}

fn clone_symlink<Src: AsRef<Path>, Dst: AsRef<Path>>(src: Src, dst: Dst) -> Result<()> {
    let src_symlink = read_link(src.as_ref())?;
    symlink(&src_symlink, dst.as_ref())?;
    if let Err(e) = lcopyfilecon(src.as_ref(), dst.as_ref()) {
        log::warn!("copy context of {}: {e:#}", src.as_ref().display());
    }
    log::debug!(
        "clone symlink {} -> {}({})",
        src.as_ref().display(),
        dst.as_ref().display(),
        src_symlink.display()
    );
    Ok(())
}

fn mount_mirror<P: AsRef<Path>, WP: AsRef<Path>>(
    path: P,
    work_dir_path: WP,
    entry: &DirEntry,
) -> Result<()> {
    let path = path.as_ref().join(entry.file_name());
    let work_dir_path = work_dir_path.as_ref().join(entry.file_name());
    let file_type = entry.file_type()?;

    if file_type.is_file() {
        log::debug!(
            "mount mirror file {} -> {}",
            path.display(),
            work_dir_path.display()
        );
        fs::File::create(&work_dir_path)?;
        mount_bind(&path, &work_dir_path)?;
    } else if file_type.is_dir() {
        log::debug!(
            "mount mirror dir {} -> {}",
            path.display(),
            work_dir_path.display()
        );
        create_dir(&work_dir_path)?;
        let metadata = entry.metadata()?;
        chmod(&work_dir_path, Mode::from_raw_mode(metadata.mode()))?;
        chown(
            &work_dir_path,
            Some(Uid::from_raw(metadata.uid())),
            Some(Gid::from_raw(metadata.gid())),
        )?;
        if let Err(e) = lcopyfilecon(&path, &work_dir_path) {
            log::warn!("copy context of {}: {e:#}", path.display());
        }
        for entry in path.read_dir()?.flatten() {
            mount_mirror(&path, &work_dir_path, &entry)?;
        }
    } else if file_type.is_symlink() {
        log::debug!(
            "create mirror symlink {} -> {}",
            path.display(),
            work_dir_path.display()
        );
        clone_symlink(&path, &work_dir_path)?;
    }

    Ok(())
}

fn do_magic_mount<P: AsRef<Path>, WP: AsRef<Path>>(
    ctx: &mut MagicMount,
    path: P,
    work_dir_path: WP,
    mut current: Node,
    has_tmpfs: bool,
) -> Result<()> {
    let path = path.as_ref().join(&current.name);
    let work_dir_path = work_dir_path.as_ref().join(&current.name);

    match current.file_type {
        RegularFile => {
            let target_path = if has_tmpfs {
                if let Some(parent) = work_dir_path.parent() {
                    ensure_dir_exists(parent)?;
                }
                fs::File::create(&work_dir_path)?;
                &work_dir_path
            } else {
                &path
            };
            let Some(module_path) = &current.module_path else {
                bail!("cannot mount root file {}!", path.display());
            };

            log::debug!(
                "mount module file {} -> {}",
                module_path.display(),
                target_path.display()
            );
            mount_bind(module_path, target_path)?;

            // On a live-path bind the mark must land before the mountpoint
            // turns read-only.
            if !has_tmpfs && ctx.enable_unmountable {
                if let Err(e) = send_unmountable(&path) {
                    log::warn!("mark {} unmountable: {e:#}", path.display());
                }
            }
            if let Err(e) = mount_remount(target_path, MountFlags::RDONLY | MountFlags::BIND, "") {
                log::warn!("make file {} ro: {e}", target_path.display());
            }
            ctx.stats.nodes_mounted += 1;
        }
        Symlink => {
            let Some(module_path) = &current.module_path else {
                bail!("cannot mount root symlink {}!", path.display());
            };
            log::debug!(
                "create module symlink {} -> {}",
                module_path.display(),
                work_dir_path.display()
            );
            clone_symlink(module_path, &work_dir_path)?;
            ctx.stats.nodes_mounted += 1;
        }
        Whiteout => {
            log::debug!("file {} is removed", path.display());
            ctx.stats.nodes_whiteout += 1;
        }
        Directory => {
            let mut create_tmpfs = !has_tmpfs && current.replace && current.module_path.is_some();

            if !has_tmpfs && !create_tmpfs {
                for node in &mut current.children {
                    let real_path = path.join(&node.name);
                    let need = match node.file_type {
                        Symlink => true,
                        Whiteout => real_path.exists(),
                        _ => {
                            if let Ok(metadata) = real_path.symlink_metadata() {
                                let real_type = node_type_from_metadata(&metadata);
                                real_type != node.file_type || real_type == Symlink
                            } else {
                                // no live counterpart, nothing to bind over
                                true
                            }
                        }
                    };
                    if need {
                        if current.module_path.is_none() {
                            log::error!(
                                "cannot create tmpfs on {}, ignore: {}",
                                path.display(),
                                node.name
                            );
                            node.skip = true;
                            ctx.stats.nodes_skipped += 1;
                            continue;
                        }
                        create_tmpfs = true;
                        break;
                    }
                }
            }

            let has_tmpfs = has_tmpfs || create_tmpfs;

            if has_tmpfs {
                log::debug!(
                    "creating tmpfs skeleton for {} at {}",
                    path.display(),
                    work_dir_path.display()
                );
                create_dir_all(&work_dir_path)?;
                let (metadata, source_path) = if path.exists() {
                    (path.metadata()?, path.clone())
                } else if let Some(module_path) = &current.module_path {
                    (module_path.metadata()?, module_path.clone())
                } else {
                    bail!("cannot mount root dir {}!", path.display());
                };
                chmod(&work_dir_path, Mode::from_raw_mode(metadata.mode()))?;
                chown(
                    &work_dir_path,
                    Some(Uid::from_raw(metadata.uid())),
                    Some(Gid::from_raw(metadata.gid())),
                )?;
                if let Err(e) = lcopyfilecon(&source_path, &work_dir_path) {
                    log::warn!("copy context of {}: {e:#}", source_path.display());
                }
            }

            if create_tmpfs {
                log::debug!(
                    "creating tmpfs for {} at {}",
                    path.display(),
                    work_dir_path.display()
                );
                mount_bind(&work_dir_path, &work_dir_path).context("bind self")?;
            }

            if path.exists() && !current.replace {
                for entry in path.read_dir()?.flatten() {
                    let name = entry.file_name().to_string_lossy().to_string();
                    let result = match current.children.iter().position(|c| c.name == name) {
                        Some(pos) => {
                            let node = current.children.remove(pos);
                            if node.skip {
                                continue;
                            }
                            let owner = node.module_name.clone();
                            do_magic_mount(ctx, &path, &work_dir_path, node, has_tmpfs)
                                .with_context(|| format!("magic mount {}/{name}", path.display()))
                                .map_err(|e| (e, owner))
                        }
                        None if has_tmpfs => mount_mirror(&path, &work_dir_path, &entry)
                            .with_context(|| format!("mount mirror {}/{name}", path.display()))
                            .map_err(|e| (e, None)),
                        None => Ok(()),
                    };

                    if let Err((e, owner)) = result {
                        if has_tmpfs {
                            return Err(e);
                        }
                        ctx.stats.nodes_fail += 1;
                        if let Some(module) = owner.or_else(|| current.module_name.clone()) {
                            ctx.mark_failed(&module);
                        }
                        log::error!("mount child {}/{name} failed: {e:#}", path.display());
                    }
                }
            }

            if current.replace {
                if current.module_path.is_none() {
                    bail!(
                        "dir {} is declared as replaced but it is root!",
                        path.display()
                    );
                }
                log::debug!("dir {} is replaced", path.display());
            }

            for node in std::mem::take(&mut current.children) {
                if node.skip {
                    continue;
                }
                let name = node.name.clone();
                let owner = node.module_name.clone();
                if let Err(e) = do_magic_mount(ctx, &path, &work_dir_path, node, has_tmpfs)
                    .with_context(|| format!("magic mount {}/{name}", path.display()))
                {
                    if has_tmpfs {
                        return Err(e);
                    }
                    ctx.stats.nodes_fail += 1;
                    if let Some(module) = owner.or_else(|| current.module_name.clone()) {
                        ctx.mark_failed(&module);
                    }
                    log::error!("mount child {}/{name} failed: {e:#}", path.display());
                }
            }

            if create_tmpfs {
                if let Err(e) =
                    mount_remount(&work_dir_path, MountFlags::RDONLY | MountFlags::BIND, "")
                {
                    log::warn!("make dir {} ro: {e}", path.display());
                }
                log::debug!(
                    "moving tmpfs {} -> {}",
                    work_dir_path.display(),
                    path.display()
                );
                mount_move(&work_dir_path, &path).context("move self")?;
                if let Err(e) = mount_change(
                    &path,
                    MountPropagationFlags::PRIVATE | MountPropagationFlags::REC,
                ) {
                    log::warn!("make dir {} private: {e}", path.display());
                }
                if ctx.enable_unmountable {
                    if let Err(e) = send_unmountable(&path) {
                        log::warn!("mark {} unmountable: {e:#}", path.display());
                    }
                }
                ctx.stats.nodes_mounted += 1;
            }
        }
    }

    Ok(())
}

pub fn magic_mount(ctx: &mut MagicMount, tmp_root: &Path) -> Result<()> {
    let Some(root) = collect_module_files(ctx)? else {
        log::info!("no modules to mount, skipping!");
        return Ok(());
    };
    log::debug!("collected: {root:#?}");

    let work_dir = tmp_root.join(WORK_DIR_NAME);
    ensure_dir_exists(&work_dir)?;
    mount(
        ctx.mount_source.as_str(),
        &work_dir,
        "tmpfs",
        MountFlags::empty(),
        None::<&std::ffi::CStr>,
    )
    .context("mount tmp")?;
    mount_change(
        &work_dir,
        MountPropagationFlags::PRIVATE | MountPropagationFlags::REC,
    )
    .context("make tmp private")?;

    let result = do_magic_mount(ctx, "/", &work_dir, root, false);

    if let Err(e) = unmount(&work_dir, UnmountFlags::DETACH) {
        log::error!("failed to unmount tmp {e}");
    }
    fs::remove_dir(&work_dir).ok();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::os::unix::fs::symlink;
    use tempfile::TempDir;

    fn test_ctx(module_dir: &Path) -> MagicMount {
        MagicMount {
            module_dir: module_dir.to_path_buf(),
            ..MagicMount::new()
        }
    }

    #[test]
    fn blacklist_first_segment() {
        assert!(extra_partition_blacklisted("vendor"));
        assert!(extra_partition_blacklisted("/bin"));
        assert!(extra_partition_blacklisted("sys/kernel"));
        assert!(!extra_partition_blacklisted("mi_ext"));
        assert!(!extra_partition_blacklisted("my_stock"));
        // byte-exact comparison, uppercase slips through
        assert!(!extra_partition_blacklisted("VENDOR"));
    }

    #[test]
    fn register_rejects_blacklisted_and_empty() {
        let tmp = TempDir::new().unwrap();
        let mut ctx = test_ctx(tmp.path());
        for name in ["", "  ", "/bin", "vendor", "sys"] {
            ctx.register_extra_partition(name);
        }
        assert!(ctx.extra_partitions.is_empty());

        ctx.register_extra_partition("my_stock");
        ctx.register_extra_partition("mi_ext");
        ctx.register_extra_partition("my_stock");
        assert_eq!(ctx.extra_partitions, vec!["my_stock", "mi_ext"]);
    }

    #[test]
    fn mark_failed_deduplicates() {
        let tmp = TempDir::new().unwrap();
        let mut ctx = test_ctx(tmp.path());
        ctx.mark_failed("modA");
        ctx.mark_failed("modB");
        ctx.mark_failed("modA");
        assert_eq!(ctx.failed_modules, vec!["modA", "modB"]);
    }

    #[test]
    fn node_type_classification() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("f");
        File::create(&file).unwrap();
        assert_eq!(
            node_type_from_metadata(&file.symlink_metadata().unwrap()),
            RegularFile
        );
        assert_eq!(
            node_type_from_metadata(&tmp.path().symlink_metadata().unwrap()),
            Directory
        );

        let link = tmp.path().join("l");
        symlink("f", &link).unwrap();
        assert_eq!(
            node_type_from_metadata(&link.symlink_metadata().unwrap()),
            Symlink
        );

        // /dev/null is a char device with a nonzero rdev: falls through to
        // the whiteout catch-all.
        let null = Path::new("/dev/null");
        if null.exists() {
            assert_eq!(
                node_type_from_metadata(&null.symlink_metadata().unwrap()),
                Whiteout
            );
        }
    }

    #[test]
    fn replace_sentinel_file() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("Replaced");
        fs::create_dir(&dir).unwrap();
        assert!(!dir_is_replace(&dir));

        File::create(dir.join("replace")).unwrap();
        assert!(!dir_is_replace(&dir));

        File::create(dir.join(REPLACE_DIR_FILE_NAME)).unwrap();
        assert!(dir_is_replace(&dir));
    }

    #[test]
    fn symlink_compatibility() {
        let module_dir = Path::new("/data/adb/modules");
        let name = Some("mod");
        for ok in ["../vendor", "../vendor/", "/data/adb/modules/mod/vendor"] {
            assert!(
                symlink_is_compatible(Path::new(ok), "vendor", module_dir, name),
                "{ok} should be compatible"
            );
        }
        for bad in ["/vendor_alt", "../vendor_alt", "../product", "/"] {
            assert!(
                !symlink_is_compatible(Path::new(bad), "vendor", module_dir, name),
                "{bad} should not be compatible"
            );
        }
        // absolute form requires a known module name
        assert!(!symlink_is_compatible(
            Path::new("/data/adb/modules/mod/vendor"),
            "vendor",
            module_dir,
            None
        ));
    }

    #[test]
    fn disabled_module_markers() {
        let tmp = TempDir::new().unwrap();
        for marker in [DISABLE_FILE_NAME, REMOVE_FILE_NAME, SKIP_MOUNT_FILE_NAME] {
            let module = tmp.path().join(format!("mod_{marker}"));
            fs::create_dir(&module).unwrap();
            assert!(!module_is_disabled(&module));
            File::create(module.join(marker)).unwrap();
            assert!(module_is_disabled(&module));
        }
    }

    #[test]
    fn enumerate_skips_files_and_disabled() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir(tmp.path().join("modA")).unwrap();
        fs::create_dir(tmp.path().join("modB")).unwrap();
        File::create(tmp.path().join("modB").join(DISABLE_FILE_NAME)).unwrap();
        File::create(tmp.path().join("stray_file")).unwrap();

        let modules = enumerate_modules(tmp.path()).unwrap();
        assert_eq!(modules.len(), 1);
        assert_eq!(modules[0].0, "modA");
    }

    #[test]
    fn module_without_system_yields_no_content() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir(tmp.path().join("modA")).unwrap();

        let mut ctx = test_ctx(tmp.path());
        assert!(collect_module_files(&mut ctx).unwrap().is_none());
        assert_eq!(ctx.stats.modules_total, 0);
    }

    #[test]
    fn empty_system_dir_yields_no_content() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("modA/system")).unwrap();

        let mut ctx = test_ctx(tmp.path());
        assert!(collect_module_files(&mut ctx).unwrap().is_none());
        // the module was enumerated even though it contributed nothing
        assert_eq!(ctx.stats.modules_total, 1);
    }

    #[test]
    fn single_file_tree() {
        let tmp = TempDir::new().unwrap();
        let lib = tmp.path().join("modA/system/lib");
        fs::create_dir_all(&lib).unwrap();
        File::create(lib.join("libfoo.so")).unwrap();

        let mut ctx = test_ctx(tmp.path());
        let root = collect_module_files(&mut ctx).unwrap().unwrap();

        let system = root.child("system").unwrap();
        let lib = system.child("lib").unwrap();
        assert_eq!(lib.file_type, Directory);
        let file = lib.child("libfoo.so").unwrap();
        assert_eq!(file.file_type, RegularFile);
        assert_eq!(file.module_name.as_deref(), Some("modA"));
        assert_eq!(
            file.module_path.as_deref(),
            Some(tmp.path().join("modA/system/lib/libfoo.so").as_path())
        );
        // lib + libfoo.so + synthetic root/system pair
        assert_eq!(ctx.stats.nodes_total, 4);
    }

    #[test]
    fn first_module_wins_node_identity() {
        let tmp = TempDir::new().unwrap();
        for module in ["modA", "modB"] {
            let etc = tmp.path().join(module).join("system/etc");
            fs::create_dir_all(&etc).unwrap();
            File::create(etc.join("hosts")).unwrap();
        }
        File::create(tmp.path().join("modB/system/etc/extra.conf")).unwrap();

        let mut stats = MountStats::default();
        let mut system = Node::new_root("system");
        system
            .collect_module_files(&tmp.path().join("modA/system"), "modA", &mut stats)
            .unwrap();
        system
            .collect_module_files(&tmp.path().join("modB/system"), "modB", &mut stats)
            .unwrap();

        let etc = system.child("etc").unwrap();
        assert_eq!(etc.module_name.as_deref(), Some("modA"));
        let hosts = etc.child("hosts").unwrap();
        assert_eq!(hosts.module_name.as_deref(), Some("modA"));
        // the later module still contributes new descendants
        let extra = etc.child("extra.conf").unwrap();
        assert_eq!(extra.module_name.as_deref(), Some("modB"));
    }

    #[test]
    fn children_names_stay_unique() {
        let tmp = TempDir::new().unwrap();
        for module in ["modA", "modB"] {
            let lib = tmp.path().join(module).join("system/lib");
            fs::create_dir_all(&lib).unwrap();
            File::create(lib.join("libfoo.so")).unwrap();
        }

        let mut ctx = test_ctx(tmp.path());
        let root = collect_module_files(&mut ctx).unwrap().unwrap();
        let lib = root.child("system").unwrap().child("lib").unwrap();
        let count = lib
            .children
            .iter()
            .filter(|c| c.name == "libfoo.so")
            .count();
        assert_eq!(count, 1);
    }

    #[test]
    fn replace_dir_with_only_sentinel_counts_as_content() {
        let tmp = TempDir::new().unwrap();
        let app = tmp.path().join("modA/system/app/Replaced");
        fs::create_dir_all(&app).unwrap();
        File::create(app.join(REPLACE_DIR_FILE_NAME)).unwrap();

        let mut ctx = test_ctx(tmp.path());
        let root = collect_module_files(&mut ctx).unwrap().unwrap();
        let replaced = root
            .child("system")
            .unwrap()
            .child("app")
            .unwrap()
            .child("Replaced")
            .unwrap();
        assert!(replaced.replace);
    }

    #[test]
    fn symlink_node_from_module() {
        let tmp = TempDir::new().unwrap();
        let etc = tmp.path().join("modA/system/etc");
        fs::create_dir_all(&etc).unwrap();
        symlink("/data/hosts", etc.join("hosts")).unwrap();

        let mut ctx = test_ctx(tmp.path());
        let root = collect_module_files(&mut ctx).unwrap().unwrap();
        let hosts = root
            .child("system")
            .unwrap()
            .child("etc")
            .unwrap()
            .child("hosts")
            .unwrap();
        assert_eq!(hosts.file_type, Symlink);
    }

    #[test]
    fn detach_preserves_sibling_order() {
        let mut node = Node::new_root("system");
        for name in ["a", "b", "c"] {
            node.children.push(Node::new_root(name));
        }
        let detached = node.detach_child("b").unwrap();
        assert_eq!(detached.name, "b");
        let names: Vec<_> = node.children.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["a", "c"]);
        assert!(node.detach_child("b").is_none());
    }
}
