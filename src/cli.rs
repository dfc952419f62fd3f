use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::Parser;

use crate::{
    config::Config,
    defs::DEFAULT_CONFIG_FILE,
    logging,
    magic_mount::{self, MagicMount},
    utils,
};

#[derive(Parser, Debug)]
#[command(name = "magic-mount", version, about = "Mount module overlays onto the live system")]
struct Args {
    /// Module root directory
    #[arg(short = 'm', long)]
    module_dir: Option<PathBuf>,

    /// Staging directory parent (skips the tmpfs candidate probe)
    #[arg(short = 't', long)]
    temp_dir: Option<PathBuf>,

    /// Source label for the staging tmpfs
    #[arg(short = 's', long)]
    mount_source: Option<String>,

    /// Extra partitions, comma or whitespace separated
    #[arg(short = 'p', long)]
    partitions: Option<String>,

    /// Log destination, '-' for stdout
    #[arg(short = 'l', long)]
    log_file: Option<String>,

    /// Config file path
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short = 'v', long)]
    verbose: bool,

    /// Do not mark created mounts as user-unmountable
    #[arg(long)]
    no_umount: bool,
}

fn split_partitions(value: &str) -> Vec<String> {
    value
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn load_config(args: &Args) -> Result<Config> {
    let path = args
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    if path.exists() {
        Config::load(&path).with_context(|| format!("load config {}", path.display()))
    } else if args.config.is_some() {
        bail!("config file {} does not exist", path.display());
    } else {
        Ok(Config::default())
    }
}

fn print_summary(ctx: &MagicMount) {
    let stats = &ctx.stats;
    log::info!("modules: {} scanned", stats.modules_total);
    log::info!(
        "nodes: {} total, {} mounted, {} skipped, {} whiteout, {} failed",
        stats.nodes_total,
        stats.nodes_mounted,
        stats.nodes_skipped,
        stats.nodes_whiteout,
        stats.nodes_fail
    );
    for module in &ctx.failed_modules {
        log::warn!("module {module} failed to mount");
    }
}

pub fn run() -> Result<()> {
    let args = Args::parse();

    if !rustix::process::geteuid().is_root() {
        bail!("magic mount must run as root");
    }

    let config = load_config(&args)?;

    logging::set_debug(args.verbose || config.debug);
    let log_file = args
        .log_file
        .clone()
        .or_else(|| config.log_file.clone())
        .unwrap_or_else(|| "-".to_string());
    logging::set_file(&log_file)?;

    let mut ctx = MagicMount::new();
    if let Some(dir) = args.module_dir.or(config.module_dir) {
        ctx.module_dir = dir;
    }
    if let Some(source) = args.mount_source.or(config.mount_source) {
        ctx.mount_source = source;
    }
    if let Some(umount) = config.umount {
        ctx.enable_unmountable = umount;
    }
    if args.no_umount {
        ctx.enable_unmountable = false;
    }

    let partitions = match &args.partitions {
        Some(list) => split_partitions(list),
        None => config.partitions,
    };
    for partition in &partitions {
        ctx.register_extra_partition(partition);
    }

    let tmp_root = args
        .temp_dir
        .or(config.temp_dir)
        .unwrap_or_else(utils::select_temp_dir);
    log::debug!(
        "module_dir={} tmp_root={} source={} umount={}",
        ctx.module_dir.display(),
        tmp_root.display(),
        ctx.mount_source,
        ctx.enable_unmountable
    );

    let result = magic_mount::magic_mount(&mut ctx, &tmp_root);
    print_summary(&ctx);
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_overrides_parse() {
        let args = Args::parse_from([
            "magic-mount",
            "-m",
            "/data/adb/modules_update",
            "-s",
            "MM",
            "-p",
            "my_stock,mi_ext",
            "-v",
            "--no-umount",
        ]);
        assert_eq!(
            args.module_dir.as_deref(),
            Some(std::path::Path::new("/data/adb/modules_update"))
        );
        assert_eq!(args.mount_source.as_deref(), Some("MM"));
        assert!(args.verbose);
        assert!(args.no_umount);
        assert_eq!(
            split_partitions(args.partitions.as_deref().unwrap()),
            vec!["my_stock", "mi_ext"]
        );
    }

    #[test]
    fn missing_explicit_config_errors() {
        let args = Args::parse_from(["magic-mount", "-c", "/nonexistent/mm.conf"]);
        assert!(load_config(&args).is_err());
    }
}
