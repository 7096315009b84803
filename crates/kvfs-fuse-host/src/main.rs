// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! kvfs FUSE host
//!
//! Mounts a kvfs filesystem whose metadata lives in a key-value store and
//! unmounts it cleanly on SIGINT/SIGTERM.

#[cfg(all(feature = "fuse", target_os = "linux"))]
mod adapter;

use anyhow::{Context, Result};
use clap::Parser;
use kvfs_core::{FileSystem, FsConfig};
use kvfs_logging::{CliLogLevel, CliLoggingArgs};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, error, info};

const COMPONENT: &str = "kvfs";

#[derive(Parser, Debug)]
#[command(name = "kvfs", version, about = "Mount a filesystem backed by a key-value metadata store")]
struct Args {
    /// Mount point for the filesystem
    mount_point: PathBuf,

    /// Configuration file (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Name of this host (overrides the config file)
    #[arg(short = 'N', long)]
    name: Option<String>,

    /// Mount read-only
    #[arg(short = 'R', long)]
    readonly: bool,

    #[command(flatten)]
    logging: CliLoggingArgs,

    /// Allow other users to access the filesystem
    #[arg(long)]
    allow_other: bool,

    /// Auto unmount on process exit
    #[arg(long)]
    auto_unmount: bool,
}

fn load_config(config_path: Option<&Path>) -> Result<FsConfig> {
    match config_path {
        Some(path) => FsConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display())),
        None => Ok(FsConfig::default()),
    }
}

/// Command-line values take precedence over the config file
fn apply_overrides(config: &mut FsConfig, args: &Args) {
    if let Some(name) = &args.name {
        config.name = name.clone();
    }
    if let Some(level) = args.logging.log_level {
        config.log_level = Some(level.to_string());
    }
    if args.readonly {
        config.read_only = true;
    }
}

fn config_log_level(config: &FsConfig) -> Result<CliLogLevel> {
    match config.log_level.as_deref() {
        Some(level) => CliLogLevel::from_str(level).map_err(anyhow::Error::msg),
        None => Ok(CliLogLevel::default()),
    }
}

#[cfg(all(feature = "fuse", target_os = "linux"))]
fn mount_options(args: &Args, read_only: bool) -> Vec<fuser::MountOption> {
    let mut options = vec![
        fuser::MountOption::FSName("kvfs".to_string()),
        fuser::MountOption::Subtype("kvfs".to_string()),
    ];
    if read_only {
        options.push(fuser::MountOption::RO);
    }
    if args.allow_other {
        options.push(fuser::MountOption::AllowOther);
    }
    if args.auto_unmount {
        options.push(fuser::MountOption::AutoUnmount);
    }
    options
}

/// Mount, then block until a signal arrives or the kernel unmounts us
#[cfg(all(feature = "fuse", target_os = "linux"))]
fn serve(fs: &Arc<FileSystem>, config: &FsConfig, args: &Args) -> Result<()> {
    use adapter::{KvFsFuse, ShutdownReason};
    use std::sync::mpsc;

    let (tx, rx) = mpsc::channel();
    let filesystem =
        KvFsFuse::new(Arc::clone(fs), &config.cache).with_shutdown_notifier(tx.clone());

    info!(
        attr_ttl_ms = config.cache.attr_ttl_ms,
        entry_ttl_ms = config.cache.entry_ttl_ms,
        "mounting filesystem"
    );
    let options = mount_options(args, config.read_only);
    let session = fuser::spawn_mount2(filesystem, &args.mount_point, &options)
        .with_context(|| format!("mounting {}", args.mount_point.display()))?;

    ctrlc::set_handler(move || {
        let _ = tx.send(ShutdownReason::Signal);
    })
    .context("installing signal handler")?;

    info!("kvfs mounted; waiting for unmount or termination signal");
    match rx.recv() {
        Ok(ShutdownReason::Signal) => info!("termination signal received, unmounting"),
        Ok(ShutdownReason::Unmounted) | Err(_) => info!("filesystem was unmounted"),
    }
    session.join();
    Ok(())
}

#[cfg(not(all(feature = "fuse", target_os = "linux")))]
fn serve(fs: &Arc<FileSystem>, _config: &FsConfig, args: &Args) -> Result<()> {
    tracing::warn!("FUSE support not compiled in; {} was not mounted", args.mount_point.display());
    info!("To enable FUSE support, compile with: cargo build --features fuse");
    let stats = fs.stats();
    info!(
        files = stats.files,
        directories = stats.directories,
        bytes = stats.bytes,
        "kvfs core initialized"
    );
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = load_config(args.config.as_deref())?;
    apply_overrides(&mut config, &args);
    let level = config_log_level(&config)?;
    args.logging.clone().init(COMPONENT, level)?;

    info!(
        mount_point = %args.mount_point.display(),
        name = %config.name,
        read_only = config.read_only,
        "starting kvfs"
    );
    debug!(?config, "configuration loaded");

    let fs = Arc::new(FileSystem::from_config(&config).context("opening filesystem")?);
    let served = serve(&fs, &config, &args);

    // The session is gone by now, so nothing can race the final sync
    if let Err(err) = fs.shutdown() {
        error!(error = %err, "failed to persist filesystem state on shutdown");
        return Err(err).context("shutting down filesystem");
    }
    served?;
    info!("kvfs stopped");
    Ok(())
}
