// src/main.rs

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tabsync::backup::{self, RestoreOptions, SnapshotStore};
use tabsync::db::models::{Changeset, ChangesetKind, ChangesetStatus, Device};
use tabsync::device::{self, CancelToken, DeviceManager, LocalConnection};
use tabsync::packages::archive::PayloadCompression;
use tabsync::packages::transaction::{self, InstallOptions};
use tabsync::packages::{ArchiveBuilder, Package};
use tabsync::{Config, Error};
use tracing::info;

/// Where the tablet keeps notebooks, templates and their metadata
const DEFAULT_MANAGED_ROOT: &str = "/home/root/.local/share/remarkable/xochitl";

const USAGE_EXIT: u8 = 2;

#[derive(Parser)]
#[command(name = "tabsync")]
#[command(author, version, about = "Package installer and backup manager for e-paper tablets", long_about = None)]
struct Cli {
    /// Database path (default: <data dir>/tabsync.db)
    #[arg(short, long, global = true)]
    db_path: Option<String>,

    /// Install prefix on the device
    #[arg(long, global = true, env = "PREFIX")]
    prefix: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the tabsync database
    Init,
    /// Register a device
    DeviceAdd {
        /// Device name
        name: String,
        /// SSH host name or address
        #[arg(long, required_unless_present = "local")]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        user: Option<String>,
        /// Private key for SSH authentication
        #[arg(long)]
        key: Option<String>,
        /// Host directory standing in for the device
        #[arg(long, conflicts_with = "host")]
        local: Option<String>,
        /// Device directory captured by backups
        #[arg(long, default_value = DEFAULT_MANAGED_ROOT)]
        root: String,
    },
    /// List registered devices
    DeviceList,
    /// Forget a device
    DeviceRemove { name: String },
    /// Build a package archive from a staged directory
    Pack {
        /// Directory laid out as it should appear under the prefix
        dir: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
        #[arg(long)]
        name: String,
        #[arg(long)]
        version: String,
        /// Free-form description stored in the INFO section
        #[arg(long)]
        info: Option<String>,
        #[arg(long, value_enum, default_value_t = CompressionArg::None)]
        compression: CompressionArg,
    },
    /// Print the INFO section of an archive
    Info { archive: PathBuf },
    /// Print the manifest of an archive under the prefix
    Manifest { archive: PathBuf },
    /// Install a package archive onto a device
    Install {
        archive: PathBuf,
        #[arg(short = 'D', long)]
        device: String,
        /// Take over files owned by other packages
        #[arg(long)]
        force: bool,
    },
    /// Remove an installed package
    Remove {
        package: String,
        #[arg(short = 'D', long)]
        device: String,
    },
    /// Remove files left behind by an interrupted install
    Cleanup {
        archive: PathBuf,
        #[arg(short = 'D', long)]
        device: String,
    },
    /// List packages installed on a device
    Query {
        #[arg(short = 'D', long)]
        device: String,
    },
    /// Show changeset history
    History {
        /// Only changesets run against this device
        #[arg(short = 'D', long)]
        device: Option<String>,
        /// Show a single changeset
        #[arg(long, conflicts_with = "device")]
        id: Option<i64>,
    },
    /// Capture a snapshot of the device's managed root
    Backup {
        #[arg(short = 'D', long)]
        device: String,
    },
    /// Write a snapshot back onto a device
    Restore {
        snapshot: String,
        #[arg(short = 'D', long)]
        device: String,
        /// Restore only this subtree of the snapshot
        #[arg(long)]
        subtree: Option<String>,
        /// Restore even if the snapshot was taken on another hardware model
        #[arg(long)]
        any_model: bool,
    },
    /// List snapshots, newest first
    Snapshots {
        #[arg(short = 'D', long)]
        device: Option<String>,
    },
    /// Re-hash the stored files of a snapshot
    Verify { snapshot: String },
    /// Delete a snapshot
    SnapshotDelete { snapshot: String },
    /// Run an archive's flags against the local prefix
    Helper {
        archive: PathBuf,
        /// --info, --manifest, --install or --uninstall
        #[arg(allow_hyphen_values = true)]
        flag: Option<String>,
        /// Exit with status 2 on an unsupported flag
        #[arg(long)]
        strict: bool,
    },
    /// Generate shell completion scripts
    Completions { shell: clap_complete::Shell },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum CompressionArg {
    None,
    Gzip,
    Zstd,
    Xz,
}

impl From<CompressionArg> for PayloadCompression {
    fn from(arg: CompressionArg) -> Self {
        match arg {
            CompressionArg::None => PayloadCompression::None,
            CompressionArg::Gzip => PayloadCompression::Gzip,
            CompressionArg::Zstd => PayloadCompression::Zstd,
            CompressionArg::Xz => PayloadCompression::Xz,
        }
    }
}

/// Legacy flags understood by an archive's preamble
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HelperFlag {
    Info,
    Manifest,
    Install,
    Uninstall,
}

impl HelperFlag {
    fn parse(flag: Option<&str>) -> Option<Self> {
        match flag? {
            "--info" => Some(HelperFlag::Info),
            "--manifest" => Some(HelperFlag::Manifest),
            "--install" => Some(HelperFlag::Install),
            "--uninstall" => Some(HelperFlag::Uninstall),
            _ => None,
        }
    }
}

/// Map an error to the process exit status
fn exit_code_for(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<Error>() {
        Some(Error::Format(_)) => 3,
        Some(Error::Conflict { .. }) => 4,
        Some(Error::Verification(_)) => 5,
        Some(Error::Connection(_)) => 6,
        Some(Error::NotFound(_) | Error::DatabaseNotFound(_)) => 7,
        Some(Error::PartialFailure(_)) => 8,
        _ => 1,
    }
}

/// Human-readable error detail, one failed unit per line
fn describe_error(err: &Error) -> String {
    match err {
        Error::PartialFailure(units) => {
            let mut text = err.to_string();
            for unit in units {
                text.push_str("\n  ");
                text.push_str(&unit.to_string());
            }
            text
        }
        Error::Conflict { conflicts, .. } => {
            let mut text = err.to_string();
            for conflict in conflicts {
                text.push_str(&format!("\n  {}:", conflict.package_id));
                for path in &conflict.paths {
                    text.push_str("\n    ");
                    text.push_str(path);
                }
            }
            text
        }
        _ => err.to_string(),
    }
}

/// Run one device session, recording it as a changeset
fn journaled<T>(
    config: &Config,
    kind: ChangesetKind,
    description: String,
    device: Option<&str>,
    op: impl FnOnce() -> tabsync::Result<T>,
) -> Result<T> {
    let conn = tabsync::db::open_or_init(&db_path(config))?;
    let mut changeset = Changeset::new(kind, description, device.map(str::to_string));
    changeset.insert(&conn)?;

    match op() {
        Ok(value) => {
            changeset.update_status(&conn, ChangesetStatus::Applied, None)?;
            Ok(value)
        }
        Err(e) => {
            changeset.update_status(&conn, ChangesetStatus::Failed, Some(describe_error(&e)))?;
            Err(anyhow::Error::new(e).context(describe_context(kind)))
        }
    }
}

fn describe_context(kind: ChangesetKind) -> &'static str {
    match kind {
        ChangesetKind::Install => "install failed",
        ChangesetKind::Remove => "remove failed",
        ChangesetKind::Cleanup => "cleanup failed",
        ChangesetKind::Backup => "backup failed",
        ChangesetKind::Restore => "restore failed",
    }
}

fn db_path(config: &Config) -> String {
    config.db_path.to_string_lossy().into_owned()
}

/// Look up a registered device and open its connection
fn open_device(config: &Config, name: &str) -> Result<(Device, DeviceManager)> {
    let conn = tabsync::db::open_or_init(&db_path(config))?;
    let device = Device::require(&conn, name)?;
    let connection = device::connect(&device, config)?;
    info!("Connected to {} ({})", device.name, connection.describe());

    let mut manager = DeviceManager::new(&config.lock_dir);
    manager.register(&device.name, connection)?;
    Ok((device, manager))
}

fn open_package(path: &Path) -> Result<Package> {
    Package::open(path).with_context(|| format!("cannot read archive {}", path.display()))
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = Config::from_env()?;
    if let Some(prefix) = &cli.prefix {
        config = config.with_prefix(prefix.clone());
    }
    if let Some(db_path) = &cli.db_path {
        config.db_path = PathBuf::from(db_path);
    }
    Ok(config)
}

fn main() -> ExitCode {
    // Initialize tracing subscriber for logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    match run(cli) {
        Ok(code) => code,
        Err(err) => {
            match err.downcast_ref::<Error>() {
                Some(inner) if err.chain().count() > 1 => {
                    eprintln!("Error: {}: {}", err, describe_error(inner))
                }
                Some(inner) => eprintln!("Error: {}", describe_error(inner)),
                None => eprintln!("Error: {:#}", err),
            }
            ExitCode::from(exit_code_for(&err))
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    let config = load_config(&cli)?;

    match cli.command {
        Some(Commands::Init) => {
            info!("Initializing tabsync database at: {}", config.db_path.display());
            config.ensure_directories()?;
            tabsync::db::init(&db_path(&config))?;
            println!("Database initialized successfully at: {}", config.db_path.display());
        }
        Some(Commands::DeviceAdd {
            name,
            host,
            port,
            user,
            key,
            local,
            root,
        }) => {
            let mut conn = tabsync::db::open_or_init(&db_path(&config))?;
            let mut device = match (local, host) {
                (Some(dir), _) => Device::local(name, dir, root),
                (None, Some(host)) => {
                    let mut device = Device::ssh(name, host, root);
                    device.port = port;
                    device.user = user;
                    device.key_path = key;
                    device
                }
                (None, None) => anyhow::bail!("either --host or --local is required"),
            };
            let added = tabsync::db::transaction(&mut conn, |tx| {
                if Device::find_by_name(tx, &device.name)?.is_some() {
                    return Ok(false);
                }
                device.insert(tx)?;
                Ok(true)
            })?;
            if !added {
                anyhow::bail!("Device '{}' is already registered", device.name);
            }
            println!("Added device: {} ({})", device.name, device.kind.as_str());
        }
        Some(Commands::DeviceList) => {
            let conn = tabsync::db::open_or_init(&db_path(&config))?;
            let devices = Device::list_all(&conn)?;
            if devices.is_empty() {
                println!("No devices registered.");
            } else {
                println!("Devices:");
                for device in &devices {
                    let endpoint = match (&device.user, &device.host, device.port) {
                        (Some(user), Some(host), Some(port)) => format!("{}@{}:{}", user, host, port),
                        (Some(user), Some(host), None) => format!("{}@{}", user, host),
                        (None, Some(host), Some(port)) => format!("{}:{}", host, port),
                        (_, Some(host), _) => host.clone(),
                        (_, None, _) => "-".to_string(),
                    };
                    println!(
                        "  {} [{}] {} (backs up {})",
                        device.name,
                        device.kind.as_str(),
                        endpoint,
                        device.managed_root
                    );
                }
            }
        }
        Some(Commands::DeviceRemove { name }) => {
            let conn = tabsync::db::open_or_init(&db_path(&config))?;
            if !Device::delete(&conn, &name)? {
                return Err(Error::NotFound(format!("device {}", name)).into());
            }
            println!("Removed device: {}", name);
        }
        Some(Commands::Pack {
            dir,
            output,
            name,
            version,
            info,
            compression,
        }) => {
            let mut builder = ArchiveBuilder::new(&name, &version).compression(compression.into());
            if let Some(text) = info {
                builder = builder.description(text);
            }
            builder.add_dir(&dir)?;
            let archive = builder.write(&output)?;
            println!(
                "Packed {} {}: {} file(s) into {}",
                name,
                version,
                archive.manifest().len(),
                output.display()
            );
        }
        Some(Commands::Info { archive }) => {
            let package = open_package(&archive)?;
            println!("{}", package.archive.info());
        }
        Some(Commands::Manifest { archive }) => {
            let package = open_package(&archive)?;
            for path in package.archive.prefixed_manifest(&config.prefix) {
                println!("{}", path);
            }
        }
        Some(Commands::Install {
            archive,
            device,
            force,
        }) => {
            let package = open_package(&archive)?;
            info!("Installing package: {} {}", package.id, package.version);
            let (device, manager) = open_device(&config, &device)?;
            let options = InstallOptions { allow_overwrite: force };

            let report = journaled(
                &config,
                ChangesetKind::Install,
                format!("Install {}-{}", package.id, package.version),
                Some(&device.name),
                || {
                    let mut session = manager.session(&device.name)?;
                    transaction::install(&mut *session, &config, &package, options, &CancelToken::new())
                },
            )?;

            println!("Installed package: {} version {}", report.package_id, report.version);
            if let Some(previous) = &report.previous_version {
                println!("  Replaced version: {}", previous);
            }
            println!("  Files: {}", report.files_written);
            if !report.overwritten.is_empty() {
                println!("  Overwrote: {}", report.overwritten.join(", "));
            }
            if !report.removed_stale.is_empty() {
                println!("  Removed stale files: {}", report.removed_stale.len());
            }
        }
        Some(Commands::Remove { package, device }) => {
            info!("Removing package: {}", package);
            let (device, manager) = open_device(&config, &device)?;
            let report = journaled(
                &config,
                ChangesetKind::Remove,
                format!("Remove {}", package),
                Some(&device.name),
                || {
                    let mut session = manager.session(&device.name)?;
                    transaction::uninstall(&mut *session, &config, &package, &CancelToken::new())
                },
            )?;

            println!("Removed package: {}", report.package_id);
            println!("  Files removed: {}", report.files_removed);
            if !report.missing.is_empty() {
                println!("  Already missing: {}", report.missing.join(", "));
            }
        }
        Some(Commands::Cleanup { archive, device }) => {
            let package = open_package(&archive)?;
            let (device, manager) = open_device(&config, &device)?;
            let report = journaled(
                &config,
                ChangesetKind::Cleanup,
                format!("Cleanup {}-{}", package.id, package.version),
                Some(&device.name),
                || {
                    let mut session = manager.session(&device.name)?;
                    transaction::cleanup(&mut *session, &config, &package)
                },
            )?;

            println!("Cleaned up {}: {} file(s) removed", package.id, report.files_removed);
            for path in &report.skipped {
                println!("  Kept {} (owned by another package)", path);
            }
        }
        Some(Commands::Query { device }) => {
            let (device, manager) = open_device(&config, &device)?;
            let registry = {
                let mut session = manager.session(&device.name)?;
                transaction::query(&mut *session, &config)?
            };

            if registry.is_empty() {
                println!("No packages found.");
            } else {
                println!("Installed packages:");
                for (id, entry) in registry.iter() {
                    println!("  {} {} ({} files, {})", id, entry.version, entry.manifest.len(), entry.installed_at);
                }
                println!("\nTotal: {} package(s)", registry.len());
            }
        }
        Some(Commands::History { device, id }) => {
            let conn = tabsync::db::open(&db_path(&config))?;
            let changesets = match (id, device.as_deref()) {
                (Some(id), _) => Changeset::find_by_id(&conn, id)?.into_iter().collect(),
                (None, Some(device)) => Changeset::find_by_device(&conn, device)?,
                (None, None) => Changeset::list_all(&conn)?,
            };

            if changesets.is_empty() {
                println!("No changeset history.");
            } else {
                println!("Changeset history:");
                for changeset in &changesets {
                    let timestamp = changeset
                        .applied_at
                        .as_ref()
                        .or(changeset.failed_at.as_ref())
                        .or(changeset.created_at.as_ref())
                        .map(|s| s.as_str())
                        .unwrap_or("pending");

                    println!(
                        "  [{}] {} - {} on {} ({})",
                        changeset.id.unwrap_or_default(),
                        timestamp,
                        changeset.description,
                        changeset.device_name.as_deref().unwrap_or("-"),
                        changeset.status.as_str()
                    );
                    if let Some(detail) = &changeset.detail {
                        for line in detail.lines() {
                            println!("      {}", line);
                        }
                    }
                }
                println!("\nTotal: {} changeset(s)", changesets.len());
            }
        }
        Some(Commands::Backup { device }) => {
            config.ensure_directories()?;
            let (device, manager) = open_device(&config, &device)?;
            let store = SnapshotStore::new(&config.backup_dir);

            let report = journaled(
                &config,
                ChangesetKind::Backup,
                format!("Backup {}", device.managed_root),
                Some(&device.name),
                || {
                    let mut session = manager.session(&device.name)?;
                    backup::backup(
                        &mut *session,
                        &store,
                        &device.name,
                        &device.managed_root,
                        &CancelToken::new(),
                    )
                },
            )?;

            println!("Snapshot {} committed", report.snapshot_id);
            if report.resumed {
                println!("  Resumed an interrupted run");
            }
            println!("  Files: {}", report.files_total);
            println!("  Transferred: {} ({} bytes)", report.transferred, report.bytes_transferred);
            println!("  Reused: {}", report.reused + report.already_stored);
        }
        Some(Commands::Restore {
            snapshot,
            device,
            subtree,
            any_model,
        }) => {
            let store = SnapshotStore::new(&config.backup_dir);
            let snapshot = store.load(&snapshot)?;
            let (device, manager) = open_device(&config, &device)?;

            let description = match &subtree {
                Some(subtree) => format!("Restore {} ({})", snapshot.id, subtree),
                None => format!("Restore {}", snapshot.id),
            };
            let report = journaled(
                &config,
                ChangesetKind::Restore,
                description,
                Some(&device.name),
                || {
                    let mut session = manager.session(&device.name)?;
                    backup::restore(
                        &mut *session,
                        &store,
                        &snapshot,
                        &device.managed_root,
                        RestoreOptions {
                            subtree: subtree.as_deref(),
                            allow_other_model: any_model,
                        },
                        &CancelToken::new(),
                    )
                },
            )?;

            println!("Restored snapshot {}", report.snapshot_id);
            println!("  Written: {} ({} bytes)", report.restored, report.bytes_written);
            println!("  Unchanged: {}", report.unchanged);
        }
        Some(Commands::Snapshots { device }) => {
            let store = SnapshotStore::new(&config.backup_dir);
            let snapshots = store.list(device.as_deref())?;
            if snapshots.is_empty() {
                println!("No snapshots.");
            } else {
                println!("Snapshots:");
                for snapshot in &snapshots {
                    println!(
                        "  {} {} files, {} bytes{}",
                        snapshot.id,
                        snapshot.len(),
                        snapshot.total_bytes(),
                        if snapshot.committed { "" } else { " (incomplete)" }
                    );
                }
            }
        }
        Some(Commands::Verify { snapshot }) => {
            let store = SnapshotStore::new(&config.backup_dir);
            let snapshot = store.load(&snapshot)?;
            let report = backup::verify(&store, &snapshot);
            if !report.is_ok() {
                for unit in &report.mismatched {
                    eprintln!("  {}", unit);
                }
                return Err(Error::Verification(format!(
                    "{} of {} stored file(s) in {} are damaged",
                    report.mismatched.len(),
                    snapshot.len(),
                    snapshot.id
                ))
                .into());
            }
            println!("Snapshot {}: {} file(s) verified", report.snapshot_id, report.verified);
        }
        Some(Commands::SnapshotDelete { snapshot }) => {
            let store = SnapshotStore::new(&config.backup_dir);
            store.delete(&snapshot)?;
            println!("Deleted snapshot {}", snapshot);
        }
        Some(Commands::Helper {
            archive,
            flag,
            strict,
        }) => {
            return run_helper(&config, &archive, flag.as_deref(), strict);
        }
        Some(Commands::Completions { shell }) => {
            clap_complete::generate(shell, &mut Cli::command(), "tabsync", &mut io::stdout());
        }
        None => {
            // No command provided, show help
            println!("tabsync v{}", env!("CARGO_PKG_VERSION"));
            println!("Run 'tabsync --help' for usage information");
        }
    }

    Ok(ExitCode::SUCCESS)
}

/// Legacy surface of a self-extracting archive, run against this machine
fn run_helper(config: &Config, archive: &Path, flag: Option<&str>, strict: bool) -> Result<ExitCode> {
    let Some(flag) = HelperFlag::parse(flag) else {
        eprintln!(
            "usage: tabsync helper {} --info|--manifest|--install|--uninstall",
            archive.display()
        );
        return Ok(if strict { ExitCode::from(USAGE_EXIT) } else { ExitCode::SUCCESS });
    };

    let package = open_package(archive)?;
    match flag {
        HelperFlag::Info => println!("{}", package.archive.info()),
        HelperFlag::Manifest => {
            for path in package.archive.prefixed_manifest(&config.prefix) {
                println!("{}", path);
            }
        }
        HelperFlag::Install => {
            let mut conn = LocalConnection::new("/")?;
            transaction::install(&mut conn, config, &package, InstallOptions::default(), &CancelToken::new())?;
        }
        HelperFlag::Uninstall => {
            let mut conn = LocalConnection::new("/")?;
            transaction::uninstall(&mut conn, config, &package.id, &CancelToken::new())?;
        }
    }
    Ok(ExitCode::SUCCESS)
}
