use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use ember_core::archive::verify_export;
use ember_core::config::StorageSettings;
use ember_core::sweep::{spawn_sweep_scheduler, SweepDeps, SweepOptions, Sweeper};
use ember_core::{
    EmberConfig, GroupOutcome, LifecycleEvent, LifecycleStore, OutboxNotifier, SecureEraser,
    SqliteStore, SweepStatus, SystemClock,
};
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Ember ephemeral group lifecycle service", long_about = None)]
struct Cli {
    /// Config file (defaults to config.json in the data directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Root all storage under this directory
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write a default config and create the database
    Init {
        #[arg(long)]
        force: bool,
    },
    /// Run the expiry sweep scheduler until interrupted
    Run,
    /// Run a single sweep over all expired groups and exit
    SweepNow,
    /// Show the export artifact recorded for a group
    Export { group_id: String },
    /// Check a digest against a group's export archive
    VerifyExport { group_id: String, digest: String },
    /// List sweep runs, optionally filtered by status
    Runs {
        #[arg(long = "status")]
        statuses: Vec<String>,
    },
    /// Securely erase a file or directory tree
    Shred {
        path: PathBuf,
        #[arg(long)]
        passes: Option<u32>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    match cli.command {
        Commands::Init { force } => init_command(&cli.config, &config, force),
        Commands::Run => run_command(&config).await,
        Commands::SweepNow => sweep_now_command(&config).await,
        Commands::Export { group_id } => export_command(&config, &group_id),
        Commands::VerifyExport { group_id, digest } => verify_command(&config, &group_id, &digest),
        Commands::Runs { statuses } => runs_command(&config, &statuses),
        Commands::Shred { path, passes } => shred_command(&config, &path, passes),
    }
}

fn load_config(cli: &Cli) -> Result<EmberConfig> {
    let mut config = match (&cli.config, &cli.data_dir) {
        (Some(path), _) => EmberConfig::load_or_default(Some(path)),
        (None, Some(dir)) => EmberConfig::load_or_default(Some(&dir.join("config.json"))),
        (None, None) => EmberConfig::load_or_default(None),
    }
    .context("loading configuration")?;
    if let Some(dir) = &cli.data_dir {
        config.storage = StorageSettings::under(dir);
    }
    Ok(config)
}

fn open_store(config: &EmberConfig) -> Result<Arc<SqliteStore>> {
    let db = &config.storage.database_path;
    if let Some(parent) = db.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let store = SqliteStore::open(db).with_context(|| format!("opening {}", db.display()))?;
    Ok(Arc::new(store))
}

fn build_sweeper(config: &EmberConfig) -> Result<Arc<Sweeper>> {
    let cipher = config.build_cipher().context("loading encryption key")?;
    let store: Arc<dyn LifecycleStore> = open_store(config)?;
    let notifier = OutboxNotifier::new(&config.storage.outbox_dir).context("preparing outbox")?;
    let deps = SweepDeps::new(
        store,
        Arc::new(cipher),
        Arc::new(notifier),
        Arc::new(SecureEraser::new(config.erase.passes)),
        Arc::new(SystemClock),
    );
    let sweeper = Sweeper::new(deps, &SweepOptions::from_config(config))?;
    Ok(Arc::new(sweeper))
}

fn init_command(config_path: &Option<PathBuf>, config: &EmberConfig, force: bool) -> Result<()> {
    let path = match config_path {
        Some(p) => p.clone(),
        None => config
            .storage
            .database_path
            .parent()
            .map(|dir| dir.join("config.json"))
            .ok_or_else(|| anyhow!("cannot place config next to the database"))?,
    };
    if path.exists() && !force {
        bail!("config already exists at {} (use --force to overwrite)", path.display());
    }
    config.save(&path)?;
    fs::create_dir_all(&config.storage.exports_dir)?;
    fs::create_dir_all(&config.storage.outbox_dir)?;
    open_store(config)?;
    println!("Config written: {}", path.display());
    println!("Database: {}", config.storage.database_path.display());
    println!("Exports: {}", config.storage.exports_dir.display());
    println!("Set {} before running the service.", config.cipher.key_env);
    Ok(())
}

async fn run_command(config: &EmberConfig) -> Result<()> {
    let sweeper = build_sweeper(config)?;

    let mut events = sweeper.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(LifecycleEvent::ExportCreated { group_id, digest, .. }) => {
                    info!(group_id = %group_id, digest = %digest, "export created")
                }
                Ok(LifecycleEvent::GroupPurged { group_id }) => {
                    info!(group_id = %group_id, "group purged")
                }
                Ok(LifecycleEvent::SweepFailed { group_id, stage, error }) => {
                    warn!(group_id = %group_id, stage = %stage, error = %error, "sweep run FAILED")
                }
                Err(RecvError::Lagged(n)) => warn!(missed = n, "lifecycle event log lagging"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let (handle, control) = spawn_sweep_scheduler(
        sweeper.clone(),
        config.sweep.interval(),
        config.sweep.safety_net_interval(),
    );
    info!(db = %config.storage.database_path.display(), "ember service running");

    signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutdown signal received");
    control.shutdown();
    handle.await.context("joining sweep scheduler")?;
    Ok(())
}

async fn sweep_now_command(config: &EmberConfig) -> Result<()> {
    let sweeper = build_sweeper(config)?;
    let report = tokio::task::spawn_blocking(move || sweeper.sweep_once()).await?;
    if let Some(err) = &report.error {
        bail!("sweep failed: {err}");
    }
    println!(
        "due={} claimed={} purged={} stalled={}",
        report.due,
        report.claimed(),
        report.purged(),
        report.stalled()
    );
    for (group_id, outcome) in &report.outcomes {
        match outcome {
            GroupOutcome::Stalled { status, error } => println!("  {group_id}: {status} ({error})"),
            GroupOutcome::Purged(_) => println!("  {group_id}: PURGED"),
            GroupOutcome::Interrupted(status) => println!("  {group_id}: interrupted at {status}"),
            GroupOutcome::NotClaimed => println!("  {group_id}: claimed elsewhere"),
        }
    }
    Ok(())
}

fn export_command(config: &EmberConfig, group_id: &str) -> Result<()> {
    let store = open_store(config)?;
    match store.export_artifact(group_id)? {
        Some(artifact) => println!("{}", serde_json::to_string_pretty(&artifact)?),
        None => bail!("no export recorded for group {group_id}"),
    }
    Ok(())
}

fn verify_command(config: &EmberConfig, group_id: &str, digest: &str) -> Result<()> {
    let store = open_store(config)?;
    if verify_export(&*store, group_id, digest)? {
        println!("OK");
        Ok(())
    } else {
        bail!("digest does not match the export of group {group_id}")
    }
}

fn runs_command(config: &EmberConfig, statuses: &[String]) -> Result<()> {
    let statuses = statuses
        .iter()
        .map(|s| {
            s.to_ascii_uppercase()
                .parse::<SweepStatus>()
                .map_err(|v| anyhow!("unknown status {v}"))
        })
        .collect::<Result<Vec<_>>>()?;
    let store = open_store(config)?;
    let runs = store.runs_with_status(&statuses)?;
    println!("{}", serde_json::to_string_pretty(&runs)?);
    Ok(())
}

fn shred_command(config: &EmberConfig, path: &Path, passes: Option<u32>) -> Result<()> {
    let eraser = SecureEraser::new(passes.unwrap_or(config.erase.passes).max(1));
    let meta = fs::symlink_metadata(path).with_context(|| format!("inspecting {}", path.display()))?;
    if meta.is_dir() {
        let report = eraser.erase_dir(path)?;
        println!(
            "Erased {} file(s), {} bytes written, {} dir(s) removed",
            report.files, report.bytes_written, report.dirs_removed
        );
    } else if let Some(report) = eraser.erase_file(path)? {
        println!(
            "Erased {} ({} bytes, {} passes)",
            report.path.display(),
            report.size,
            report.passes_written
        );
    }
    Ok(())
}
