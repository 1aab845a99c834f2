use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

mod error;
mod handlers;
mod models;
mod services;
mod utils;

use handlers::{create_app, AppState};
use models::config::{parse_schedule, AppConfig};
use services::backup::BackupEngine;
use services::dispatcher::{AlertDispatcher, TelegramTransport};
use services::prober::{ServiceProber, SystemctlProber};
use services::sampler::{metrics_summary, write_health_snapshot, MetricsSampler, SysinfoSampler};
use services::scheduler::{run_backup_loop, run_health_loop, BackupJob, HealthTicker, SharedHandles};
use services::state::{AlertOverrides, SharedStatus, ThresholdStore, WhitelistStore};
use utils::format::human_duration;
use utils::instance::InstanceLock;
use utils::logging::{init_logging, log_action};

#[derive(Parser)]
#[command(name = "potion-runner", version, about = "Server health watchdog and backup runner")]
struct Cli {
    /// Config file, any format the config crate reads (extension optional)
    #[arg(long, global = true, default_value = "config")]
    config: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the daemon: health loop, backup loop and admin API
    Run,
    /// Take one backup now
    BackupOnce {
        /// Ignore the recent-snapshot tolerance
        #[arg(long)]
        force: bool,
    },
    /// Sample metrics once and write the health snapshot file
    HealthPing,
    /// Verify a snapshot against its manifest
    Verify { label: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load(&cli.config).context("Configuration invalid")?;
    let _guards = init_logging(&config.paths.log_dir(), &config.logging.level)?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run_daemon(config).await,
        Command::BackupOnce { force } => backup_once(&config, force).await,
        Command::HealthPing => health_ping(&config).await,
        Command::Verify { label } => verify(&config, label).await,
    }
}

fn backup_job(config: &AppConfig) -> BackupJob {
    BackupJob::new(
        BackupEngine::new(&config.paths.backup_dir()),
        config.backup_sources(),
        config.backup.tolerance(),
    )
}

async fn run_daemon(config: AppConfig) -> Result<()> {
    info!("Starting potion-runner v{}", env!("CARGO_PKG_VERSION"));
    std::fs::create_dir_all(&config.paths.data_dir)
        .with_context(|| format!("creating {}", config.paths.data_dir.display()))?;
    let mut instance = InstanceLock::open(&config.paths.lock_file())?;
    let _instance_guard = instance.acquire()?;

    let services = WhitelistStore::load(
        config.paths.services_file(),
        config.monitoring.services_whitelist.clone(),
    )?;
    let shared = SharedHandles {
        thresholds: ThresholdStore::new(config.thresholds.clone()),
        overrides: AlertOverrides::default(),
        status: SharedStatus::default(),
        services,
    };

    let transport = TelegramTransport::new(&config.bot.api_base, &config.bot.token)?;
    let dispatcher = AlertDispatcher::new(Arc::new(transport), config.bot.admin_ids.clone());

    let sampler: Arc<Mutex<dyn MetricsSampler>> =
        Arc::new(Mutex::new(SysinfoSampler::new(config.paths.hdd_mount().to_path_buf())));
    let prober: Arc<dyn ServiceProber> = Arc::new(SystemctlProber::new(Duration::from_secs(
        config.monitoring.command_timeout_secs,
    )));
    let ticker = HealthTicker::new(
        sampler,
        Arc::clone(&prober),
        dispatcher.clone(),
        shared.clone(),
        config.paths.health_file(),
    );

    // Start background health loop
    let every = Duration::from_secs(config.monitoring.interval_secs);
    let first = Duration::from_secs(config.monitoring.first_tick_secs);
    tokio::spawn(run_health_loop(ticker, every, first));

    // Start backup loop
    let schedule = parse_schedule(&config.backup.schedule).map_err(anyhow::Error::msg)?;
    let (schedule_tx, schedule_rx) = watch::channel(schedule);
    let job = backup_job(&config);
    tokio::spawn(run_backup_loop(job.clone(), dispatcher.clone(), schedule_rx));

    let state = AppState {
        thresholds: shared.thresholds,
        overrides: shared.overrides,
        status: shared.status,
        services: shared.services,
        prober,
        backup: job,
        schedule: Arc::new(schedule_tx),
        api_token: config.api.token.clone(),
    };
    let app = create_app(state);

    let listener = tokio::net::TcpListener::bind(&config.api.bind)
        .await
        .with_context(|| format!("binding admin API on {}", config.api.bind))?;
    info!("Admin API listening on http://{}", config.api.bind);

    dispatcher
        .broadcast(&format!("✅ potion-runner v{} started", env!("CARGO_PKG_VERSION")))
        .await;
    log_action("daemon.start", None, "ok", &config.api.bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("potion-runner stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}

async fn backup_once(config: &AppConfig, force: bool) -> Result<()> {
    let job = backup_job(config);
    let report = if force {
        Some(job.run_now().await?)
    } else {
        job.run_if_due().await?
    };

    match report {
        Some(report) => {
            log_action("cli.backup", None, "ok", &report.snapshot.display().to_string());
            println!(
                "Snapshot {} ({} files indexed)",
                report.snapshot.display(),
                report.files_indexed
            );
            for skipped in &report.skipped_sources {
                println!("skipped {skipped}");
            }
        }
        None => println!("Recent snapshot still valid; use --force to back up anyway"),
    }
    Ok(())
}

async fn health_ping(config: &AppConfig) -> Result<()> {
    let hdd_mount = config.paths.hdd_mount().to_path_buf();
    let metrics = tokio::task::spawn_blocking(move || SysinfoSampler::new(hdd_mount).sample()).await?;
    let path = config.paths.health_file();
    write_health_snapshot(&metrics, &path).await?;
    println!("{}", metrics_summary(&metrics));
    println!("Up {}", human_duration(metrics.uptime.as_secs()));
    println!("Health snapshot written to {}", path.display());
    Ok(())
}

async fn verify(config: &AppConfig, label: String) -> Result<()> {
    let engine = BackupEngine::new(&config.paths.backup_dir());
    let checked = label.clone();
    let mismatches = tokio::task::spawn_blocking(move || engine.verify_label(&checked)).await??;
    if mismatches.is_empty() {
        println!("{label}: intact");
        log_action("cli.backup_verify", None, "ok", &label);
        return Ok(());
    }
    for mismatch in &mismatches {
        println!("{mismatch}");
    }
    log_action("cli.backup_verify", None, "mismatch", &label);
    anyhow::bail!("snapshot {label}: {} files failed verification", mismatches.len())
}
