use crate::models::backup::BackupReport;
use crate::models::metrics::{Alert, ConditionCode};
use crate::services::backup::{default_label, should_run_backup, BackupEngine};
use crate::services::dispatcher::AlertDispatcher;
use crate::services::monitor::HealthMonitor;
use crate::services::prober::{failed_services, ServiceProber};
use crate::services::sampler::{metrics_summary, write_health_snapshot, MetricsSampler};
use crate::services::state::{AlertOverrides, SharedStatus, StatusBoard, ThresholdStore, WhitelistStore};
use crate::utils::logging::log_action;
use anyhow::Result;
use chrono::{DateTime, Duration, Local, NaiveTime, TimeZone, Utc};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Handles the health tick shares with the admin API.
#[derive(Clone)]
pub struct SharedHandles {
    pub thresholds: ThresholdStore,
    pub overrides: AlertOverrides,
    pub status: SharedStatus,
    pub services: WhitelistStore,
}

#[derive(Debug, Default, PartialEq)]
pub struct TickReport {
    pub delivered: Vec<Alert>,
    pub snoozed: Vec<ConditionCode>,
    pub recovered: Vec<ConditionCode>,
}

/// Owns the health monitor; the only writer of its state.
pub struct HealthTicker {
    monitor: HealthMonitor,
    sampler: Arc<Mutex<dyn MetricsSampler>>,
    prober: Arc<dyn ServiceProber>,
    dispatcher: AlertDispatcher,
    shared: SharedHandles,
    health_file: PathBuf,
    last_timestamp: Option<DateTime<Utc>>,
}

impl HealthTicker {
    pub fn new(
        sampler: Arc<Mutex<dyn MetricsSampler>>,
        prober: Arc<dyn ServiceProber>,
        dispatcher: AlertDispatcher,
        shared: SharedHandles,
        health_file: PathBuf,
    ) -> Self {
        Self {
            monitor: HealthMonitor::new(shared.thresholds.get()),
            sampler,
            prober,
            dispatcher,
            shared,
            health_file,
            last_timestamp: None,
        }
    }

    pub async fn tick(&mut self) -> Result<TickReport> {
        self.monitor.set_thresholds(self.shared.thresholds.get());

        let sampler = Arc::clone(&self.sampler);
        let mut metrics = tokio::task::spawn_blocking(move || sampler.lock().sample()).await?;
        // Wall clock can step back; the monitor needs non-decreasing time.
        if let Some(last) = self.last_timestamp {
            metrics.timestamp = metrics.timestamp.max(last);
        }
        self.last_timestamp = Some(metrics.timestamp);

        let whitelist = self.shared.services.get();
        let statuses = self.prober.probe(&whitelist).await;
        let failed = failed_services(&statuses);
        let evaluation = self.monitor.evaluate(&metrics, &failed);
        if !evaluation.is_empty() {
            info!(
                triggered = evaluation.triggered.len(),
                recovered = evaluation.recovered.len(),
                "Alert state changed"
            );
        }

        let now = Utc::now();
        let overrides = &self.shared.overrides;
        let (delivered, snoozed): (Vec<Alert>, Vec<Alert>) = evaluation
            .triggered
            .into_iter()
            .partition(|alert| !overrides.is_disabled(&alert.code, now));

        if let Err(e) = write_health_snapshot(&metrics, &self.health_file).await {
            warn!(path = %self.health_file.display(), error = %e, "Failed to write health snapshot");
        }

        self.dispatcher
            .dispatch_tick(&delivered, &evaluation.recovered, &metrics_summary(&metrics))
            .await;

        for alert in &delivered {
            log_action(
                "alert.trigger",
                None,
                "alert",
                &format!("{}:{}", alert.code, alert.message),
            );
        }
        for alert in &snoozed {
            debug!(code = %alert.code, "Alert snoozed by operator override");
            log_action("alert.trigger", None, "snoozed", &alert.code.to_string());
        }
        for code in &evaluation.recovered {
            log_action("alert.recover", None, "ok", &code.to_string());
        }

        *self.shared.status.write().await = StatusBoard {
            last_tick: Some(metrics.timestamp),
            metrics: Some(metrics),
            services: statuses,
            open_alerts: self.monitor.open_alerts(),
        };

        Ok(TickReport {
            delivered,
            snoozed: snoozed.into_iter().map(|alert| alert.code).collect(),
            recovered: evaluation.recovered,
        })
    }
}

pub async fn run_health_loop(mut ticker: HealthTicker, every: std::time::Duration, first: std::time::Duration) {
    tokio::time::sleep(first).await;
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        match ticker.tick().await {
            Ok(report) => debug!(
                delivered = report.delivered.len(),
                snoozed = report.snoozed.len(),
                recovered = report.recovered.len(),
                "Health tick finished"
            ),
            Err(e) => warn!(error = %e, "Health tick failed"),
        }
    }
}

/// Runs backups on the blocking pool, one at a time.
#[derive(Clone)]
pub struct BackupJob {
    engine: BackupEngine,
    sources: Vec<PathBuf>,
    tolerance: Duration,
    running: Arc<tokio::sync::Mutex<()>>,
}

impl BackupJob {
    pub fn new(engine: BackupEngine, sources: Vec<PathBuf>, tolerance: Duration) -> Self {
        Self {
            engine,
            sources,
            tolerance,
            running: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    pub fn engine(&self) -> &BackupEngine {
        &self.engine
    }

    /// Backs up unless a snapshot newer than the tolerance already exists.
    pub async fn run_if_due(&self) -> Result<Option<BackupReport>> {
        let _running = self.running.lock().await;
        let engine = self.engine.clone();
        let last = tokio::task::spawn_blocking(move || engine.latest_backup_timestamp()).await?;
        if !should_run_backup(last, Utc::now(), self.tolerance) {
            info!(?last, "Scheduled backup skipped: recent snapshot still valid");
            log_action("backup.auto", None, "skip", "recent snapshot");
            return Ok(None);
        }
        self.perform().await.map(Some)
    }

    /// Backs up regardless of tolerance, after any run already in progress.
    pub async fn run_now(&self) -> Result<BackupReport> {
        let _running = self.running.lock().await;
        self.perform().await
    }

    async fn perform(&self) -> Result<BackupReport> {
        let engine = self.engine.clone();
        let sources = self.sources.clone();
        let label = default_label(Local::now());
        let report = tokio::task::spawn_blocking(move || engine.perform_backup(&sources, &label)).await??;
        Ok(report)
    }
}

/// Next occurrence of `at` strictly after `now`, skipping times a DST gap removes.
pub fn next_daily_run<Tz: TimeZone>(now: &DateTime<Tz>, at: NaiveTime) -> DateTime<Tz> {
    let tz = now.timezone();
    for offset in 0..=2 {
        let date = now.date_naive() + Duration::days(offset);
        if let Some(candidate) = tz.from_local_datetime(&date.and_time(at)).earliest() {
            if candidate > *now {
                return candidate;
            }
        }
    }
    now.clone() + Duration::days(1)
}

pub async fn run_backup_loop(job: BackupJob, dispatcher: AlertDispatcher, mut schedule: watch::Receiver<NaiveTime>) {
    loop {
        let at = *schedule.borrow_and_update();
        let now = Local::now();
        let next = next_daily_run(&now, at);
        let wait = (next - now).to_std().unwrap_or_default();
        info!(next = %next.format("%Y-%m-%d %H:%M"), "Next backup scheduled");

        tokio::select! {
            _ = tokio::time::sleep(wait) => {
                report_scheduled_backup(&job, &dispatcher).await;
            }
            Ok(()) = schedule.changed() => {
                info!("Backup schedule changed");
            }
        }
    }
}

async fn report_scheduled_backup(job: &BackupJob, dispatcher: &AlertDispatcher) {
    match job.run_if_due().await {
        Ok(None) => {}
        Ok(Some(report)) => {
            let label = report
                .snapshot
                .file_name()
                .map(|name| name.to_string_lossy().to_string())
                .unwrap_or_default();
            let mut text = format!(
                "✅ Scheduled backup finished ({label}, {} files).",
                report.files_indexed
            );
            if !report.skipped_sources.is_empty() {
                text.push_str(&format!("\nSkipped: {}", report.skipped_sources.join("; ")));
            }
            dispatcher.broadcast(&text).await;
            log_action("backup.auto", None, "ok", &label);
        }
        Err(e) => {
            warn!(error = %e, "Scheduled backup failed");
            dispatcher
                .broadcast(&format!("❌ Scheduled backup failed: {e}"))
                .await;
            log_action("backup.auto", None, "fail", &e.to_string());
        }
    }
}
