use crate::error::{ConfigError, ServiceListError, ThresholdError};
use chrono::NaiveTime;
use config::{Config, Environment, File};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::warn;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub bot: BotConfig,
    pub paths: PathsConfig,
    pub monitoring: MonitoringConfig,
    pub thresholds: Thresholds,
    pub backup: BackupConfig,
    pub api: ApiConfig,
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Layers `POTION_*` environment variables over the optional config file.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let settings = Config::builder()
            .add_source(File::with_name(path).required(false))
            .add_source(
                Environment::with_prefix("POTION")
                    .prefix_separator("_")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("bot.admin_ids")
                    .with_list_parse_key("monitoring.services_whitelist")
                    .with_list_parse_key("backup.extra_sources")
                    .try_parsing(true),
            )
            .build()?;

        let config: AppConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bot.token.trim().is_empty() {
            return Err(ConfigError::Missing("bot.token"));
        }
        if self.bot.admin_ids.is_empty() {
            return Err(ConfigError::Missing("bot.admin_ids"));
        }
        parse_schedule(&self.backup.schedule).map_err(|reason| ConfigError::Invalid {
            field: "backup.schedule",
            reason,
        })?;
        if self.monitoring.interval_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "monitoring.interval_secs",
                reason: "must be greater than zero".to_string(),
            });
        }

        if let Some(bad) = self
            .monitoring
            .services_whitelist
            .iter()
            .find(|name| !is_valid_service_name(name))
        {
            return Err(ConfigError::Invalid {
                field: "monitoring.services_whitelist",
                reason: format!("{bad:?} is not a valid unit name"),
            });
        }
        Ok(())
    }

    /// Paths mirrored into each snapshot, in order, existing ones only.
    ///
    /// Each source lands in `<snapshot>/<file name>`, so a later source whose
    /// name is already taken is dropped.
    pub fn backup_sources(&self) -> Vec<PathBuf> {
        let data_dir = &self.paths.data_dir;
        let candidates = [
            data_dir.join("app"),
            self.paths.log_dir(),
            data_dir.join("scripts"),
            data_dir.join(".env"),
        ];

        let mut sources: Vec<PathBuf> = Vec::new();
        for path in candidates.into_iter().chain(self.backup.extra_sources.iter().cloned()) {
            if !path.exists() || sources.contains(&path) {
                continue;
            }
            if let Some(taken) = sources
                .iter()
                .find(|source| source.file_name() == path.file_name())
            {
                warn!(
                    source = %path.display(),
                    conflicts_with = %taken.display(),
                    "Backup source dropped: snapshot name already used"
                );
                continue;
            }
            sources.push(path);
        }
        sources
    }
}

/// Unit names usable as a `systemctl` argument; never starts like a flag.
pub fn is_valid_service_name(name: &str) -> bool {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^[A-Za-z0-9@_][A-Za-z0-9@._:-]*$").ok())
        .as_ref()
        .map_or(false, |pattern| pattern.is_match(name))
}

/// Appends `.service` when missing, then checks the name.
pub fn normalize_service_name(raw: &str) -> Result<String, ServiceListError> {
    let trimmed = raw.trim();
    let name = if trimmed.ends_with(".service") {
        trimmed.to_string()
    } else {
        format!("{trimmed}.service")
    };
    if !is_valid_service_name(&name) {
        return Err(ServiceListError::InvalidName(raw.to_string()));
    }
    Ok(name)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BotConfig {
    pub token: String,
    pub admin_ids: Vec<i64>,
    pub api_base: String,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            admin_ids: Vec::new(),
            api_base: "https://api.telegram.org".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub data_dir: PathBuf,
    pub log_dir: Option<PathBuf>,
    pub backup_dir: Option<PathBuf>,
    pub hdd_mount: PathBuf,
    pub health_file: Option<PathBuf>,
    pub services_file: Option<PathBuf>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/opt/potion-runner"),
            log_dir: None,
            backup_dir: None,
            hdd_mount: PathBuf::from("/mnt/potion-data"),
            health_file: None,
            services_file: None,
        }
    }
}

impl PathsConfig {
    pub fn log_dir(&self) -> PathBuf {
        self.log_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("logs"))
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.backup_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("backups"))
    }

    pub fn health_file(&self) -> PathBuf {
        self.health_file
            .clone()
            .unwrap_or_else(|| self.data_dir.join("last_health.json"))
    }

    /// Runtime additions and removals to the service whitelist.
    pub fn services_file(&self) -> PathBuf {
        self.services_file
            .clone()
            .unwrap_or_else(|| self.data_dir.join("services_whitelist.json"))
    }

    pub fn lock_file(&self) -> PathBuf {
        self.data_dir.join("potion-runner.lock")
    }

    pub fn hdd_mount(&self) -> &Path {
        &self.hdd_mount
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub interval_secs: u64,
    pub first_tick_secs: u64,
    pub command_timeout_secs: u64,
    pub services_whitelist: Vec<String>,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            first_tick_secs: 10,
            command_timeout_secs: 60,
            services_whitelist: Vec::new(),
        }
    }
}

/// Alert thresholds. Replaced as a whole on update, never mutated in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    pub cpu_percent: f64,
    pub ram_free_mb: f64,
    pub disk_percent: f64,
    pub temperature_c: f64,
    pub hysteresis_minutes: u32,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            cpu_percent: 90.0,
            ram_free_mb: 500.0,
            disk_percent: 90.0,
            temperature_c: 85.0,
            hysteresis_minutes: 15,
        }
    }
}

impl Thresholds {
    pub fn hysteresis(&self) -> chrono::Duration {
        chrono::Duration::minutes(i64::from(self.hysteresis_minutes))
    }

    /// Returns a copy with one field changed, addressed by its operator-facing name.
    pub fn with_value(&self, metric: &str, raw: &str) -> Result<Self, ThresholdError> {
        let mut next = self.clone();
        match metric.to_ascii_lowercase().as_str() {
            "cpu" => next.cpu_percent = parse_percent("cpu", raw)?,
            "ram" => next.ram_free_mb = parse_non_negative("ram", raw)?,
            "disk" => next.disk_percent = parse_percent("disk", raw)?,
            "temp" => next.temperature_c = parse_non_negative("temp", raw)?,
            "hysteresis" => {
                next.hysteresis_minutes =
                    raw.trim()
                        .parse()
                        .map_err(|_| ThresholdError::InvalidValue {
                            metric: "hysteresis",
                            value: raw.to_string(),
                        })?
            }
            other => return Err(ThresholdError::UnknownMetric(other.to_string())),
        }
        Ok(next)
    }
}

fn parse_non_negative(metric: &'static str, raw: &str) -> Result<f64, ThresholdError> {
    match raw.trim().parse::<f64>() {
        Ok(value) if value.is_finite() && value >= 0.0 => Ok(value),
        _ => Err(ThresholdError::InvalidValue {
            metric,
            value: raw.to_string(),
        }),
    }
}

fn parse_percent(metric: &'static str, raw: &str) -> Result<f64, ThresholdError> {
    let value = parse_non_negative(metric, raw)?;
    if value > 100.0 {
        return Err(ThresholdError::InvalidValue {
            metric,
            value: raw.to_string(),
        });
    }
    Ok(value)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    pub schedule: String,
    pub tolerance_minutes: u32,
    pub extra_sources: Vec<PathBuf>,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            schedule: "02:30".to_string(),
            tolerance_minutes: 45,
            extra_sources: Vec::new(),
        }
    }
}

impl BackupConfig {
    pub fn tolerance(&self) -> chrono::Duration {
        chrono::Duration::minutes(i64::from(self.tolerance_minutes))
    }
}

/// Accepts `HH:MM` (or `HH.MM`) in 24 hour time.
pub fn parse_schedule(raw: &str) -> Result<NaiveTime, String> {
    let normalized = raw.trim().replace('.', ":");
    NaiveTime::parse_from_str(&normalized, "%H:%M")
        .map_err(|_| format!("{raw:?} is not a HH:MM time"))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub bind: String,
    pub token: Option<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:5001".to_string(),
            token: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}
