//! State shared between the scheduler and the admin API.
//!
//! The health monitor itself is not here: it is owned by the health tick alone.

use crate::error::ServiceListError;
use crate::models::config::{is_valid_service_name, Thresholds};
use crate::models::metrics::{ConditionCode, MetricsSnapshot, ServiceStatus};
use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Current thresholds, swapped as a whole so a tick never sees a partial update.
#[derive(Clone)]
pub struct ThresholdStore {
    inner: Arc<RwLock<Arc<Thresholds>>>,
}

impl ThresholdStore {
    pub fn new(thresholds: Thresholds) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(thresholds))),
        }
    }

    pub fn get(&self) -> Arc<Thresholds> {
        Arc::clone(&self.inner.read())
    }

    /// Builds the next value from the current one and swaps it in under one write lock.
    pub fn update<E>(&self, f: impl FnOnce(&Thresholds) -> Result<Thresholds, E>) -> Result<Arc<Thresholds>, E> {
        let mut guard = self.inner.write();
        let next = Arc::new(f(&guard)?);
        *guard = Arc::clone(&next);
        Ok(next)
    }
}

/// Whitelisted service units. Swapped as a whole; changes are written to
/// `persist_to` (when set) before they become visible.
#[derive(Clone)]
pub struct WhitelistStore {
    inner: Arc<RwLock<Arc<Vec<String>>>>,
    persist_to: Option<PathBuf>,
}

impl WhitelistStore {
    pub fn new(services: Vec<String>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(services))),
            persist_to: None,
        }
    }

    /// Uses the list saved at `path` when present, else `configured`.
    pub fn load(path: PathBuf, configured: Vec<String>) -> Result<Self, ServiceListError> {
        let services = match fs::read(&path) {
            Ok(content) => {
                let saved: Vec<String> =
                    serde_json::from_slice(&content).map_err(|source| ServiceListError::Json {
                        path: path.clone(),
                        source,
                    })?;
                let (valid, invalid): (Vec<String>, Vec<String>) =
                    saved.into_iter().partition(|name| is_valid_service_name(name));
                if !invalid.is_empty() {
                    warn!(path = %path.display(), ?invalid, "Ignoring invalid saved service names");
                }
                info!(path = %path.display(), count = valid.len(), "Service whitelist loaded");
                valid
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => configured,
            Err(source) => return Err(ServiceListError::Io { path, source }),
        };
        Ok(Self {
            inner: Arc::new(RwLock::new(Arc::new(services))),
            persist_to: Some(path),
        })
    }

    pub fn get(&self) -> Arc<Vec<String>> {
        Arc::clone(&self.inner.read())
    }

    /// Returns `false` when the service was already listed.
    pub fn add(&self, service: &str) -> Result<bool, ServiceListError> {
        self.modify(|services| {
            if services.iter().any(|name| name == service) {
                return false;
            }
            services.push(service.to_string());
            true
        })
    }

    /// Returns `false` when the service was not listed.
    pub fn remove(&self, service: &str) -> Result<bool, ServiceListError> {
        self.modify(|services| {
            let before = services.len();
            services.retain(|name| name != service);
            services.len() != before
        })
    }

    fn modify(&self, f: impl FnOnce(&mut Vec<String>) -> bool) -> Result<bool, ServiceListError> {
        let mut guard = self.inner.write();
        let mut next = Vec::clone(&guard);
        if !f(&mut next) {
            return Ok(false);
        }
        if let Some(path) = &self.persist_to {
            save_services(path, &next)?;
        }
        *guard = Arc::new(next);
        Ok(true)
    }
}

fn save_services(path: &Path, services: &[String]) -> Result<(), ServiceListError> {
    let io_err = |source| ServiceListError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
    }
    let content = serde_json::to_vec_pretty(services).map_err(|source| ServiceListError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    let temp_path = path.with_extension("json.tmp");
    fs::write(&temp_path, content).map_err(io_err)?;
    fs::rename(&temp_path, path).map_err(io_err)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DisabledAlert {
    pub code: ConditionCode,
    pub until: DateTime<Utc>,
    pub remaining_minutes: i64,
}

/// Operator snoozes: condition code to expiry. Expired entries are pruned on read.
#[derive(Clone, Default)]
pub struct AlertOverrides {
    inner: Arc<Mutex<BTreeMap<ConditionCode, DateTime<Utc>>>>,
}

impl AlertOverrides {
    pub fn disable(&self, code: ConditionCode, minutes: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        let until = now + Duration::minutes(i64::from(minutes));
        self.inner.lock().insert(code, until);
        until
    }

    pub fn is_disabled(&self, code: &ConditionCode, now: DateTime<Utc>) -> bool {
        let mut disabled = self.inner.lock();
        match disabled.get(code) {
            Some(until) if now < *until => true,
            Some(_) => {
                disabled.remove(code);
                false
            }
            None => false,
        }
    }

    pub fn active(&self, now: DateTime<Utc>) -> Vec<DisabledAlert> {
        let mut disabled = self.inner.lock();
        disabled.retain(|_, until| now < *until);
        disabled
            .iter()
            .map(|(code, until)| DisabledAlert {
                code: code.clone(),
                until: *until,
                remaining_minutes: (*until - now).num_minutes(),
            })
            .collect()
    }
}

/// What the last health tick saw, published for read-only consumers.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatusBoard {
    pub last_tick: Option<DateTime<Utc>>,
    pub metrics: Option<MetricsSnapshot>,
    pub services: Vec<ServiceStatus>,
    pub open_alerts: Vec<ConditionCode>,
}

pub type SharedStatus = Arc<tokio::sync::RwLock<StatusBoard>>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ThresholdError;
    use crate::models::metrics::MetricKind;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn threshold_reads_are_stable_snapshots() {
        let store = ThresholdStore::new(Thresholds::default());
        let before = store.get();

        let updated = store
            .update(|current| current.with_value("cpu", "70"))
            .unwrap();
        assert_eq!(updated.cpu_percent, 70.0);

        // A reader holding the old Arc keeps a consistent value.
        assert_eq!(before.cpu_percent, 90.0);
        assert_eq!(store.get().cpu_percent, 70.0);
    }

    #[test]
    fn failed_threshold_update_leaves_store_untouched() {
        let store = ThresholdStore::new(Thresholds::default());
        let err = store
            .update(|current| current.with_value("fan", "1"))
            .unwrap_err();
        assert_eq!(err, ThresholdError::UnknownMetric("fan".to_string()));
        assert_eq!(*store.get(), Thresholds::default());
    }

    #[test]
    fn whitelist_changes_survive_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("services_whitelist.json");

        let store = WhitelistStore::load(path.clone(), vec!["nginx.service".to_string()]).unwrap();
        let before = store.get();
        assert!(store.add("redis.service").unwrap());
        assert!(!store.add("redis.service").unwrap());
        assert!(store.remove("nginx.service").unwrap());
        assert!(!store.remove("ghost.service").unwrap());

        assert_eq!(*before, vec!["nginx.service".to_string()]);
        assert_eq!(*store.get(), vec!["redis.service".to_string()]);

        let reloaded = WhitelistStore::load(path, vec!["nginx.service".to_string()]).unwrap();
        assert_eq!(*reloaded.get(), vec!["redis.service".to_string()]);
    }

    #[test]
    fn saved_whitelist_drops_unsafe_names() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("services_whitelist.json");
        fs::write(&path, r#"["cron.service", "--all"]"#).unwrap();

        let store = WhitelistStore::load(path, Vec::new()).unwrap();
        assert_eq!(*store.get(), vec!["cron.service".to_string()]);
    }

    #[test]
    fn overrides_expire_lazily() {
        let overrides = AlertOverrides::default();
        let cpu = ConditionCode::Metric(MetricKind::CpuHigh);
        overrides.disable(cpu.clone(), 30, now());

        assert!(overrides.is_disabled(&cpu, now() + Duration::minutes(29)));
        assert!(!overrides.is_disabled(&ConditionCode::service("nginx"), now()));

        let active = overrides.active(now() + Duration::minutes(10));
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].remaining_minutes, 20);

        assert!(!overrides.is_disabled(&cpu, now() + Duration::minutes(30)));
        assert!(overrides.active(now()).is_empty());
    }
}
