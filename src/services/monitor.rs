use crate::models::config::Thresholds;
use crate::models::metrics::{Alert, ConditionCode, MetricKind, MetricsSnapshot};
use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// One condition evaluated on one tick. Built fresh per call, never stored.
#[derive(Debug, Clone)]
struct Check {
    code: ConditionCode,
    breached: bool,
    message: String,
    sustain: Duration,
}

/// Outcome of a single tick, triggers first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Evaluation {
    pub triggered: Vec<Alert>,
    pub recovered: Vec<ConditionCode>,
}

impl Evaluation {
    pub fn is_empty(&self) -> bool {
        self.triggered.is_empty() && self.recovered.is_empty()
    }
}

/// Tracks metric and service breaches and emits alerts with debounce and cooldown.
///
/// Owned by the health tick; every map is keyed by condition code.
/// A code sits in `active_alerts` from the tick that triggered it until the
/// first tick where its condition no longer reads true.
pub struct HealthMonitor {
    thresholds: Arc<Thresholds>,
    breach_started: BTreeMap<ConditionCode, DateTime<Utc>>,
    active_alerts: BTreeMap<ConditionCode, DateTime<Utc>>,
    cooldown_until: BTreeMap<ConditionCode, DateTime<Utc>>,
}

impl HealthMonitor {
    pub fn new(thresholds: Arc<Thresholds>) -> Self {
        Self {
            thresholds,
            breach_started: BTreeMap::new(),
            active_alerts: BTreeMap::new(),
            cooldown_until: BTreeMap::new(),
        }
    }

    #[cfg(test)]
    pub fn thresholds(&self) -> &Arc<Thresholds> {
        &self.thresholds
    }

    /// Applies new thresholds from the next evaluation on. Timers and open alerts are kept.
    pub fn set_thresholds(&mut self, thresholds: Arc<Thresholds>) {
        if *self.thresholds != *thresholds {
            info!(?thresholds, "Health monitor thresholds updated");
        }
        self.thresholds = thresholds;
    }

    pub fn open_alerts(&self) -> Vec<ConditionCode> {
        self.active_alerts.keys().cloned().collect()
    }

    /// Runs one tick. `metrics.timestamp` must not go backwards between calls.
    pub fn evaluate(&mut self, metrics: &MetricsSnapshot, failed_services: &[String]) -> Evaluation {
        let now = metrics.timestamp;
        let checks = build_checks(&self.thresholds, metrics, failed_services);
        let mut evaluation = Evaluation::default();

        for check in &checks {
            if let Some(alert) = self.process_condition(check, now) {
                evaluation.triggered.push(alert);
            }
        }

        let breaching: BTreeSet<&ConditionCode> = checks
            .iter()
            .filter(|check| check.breached)
            .map(|check| &check.code)
            .collect();

        // A condition that was not observed true this tick loses its breach timer.
        self.breach_started.retain(|code, _| breaching.contains(code));

        let resolved: Vec<ConditionCode> = self
            .active_alerts
            .keys()
            .filter(|code| !breaching.contains(code))
            .cloned()
            .collect();

        for code in resolved {
            if let ConditionCode::Metric(_) = code {
                if !checks.iter().any(|check| check.code == code) {
                    warn!(code = %code, "Condition no longer observable; treating as recovered");
                }
            }
            info!(code = %code, "Alert recovered");
            self.active_alerts.remove(&code);
            evaluation.recovered.push(code);
        }

        evaluation
    }

    fn process_condition(&mut self, check: &Check, now: DateTime<Utc>) -> Option<Alert> {
        if !check.breached {
            self.breach_started.remove(&check.code);
            return None;
        }

        let started = *self.breach_started.entry(check.code.clone()).or_insert_with(|| {
            debug!(code = %check.code, at = %now, "Breach started");
            now
        });

        if now - started < check.sustain {
            return None;
        }

        if let Some(until) = self.cooldown_until.get(&check.code) {
            if now < *until {
                return None;
            }
        }

        if self.active_alerts.contains_key(&check.code) {
            return None;
        }

        warn!(code = %check.code, message = %check.message, "Alert triggered");
        self.active_alerts.insert(check.code.clone(), now);
        self.cooldown_until
            .insert(check.code.clone(), now + self.thresholds.hysteresis());
        Some(Alert {
            code: check.code.clone(),
            message: check.message.clone(),
        })
    }
}

fn metric_check(kind: MetricKind, breached: bool, message: String) -> Check {
    Check {
        code: ConditionCode::Metric(kind),
        breached,
        message,
        sustain: kind.sustain(),
    }
}

fn build_checks(thresholds: &Thresholds, metrics: &MetricsSnapshot, failed_services: &[String]) -> Vec<Check> {
    let mem_mb = metrics.mem_available_mb();
    let mut checks = vec![
        metric_check(
            MetricKind::CpuHigh,
            metrics.cpu_percent >= thresholds.cpu_percent,
            format!("CPU high {:.1}%", metrics.cpu_percent),
        ),
        metric_check(
            MetricKind::RamLow,
            mem_mb <= thresholds.ram_free_mb,
            format!("RAM free {:.0} MB", mem_mb),
        ),
        metric_check(
            MetricKind::DiskRoot,
            metrics.disk_root_percent >= thresholds.disk_percent,
            format!("Disk / at {:.1}%", metrics.disk_root_percent),
        ),
    ];

    if let Some(hdd) = metrics.disk_hdd_percent {
        checks.push(metric_check(
            MetricKind::DiskHdd,
            hdd >= thresholds.disk_percent,
            format!("Disk HDD at {:.1}%", hdd),
        ));
    }

    if let Some(hottest) = metrics.hottest() {
        checks.push(metric_check(
            MetricKind::TempHigh,
            hottest.current >= thresholds.temperature_c,
            format!("CPU temperature {:.0}°C", hottest.current),
        ));
    }

    for service in failed_services {
        let code = ConditionCode::service(service.as_str());
        checks.push(Check {
            sustain: code.sustain(),
            code,
            breached: true,
            message: format!("Service {service} failed"),
        });
    }

    checks
}
