use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Temperature {
    pub label: String,
    pub current: f64,
}

/// One reading of host metrics, taken at `timestamp`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub timestamp: DateTime<Utc>,
    pub cpu_percent: f64,
    pub load_avg: [f64; 3],
    pub mem_total: u64,
    pub mem_available: u64,
    pub mem_percent: f64,
    pub swap_percent: f64,
    pub disk_root_percent: f64,
    pub disk_root_free: u64,
    /// Absent when the secondary disk is not mounted.
    pub disk_hdd_percent: Option<f64>,
    pub disk_hdd_free: Option<u64>,
    pub uptime: Duration,
    pub temperatures: Vec<Temperature>,
}

impl MetricsSnapshot {
    pub fn mem_available_mb(&self) -> f64 {
        self.mem_available as f64 / (1024.0 * 1024.0)
    }

    pub fn hottest(&self) -> Option<&Temperature> {
        self.temperatures
            .iter()
            .max_by(|a, b| a.current.total_cmp(&b.current))
    }
}

/// Flat document written for external liveness probes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub timestamp: DateTime<Utc>,
    pub cpu_percent: f64,
    pub mem_available: u64,
    pub disk_root_percent: f64,
}

impl From<&MetricsSnapshot> for HealthSnapshot {
    fn from(metrics: &MetricsSnapshot) -> Self {
        Self {
            timestamp: metrics.timestamp,
            cpu_percent: metrics.cpu_percent,
            mem_available: metrics.mem_available,
            disk_root_percent: metrics.disk_root_percent,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub name: String,
    pub active_state: String,
    pub sub_state: String,
    pub description: String,
    pub since: String,
}

impl ServiceStatus {
    pub fn unknown(name: &str, since: String) -> Self {
        Self {
            name: name.to_string(),
            active_state: "unknown".to_string(),
            sub_state: "unknown".to_string(),
            description: "status unavailable".to_string(),
            since,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.active_state == "active" && matches!(self.sub_state.as_str(), "running" | "listening")
    }
}

/// Fixed metric conditions watched on every tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    CpuHigh,
    RamLow,
    DiskRoot,
    DiskHdd,
    TempHigh,
}

impl MetricKind {
    pub const ALL: [MetricKind; 5] = [
        MetricKind::CpuHigh,
        MetricKind::RamLow,
        MetricKind::DiskRoot,
        MetricKind::DiskHdd,
        MetricKind::TempHigh,
    ];

    pub fn code(self) -> &'static str {
        match self {
            MetricKind::CpuHigh => "cpu_high",
            MetricKind::RamLow => "ram_low",
            MetricKind::DiskRoot => "disk_root",
            MetricKind::DiskHdd => "disk_hdd",
            MetricKind::TempHigh => "temp_high",
        }
    }

    /// Continuous breach time required before the condition alerts.
    pub fn sustain(self) -> chrono::Duration {
        match self {
            MetricKind::CpuHigh => chrono::Duration::minutes(5),
            MetricKind::RamLow => chrono::Duration::minutes(2),
            MetricKind::DiskRoot | MetricKind::DiskHdd => chrono::Duration::minutes(1),
            MetricKind::TempHigh => chrono::Duration::minutes(3),
        }
    }
}

/// Key for all per-condition timing state.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConditionCode {
    Metric(MetricKind),
    Service(String),
}

impl ConditionCode {
    pub fn service(name: impl Into<String>) -> Self {
        ConditionCode::Service(name.into())
    }

    pub fn sustain(&self) -> chrono::Duration {
        match self {
            ConditionCode::Metric(kind) => kind.sustain(),
            ConditionCode::Service(_) => chrono::Duration::zero(),
        }
    }
}

impl fmt::Display for ConditionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConditionCode::Metric(kind) => f.write_str(kind.code()),
            ConditionCode::Service(name) => write!(f, "svc_{name}"),
        }
    }
}

impl FromStr for ConditionCode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(name) = s.strip_prefix("svc_") {
            if name.is_empty() {
                return Err("service code needs a service name".to_string());
            }
            return Ok(ConditionCode::service(name));
        }
        MetricKind::ALL
            .into_iter()
            .find(|kind| kind.code() == s)
            .map(ConditionCode::Metric)
            .ok_or_else(|| format!("unknown condition code {s:?}"))
    }
}

impl Serialize for ConditionCode {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ConditionCode {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub code: ConditionCode,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn condition_codes_keep_wire_names() {
        assert_eq!(ConditionCode::Metric(MetricKind::CpuHigh).to_string(), "cpu_high");
        assert_eq!(ConditionCode::service("nginx.service").to_string(), "svc_nginx.service");

        for kind in MetricKind::ALL {
            let parsed: ConditionCode = kind.code().parse().unwrap();
            assert_eq!(parsed, ConditionCode::Metric(kind));
        }
        assert_eq!(
            "svc_docker".parse::<ConditionCode>().unwrap(),
            ConditionCode::service("docker")
        );
        assert!("svc_".parse::<ConditionCode>().is_err());
        assert!("fan_low".parse::<ConditionCode>().is_err());
    }

    #[test]
    fn condition_code_serializes_as_string() {
        let json = serde_json::to_string(&ConditionCode::service("redis")).unwrap();
        assert_eq!(json, "\"svc_redis\"");
    }

    #[test]
    fn service_health_requires_active_and_running() {
        let mut status = ServiceStatus {
            name: "nginx".to_string(),
            active_state: "active".to_string(),
            sub_state: "running".to_string(),
            description: String::new(),
            since: String::new(),
        };
        assert!(status.is_healthy());

        status.sub_state = "listening".to_string();
        assert!(status.is_healthy());

        status.sub_state = "exited".to_string();
        assert!(!status.is_healthy());

        assert!(!ServiceStatus::unknown("nginx", String::new()).is_healthy());
    }

    #[test]
    fn sustain_windows_per_condition() {
        assert_eq!(MetricKind::CpuHigh.sustain(), chrono::Duration::minutes(5));
        assert_eq!(MetricKind::TempHigh.sustain(), chrono::Duration::minutes(3));
        assert_eq!(ConditionCode::service("x").sustain(), chrono::Duration::zero());
    }
}
