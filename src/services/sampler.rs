use crate::models::metrics::{HealthSnapshot, MetricsSnapshot, Temperature};
use crate::utils::format::human_bytes;
use anyhow::Result;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::time::Duration;
use sysinfo::{Components, Disks, System};
use tokio::fs;
use tracing::debug;

/// Reads host metrics. Missing sensors or mounts degrade to absent fields.
#[cfg_attr(test, mockall::automock)]
pub trait MetricsSampler: Send {
    fn sample(&mut self) -> MetricsSnapshot;
}

pub struct SysinfoSampler {
    system: System,
    hdd_mount: PathBuf,
}

impl SysinfoSampler {
    pub fn new(hdd_mount: PathBuf) -> Self {
        Self {
            system: System::new(),
            hdd_mount,
        }
    }
}

impl MetricsSampler for SysinfoSampler {
    fn sample(&mut self) -> MetricsSnapshot {
        // CPU usage is a delta between two refreshes.
        self.system.refresh_cpu();
        std::thread::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);
        self.system.refresh_cpu();
        self.system.refresh_memory();

        let cpu_percent = f64::from(self.system.global_cpu_info().cpu_usage());
        let load = System::load_average();

        let mem_total = self.system.total_memory();
        let mem_available = self.system.available_memory();
        let swap_total = self.system.total_swap();

        let disks = Disks::new_with_refreshed_list();
        let (disk_root_percent, disk_root_free) =
            disk_usage(&disks, Path::new("/")).unwrap_or((0.0, 0));
        let hdd = disk_usage(&disks, &self.hdd_mount);

        let components = Components::new_with_refreshed_list();
        let temperatures = readable_temperatures(
            components
                .list()
                .iter()
                .map(|component| (component.label(), component.temperature())),
        );

        let snapshot = MetricsSnapshot {
            timestamp: Utc::now(),
            cpu_percent,
            load_avg: [load.one, load.five, load.fifteen],
            mem_total,
            mem_available,
            mem_percent: used_percent(mem_total, mem_available),
            swap_percent: used_percent(swap_total, swap_total - self.system.used_swap().min(swap_total)),
            disk_root_percent,
            disk_root_free,
            disk_hdd_percent: hdd.map(|(percent, _)| percent),
            disk_hdd_free: hdd.map(|(_, free)| free),
            uptime: Duration::from_secs(System::uptime()),
            temperatures,
        };
        debug!(?snapshot, "Metrics collected");
        snapshot
    }
}

fn used_percent(total: u64, available: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    let used = total.saturating_sub(available);
    used as f64 / total as f64 * 100.0
}

/// Usage percent and free bytes of the filesystem mounted exactly at `mount`.
fn disk_usage(disks: &Disks, mount: &Path) -> Option<(f64, u64)> {
    disks
        .list()
        .iter()
        .find(|disk| disk.mount_point() == mount)
        .map(|disk| {
            (
                used_percent(disk.total_space(), disk.available_space()),
                disk.available_space(),
            )
        })
}

/// One-line summary appended to alert messages.
pub fn metrics_summary(metrics: &MetricsSnapshot) -> String {
    let mut parts = vec![
        format!(
            "CPU {:.1}% ({:.2}, {:.2}, {:.2} load)",
            metrics.cpu_percent, metrics.load_avg[0], metrics.load_avg[1], metrics.load_avg[2]
        ),
        format!(
            "RAM {:.1}% free {}",
            metrics.mem_percent,
            human_bytes(metrics.mem_available)
        ),
        format!(
            "Disk / {:.1}% free {}",
            metrics.disk_root_percent,
            human_bytes(metrics.disk_root_free)
        ),
    ];
    if let (Some(percent), Some(free)) = (metrics.disk_hdd_percent, metrics.disk_hdd_free) {
        parts.push(format!("Disk HDD {:.1}% free {}", percent, human_bytes(free)));
    }
    parts.push(format!(
        "Uptime {:.1} h",
        metrics.uptime.as_secs_f64() / 3600.0
    ));
    if let Some(top) = metrics.hottest() {
        parts.push(format!("Temp {} {:.0}°C", top.label, top.current));
    }
    parts.join(" | ")
}

/// Overwrites the liveness document at `path` via a temp file and rename.
pub async fn write_health_snapshot(metrics: &MetricsSnapshot, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }

    let content = serde_json::to_string_pretty(&HealthSnapshot::from(metrics))?;
    let temp_file = path.with_extension("json.tmp");
    fs::write(&temp_file, content).await?;
    fs::rename(&temp_file, path).await?;
    Ok(())
}

/// Drops sensors that report NaN or infinity; zero and sub-zero readings are real.
fn readable_temperatures<'a>(readings: impl Iterator<Item = (&'a str, f32)>) -> Vec<Temperature> {
    readings
        .map(|(label, celsius)| Temperature {
            label: label.to_string(),
            current: f64::from(celsius),
        })
        .filter(|temp| temp.current.is_finite())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn snapshot() -> MetricsSnapshot {
        MetricsSnapshot {
            timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 8, 30, 0).unwrap(),
            cpu_percent: 42.3,
            load_avg: [1.0, 0.5, 0.25],
            mem_total: 8 * 1024 * 1024 * 1024,
            mem_available: 2 * 1024 * 1024 * 1024,
            mem_percent: 75.0,
            swap_percent: 0.0,
            disk_root_percent: 61.0,
            disk_root_free: 10 * 1024 * 1024 * 1024,
            disk_hdd_percent: None,
            disk_hdd_free: None,
            uptime: Duration::from_secs(7200),
            temperatures: vec![
                Temperature {
                    label: "acpitz".to_string(),
                    current: 41.0,
                },
                Temperature {
                    label: "cpu_thermal".to_string(),
                    current: 57.4,
                },
            ],
        }
    }

    #[test]
    fn used_percent_handles_zero_total() {
        assert_eq!(used_percent(0, 0), 0.0);
        assert_eq!(used_percent(200, 50), 75.0);
        assert_eq!(used_percent(100, 150), 0.0);
    }

    #[test]
    fn summary_lists_available_metrics() {
        let summary = metrics_summary(&snapshot());
        assert_eq!(
            summary,
            "CPU 42.3% (1.00, 0.50, 0.25 load) | RAM 75.0% free 2.0 GB | Disk / 61.0% free 10.0 GB | Uptime 2.0 h | Temp cpu_thermal 57°C"
        );

        let mut with_hdd = snapshot();
        with_hdd.disk_hdd_percent = Some(12.5);
        with_hdd.disk_hdd_free = Some(1024);
        assert!(metrics_summary(&with_hdd).contains("Disk HDD 12.5% free 1.0 KB"));
    }

    #[tokio::test]
    async fn health_snapshot_is_flat_and_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("last_health.json");

        write_health_snapshot(&snapshot(), &path).await.unwrap();
        let mut second = snapshot();
        second.cpu_percent = 5.0;
        write_health_snapshot(&second, &path).await.unwrap();

        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        let object = value.as_object().unwrap();
        assert_eq!(object.len(), 4);
        assert_eq!(object["cpu_percent"], 5.0);
        assert_eq!(object["mem_available"], 2u64 * 1024 * 1024 * 1024);
        assert_eq!(object["disk_root_percent"], 61.0);
        assert_eq!(object["timestamp"], "2024-05-01T08:30:00Z");
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn cold_sensors_are_kept_and_broken_ones_dropped() {
        let readings = [
            ("outdoor", -4.5_f32),
            ("idle", 0.0),
            ("broken", f32::NAN),
            ("cpu", 48.0),
            ("runaway", f32::INFINITY),
        ];
        let temps = readable_temperatures(readings.into_iter());
        let labels: Vec<_> = temps.iter().map(|t| t.label.as_str()).collect();
        assert_eq!(labels, vec!["outdoor", "idle", "cpu"]);
        assert_eq!(temps[0].current, -4.5);
    }
}
