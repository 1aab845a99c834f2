use crate::models::metrics::ServiceStatus;
use crate::utils::shell::run_cmd;
use async_trait::async_trait;
use chrono::Local;
use std::collections::HashMap;
use std::time::Duration;
use tracing::warn;

const SHOW_PROPERTIES: &str = "--property=ActiveState,SubState,Description,ActiveEnterTimestamp";

/// Queries the service manager. Returns one status per name, in order,
/// with an `unknown` state for anything that could not be read.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ServiceProber: Send + Sync {
    async fn probe(&self, whitelist: &[String]) -> Vec<ServiceStatus>;

    /// Confirms the unit is known to the service manager before it is whitelisted.
    async fn check_unit(&self, service: &str) -> Result<(), String>;
}

pub struct SystemctlProber {
    timeout: Duration,
}

impl SystemctlProber {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn show(&self, service: &str) -> ServiceStatus {
        let result = run_cmd(
            "systemctl",
            &["show", service, SHOW_PROPERTIES, "--no-pager"],
            self.timeout,
            true,
        )
        .await;

        match result {
            Ok(output) => status_from_show(service, &parse_show_output(&output.stdout)),
            Err(e) => {
                warn!(service, error = %e, "systemctl show failed");
                ServiceStatus::unknown(service, Local::now().format("%Y-%m-%d %H:%M:%S").to_string())
            }
        }
    }
}

#[async_trait]
impl ServiceProber for SystemctlProber {
    async fn probe(&self, whitelist: &[String]) -> Vec<ServiceStatus> {
        let mut statuses = Vec::with_capacity(whitelist.len());
        for service in whitelist {
            statuses.push(self.show(service).await);
        }
        statuses
    }

    async fn check_unit(&self, service: &str) -> Result<(), String> {
        let output = run_cmd("systemctl", &["status", service, "--no-pager"], self.timeout, false)
            .await
            .map_err(|e| e.to_string())?;
        // 0 and 3 are running and stopped units; 4 is "no such unit".
        match output.code {
            Some(0) | Some(3) => Ok(()),
            _ if output.stderr.is_empty() => Err(format!("{service} not found")),
            _ => Err(output.stderr),
        }
    }
}

pub fn failed_services(statuses: &[ServiceStatus]) -> Vec<String> {
    statuses
        .iter()
        .filter(|status| !status.is_healthy())
        .map(|status| status.name.clone())
        .collect()
}

fn parse_show_output(stdout: &str) -> HashMap<String, String> {
    stdout
        .lines()
        .filter_map(|line| line.split_once('='))
        .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
        .collect()
}

fn status_from_show(service: &str, data: &HashMap<String, String>) -> ServiceStatus {
    let field = |key: &str, default: &str| {
        data.get(key)
            .cloned()
            .unwrap_or_else(|| default.to_string())
    };
    ServiceStatus {
        name: service.to_string(),
        active_state: field("ActiveState", "unknown"),
        sub_state: field("SubState", "unknown"),
        description: field("Description", ""),
        since: field("ActiveEnterTimestamp", ""),
    }
}
