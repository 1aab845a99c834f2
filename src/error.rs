use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
    #[error("{0} is required; set it in the config file or environment")]
    Missing(&'static str),
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Error)]
pub enum ShellError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{program} timed out after {secs}s")]
    Timeout { program: String, secs: u64 },
    #[error("{program} exited with code {code:?}: {stderr}")]
    Failed {
        program: String,
        code: Option<i32>,
        stderr: String,
    },
}

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("manifest {0} not found")]
    ManifestNotFound(PathBuf),
    #[error("snapshot label {0} already has a manifest")]
    LabelExists(String),
    #[error("invalid snapshot label {0:?}")]
    InvalidLabel(String),
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed manifest {path}: {source}")]
    Manifest {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("directory walk failed: {0}")]
    Walk(#[from] walkdir::Error),
}

impl BackupError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("transport request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("transport rejected message: {0}")]
    Rejected(String),
}

#[derive(Debug, Error, PartialEq)]
pub enum ThresholdError {
    #[error("unknown metric {0:?}; choose cpu, ram, disk, temp or hysteresis")]
    UnknownMetric(String),
    #[error("invalid value {value:?} for {metric}")]
    InvalidValue { metric: &'static str, value: String },
}

#[derive(Debug, Error)]
pub enum ServiceListError {
    #[error("{0:?} is not a valid unit name")]
    InvalidName(String),
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed service list {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Error)]
pub enum InstanceError {
    #[error("another potion-runner instance holds {0}")]
    Held(PathBuf),
    #[error("I/O error on lock file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
