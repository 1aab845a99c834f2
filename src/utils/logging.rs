use anyhow::Result;
use std::path::Path;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    filter::filter_fn, fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer,
};

/// Target for the operator action log.
pub const ACTIONS_TARGET: &str = "potion_runner::actions";

/// Keeps the file writers flushing; drop only at process exit.
pub struct LogGuards {
    _runtime: WorkerGuard,
    _actions: WorkerGuard,
}

pub fn init_logging(log_dir: &Path, level: &str) -> Result<LogGuards> {
    std::fs::create_dir_all(log_dir)?;

    let (runtime_writer, runtime_guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(log_dir, "runtime.log"));
    let (actions_writer, actions_guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(log_dir, "actions.log"));

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{level},tower_http=warn,hyper=warn,reqwest=warn")));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stdout)
                .with_ansi(true)
                .with_filter(filter_fn(|meta| meta.target() != ACTIONS_TARGET)),
        )
        .with(
            fmt::layer()
                .with_writer(runtime_writer)
                .with_ansi(false)
                .json()
                .with_filter(filter_fn(|meta| meta.target() != ACTIONS_TARGET)),
        )
        .with(
            fmt::layer()
                .with_writer(actions_writer)
                .with_ansi(false)
                .with_target(false)
                .with_filter(filter_fn(|meta| meta.target() == ACTIONS_TARGET)),
        )
        .try_init()?;

    info!(log_dir = %log_dir.display(), "Logging initialized");
    Ok(LogGuards {
        _runtime: runtime_guard,
        _actions: actions_guard,
    })
}

/// Records an operator-visible action (alert, backup, admin change) in the action log.
pub fn log_action(action: &str, user: Option<&str>, result: &str, detail: &str) {
    info!(
        target: ACTIONS_TARGET,
        user = user.unwrap_or("-"),
        action,
        result,
        detail
    );
}
