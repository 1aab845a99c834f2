use crate::error::ShellError;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub code: Option<i32>,
}

impl CommandOutput {
    pub fn succeeded(&self) -> bool {
        self.code == Some(0)
    }
}

/// Runs `program` with `args`, killing it once `timeout` elapses.
///
/// A non-zero exit is an error only when `check` is set.
pub async fn run_cmd(
    program: &str,
    args: &[&str],
    timeout: Duration,
    check: bool,
) -> Result<CommandOutput, ShellError> {
    debug!(program, ?args, "Running command");

    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output();

    let output = match tokio::time::timeout(timeout, child).await {
        Ok(Ok(output)) => output,
        Ok(Err(source)) => {
            return Err(ShellError::Spawn {
                program: program.to_string(),
                source,
            })
        }
        Err(_) => {
            return Err(ShellError::Timeout {
                program: program.to_string(),
                secs: timeout.as_secs(),
            })
        }
    };

    let result = CommandOutput {
        stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        code: output.status.code(),
    };

    if check && !result.succeeded() {
        return Err(ShellError::Failed {
            program: program.to_string(),
            code: result.code,
            stderr: result.stderr,
        });
    }
    Ok(result)
}
