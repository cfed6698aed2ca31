//! External script execution
//!
//! Scripts get their parameters through environment variables and report
//! success with exit code 0. Output is captured in full; a script that
//! outlives the timeout is killed.

use serde::Serialize;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use warden_core::{WardenError, WardenResult};

/// Default script timeout
pub const DEFAULT_SCRIPT_TIMEOUT: Duration = Duration::from_secs(300);

/// Captured result of one script run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScriptOutput {
    /// Script path
    pub script: String,
    /// Exit code; absent when killed
    pub exit_code: Option<i32>,
    /// Captured stdout
    pub stdout: String,
    /// Captured stderr
    pub stderr: String,
    /// Wall time
    pub duration_ms: u64,
    /// Killed after the timeout
    pub timed_out: bool,
}

impl ScriptOutput {
    /// Exit code 0
    #[inline]
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Error describing a failed run
    #[must_use]
    pub fn to_error(&self) -> Option<WardenError> {
        (!self.success()).then(|| WardenError::ExternalScriptFailed {
            script: self.script.clone(),
            exit_code: self.exit_code,
            stderr: if self.timed_out {
                format!("timed out after {}ms; {}", self.duration_ms, self.stderr)
            } else {
                self.stderr.clone()
            },
        })
    }
}

/// Runs scripts under a timeout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScriptRunner {
    timeout: Duration,
}

impl Default for ScriptRunner {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_SCRIPT_TIMEOUT,
        }
    }
}

impl ScriptRunner {
    /// Runner with a custom timeout
    #[inline]
    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Run `script` with extra environment variables.
    ///
    /// `.sh` files run through `sh`; anything else is executed directly.
    /// Errors only when the process cannot be started.
    pub async fn run(&self, script: &Path, env: &[(&str, String)]) -> WardenResult<ScriptOutput> {
        let mut command = if script.extension().is_some_and(|e| e == "sh") {
            let mut c = Command::new("sh");
            c.arg(script);
            c
        } else {
            Command::new(script)
        };
        command
            .envs(env.iter().map(|(k, v)| (*k, v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let name = script.display().to_string();
        let started = Instant::now();
        let child = command.spawn().map_err(|e| WardenError::ExternalScriptFailed {
            script: name.clone(),
            exit_code: None,
            stderr: format!("cannot start: {e}"),
        })?;

        match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => {
                let result = ScriptOutput {
                    script: name,
                    exit_code: output.status.code(),
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                    duration_ms: started.elapsed().as_millis() as u64,
                    timed_out: false,
                };
                tracing::debug!(script = %result.script, exit_code = ?result.exit_code, "script finished");
                Ok(result)
            }
            Ok(Err(e)) => Err(WardenError::ExternalScriptFailed {
                script: name,
                exit_code: None,
                stderr: format!("wait failed: {e}"),
            }),
            Err(_) => {
                tracing::warn!(script = %name, timeout_ms = self.timeout.as_millis() as u64, "script timed out and was killed");
                Ok(ScriptOutput {
                    script: name,
                    exit_code: None,
                    stdout: String::new(),
                    stderr: String::new(),
                    duration_ms: started.elapsed().as_millis() as u64,
                    timed_out: true,
                })
            }
        }
    }
}
