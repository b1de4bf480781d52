//! Subprocess provider client - runs an external command per prompt

use crate::provider::ProviderError;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Exit code conventionally used by CLI backends for rate limiting
const RATE_LIMIT_EXIT_CODE: i32 = 75;

/// Client for executing a provider CLI as a subprocess
#[derive(Debug, Clone)]
pub struct SubprocessClient {
    command: String,
    args: Vec<String>,
    timeout_secs: u64,
}

impl SubprocessClient {
    pub fn new(command: String, args: Vec<String>, timeout_secs: u64) -> Self {
        Self {
            command,
            args,
            timeout_secs,
        }
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    /// Execute a prompt through the subprocess and capture stdout
    ///
    /// # Errors
    /// - `Terminal` if the executable cannot be spawned or emits invalid UTF-8
    /// - `RateLimited` if it exits with code 75
    /// - `Transient` for any other non-zero exit
    /// - `Timeout` if it runs longer than the configured (or overriding) timeout
    pub async fn execute(
        &self,
        prompt: &str,
        timeout_override: Option<u64>,
    ) -> Result<String, ProviderError> {
        let timeout_secs = timeout_override.unwrap_or(self.timeout_secs);
        debug!(
            "Spawning {} with prompt length: {}",
            self.command,
            prompt.len()
        );

        let result = timeout(
            Duration::from_secs(timeout_secs),
            Command::new(&self.command)
                .args(&self.args)
                .arg(prompt)
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| ProviderError::Timeout(timeout_secs))?;

        let output = result.map_err(|e| {
            ProviderError::Terminal(format!("Failed to execute {}: {}", self.command, e))
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let exit_code = output.status.code().unwrap_or(-1);
            warn!(
                "{} exited with code {}: {}",
                self.command,
                exit_code,
                stderr.trim()
            );
            let message = format!("{} exited with code {}: {}", self.command, exit_code, stderr.trim());
            return Err(if exit_code == RATE_LIMIT_EXIT_CODE {
                ProviderError::RateLimited(message)
            } else {
                ProviderError::Transient(message)
            });
        }

        let content = String::from_utf8(output.stdout).map_err(|e| {
            ProviderError::Terminal(format!("Failed to decode {} output: {}", self.command, e))
        })?;

        debug!("{} returned {} bytes of output", self.command, content.len());

        Ok(content)
    }
}
