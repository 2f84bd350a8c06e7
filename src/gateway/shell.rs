//! Process launcher that runs command lines through a shell.

use async_trait::async_trait;
use tracing::debug;

use super::{GatewayError, ProcessLauncher};

/// Runs `<shell> -c <command line>` and captures stdout.
///
/// Several administration tools report status through their exit code even
/// when they succeed (`sapcontrol` exits with 3 when every process is
/// running), so a non-zero exit is only an error when nothing was written
/// to stdout.
#[derive(Debug, Clone)]
pub struct ShellLauncher {
    shell: String,
}

impl ShellLauncher {
    /// Create a launcher for the given shell binary.
    pub fn new(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }
}

impl Default for ShellLauncher {
    fn default() -> Self {
        Self::new("/bin/sh")
    }
}

#[async_trait]
impl ProcessLauncher for ShellLauncher {
    async fn run(&self, command_line: &str) -> Result<String, GatewayError> {
        debug!(shell = %self.shell, command = command_line, "launching command");
        let output = tokio::process::Command::new(&self.shell)
            .arg("-c")
            .arg(command_line)
            .stdin(std::process::Stdio::null())
            .output()
            .await
            .map_err(|source| GatewayError::Spawn {
                program: self.shell.clone(),
                source,
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout)
            .trim_end_matches('\n')
            .to_owned();

        if !output.status.success() && stdout.trim().is_empty() {
            return Err(GatewayError::NonZeroExit {
                program: command_line.to_owned(),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            });
        }

        Ok(stdout)
    }
}
