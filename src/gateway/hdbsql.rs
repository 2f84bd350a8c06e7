//! Query executor backed by the `hdbsql` command-line client.

use async_trait::async_trait;
use tracing::debug;

use super::{GatewayError, QueryExecutor, Row};

/// Runs statements through `hdbsql` using a key from the secure user store.
///
/// The client is started without a shell, so statements never need quoting.
/// Output is requested without headers and row counts (`-a -x`) and parsed
/// by [`parse_rows`].
#[derive(Debug, Clone)]
pub struct HdbsqlExecutor {
    program: String,
    user_key: String,
    ssl: bool,
}

impl HdbsqlExecutor {
    /// Create an executor for the given client binary and user-store key.
    pub fn new(program: impl Into<String>, user_key: impl Into<String>, ssl: bool) -> Self {
        Self {
            program: program.into(),
            user_key: user_key.into(),
            ssl,
        }
    }

    /// Arguments passed to the client for a statement.
    pub fn args(&self, sql: &str) -> Vec<String> {
        let mut args: Vec<String> = ["-j", "-A", "-a", "-x"]
            .iter()
            .map(|s| (*s).to_owned())
            .collect();
        if self.ssl {
            args.push("-e".to_owned());
            args.push("-ssltrustcert".to_owned());
        }
        args.push("-U".to_owned());
        args.push(self.user_key.clone());
        args.push(sql.to_owned());
        args
    }
}

#[async_trait]
impl QueryExecutor for HdbsqlExecutor {
    async fn query(&self, sql: &str) -> Result<Vec<Row>, GatewayError> {
        debug!(program = %self.program, sql, "executing statement");
        let output = tokio::process::Command::new(&self.program)
            .args(self.args(sql))
            .stdin(std::process::Stdio::null())
            .output()
            .await
            .map_err(|source| GatewayError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(GatewayError::NonZeroExit {
                program: self.program.clone(),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            });
        }

        Ok(parse_rows(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// Parse pipe-separated client output into rows of trimmed cells.
///
/// Lines look like `|a   |b |`; surrounding pipes are optional and blank
/// lines are skipped. A line without any pipe becomes a single-cell row.
pub fn parse_rows(stdout: &str) -> Vec<Row> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            let inner = line.strip_prefix('|').unwrap_or(line);
            let inner = inner.strip_suffix('|').unwrap_or(inner);
            inner.split('|').map(|cell| cell.trim().to_owned()).collect()
        })
        .collect()
}
