//! Probe gateway: the only way either tool reaches the database or the host.
//!
//! Two seams, both async and object-safe so the watchdog can inject fakes:
//! - [`QueryExecutor`] runs a statement and returns rows of text.
//! - [`ProcessLauncher`] runs a command line and returns its stdout.

use async_trait::async_trait;

pub mod hdbsql;
pub mod shell;

/// One result row, each cell already trimmed.
pub type Row = Vec<String>;

/// Errors produced by gateway operations.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// The external program could not be started at all.
    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        /// Program that failed to start.
        program: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The program ran but reported failure.
    #[error("`{program}` exited with code {code:?}: {stderr}")]
    NonZeroExit {
        /// Program that failed.
        program: String,
        /// Exit code, `None` when killed by a signal.
        code: Option<i32>,
        /// Captured stderr (trimmed).
        stderr: String,
    },
    /// The output did not have the expected shape.
    #[error("unexpected output: {0}")]
    Output(String),
    /// The task running the call disappeared without producing a result.
    #[error("probe task ended without a result")]
    Lost,
}

/// Executes statements against the monitored database.
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    /// Run a statement and return its result rows (empty for DML/DDL).
    async fn query(&self, sql: &str) -> Result<Vec<Row>, GatewayError>;

    /// Run a statement whose first cell is an integer, e.g. `select count(*)`.
    async fn query_count(&self, sql: &str) -> Result<i64, GatewayError> {
        let rows = self.query(sql).await?;
        first_integer(&rows)
    }
}

/// Launches OS-level commands on the local host.
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    /// Run a command line through the configured shell and return stdout.
    async fn run(&self, command_line: &str) -> Result<String, GatewayError>;
}

/// Parse the first cell of the first row as an integer.
///
/// # Errors
///
/// Returns [`GatewayError::Output`] when there are no rows or the cell is not
/// an integer.
pub fn first_integer(rows: &[Row]) -> Result<i64, GatewayError> {
    let cell = rows
        .first()
        .and_then(|row| row.first())
        .ok_or_else(|| GatewayError::Output("expected one row, got none".to_owned()))?;
    cell.parse::<i64>()
        .map_err(|_| GatewayError::Output(format!("expected an integer, got '{cell}'")))
}

/// Quote a value as an SQL string literal, doubling embedded quotes.
pub fn sql_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}
