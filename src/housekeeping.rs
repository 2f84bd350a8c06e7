//! Templated cleanup tasks for the statistics schema and system tables.
//!
//! Every task follows the same shape: count, render the statement from its
//! retention value, execute it, count again, report the difference.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::{load_toml, ConnectionConfig};
use crate::gateway::{GatewayError, QueryExecutor};
use crate::logging::LogConfig;
use crate::notify::NotifyConfig;
use crate::topology::Topology;

/// `[housekeeping]` section of `dbcleaner.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct HousekeepingConfig {
    /// Keep statistics-server alerts for this many days.
    #[serde(default)]
    pub alert_retention_days: Option<u32>,

    /// Keep `(unknown)` object-lock statistics for this many days.
    #[serde(default)]
    pub object_lock_retention_days: Option<u32>,

    /// Keep audit log entries for this many days.
    #[serde(default)]
    pub audit_log_retention_days: Option<u32>,

    /// Drop statistics e-mails pending longer than this many days.
    #[serde(default)]
    pub pending_email_days: Option<u32>,

    /// Keep ini-file content history for this many days.
    #[serde(default)]
    pub ini_history_retention_days: Option<u32>,

    /// Execute the rendered statements. `false` only counts and logs.
    #[serde(default = "default_true")]
    pub execute_sql: bool,

    /// Log every rendered statement.
    #[serde(default)]
    pub output_sql: bool,

    /// Days between runs; zero or negative exits after one run.
    #[serde(default = "default_interval_days")]
    pub interval_days: i64,

    /// Where the log files go. Defaults to `~/.dbkeeper/logs`.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

impl Default for HousekeepingConfig {
    fn default() -> Self {
        Self {
            alert_retention_days: None,
            object_lock_retention_days: None,
            audit_log_retention_days: None,
            pending_email_days: None,
            ini_history_retention_days: None,
            execute_sql: true,
            output_sql: false,
            interval_days: default_interval_days(),
            log_dir: None,
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_interval_days() -> i64 {
    -1
}

/// The whole `dbcleaner.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct CleanerConfig {
    /// Database and shell access.
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Monitored instance.
    pub database: Topology,
    /// Escalation receivers.
    #[serde(default)]
    pub notify: NotifyConfig,
    /// Cleanup tasks.
    #[serde(default)]
    pub housekeeping: HousekeepingConfig,
    /// Log filter and file output.
    #[serde(default)]
    pub logging: LogConfig,
}

impl CleanerConfig {
    /// Load, normalize and validate a cleaner config file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let mut config: Self = load_toml(path)?;
        config.database = config.database.normalized();
        config
            .validate()
            .map_err(|e| anyhow::anyhow!("invalid config at {}: {e}", path.display()))?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), String> {
        self.connection.validate()?;
        self.database.validate()?;
        self.notify.validate()?;
        if planned_tasks(&self.housekeeping).is_empty() {
            return Err("no housekeeping task is enabled".to_owned());
        }
        Ok(())
    }
}

/// One cleanup task and its retention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupTask {
    /// Statistics-server alerts.
    Alerts {
        /// Retention in days.
        days: u32,
    },
    /// Object-lock statistics for `(unknown)` objects.
    UnknownObjectLocks {
        /// Retention in days.
        days: u32,
    },
    /// Audit log.
    AuditLog {
        /// Retention in days.
        days: u32,
    },
    /// Statistics e-mails stuck in processing.
    PendingEmails {
        /// Age in days.
        days: u32,
    },
    /// Ini-file content history.
    IniHistory {
        /// Retention in days.
        days: u32,
    },
}

impl CleanupTask {
    /// Short task name used in logs and reports.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Alerts { .. } => "alerts",
            Self::UnknownObjectLocks { .. } => "object_locks",
            Self::AuditLog { .. } => "audit_log",
            Self::PendingEmails { .. } => "pending_emails",
            Self::IniHistory { .. } => "ini_history",
        }
    }

    /// Statement counting the rows the task may remove.
    pub fn count_sql(&self) -> &'static str {
        match self {
            Self::Alerts { .. } => "SELECT COUNT(*) FROM _SYS_STATISTICS.STATISTICS_ALERTS_BASE",
            Self::UnknownObjectLocks { .. } => {
                "SELECT COUNT(*) FROM _SYS_STATISTICS.HOST_OBJECT_LOCK_STATISTICS_BASE WHERE OBJECT_NAME = '(unknown)'"
            }
            Self::AuditLog { .. } => "SELECT COUNT(*) FROM SYS.AUDIT_LOG",
            Self::PendingEmails { .. } => {
                "SELECT COUNT(*) FROM _SYS_STATISTICS.STATISTICS_EMAIL_PROCESSING"
            }
            Self::IniHistory { .. } => "SELECT COUNT(*) FROM SYS.M_INIFILE_CONTENT_HISTORY",
        }
    }

    /// Render the cleanup statement relative to `now` (local time).
    pub fn render(&self, now: NaiveDateTime) -> String {
        match *self {
            Self::Alerts { days } => format!(
                "DELETE FROM _SYS_STATISTICS.STATISTICS_ALERTS_BASE WHERE ALERT_TIMESTAMP < ADD_DAYS(CURRENT_TIMESTAMP, -{days})"
            ),
            Self::UnknownObjectLocks { days } => format!(
                "DELETE FROM _SYS_STATISTICS.HOST_OBJECT_LOCK_STATISTICS_BASE WHERE OBJECT_NAME = '(unknown)' and SERVER_TIMESTAMP < ADD_DAYS(CURRENT_TIMESTAMP, -{days})"
            ),
            Self::AuditLog { days } => format!(
                "ALTER SYSTEM CLEAR AUDIT LOG UNTIL '{}'",
                days_before(now, days).format("%Y-%m-%d %H:%M:%S")
            ),
            Self::PendingEmails { days } => format!(
                "DELETE FROM _SYS_STATISTICS.STATISTICS_EMAIL_PROCESSING WHERE SECONDS_BETWEEN(SNAPSHOT_ID, CURRENT_TIMESTAMP) > {days} * 86400"
            ),
            Self::IniHistory { days } => format!(
                "ALTER SYSTEM CLEAR INIFILE CONTENT HISTORY UNTIL '{}'",
                days_before(now, days).format("%Y-%m-%d %H:%M:%S")
            ),
        }
    }
}

fn days_before(now: NaiveDateTime, days: u32) -> NaiveDateTime {
    now.checked_sub_signed(chrono::Duration::days(i64::from(days)))
        .unwrap_or(NaiveDateTime::MIN)
}

/// Tasks enabled by `config`, in a fixed order.
pub fn planned_tasks(config: &HousekeepingConfig) -> Vec<CleanupTask> {
    let candidates = [
        config.alert_retention_days.map(|days| CleanupTask::Alerts { days }),
        config
            .object_lock_retention_days
            .map(|days| CleanupTask::UnknownObjectLocks { days }),
        config
            .audit_log_retention_days
            .map(|days| CleanupTask::AuditLog { days }),
        config
            .pending_email_days
            .map(|days| CleanupTask::PendingEmails { days }),
        config
            .ini_history_retention_days
            .map(|days| CleanupTask::IniHistory { days }),
    ];
    candidates.into_iter().flatten().collect()
}

/// Result of one task.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TaskReport {
    /// Task name.
    pub task: String,
    /// Rendered statement.
    pub statement: String,
    /// Rows before.
    pub before: i64,
    /// Rows after.
    pub after: i64,
    /// `before - after`, never negative.
    pub removed: i64,
    /// Whether the statement was actually executed.
    pub executed: bool,
}

/// Runs cleanup tasks against one database.
pub struct Housekeeper {
    executor: Arc<dyn QueryExecutor>,
    execute_sql: bool,
    output_sql: bool,
}

impl Housekeeper {
    /// Create a housekeeper.
    pub fn new(executor: Arc<dyn QueryExecutor>, execute_sql: bool, output_sql: bool) -> Self {
        Self {
            executor,
            execute_sql,
            output_sql,
        }
    }

    /// Count, clean, count again.
    ///
    /// An empty table skips the statement.
    ///
    /// # Errors
    ///
    /// Propagates the first gateway error.
    pub async fn run_task(
        &self,
        task: &CleanupTask,
        now: NaiveDateTime,
    ) -> Result<TaskReport, GatewayError> {
        let statement = task.render(now);
        let before = self.executor.query_count(task.count_sql()).await?;
        if before == 0 {
            return Ok(TaskReport {
                task: task.name().to_owned(),
                statement,
                before,
                after: before,
                removed: 0,
                executed: false,
            });
        }

        if self.output_sql {
            info!(task = task.name(), sql = %statement, "cleanup statement");
        }
        if self.execute_sql {
            self.executor.query(&statement).await?;
        }

        let after = self.executor.query_count(task.count_sql()).await?;
        Ok(TaskReport {
            task: task.name().to_owned(),
            statement,
            before,
            after,
            removed: before.saturating_sub(after).max(0),
            executed: self.execute_sql,
        })
    }

    /// Run every task; a failing task is logged and skipped.
    pub async fn run_all(&self, tasks: &[CleanupTask], now: NaiveDateTime) -> Vec<TaskReport> {
        let mut reports = Vec::with_capacity(tasks.len());
        for task in tasks {
            match self.run_task(task, now).await {
                Ok(report) => {
                    info!(
                        task = %report.task,
                        before = report.before,
                        removed = report.removed,
                        "cleanup task finished"
                    );
                    reports.push(report);
                }
                Err(e) => warn!(task = task.name(), error = %e, "cleanup task failed"),
            }
        }
        reports
    }
}
