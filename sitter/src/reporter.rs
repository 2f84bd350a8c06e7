//! Check records and escalation.
//!
//! Every check the tracker runs ends in a [`CheckRecord`] that is logged.
//! Records that matter to an operator are escalated through the injected
//! [`Notifier`]; delivery failures are logged and swallowed.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dbkeeper::gateway::Row;
use dbkeeper::notify::Notifier;
use dbkeeper::topology::Topology;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

/// Result of one check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckRecord {
    /// Check name, e.g. `Ping Check` or `Feature Check 2`.
    pub action: String,
    /// Wall time spent.
    pub duration: Duration,
    /// Whether the check itself ran (`None` when not applicable).
    pub successful: Option<bool>,
    /// Whether the database passed the check (`None` when not applicable).
    pub passed: Option<bool>,
    /// Free text.
    pub comment: String,
}

impl CheckRecord {
    /// Record for a check that ran; `passed` is the verdict.
    pub fn passed(
        action: impl Into<String>,
        duration: Duration,
        passed: bool,
        comment: impl Into<String>,
    ) -> Self {
        Self {
            action: action.into(),
            duration,
            successful: Some(true),
            passed: Some(passed),
            comment: comment.into(),
        }
    }

    /// Record for a check that could not complete.
    pub fn unsuccessful(
        action: impl Into<String>,
        duration: Duration,
        comment: impl Into<String>,
    ) -> Self {
        Self {
            action: action.into(),
            duration,
            successful: Some(false),
            passed: None,
            comment: comment.into(),
        }
    }

    /// Record for an action without a verdict, e.g. a recording.
    pub fn note(
        action: impl Into<String>,
        duration: Duration,
        comment: impl Into<String>,
    ) -> Self {
        Self {
            action: action.into(),
            duration,
            successful: None,
            passed: None,
            comment: comment.into(),
        }
    }

    /// Whether anything about the record went wrong.
    pub fn is_problem(&self) -> bool {
        self.successful == Some(false) || self.passed == Some(false)
    }

    /// `action, duration, successful, passed, comment` on one line.
    pub fn line(&self) -> String {
        format!(
            "{}, {:.3}s, {}, {}, {}",
            self.action,
            self.duration.as_secs_f64(),
            flag(self.successful),
            flag(self.passed),
            self.comment
        )
    }
}

fn flag(value: Option<bool>) -> &'static str {
    match value {
        Some(true) => "True",
        Some(false) => "False",
        None => "-",
    }
}

/// Logs check records and escalates the ones that need a human.
pub struct Reporter {
    notifier: Arc<dyn Notifier>,
    subject: String,
    host: String,
    log_dir: PathBuf,
}

impl Reporter {
    /// Create a reporter for the monitored instance.
    pub fn new(
        notifier: Arc<dyn Notifier>,
        topology: &Topology,
        log_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            notifier,
            subject: format!("Message from sitter about {}", topology.sid),
            host: topology.local_host.clone(),
            log_dir: log_dir.into(),
        }
    }

    /// Log a record; notify as well when `escalate` is set.
    pub async fn record(&self, record: &CheckRecord, escalate: bool) {
        let duration_ms = u64::try_from(record.duration.as_millis()).unwrap_or(u64::MAX);
        if record.is_problem() {
            warn!(
                action = %record.action,
                duration_ms,
                successful = ?record.successful,
                passed = ?record.passed,
                comment = %record.comment,
                "check"
            );
        } else {
            info!(
                action = %record.action,
                duration_ms,
                successful = ?record.successful,
                passed = ?record.passed,
                comment = %record.comment,
                "check"
            );
        }
        if escalate {
            self.escalate(&record.line()).await;
        }
    }

    /// Send `details` to the operators.
    pub async fn escalate(&self, details: &str) {
        let body = format!(
            "Hi Team,\nAn odd event was reported by the sitter on {}. Here below are the details:\n{details}\n",
            self.host
        );
        if let Err(e) = self.notifier.notify(&self.subject, &body).await {
            warn!(error = %e, "failed to deliver escalation");
        }
    }

    /// Append the rows matching an evaluated rule to today's
    /// `critical_features_<date>.txt`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or written.
    pub async fn append_feature_rows(
        &self,
        rule_id: usize,
        rows: &[Row],
    ) -> anyhow::Result<PathBuf> {
        let date = chrono::Local::now().format("%Y-%m-%d");
        let path = self.log_dir.join(format!("critical_features_{date}.txt"));
        let mut text = format!(
            "--- feature check {rule_id} at {} ---\n",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
        );
        for row in rows {
            text.push_str(&row.join(" | "));
            text.push('\n');
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| anyhow::anyhow!("failed to open {}: {e}", path.display()))?;
        file.write_all(text.as_bytes())
            .await
            .map_err(|e| anyhow::anyhow!("failed to write {}: {e}", path.display()))?;
        Ok(path)
    }
}

/// Render a left-aligned table, each column two wider than its widest cell.
pub fn format_table(headers: &[&str], rows: &[Vec<String>]) -> String {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.chars().count()).collect();
    for row in rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.chars().count());
        }
    }

    let mut out = table_line(headers.iter().copied(), &widths);
    out.push('\n');
    for row in rows {
        out.push_str(&table_line(row.iter().map(String::as_str), &widths));
        out.push('\n');
    }
    out
}

fn table_line<'a>(cells: impl Iterator<Item = &'a str>, widths: &[usize]) -> String {
    let mut line = String::new();
    for (cell, width) in cells.zip(widths) {
        line.push_str(&format!("{cell:<pad$}", pad = width.saturating_add(2)));
    }
    line.trim_end().to_owned()
}
