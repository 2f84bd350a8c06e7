//! Count / clean / count behaviour against a scripted executor.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::NaiveDate;
use dbkeeper::gateway::{GatewayError, QueryExecutor, Row};
use dbkeeper::housekeeping::{CleanupTask, Housekeeper};

/// Answers counts from a queue and records every statement.
struct ScriptedDb {
    counts: Mutex<VecDeque<i64>>,
    fail_statements: bool,
    executed: Mutex<Vec<String>>,
}

impl ScriptedDb {
    fn new(counts: &[i64], fail_statements: bool) -> Arc<Self> {
        Arc::new(Self {
            counts: Mutex::new(counts.iter().copied().collect()),
            fail_statements,
            executed: Mutex::new(Vec::new()),
        })
    }

    fn statements(&self) -> Vec<String> {
        self.executed.lock().expect("lock").clone()
    }
}

#[async_trait]
impl QueryExecutor for ScriptedDb {
    async fn query(&self, sql: &str) -> Result<Vec<Row>, GatewayError> {
        if sql.starts_with("SELECT COUNT(*)") {
            let next = self.counts.lock().expect("lock").pop_front();
            return next
                .map(|n| vec![vec![n.to_string()]])
                .ok_or_else(|| GatewayError::Output("no more counts".to_owned()));
        }
        self.executed.lock().expect("lock").push(sql.to_owned());
        if self.fail_statements {
            return Err(GatewayError::Output("insufficient privilege".to_owned()));
        }
        Ok(Vec::new())
    }
}

fn now() -> chrono::NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 1, 10)
        .and_then(|d| d.and_hms_opt(8, 0, 0))
        .expect("valid timestamp")
}

#[tokio::test]
async fn reports_removed_rows() {
    let db = ScriptedDb::new(&[120, 20], false);
    let housekeeper = Housekeeper::new(db.clone(), true, false);

    let report = housekeeper
        .run_task(&CleanupTask::Alerts { days: 30 }, now())
        .await
        .expect("task");

    assert_eq!(report.before, 120);
    assert_eq!(report.after, 20);
    assert_eq!(report.removed, 100);
    assert!(report.executed);
    assert_eq!(db.statements().len(), 1);
}

#[tokio::test]
async fn empty_table_skips_statement() {
    let db = ScriptedDb::new(&[0], false);
    let housekeeper = Housekeeper::new(db.clone(), true, false);

    let report = housekeeper
        .run_task(&CleanupTask::PendingEmails { days: 5 }, now())
        .await
        .expect("task");

    assert_eq!(report.removed, 0);
    assert!(!report.executed);
    assert!(db.statements().is_empty());
}

#[tokio::test]
async fn dry_run_counts_but_never_executes() {
    let db = ScriptedDb::new(&[9, 9], false);
    let housekeeper = Housekeeper::new(db.clone(), false, true);

    let report = housekeeper
        .run_task(&CleanupTask::AuditLog { days: 1 }, now())
        .await
        .expect("task");

    assert_eq!(report.removed, 0);
    assert!(!report.executed);
    assert!(db.statements().is_empty());
}

#[tokio::test]
async fn failing_task_does_not_stop_the_rest() {
    let db = ScriptedDb::new(&[5, 7, 2], true);
    let housekeeper = Housekeeper::new(db.clone(), true, false);
    let tasks = [
        CleanupTask::Alerts { days: 1 },
        CleanupTask::IniHistory { days: 1 },
    ];

    let reports = housekeeper.run_all(&tasks, now()).await;

    // Both statements were attempted; neither produced a report.
    assert!(reports.is_empty());
    assert_eq!(db.statements().len(), 2);
}
