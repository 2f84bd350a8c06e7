//! Stopping the sessions behind a violating feature rule.
//!
//! Every step is a guarded call and every failure is logged; nothing here
//! aborts the tracking cycle.

use std::sync::Arc;
use std::time::Duration;

use dbkeeper::gateway::{sql_literal, QueryExecutor};
use serde::Deserialize;
use tracing::{info, warn};

use crate::deadline::{CallOutcome, DeadlineGuard, ProbeCategory};
use crate::rules::FeatureRule;

/// What to do with sessions matching a violating rule.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum KillAction {
    /// Leave them alone.
    #[default]
    None,
    /// `ALTER SYSTEM CANCEL SESSION`
    Cancel,
    /// `ALTER SYSTEM DISCONNECT SESSION`
    Disconnect,
}

impl KillAction {
    /// SQL keyword, `None` for [`KillAction::None`].
    pub fn keyword(self) -> Option<&'static str> {
        match self {
            Self::None => None,
            Self::Cancel => Some("CANCEL"),
            Self::Disconnect => Some("DISCONNECT"),
        }
    }
}

/// Outcome of one kill action.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KillReport {
    /// Connections matching the rule.
    pub matched: usize,
    /// Connections gone after the statement.
    pub stopped: usize,
    /// One entry per problem encountered.
    pub failures: Vec<String>,
}

/// Cancel or disconnect every connection whose rows match `rule`.
pub async fn stop_sessions(
    rule: &FeatureRule,
    guard: &DeadlineGuard,
    executor: &Arc<dyn QueryExecutor>,
    timeout: Duration,
) -> KillReport {
    let mut report = KillReport::default();
    let Some(keyword) = rule.kill.keyword() else {
        return report;
    };

    let has_connection_column = guard
        .call(ProbeCategory::Session, timeout, {
            let executor = Arc::clone(executor);
            let sql = format!(
                "select count(*) from sys.m_monitor_columns where view_column_name = 'CONNECTION_ID' and view_name = {}",
                sql_literal(&rule.view)
            );
            async move { executor.query_count(&sql).await }
        })
        .await;
    match has_connection_column {
        CallOutcome::Completed(n) if n > 0 => {}
        CallOutcome::Completed(_) => {
            warn!(
                rule = rule.id,
                view = %rule.view,
                "view has no CONNECTION_ID column, sessions cannot be stopped"
            );
            report
                .failures
                .push(format!("{} has no CONNECTION_ID column", rule.view));
            return report;
        }
        other => {
            record_failure(&mut report, rule.id, "connection column check", &other);
            return report;
        }
    }

    let ids = match guard
        .query(
            ProbeCategory::Session,
            timeout,
            executor,
            format!(
                "select distinct CONNECTION_ID from SYS.{} where {}",
                rule.view,
                rule.where_clause()
            ),
        )
        .await
    {
        CallOutcome::Completed(rows) => rows
            .into_iter()
            .filter_map(|row| row.into_iter().next())
            .filter(|id| !id.is_empty())
            .collect::<Vec<_>>(),
        other => {
            record_failure(&mut report, rule.id, "connection lookup", &other);
            return report;
        }
    };
    report.matched = ids.len();

    for id in ids {
        match connection_exists(guard, executor, timeout, &id).await {
            CallOutcome::Completed(false) => {
                info!(rule = rule.id, connection = %id, "connection already gone");
                continue;
            }
            CallOutcome::Completed(true) => {}
            other => {
                record_failure(&mut report, rule.id, "connection existence check", &other);
                // The slot is taken by a stuck probe; the rest would hang too.
                if other.is_hanging() {
                    break;
                }
                continue;
            }
        }

        info!(
            rule = rule.id,
            connection = %id,
            action = keyword,
            check = %rule.description(),
            "stopping session"
        );
        let statement = format!("ALTER SYSTEM {keyword} SESSION {}", sql_literal(&id));
        let outcome = guard
            .query(ProbeCategory::Session, timeout, executor, statement)
            .await;
        if !matches!(outcome, CallOutcome::Completed(_)) {
            record_failure(&mut report, rule.id, "stop statement", &outcome);
            if outcome.is_hanging() {
                break;
            }
            continue;
        }

        match connection_exists(guard, executor, timeout, &id).await {
            CallOutcome::Completed(false) => {
                info!(rule = rule.id, connection = %id, "session stopped");
                report.stopped = report.stopped.saturating_add(1);
            }
            CallOutcome::Completed(true) => warn!(
                rule = rule.id,
                connection = %id,
                "statement executed but the connection is still there, it may take a while"
            ),
            other => record_failure(&mut report, rule.id, "post-stop check", &other),
        }
    }

    report
}

async fn connection_exists(
    guard: &DeadlineGuard,
    executor: &Arc<dyn QueryExecutor>,
    timeout: Duration,
    id: &str,
) -> CallOutcome<bool> {
    let executor = Arc::clone(executor);
    let sql = format!(
        "select count(*) from sys.m_connections where CONNECTION_ID = {}",
        sql_literal(id)
    );
    guard
        .call(ProbeCategory::Session, timeout, async move {
            executor.query_count(&sql).await.map(|n| n > 0)
        })
        .await
}

fn record_failure<T>(report: &mut KillReport, rule: usize, step: &str, outcome: &CallOutcome<T>) {
    let reason = match outcome {
        CallOutcome::Hanging => "no response".to_owned(),
        CallOutcome::Failed(e) => e.to_string(),
        CallOutcome::Completed(_) => return,
    };
    warn!(rule, step, reason = %reason, "kill action step failed");
    report.failures.push(format!("{step}: {reason}"));
}
