//! Plan-change analysis over the plan-cache history.
//!
//! Statements executed under more than one engine (or plan) are grouped by
//! statement hash, and each variant's average execution time is compared
//! with the fastest sibling. A group whose slowest variant drifts past the
//! threshold is a regression.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use dbkeeper::gateway::{sql_literal, GatewayError, QueryExecutor, Row};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::deadline::{CallOutcome, DeadlineGuard, ProbeCategory};
use crate::reporter::format_table;

const PLAN_CACHE_HISTORY: &str = "_SYS_STATISTICS.HOST_SQL_PLAN_CACHE";

/// Which identity change splits a statement into variants.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    /// Execution engine changes.
    #[default]
    Engine,
    /// Plan id changes.
    PlanId,
}

impl ChangeKind {
    /// Column holding the identity.
    pub fn column(self) -> &'static str {
        match self {
            Self::Engine => "EXECUTION_ENGINE",
            Self::PlanId => "PLAN_ID",
        }
    }

    /// Table header for the identity column.
    pub fn title(self) -> &'static str {
        match self {
            Self::Engine => "Engines",
            Self::PlanId => "Plan ID",
        }
    }

    /// Phrase used in check comments.
    pub fn description(self) -> &'static str {
        match self {
            Self::Engine => "engine changes",
            Self::PlanId => "plan id changes",
        }
    }
}

/// Aggregated statistics of one statement under one engine or plan.
#[derive(Debug, Clone, PartialEq)]
pub struct StatementVariant {
    /// Statement fingerprint.
    pub statement_hash: String,
    /// Engine name or plan id.
    pub plan_identity: String,
    /// Average execution time in milliseconds.
    pub avg_exec_ms: f64,
    /// Total executions.
    pub exec_count: u64,
    /// Total execution time in whole minutes.
    pub total_exec_minutes: u64,
    /// Latest snapshot containing this variant.
    pub max_snapshot_time: String,
}

/// Parse `MAX_SNP_TIME, HASH, AVG_EXEC_MS, EXEC_COUNT, <identity>, TOT_EXEC_MINUTES`.
///
/// # Errors
///
/// Returns [`GatewayError::Output`] for short rows and non-numeric cells.
pub fn parse_variant(row: &Row) -> Result<StatementVariant, GatewayError> {
    let [snapshot, hash, avg, count, identity, minutes, ..] = row.as_slice() else {
        return Err(GatewayError::Output(format!(
            "expected 6 plan-cache columns, got {}",
            row.len()
        )));
    };
    let avg_exec_ms = avg.parse::<f64>().map_err(|_| {
        GatewayError::Output(format!("average execution time '{avg}' is not a number"))
    })?;
    Ok(StatementVariant {
        statement_hash: hash.clone(),
        plan_identity: identity.clone(),
        avg_exec_ms,
        exec_count: parse_whole(count)?,
        total_exec_minutes: parse_whole(minutes)?,
        max_snapshot_time: snapshot.clone(),
    })
}

/// Parse `12` or `12.00` as 12.
fn parse_whole(cell: &str) -> Result<u64, GatewayError> {
    let whole = cell.split_once('.').map_or(cell, |(whole, _)| whole);
    whole
        .parse::<u64>()
        .map_err(|_| GatewayError::Output(format!("'{cell}' is not a whole number")))
}

/// Relative slowdown of `avg` compared with `min`, in percent, one decimal.
pub fn drift_pct(avg: f64, min: f64) -> f64 {
    if avg <= 0.0 {
        return 0.0;
    }
    (((avg - min) / avg) * 1000.0).round() / 10.0
}

/// Variants of one statement with their drift percentages.
#[derive(Debug, Clone, PartialEq)]
pub struct StatementGroup {
    statement_hash: String,
    variants: Vec<StatementVariant>,
    drift: Vec<f64>,
}

impl StatementGroup {
    /// Start a group from its first variant.
    pub fn new(first: StatementVariant) -> Self {
        Self {
            statement_hash: first.statement_hash.clone(),
            variants: vec![first],
            drift: vec![0.0],
        }
    }

    /// Add a sibling and recompute every drift.
    pub fn add(&mut self, variant: StatementVariant) {
        self.variants.push(variant);
        self.variants.sort_by(|a, b| a.plan_identity.cmp(&b.plan_identity));
        let min = self
            .variants
            .iter()
            .map(|v| v.avg_exec_ms)
            .fold(f64::INFINITY, f64::min);
        self.drift = self
            .variants
            .iter()
            .map(|v| drift_pct(v.avg_exec_ms, min))
            .collect();
    }

    /// Statement fingerprint.
    pub fn statement_hash(&self) -> &str {
        &self.statement_hash
    }

    /// Variants ordered by identity.
    pub fn variants(&self) -> &[StatementVariant] {
        &self.variants
    }

    /// Drift per variant, aligned with [`StatementGroup::variants`].
    pub fn drift(&self) -> &[f64] {
        &self.drift
    }

    /// Largest drift in the group.
    pub fn max_drift_pct(&self) -> f64 {
        self.drift.iter().copied().fold(0.0, f64::max)
    }

    fn table_rows(&self) -> Vec<Vec<String>> {
        self.variants
            .iter()
            .zip(&self.drift)
            .map(|(v, drift)| {
                vec![
                    self.statement_hash.clone(),
                    v.plan_identity.clone(),
                    format!("{:.2}", v.avg_exec_ms),
                    format!("{drift:.1}"),
                    v.exec_count.to_string(),
                    v.total_exec_minutes.to_string(),
                    v.max_snapshot_time.clone(),
                ]
            })
            .collect()
    }
}

/// Thresholds applied to variants and groups.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlanFilter {
    /// A group is flagged when its maximum drift reaches this.
    pub min_drift_pct: f64,
    /// Variants with fewer executions are ignored.
    pub min_exec_count: u64,
    /// Variants with less total execution time are ignored.
    pub min_total_minutes: u64,
}

impl PlanFilter {
    /// Whether a variant is significant enough to compare.
    pub fn admits(&self, variant: &StatementVariant) -> bool {
        variant.exec_count >= self.min_exec_count
            && variant.total_exec_minutes >= self.min_total_minutes
    }
}

/// Group variants by statement and keep the regressions, ordered by hash.
///
/// A group needs at least two admitted variants.
pub fn analyze(
    variants: impl IntoIterator<Item = StatementVariant>,
    filter: &PlanFilter,
) -> Vec<StatementGroup> {
    let mut groups: BTreeMap<String, StatementGroup> = BTreeMap::new();
    for variant in variants.into_iter().filter(|v| filter.admits(v)) {
        match groups.get_mut(&variant.statement_hash) {
            Some(group) => group.add(variant),
            None => {
                groups.insert(variant.statement_hash.clone(), StatementGroup::new(variant));
            }
        }
    }
    groups
        .into_values()
        .filter(|g| g.variants.len() >= 2 && g.max_drift_pct() >= filter.min_drift_pct)
        .collect()
}

/// Flagged groups with their rendered table and optional traces.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanReport {
    /// Regressed statements.
    pub groups: Vec<StatementGroup>,
    /// Tabular summary, empty when nothing regressed.
    pub table: String,
    /// Execution traces around each variant's latest snapshot.
    pub traces: Vec<String>,
}

impl PlanReport {
    /// Whether any statement regressed.
    pub fn is_regression(&self) -> bool {
        !self.groups.is_empty()
    }
}

/// Runs the plan-change queries and the analysis.
#[derive(Debug, Clone)]
pub struct PlanAnalyzer {
    change: ChangeKind,
    filter: PlanFilter,
    trace_window_hours: u32,
    timeout: Duration,
}

impl PlanAnalyzer {
    /// Create an analyzer. A zero trace window disables traces.
    pub fn new(
        change: ChangeKind,
        filter: PlanFilter,
        trace_window_hours: u32,
        timeout: Duration,
    ) -> Self {
        Self {
            change,
            filter,
            trace_window_hours,
            timeout,
        }
    }

    /// Identity kind being compared.
    pub fn change(&self) -> ChangeKind {
        self.change
    }

    fn changed_hashes_subquery(&self) -> String {
        let col = self.change.column();
        format!(
            "select STATEMENT_HASH from (select STATEMENT_HASH, {col} from {PLAN_CACHE_HISTORY} group by STATEMENT_HASH, {col}) group by STATEMENT_HASH having count(*) > 1"
        )
    }

    /// Statement hashes seen under more than one identity.
    pub fn changed_hashes_sql(&self) -> String {
        self.changed_hashes_subquery()
    }

    /// Per (hash, identity) aggregates for every changed hash.
    ///
    /// The hash list stays inside the database as a subquery.
    pub fn statistics_sql(&self) -> String {
        let col = self.change.column();
        format!(
            "select MAX(TO_VARCHAR(SERVER_TIMESTAMP, 'YYYY/MM/DD HH24:MI:SS')) MAX_SNP_TIME, STATEMENT_HASH HASH, \
             TO_DECIMAL(SUM(TOTAL_EXECUTION_TIME)/SUM(EXECUTION_COUNT)/1000, 10, 2) AVG_EXEC_MS, \
             SUM(EXECUTION_COUNT) EXEC_COUNT, {col}, \
             TO_DECIMAL(SUM(TOTAL_EXECUTION_TIME)/1000/1000/60, 10, 0) TOT_EXEC_MINUTES \
             from {PLAN_CACHE_HISTORY} where STATEMENT_HASH in ({}) \
             group by STATEMENT_HASH, {col} having SUM(EXECUTION_COUNT) > 0 order by STATEMENT_HASH",
            self.changed_hashes_subquery()
        )
    }

    /// Raw snapshots of `hash` within the trace window around `snapshot`.
    pub fn trace_sql(&self, hash: &str, snapshot: &str) -> String {
        let col = self.change.column();
        let hours = self.trace_window_hours;
        let at = format!("TO_TIMESTAMP({}, 'YYYY/MM/DD HH24:MI:SS')", sql_literal(snapshot));
        format!(
            "select TO_VARCHAR(SERVER_TIMESTAMP, 'YYYY/MM/DD HH24:MI:SS') SNP_TIME, STATEMENT_HASH HASH, \
             TO_DECIMAL(TOTAL_EXECUTION_TIME/EXECUTION_COUNT/1000, 10, 2) AVG_EXEC_MS, EXECUTION_COUNT EXEC_COUNT, {col} \
             from {PLAN_CACHE_HISTORY} where STATEMENT_HASH = {} and EXECUTION_COUNT > 0 \
             and SERVER_TIMESTAMP > ADD_SECONDS({at}, -{hours}*3600) \
             and SERVER_TIMESTAMP < ADD_SECONDS({at}, {hours}*3600) order by SERVER_TIMESTAMP",
            sql_literal(hash)
        )
    }

    /// Run the analysis.
    ///
    /// Hangs and failures of the two main queries are returned as such;
    /// trace queries are best effort.
    pub async fn run(
        &self,
        guard: &DeadlineGuard,
        executor: &Arc<dyn QueryExecutor>,
    ) -> CallOutcome<PlanReport> {
        let hashes = match guard
            .query(ProbeCategory::PlanCache, self.timeout, executor, self.changed_hashes_sql())
            .await
        {
            CallOutcome::Completed(rows) => rows,
            CallOutcome::Hanging => return CallOutcome::Hanging,
            CallOutcome::Failed(e) => return CallOutcome::Failed(e),
        };
        if hashes.is_empty() {
            debug!("no statement ran under more than one {}", self.change.column());
            return CallOutcome::Completed(self.report(Vec::new(), Vec::new()));
        }

        let rows = match guard
            .query(ProbeCategory::PlanCache, self.timeout, executor, self.statistics_sql())
            .await
        {
            CallOutcome::Completed(rows) => rows,
            CallOutcome::Hanging => return CallOutcome::Hanging,
            CallOutcome::Failed(e) => return CallOutcome::Failed(e),
        };
        let variants = match rows.iter().map(parse_variant).collect::<Result<Vec<_>, _>>() {
            Ok(variants) => variants,
            Err(e) => return CallOutcome::Failed(e),
        };

        let groups = analyze(variants, &self.filter);
        let traces = if self.trace_window_hours > 0 {
            self.traces(&groups, guard, executor).await
        } else {
            Vec::new()
        };
        CallOutcome::Completed(self.report(groups, traces))
    }

    async fn traces(
        &self,
        groups: &[StatementGroup],
        guard: &DeadlineGuard,
        executor: &Arc<dyn QueryExecutor>,
    ) -> Vec<String> {
        let headers = [
            "Snapshot time",
            "Hash",
            "Avg Exec Time [ms]",
            "Execution Count",
            self.change.title(),
        ];
        let mut traces = Vec::new();
        for group in groups {
            for variant in group.variants() {
                let sql = self.trace_sql(group.statement_hash(), &variant.max_snapshot_time);
                let rows = match guard
                    .query(ProbeCategory::PlanCache, self.timeout, executor, sql)
                    .await
                {
                    CallOutcome::Completed(rows) => rows,
                    CallOutcome::Hanging => {
                        warn!(
                            hash = group.statement_hash(),
                            "plan trace query hanging, skipping traces"
                        );
                        return traces;
                    }
                    CallOutcome::Failed(e) => {
                        warn!(hash = group.statement_hash(), error = %e, "plan trace query failed");
                        continue;
                    }
                };
                if identity_changes(&rows) {
                    traces.push(format_table(&headers, &rows));
                }
            }
        }
        traces
    }

    fn report(&self, groups: Vec<StatementGroup>, traces: Vec<String>) -> PlanReport {
        let table = if groups.is_empty() {
            String::new()
        } else {
            let headers = [
                "Hash",
                self.change.title(),
                "Avg Exec Time [ms]",
                "Diff Avg Exec Time [%]",
                "Execution Count",
                "Total Exec Time [m]",
                "Max snapshot time",
            ];
            let rows: Vec<Vec<String>> =
                groups.iter().flat_map(StatementGroup::table_rows).collect();
            format_table(&headers, &rows)
        };
        PlanReport {
            groups,
            table,
            traces,
        }
    }
}

/// Whether the identity column (fifth) changes between consecutive rows.
pub fn identity_changes(rows: &[Row]) -> bool {
    rows.windows(2).any(|pair| pair[0].get(4) != pair[1].get(4))
}
