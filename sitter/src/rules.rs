//! Feature rules: threshold checks against live counts from monitoring views.
//!
//! A rule's row filter is a [`Predicate`], a small expression tree compiled
//! to a WHERE clause. Keeping the encodings typed (equality, LIKE with
//! wildcards, substring-repeat threshold, raw clause) lets them be tested
//! without a database.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use dbkeeper::gateway::{sql_literal, GatewayError, QueryExecutor};
use serde::Deserialize;
use tracing::debug;

use crate::config::{ConfigError, FeatureConfig};
use crate::deadline::{CallOutcome, DeadlineGuard, ProbeCategory};
use crate::sessions::KillAction;

/// The monitoring view whose own statement would otherwise match itself.
const ACTIVE_STATEMENTS_VIEW: &str = "M_ACTIVE_STATEMENTS";

/// Marker selecting where-clause mode in a rule's `column` field.
pub const WHERE_MODE: &str = "WHERE";

/// Row filter of a feature rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
    /// `column = 'value'`
    Equals {
        /// Column name.
        column: String,
        /// Exact value.
        value: String,
    },
    /// `column like 'pattern'` with `%` wildcards.
    Like {
        /// Column name.
        column: String,
        /// LIKE pattern.
        pattern: String,
    },
    /// `column not like 'pattern'`.
    NotLike {
        /// Column name.
        column: String,
        /// LIKE pattern.
        pattern: String,
    },
    /// The column contains `needle` more than `times` times.
    SubstringCountAbove {
        /// Column name.
        column: String,
        /// Substring to count.
        needle: String,
        /// Occurrences that must be exceeded.
        times: u64,
    },
    /// A WHERE clause taken verbatim from the configuration.
    Raw(String),
    /// Every part must hold.
    All(Vec<Predicate>),
}

impl Predicate {
    /// Translate a configured value into a predicate on `column`.
    ///
    /// - `text>N` (N an integer) counts occurrences of `text`;
    /// - a leading or trailing `*` becomes a LIKE wildcard;
    /// - anything else is an equality.
    pub fn from_value(column: &str, value: &str) -> Self {
        if let Some((needle, times)) = value.rsplit_once('>') {
            if let Ok(times) = times.trim().parse::<u64>() {
                return Self::SubstringCountAbove {
                    column: column.to_owned(),
                    needle: needle.to_owned(),
                    times,
                };
            }
        }

        let (leading, rest) = match value.strip_prefix('*') {
            Some(rest) => (true, rest),
            None => (false, value),
        };
        let (trailing, core) = match rest.strip_suffix('*') {
            Some(core) => (true, core),
            None => (false, rest),
        };

        if !leading && !trailing {
            return Self::Equals {
                column: column.to_owned(),
                value: value.to_owned(),
            };
        }
        let mut pattern = String::with_capacity(core.len().saturating_add(2));
        if leading {
            pattern.push('%');
        }
        pattern.push_str(core);
        if trailing {
            pattern.push('%');
        }
        Self::Like {
            column: column.to_owned(),
            pattern,
        }
    }

    /// Compile to a WHERE clause.
    pub fn compile(&self) -> String {
        match self {
            Self::Equals { column, value } => format!("{column} = {}", sql_literal(value)),
            Self::Like { column, pattern } => format!("{column} like {}", sql_literal(pattern)),
            Self::NotLike { column, pattern } => {
                format!("{column} not like {}", sql_literal(pattern))
            }
            Self::SubstringCountAbove {
                column,
                needle,
                times,
            } => {
                let needle_len = u64::try_from(needle.chars().count()).unwrap_or(u64::MAX);
                format!(
                    "length({column}) - length(replace({column}, {}, '')) > {}",
                    sql_literal(needle),
                    times.saturating_mul(needle_len)
                )
            }
            Self::Raw(clause) => clause.clone(),
            Self::All(parts) => parts
                .iter()
                .map(|part| match part {
                    Self::Raw(clause) => format!("({clause})"),
                    other => other.compile(),
                })
                .collect::<Vec<_>>()
                .join(" and "),
        }
    }

    /// Evaluate against one row without a database.
    ///
    /// `lookup` returns a column's value. Raw clauses cannot be evaluated
    /// locally and yield `None`.
    pub fn matches(&self, lookup: &dyn Fn(&str) -> Option<String>) -> Option<bool> {
        match self {
            Self::Equals { column, value } => {
                Some(lookup(column).as_deref() == Some(value.as_str()))
            }
            Self::Like { column, pattern } => {
                Some(lookup(column).is_some_and(|v| like_matches(&v, pattern)))
            }
            Self::NotLike { column, pattern } => {
                Some(lookup(column).is_some_and(|v| !like_matches(&v, pattern)))
            }
            Self::SubstringCountAbove {
                column,
                needle,
                times,
            } => Some(lookup(column).is_some_and(|v| {
                !needle.is_empty()
                    && u64::try_from(v.matches(needle.as_str()).count()).unwrap_or(u64::MAX)
                        > *times
            })),
            Self::Raw(_) => None,
            Self::All(parts) => {
                let mut all = true;
                for part in parts {
                    all &= part.matches(lookup)?;
                }
                Some(all)
            }
        }
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.compile())
    }
}

/// LIKE with `%` wildcards only.
fn like_matches(value: &str, pattern: &str) -> bool {
    let pieces: Vec<&str> = pattern.split('%').collect();
    let (Some(first), Some(last)) = (pieces.first(), pieces.last()) else {
        return value.is_empty();
    };
    if pieces.len() == 1 {
        return value == *first;
    }
    if !value.starts_with(first) || value.len() < first.len().saturating_add(last.len()) {
        return false;
    }
    let mut rest = &value[first.len()..];
    let middle = &pieces[1..pieces.len().saturating_sub(1)];
    for piece in middle {
        match rest.find(piece) {
            Some(at) => rest = &rest[at.saturating_add(piece.len())..],
            None => return false,
        }
    }
    rest.ends_with(last)
}

/// How the averaged count is compared to the limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitSense {
    /// Violation when the count exceeds the limit (`<L` or plain `L`).
    AtMostAllowed,
    /// Violation when the count falls below the limit (`>L`).
    AtLeastRequired,
}

/// A limit as written in the configuration: a number or a `<`/`>` string.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum LimitSpec {
    /// Plain number, an upper bound.
    Count(i64),
    /// `"10"`, `"<10"` or `">10"`.
    Text(String),
}

impl LimitSpec {
    /// Parse into a value and its sense.
    ///
    /// # Errors
    ///
    /// Returns a description when the text is not an optionally prefixed
    /// integer.
    pub fn parse(&self) -> Result<(i64, LimitSense), String> {
        match self {
            Self::Count(n) => Ok((*n, LimitSense::AtMostAllowed)),
            Self::Text(text) => {
                let text = text.trim();
                let (sense, digits) = if let Some(rest) = text.strip_prefix('>') {
                    (LimitSense::AtLeastRequired, rest)
                } else if let Some(rest) = text.strip_prefix('<') {
                    (LimitSense::AtMostAllowed, rest)
                } else {
                    (LimitSense::AtMostAllowed, text)
                };
                digits
                    .trim()
                    .parse::<i64>()
                    .map(|limit| (limit, sense))
                    .map_err(|_| {
                        format!("limit '{text}' must be an integer, optionally prefixed by < or >")
                    })
            }
        }
    }
}

/// Whether the rule matches on a column value or a free WHERE clause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchMode {
    /// Match `column` against a translated value.
    ValueMatch {
        /// Column name.
        column: String,
        /// Configured value, before translation.
        value: String,
    },
    /// The configured value is the WHERE clause.
    WhereClause,
}

/// Counts per host (empty key when not host-scoped), averaged over samples.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    /// Averaged count per host.
    pub per_host: BTreeMap<String, i64>,
    /// Number of samples the counts were averaged over.
    pub averaged_over: u32,
}

/// One configured threshold check.
#[derive(Debug, Clone)]
pub struct FeatureRule {
    /// 1-based position in the configuration.
    pub id: usize,
    /// Monitoring view in schema `SYS`.
    pub view: String,
    /// How rows are selected.
    pub match_mode: MatchMode,
    /// Compiled row filter.
    pub predicate: Predicate,
    /// Threshold.
    pub limit: i64,
    /// Direction of the threshold.
    pub sense: LimitSense,
    /// Samples to average over, at least 1.
    pub samples: u32,
    /// Pause between samples.
    pub sample_interval: Duration,
    /// Count per host.
    pub host_scoped: bool,
    /// Sessions to stop on violation.
    pub kill: KillAction,
    /// Text appended to violation messages.
    pub annotation: Option<String>,
}

impl FeatureRule {
    /// Build a rule from its configuration entry.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MalformedRule`] for an empty view or column, a
    /// bad limit or zero samples.
    pub fn from_config(
        id: usize,
        config: &FeatureConfig,
        host_scoped: bool,
    ) -> Result<Self, ConfigError> {
        let malformed = |reason: String| ConfigError::MalformedRule { rule: id, reason };

        let view = config.view.trim().to_owned();
        let column = config.column.trim();
        if view.is_empty() {
            return Err(malformed("view must not be empty".to_owned()));
        }
        if column.is_empty() {
            return Err(malformed(format!(
                "column must not be empty (use {WHERE_MODE} for a where clause)"
            )));
        }
        if config.samples == 0 {
            return Err(malformed("samples must be at least 1".to_owned()));
        }
        let (limit, sense) = config.limit.parse().map_err(malformed)?;

        let (match_mode, base) = if column == WHERE_MODE {
            if config.value.trim().is_empty() {
                return Err(malformed("where clause must not be empty".to_owned()));
            }
            (MatchMode::WhereClause, Predicate::Raw(config.value.clone()))
        } else {
            (
                MatchMode::ValueMatch {
                    column: column.to_owned(),
                    value: config.value.clone(),
                },
                Predicate::from_value(column, &config.value),
            )
        };

        let predicate = if view == ACTIVE_STATEMENTS_VIEW {
            Predicate::All(vec![
                base,
                Predicate::NotLike {
                    column: "STATEMENT_STRING".to_owned(),
                    pattern: format!("%{ACTIVE_STATEMENTS_VIEW}%"),
                },
            ])
        } else {
            base
        };

        Ok(Self {
            id,
            view,
            match_mode,
            predicate,
            limit,
            sense,
            samples: config.samples,
            sample_interval: Duration::from_secs(config.interval_secs),
            host_scoped,
            kill: config.kill,
            annotation: config.text.clone().filter(|t| !t.trim().is_empty()),
        })
    }

    /// Compiled WHERE clause.
    pub fn where_clause(&self) -> String {
        self.predicate.compile()
    }

    /// Human-readable description of what is counted.
    pub fn description(&self) -> String {
        match (&self.match_mode, &self.predicate) {
            (
                MatchMode::ValueMatch { column, .. },
                Predicate::SubstringCountAbove { needle, times, .. },
            ) => format!(
                "column {column} in {} contains the string '{needle}' more than {times} times",
                self.view
            ),
            _ => self.where_clause(),
        }
    }

    /// One-line summary used in check records.
    pub fn info(&self) -> String {
        let bound = match self.sense {
            LimitSense::AtMostAllowed => "max allowed",
            LimitSense::AtLeastRequired => "min required",
        };
        format!("{bound} = {}, check: {}", self.limit, self.description())
    }

    /// Whether an averaged count violates the limit.
    pub fn is_violation(&self, averaged: i64) -> bool {
        match self.sense {
            LimitSense::AtMostAllowed => averaged > self.limit,
            LimitSense::AtLeastRequired => averaged < self.limit,
        }
    }

    /// Hosts (or the empty key) whose averaged count violates the limit.
    pub fn violating_hosts(&self, verdict: &Verdict) -> Vec<String> {
        verdict
            .per_host
            .iter()
            .filter(|(_, count)| self.is_violation(**count))
            .map(|(host, _)| host.clone())
            .collect()
    }

    /// Check the view, the column and, in host mode, the HOST column exist.
    ///
    /// The outer outcome reports hangs and gateway failures; the inner
    /// result is the configuration verdict.
    pub async fn validate(
        &self,
        guard: &DeadlineGuard,
        executor: &Arc<dyn QueryExecutor>,
        timeout: Duration,
    ) -> CallOutcome<Result<(), ConfigError>> {
        let executor = Arc::clone(executor);
        let view = self.view.clone();
        let column = match &self.match_mode {
            MatchMode::ValueMatch { column, .. } => Some(column.clone()),
            MatchMode::WhereClause => None,
        };
        let host_scoped = self.host_scoped;

        guard
            .call(ProbeCategory::Feature(self.id), timeout, async move {
                let views = executor
                    .query_count(&format!(
                        "select count(*) from sys.m_monitors where view_name = {}",
                        sql_literal(&view)
                    ))
                    .await?;
                if views == 0 {
                    return Ok(Err(ConfigError::UnknownView { view }));
                }
                if let Some(column) = column {
                    if !has_column(executor.as_ref(), &view, &column).await? {
                        return Ok(Err(ConfigError::UnknownColumn { view, column }));
                    }
                }
                if host_scoped && !has_column(executor.as_ref(), &view, "HOST").await? {
                    return Ok(Err(ConfigError::MissingHostColumn { view }));
                }
                Ok(Ok(()))
            })
            .await
    }

    /// Sample the rule `samples` times and average per host.
    ///
    /// Each sample is one guarded call. A hanging sample stops sampling
    /// and is returned as [`CallOutcome::Hanging`]; the caller treats it as
    /// a violation.
    pub async fn evaluate(
        &self,
        guard: &DeadlineGuard,
        executor: &Arc<dyn QueryExecutor>,
        timeout: Duration,
    ) -> CallOutcome<Verdict> {
        let mut sums: BTreeMap<String, i64> = BTreeMap::new();
        let clause = self.where_clause();

        for iteration in 0..self.samples {
            if iteration > 0 && !self.sample_interval.is_zero() {
                tokio::time::sleep(self.sample_interval).await;
            }
            let op = sample_counts(
                Arc::clone(executor),
                self.view.clone(),
                clause.clone(),
                self.host_scoped,
            );
            match guard.call(ProbeCategory::Feature(self.id), timeout, op).await {
                CallOutcome::Completed(counts) => {
                    for (host, count) in counts {
                        let sum = sums.entry(host).or_insert(0);
                        *sum = sum.saturating_add(count);
                    }
                }
                CallOutcome::Hanging => {
                    debug!(rule = self.id, iteration, "feature sample hanging");
                    return CallOutcome::Hanging;
                }
                CallOutcome::Failed(e) => return CallOutcome::Failed(e),
            }
        }

        // Floor division per host.
        let divisor = i64::from(self.samples.max(1));
        let per_host = sums
            .into_iter()
            .map(|(host, sum)| (host, sum.div_euclid(divisor)))
            .collect();
        CallOutcome::Completed(Verdict {
            per_host,
            averaged_over: self.samples,
        })
    }
}

async fn has_column(
    executor: &dyn QueryExecutor,
    view: &str,
    column: &str,
) -> Result<bool, GatewayError> {
    let n = executor
        .query_count(&format!(
            "select count(*) from sys.m_monitor_columns where view_name = {} and view_column_name = {}",
            sql_literal(view),
            sql_literal(column)
        ))
        .await?;
    Ok(n > 0)
}

/// One sample: counts per host, with zero for hosts without matching rows.
async fn sample_counts(
    executor: Arc<dyn QueryExecutor>,
    view: String,
    clause: String,
    host_scoped: bool,
) -> Result<BTreeMap<String, i64>, GatewayError> {
    if !host_scoped {
        let n = executor
            .query_count(&format!("select count(*) from SYS.{view} where {clause}"))
            .await?;
        return Ok(BTreeMap::from([(String::new(), n)]));
    }

    let hosts = executor
        .query(&format!("select distinct HOST from SYS.{view}"))
        .await?;
    let mut counts: BTreeMap<String, i64> = hosts
        .into_iter()
        .filter_map(|row| row.into_iter().next())
        .filter(|host| !host.is_empty())
        .map(|host| (host, 0))
        .collect();

    let rows = executor
        .query(&format!(
            "select HOST, count(*) from SYS.{view} where {clause} group by HOST"
        ))
        .await?;
    for row in rows {
        let (Some(host), Some(count)) = (row.first(), row.get(1)) else {
            return Err(GatewayError::Output(format!("expected HOST and count, got {row:?}")));
        };
        let count = count
            .parse::<i64>()
            .map_err(|_| GatewayError::Output(format!("count '{count}' is not an integer")))?;
        counts.insert(host.clone(), count);
    }
    Ok(counts)
}

/// Full rows matching a rule, for the critical-features log.
pub async fn matching_rows(
    rule: &FeatureRule,
    guard: &DeadlineGuard,
    executor: &Arc<dyn QueryExecutor>,
    timeout: Duration,
) -> CallOutcome<Vec<dbkeeper::gateway::Row>> {
    guard
        .query(
            ProbeCategory::Feature(rule.id),
            timeout,
            executor,
            format!("select * from SYS.{} where {}", rule.view, rule.where_clause()),
        )
        .await
}
