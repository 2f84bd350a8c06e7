//! The tracking cycle.
//!
//! One cycle walks `CpuCheck → PingCheck → FeatureCheck(1..N) → PlanCheck`
//! and stops at the first anomaly, which triggers one recording episode.
//! Sleeping between cycles and deciding when to exit belong to the caller.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::Context;
use dbkeeper::gateway::{ProcessLauncher, QueryExecutor};
use dbkeeper::liveness::Liveness;
use dbkeeper::notify::Notifier;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::SitterConfig;
use crate::deadline::{CallOutcome, DeadlineGuard};
use crate::plan::PlanAnalyzer;
use crate::probes::{self, CpuKind, PingOutcome};
use crate::recorder::{Recorder, Scheduler};
use crate::reporter::{CheckRecord, Reporter};
use crate::retention::prune_older_than;
use crate::rules::{matching_rows, FeatureRule};
use crate::scope::HostScope;
use crate::sessions::{stop_sessions, KillAction};

/// Where the tracker is within a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TrackerState {
    /// Between cycles.
    Idle,
    /// Sampling CPU load.
    CpuCheck,
    /// Pinging the database.
    PingCheck,
    /// Evaluating the rule with this 1-based id.
    FeatureCheck(usize),
    /// Analyzing plan changes.
    PlanCheck,
    /// Running a recording episode.
    Recording,
    /// Housekeeping after the checks.
    Cooldown,
    /// The database is down or not primary.
    Offline,
}

/// What set off a recording.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "check", rename_all = "snake_case")]
pub enum Trigger {
    /// CPU above the limit.
    Cpu,
    /// The ping hung.
    Ping,
    /// A rule was violated or its sampling hung.
    Feature {
        /// 1-based rule id.
        rule: usize,
        /// Whether the sampling hung.
        hanging: bool,
    },
    /// A statement regressed after a plan or engine change, or the
    /// analysis hung.
    Plan {
        /// Whether the analysis hung.
        hanging: bool,
    },
}

/// Result of one cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleOutcome {
    /// A recording episode ran.
    pub recorded: bool,
    /// The database was found offline, unreachable or not primary.
    pub went_offline: bool,
    /// The anomaly found, if any.
    pub trigger: Option<Trigger>,
    /// Hosts targeted by the recording.
    pub hosts: Vec<String>,
    /// Files written by the recording.
    pub artifacts: Vec<PathBuf>,
    /// Check record lines, in order.
    pub checks: Vec<String>,
}

/// Runs tracking cycles against one database.
pub struct Tracker {
    config: SitterConfig,
    rules: Vec<FeatureRule>,
    plan: Option<PlanAnalyzer>,
    scheduler: Scheduler,
    guard: DeadlineGuard,
    executor: Arc<dyn QueryExecutor>,
    launcher: Arc<dyn ProcessLauncher>,
    reporter: Reporter,
    scope: HostScope,
    state: TrackerState,
    rules_validated: bool,
    dry_run: bool,
}

/// Early exit of a cycle stage.
enum Stage {
    Continue,
    Trigger(Trigger),
    Offline,
}

impl Tracker {
    /// Build a tracker from a validated configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if a feature rule cannot be built.
    pub fn new(
        config: SitterConfig,
        executor: Arc<dyn QueryExecutor>,
        launcher: Arc<dyn ProcessLauncher>,
        recorder: Arc<dyn Recorder>,
        notifier: Arc<dyn Notifier>,
    ) -> anyhow::Result<Self> {
        let rules = config.feature_rules().context("invalid feature rules")?;
        let plan = config.plan_check.enabled.then(|| {
            PlanAnalyzer::new(
                config.plan_check.change,
                config.plan_check.filter(),
                config.plan_check.trace_window_hours,
                config.checks.feature_timeout(),
            )
        });
        let scheduler = Scheduler::new(
            recorder,
            config.recording.mode,
            &config.recording.priority,
            config.recording.tasks(),
        );
        let reporter = Reporter::new(notifier, &config.database, config.output.log_dir.clone());
        let scope = HostScope::new(config.database.hosts.clone());
        Ok(Self {
            config,
            rules,
            plan,
            scheduler,
            guard: DeadlineGuard::new(),
            executor,
            launcher,
            reporter,
            scope,
            state: TrackerState::Idle,
            rules_validated: false,
            dry_run: false,
        })
    }

    /// Detect anomalies without recording or stopping sessions.
    pub fn set_dry_run(&mut self, dry_run: bool) {
        self.dry_run = dry_run;
    }

    /// Current state.
    pub fn state(&self) -> TrackerState {
        self.state
    }

    /// Reporter used for check records and escalation.
    pub fn reporter(&self) -> &Reporter {
        &self.reporter
    }

    fn enter(&mut self, state: TrackerState) {
        debug!(from = ?self.state, to = ?state, "tracker state");
        self.state = state;
    }

    async fn log(&self, outcome: &mut CycleOutcome, record: CheckRecord, escalate: bool) {
        self.reporter.record(&record, escalate).await;
        outcome.checks.push(record.line());
    }

    /// Run one cycle.
    ///
    /// # Errors
    ///
    /// Fails only on configuration problems found against the live
    /// database (unknown view or column); everything else is folded into
    /// the outcome.
    pub async fn run_cycle(&mut self) -> anyhow::Result<CycleOutcome> {
        let mut outcome = CycleOutcome::default();
        self.scope.reset();

        if !self.precondition(&mut outcome).await {
            self.enter(TrackerState::Offline);
            outcome.went_offline = true;
            return Ok(outcome);
        }

        let stage = match self.validate_rules(&mut outcome).await? {
            Stage::Continue => self.checks(&mut outcome).await,
            other => other,
        };

        let kill_rule = match stage {
            Stage::Offline => {
                self.enter(TrackerState::Offline);
                outcome.went_offline = true;
                return Ok(outcome);
            }
            Stage::Trigger(trigger) => {
                let kill_rule = match trigger {
                    Trigger::Feature { rule, .. } => Some(rule),
                    _ => None,
                };
                outcome.trigger = Some(trigger);
                if !self.dry_run {
                    self.record(&mut outcome).await;
                }
                kill_rule
            }
            Stage::Continue => None,
        };

        if let Some(id) = kill_rule {
            self.kill(id, &mut outcome).await;
        }

        self.enter(TrackerState::Cooldown);
        self.housekeeping().await;
        self.enter(TrackerState::Idle);
        Ok(outcome)
    }

    async fn precondition(&mut self, outcome: &mut CycleOutcome) -> bool {
        let started = Instant::now();
        let timeout = Duration::from_secs(self.config.checks.os_timeout_secs);
        let (online, comment) = match probes::online(
            &self.guard,
            &self.launcher,
            &self.config.database,
            timeout,
        )
        .await
        {
            CallOutcome::Completed(Liveness::Online) => (true, "online and primary".to_owned()),
            CallOutcome::Completed(Liveness::Offline) => {
                (false, "not every service is running".to_owned())
            }
            CallOutcome::Completed(Liveness::Replica) => {
                (false, "instance is the secondary of a replication pair".to_owned())
            }
            CallOutcome::Hanging => (false, "online check did not answer".to_owned()),
            CallOutcome::Failed(e) => (false, format!("online check failed: {e}")),
        };
        let record = CheckRecord::passed("Online Check", started.elapsed(), online, comment);
        self.log(outcome, record, false).await;
        online
    }

    /// Check the rules' views and columns once, on the first reachable
    /// cycle.
    async fn validate_rules(&mut self, outcome: &mut CycleOutcome) -> anyhow::Result<Stage> {
        if self.rules_validated {
            return Ok(Stage::Continue);
        }
        let timeout = self.config.checks.feature_timeout();
        for rule in &self.rules {
            match rule.validate(&self.guard, &self.executor, timeout).await {
                CallOutcome::Completed(Ok(())) => {}
                CallOutcome::Completed(Err(e)) => {
                    return Err(e).with_context(|| format!("feature rule {}", rule.id));
                }
                CallOutcome::Hanging => {
                    let record = CheckRecord::unsuccessful(
                        format!("Feature Check {}", rule.id),
                        timeout,
                        "hang detected while validating the rule",
                    );
                    self.log(outcome, record, true).await;
                    return Ok(Stage::Trigger(Trigger::Feature {
                        rule: rule.id,
                        hanging: true,
                    }));
                }
                CallOutcome::Failed(e) => {
                    warn!(
                        rule = rule.id,
                        error = %e,
                        "rule validation failed, database unreachable"
                    );
                    return Ok(Stage::Offline);
                }
            }
        }
        self.rules_validated = true;
        Ok(Stage::Continue)
    }

    async fn checks(&mut self, outcome: &mut CycleOutcome) -> Stage {
        if self.config.cpu.is_enabled() {
            self.enter(TrackerState::CpuCheck);
            if self.cpu_check(outcome).await {
                return Stage::Trigger(Trigger::Cpu);
            }
        }

        self.enter(TrackerState::PingCheck);
        match self.ping_check(outcome).await {
            PingOutcome::Responsive => {}
            PingOutcome::Hanging => return Stage::Trigger(Trigger::Ping),
            PingOutcome::Offline => return Stage::Offline,
        }

        let stage = self.feature_checks(outcome).await;
        if !matches!(stage, Stage::Continue) {
            return stage;
        }

        self.plan_check(outcome).await
    }

    async fn cpu_check(&mut self, outcome: &mut CycleOutcome) -> bool {
        let started = Instant::now();
        let cpu = self.config.cpu.clone();
        match cpu.run(&self.guard, &self.launcher).await {
            CallOutcome::Completed(readings) => {
                let mut tripped = false;
                for reading in readings {
                    let action = match reading.kind {
                        CpuKind::System => "System CPU Check",
                        _ => "User CPU Check",
                    };
                    let comment = format!(
                        "Av. CPU = {:.1} % (Allowed = {} %)",
                        reading.percent, cpu.max_percent
                    );
                    let record =
                        CheckRecord::passed(action, started.elapsed(), !reading.tripped, comment);
                    self.log(outcome, record, reading.tripped).await;
                    tripped |= reading.tripped;
                }
                tripped
            }
            CallOutcome::Hanging => {
                let record = CheckRecord::unsuccessful(
                    "CPU Check",
                    started.elapsed(),
                    "sar did not finish in time, treated as not tripped",
                );
                self.log(outcome, record, true).await;
                false
            }
            CallOutcome::Failed(e) => {
                let comment = format!("sar failed: {e}");
                let record = CheckRecord::unsuccessful("CPU Check", started.elapsed(), comment);
                self.log(outcome, record, false).await;
                false
            }
        }
    }

    async fn ping_check(&mut self, outcome: &mut CycleOutcome) -> PingOutcome {
        let timeout = Duration::from_secs(self.config.checks.ping_timeout_secs);
        if timeout.is_zero() {
            return PingOutcome::Responsive;
        }
        let started = Instant::now();
        let result = probes::ping(&self.guard, &self.executor, timeout).await;
        let secs = timeout.as_secs();
        let (passed, comment) = match result {
            PingOutcome::Responsive => {
                (true, format!("database responded within {secs} seconds"))
            }
            PingOutcome::Hanging => {
                (false, format!("no response from database within {secs} seconds"))
            }
            PingOutcome::Offline => (
                false,
                "database is offline or the user key does not work".to_owned(),
            ),
        };
        let record = CheckRecord::passed("Ping Check", started.elapsed(), passed, comment);
        self.log(outcome, record, !passed).await;
        result
    }

    async fn feature_checks(&mut self, outcome: &mut CycleOutcome) -> Stage {
        let timeout = self.config.checks.feature_timeout();
        for index in 0..self.rules.len() {
            let Some(rule) = self.rules.get(index).cloned() else {
                break;
            };
            self.enter(TrackerState::FeatureCheck(rule.id));
            let action = format!("Feature Check {}", rule.id);
            let started = Instant::now();

            let verdict = match rule.evaluate(&self.guard, &self.executor, timeout).await {
                CallOutcome::Completed(verdict) => verdict,
                CallOutcome::Hanging => {
                    let record = CheckRecord::unsuccessful(
                        action,
                        started.elapsed(),
                        "hang detected during feature check",
                    );
                    self.log(outcome, record, true).await;
                    return Stage::Trigger(Trigger::Feature {
                        rule: rule.id,
                        hanging: true,
                    });
                }
                CallOutcome::Failed(e) => {
                    warn!(rule = rule.id, error = %e, "feature check failed, database unreachable");
                    return Stage::Offline;
                }
            };

            let violating = rule.violating_hosts(&verdict);
            for (host, count) in &verdict.per_host {
                let violated = rule.is_violation(*count);
                let mut comment = format!("# matches = {count} {host}, {}", rule.info());
                if let (true, Some(text)) = (violated, &rule.annotation) {
                    comment.push('\n');
                    comment.push_str(text);
                }
                let record = CheckRecord::passed(&action, started.elapsed(), !violated, comment);
                self.log(outcome, record, violated).await;
            }

            if self.config.checks.log_features {
                self.log_feature_rows(&rule).await;
            }

            if !violating.is_empty() {
                if rule.host_scoped {
                    self.scope.restrict(&violating);
                }
                return Stage::Trigger(Trigger::Feature {
                    rule: rule.id,
                    hanging: false,
                });
            }
        }
        Stage::Continue
    }

    async fn log_feature_rows(&self, rule: &FeatureRule) {
        let timeout = self.config.checks.feature_timeout();
        match matching_rows(rule, &self.guard, &self.executor, timeout).await {
            CallOutcome::Completed(rows) => {
                if let Err(e) = self.reporter.append_feature_rows(rule.id, &rows).await {
                    warn!(rule = rule.id, error = %e, "could not write feature log");
                }
            }
            CallOutcome::Hanging => warn!(rule = rule.id, "feature rows query did not answer"),
            CallOutcome::Failed(e) => {
                warn!(rule = rule.id, error = %e, "feature rows query failed");
            }
        }
    }

    async fn plan_check(&mut self, outcome: &mut CycleOutcome) -> Stage {
        let Some(analyzer) = self.plan.clone() else {
            return Stage::Continue;
        };
        self.enter(TrackerState::PlanCheck);
        let action = "Plan Change Check";
        let started = Instant::now();
        match analyzer.run(&self.guard, &self.executor).await {
            CallOutcome::Completed(report) => {
                let regressed = report.is_regression();
                let comment = format!(
                    "{} statement(s) with {} slowed down by at least {} %",
                    report.groups.len(),
                    analyzer.change().description(),
                    self.config.plan_check.min_drift_pct
                );
                let record = CheckRecord::passed(action, started.elapsed(), !regressed, comment);
                self.log(outcome, record, false).await;
                if !regressed {
                    return Stage::Continue;
                }
                info!(table = %report.table, "plan change regressions");
                for trace in &report.traces {
                    info!(trace = %trace, "plan change trace");
                }
                self.reporter.escalate(&report.table).await;
                Stage::Trigger(Trigger::Plan { hanging: false })
            }
            CallOutcome::Hanging => {
                let record = CheckRecord::unsuccessful(
                    action,
                    started.elapsed(),
                    "hang detected during plan change check",
                );
                self.log(outcome, record, true).await;
                Stage::Trigger(Trigger::Plan { hanging: true })
            }
            CallOutcome::Failed(e) => {
                warn!(error = %e, "plan change check failed, database unreachable");
                Stage::Offline
            }
        }
    }

    async fn record(&mut self, outcome: &mut CycleOutcome) {
        self.enter(TrackerState::Recording);
        let started = Instant::now();
        let episode = self.scheduler.run_episode(&self.scope).await;
        outcome.recorded = true;
        outcome.hosts = self.scope.hosts().into_iter().map(str::to_owned).collect();
        outcome.artifacts = episode.artifacts();
        debug!(kinds = ?episode.kinds(), "recording episode finished");
        for report in &episode.reports {
            let record = CheckRecord::note("Recording", Duration::ZERO, report.line.clone());
            self.log(outcome, record, false).await;
        }
        let failed = episode.reports.iter().filter(|r| !r.success).count();
        let summary = CheckRecord::note(
            "Recording Episode",
            started.elapsed(),
            format!(
                "{} repetition(s), {failed} failed, {} file(s)",
                episode.reports.len(),
                outcome.artifacts.len()
            ),
        );
        self.log(outcome, summary, false).await;
    }

    async fn kill(&mut self, rule_id: usize, outcome: &mut CycleOutcome) {
        let Some(rule) = self.rules.iter().find(|r| r.id == rule_id).cloned() else {
            return;
        };
        if rule.kill == KillAction::None {
            return;
        }
        if self.dry_run {
            info!(rule = rule.id, action = ?rule.kill, "dry run, sessions left alone");
            return;
        }
        let started = Instant::now();
        let timeout = self.config.checks.feature_timeout();
        let report = stop_sessions(&rule, &self.guard, &self.executor, timeout).await;
        let comment = format!(
            "{} of {} session(s) stopped{}",
            report.stopped,
            report.matched,
            if report.failures.is_empty() {
                String::new()
            } else {
                format!(", problems: {}", report.failures.join("; "))
            }
        );
        let action = format!("Kill Sessions {}", rule.id);
        let record = CheckRecord::note(action, started.elapsed(), comment);
        self.log(outcome, record, false).await;
    }

    async fn housekeeping(&self) {
        let now = SystemTime::now();
        let output = &self.config.output;
        if let Some(days) = output.output_retention_days {
            if let Err(e) = prune_older_than(&output.output_dir, days, |_| true, now).await {
                warn!(error = %e, "output retention failed");
            }
        }
        if let Some(days) = output.log_retention_days {
            let is_log =
                |name: &str| name.starts_with("sitter") || name.starts_with("critical_features");
            if let Err(e) = prune_older_than(&output.log_dir, days, is_log, now).await {
                warn!(error = %e, "log retention failed");
            }
        }
    }
}
