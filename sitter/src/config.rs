//! `sitter.toml`: what to watch and what to record.
//!
//! Every section is optional except `[database]`. The loaded file is
//! validated as a whole before the tracking loop starts; problems that need
//! the database (unknown views and columns) surface in the first cycle.

use std::path::{Path, PathBuf};
use std::time::Duration;

use dbkeeper::config::{load_toml, ConnectionConfig};
use dbkeeper::logging::LogConfig;
use dbkeeper::notify::NotifyConfig;
use dbkeeper::topology::Topology;
use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

use crate::plan::{ChangeKind, PlanFilter};
use crate::probes::CpuCheck;
use crate::recorder::{RecorderKind, RecorderTask, RecordingMode, RteMode, TaskParams};
use crate::rules::{FeatureRule, LimitSpec};
use crate::sessions::KillAction;

/// Configuration problems. All of them stop the sitter.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A setting is out of range or inconsistent with another.
    #[error("invalid configuration: {0}")]
    Invalid(String),

    /// A `[[features]]` entry cannot be turned into a rule.
    #[error("feature rule {rule}: {reason}")]
    MalformedRule {
        /// 1-based rule position.
        rule: usize,
        /// What is wrong.
        reason: String,
    },

    /// The monitoring view does not exist.
    #[error("view {view} does not exist")]
    UnknownView {
        /// View name.
        view: String,
    },

    /// The monitoring view has no such column.
    #[error("view {view} has no column {column}")]
    UnknownColumn {
        /// View name.
        view: String,
        /// Column name.
        column: String,
    },

    /// Host mode needs a HOST column to partition by.
    #[error("host mode needs a HOST column but view {view} has none")]
    MissingHostColumn {
        /// View name.
        view: String,
    },
}

/// `[checks]`: cadence and timeouts.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ChecksConfig {
    /// Sleep between tracking cycles.
    pub check_interval_secs: u64,
    /// Sleep between online tests while the database is down.
    pub online_test_interval_secs: u64,
    /// Ping budget. Zero disables the ping.
    pub ping_timeout_secs: u64,
    /// Budget for each feature sample, kill action and plan query.
    pub feature_timeout_secs: u64,
    /// Budget for the online and primary check.
    pub os_timeout_secs: u64,
    /// After a recording: negative exits, otherwise sleep this long.
    pub after_recording_secs: i64,
    /// Count per host and record only the violating hosts.
    pub host_mode: bool,
    /// Append the rows matching each evaluated rule to the feature log.
    pub log_features: bool,
}

impl Default for ChecksConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 60,
            online_test_interval_secs: 3600,
            ping_timeout_secs: 60,
            feature_timeout_secs: 60,
            os_timeout_secs: 60,
            after_recording_secs: -1,
            host_mode: false,
            log_features: false,
        }
    }
}

impl ChecksConfig {
    /// Budget per feature query.
    pub fn feature_timeout(&self) -> Duration {
        Duration::from_secs(self.feature_timeout_secs)
    }
}

/// One `[[features]]` entry.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FeatureConfig {
    /// Monitoring view in schema `SYS`.
    pub view: String,
    /// Column to match, or `WHERE` to treat `value` as a where clause.
    pub column: String,
    /// Value pattern or where clause.
    pub value: String,
    /// `10`, `"<10"` (at most) or `">10"` (at least).
    pub limit: LimitSpec,
    /// Samples averaged per check.
    #[serde(default = "default_samples")]
    pub samples: u32,
    /// Seconds between samples.
    #[serde(default)]
    pub interval_secs: u64,
    /// What to do with matching sessions on violation.
    #[serde(default)]
    pub kill: KillAction,
    /// Annotation appended to violation messages.
    #[serde(default)]
    pub text: Option<String>,
}

fn default_samples() -> u32 {
    1
}

/// `[plan_check]`: engine or plan regressions.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct PlanCheckConfig {
    /// Run the analysis when nothing else triggered.
    pub enabled: bool,
    /// Drift percent that flags a statement.
    pub min_drift_pct: f64,
    /// Compare engines or plan ids.
    pub change: ChangeKind,
    /// Ignore variants executed fewer times.
    pub min_exec_count: u64,
    /// Ignore variants with less total execution time.
    pub min_total_minutes: u64,
    /// Hours of raw history printed around each flagged variant; 0 = none.
    pub trace_window_hours: u32,
}

impl Default for PlanCheckConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min_drift_pct: 100.0,
            change: ChangeKind::Engine,
            min_exec_count: 0,
            min_total_minutes: 0,
            trace_window_hours: 0,
        }
    }
}

impl PlanCheckConfig {
    /// Thresholds for the analyzer.
    pub fn filter(&self) -> PlanFilter {
        PlanFilter {
            min_drift_pct: self.min_drift_pct,
            min_exec_count: self.min_exec_count,
            min_total_minutes: self.min_total_minutes,
        }
    }
}

/// Repetition plan of one recorder kind.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RepeatConfig {
    /// Repetitions per episode; zero disables the kind.
    pub count: u32,
    /// Seconds between repetitions.
    pub interval_secs: u64,
}

impl Default for RepeatConfig {
    fn default() -> Self {
        Self {
            count: 0,
            interval_secs: 60,
        }
    }
}

/// `[recording.rte]`
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RteConfig {
    /// Repetitions.
    #[serde(flatten)]
    pub repeat: RepeatConfig,
    /// Dump depth.
    pub mode: RteMode,
}

/// `[recording.kernel_profile]`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct KernelProfileConfig {
    /// Repetitions.
    #[serde(flatten)]
    pub repeat: RepeatConfig,
    /// Seconds the profiler runs.
    pub duration_secs: u64,
    /// Profiler wait parameter in milliseconds.
    pub wait_ms: u64,
}

impl Default for KernelProfileConfig {
    fn default() -> Self {
        Self {
            repeat: RepeatConfig::default(),
            duration_secs: 60,
            wait_ms: 0,
        }
    }
}

/// `[recording.custom_query]`
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CustomQueryConfig {
    /// Repetitions.
    #[serde(flatten)]
    pub repeat: RepeatConfig,
    /// SELECT statement whose output is captured.
    pub sql: String,
}

/// `[recording]`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    /// Scheduling discipline.
    pub mode: RecordingMode,
    /// Kinds in priority order; must list all five exactly once.
    pub priority: Vec<RecorderKind>,
    /// Runtime dumps.
    pub rte: RteConfig,
    /// Console call stacks.
    pub callstack: RepeatConfig,
    /// Index server stack snapshots.
    pub gstack: RepeatConfig,
    /// Kernel profiler traces.
    pub kernel_profile: KernelProfileConfig,
    /// Custom query output.
    pub custom_query: CustomQueryConfig,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            mode: RecordingMode::Sequential,
            priority: RecorderKind::ALL.to_vec(),
            rte: RteConfig::default(),
            callstack: RepeatConfig::default(),
            gstack: RepeatConfig::default(),
            kernel_profile: KernelProfileConfig::default(),
            custom_query: CustomQueryConfig::default(),
        }
    }
}

impl RecordingConfig {
    /// Whether any kind is enabled.
    pub fn any_enabled(&self) -> bool {
        self.tasks().iter().any(|t| t.repeat_count > 0)
    }

    /// One task per kind, disabled ones included.
    pub fn tasks(&self) -> Vec<RecorderTask> {
        let task = |kind, repeat: &RepeatConfig, params| RecorderTask {
            kind,
            repeat_count: repeat.count,
            interval: Duration::from_secs(repeat.interval_secs),
            params,
        };
        vec![
            task(
                RecorderKind::Rte,
                &self.rte.repeat,
                TaskParams::Rte {
                    mode: self.rte.mode,
                },
            ),
            task(RecorderKind::CallStack, &self.callstack, TaskParams::None),
            task(RecorderKind::GStack, &self.gstack, TaskParams::None),
            task(
                RecorderKind::KernelProfile,
                &self.kernel_profile.repeat,
                TaskParams::KernelProfile {
                    duration: Duration::from_secs(self.kernel_profile.duration_secs),
                    wait_ms: self.kernel_profile.wait_ms,
                },
            ),
            task(
                RecorderKind::CustomQuery,
                &self.custom_query.repeat,
                TaskParams::CustomQuery {
                    sql: self.custom_query.sql.clone(),
                },
            ),
        ]
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = self.priority.clone();
        seen.sort();
        seen.dedup();
        if self.priority.len() != RecorderKind::ALL.len() || seen.len() != RecorderKind::ALL.len() {
            return Err(ConfigError::Invalid(
                "recording.priority must list each of the five recorder kinds exactly once".into(),
            ));
        }
        let sql = self.custom_query.sql.trim();
        if self.custom_query.repeat.count == 0 && !sql.is_empty() {
            return Err(ConfigError::Invalid(
                "recording.custom_query.sql is set but its count is zero".into(),
            ));
        }
        if self.custom_query.repeat.count > 0
            && !sql.get(..6).is_some_and(|head| head.eq_ignore_ascii_case("select"))
        {
            return Err(ConfigError::Invalid(
                "recording.custom_query.sql must be a SELECT statement".into(),
            ));
        }
        Ok(())
    }
}

/// `[output]`: where files go and how long they stay.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Recorder artifacts.
    pub output_dir: PathBuf,
    /// Log files and the feature log.
    pub log_dir: PathBuf,
    /// Delete artifacts older than this many days.
    pub output_retention_days: Option<u32>,
    /// Delete log files older than this many days.
    pub log_retention_days: Option<u32>,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("/tmp/sitter_output"),
            log_dir: PathBuf::from("/tmp/sitter_output"),
            output_retention_days: None,
            log_retention_days: None,
        }
    }
}

/// The whole `sitter.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct SitterConfig {
    /// Database and shell access.
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Monitored instance.
    pub database: Topology,
    /// Escalation receivers.
    #[serde(default)]
    pub notify: NotifyConfig,
    /// Cadence and timeouts.
    #[serde(default)]
    pub checks: ChecksConfig,
    /// CPU check.
    #[serde(default)]
    pub cpu: CpuCheck,
    /// Threshold rules, checked in order.
    #[serde(default)]
    pub features: Vec<FeatureConfig>,
    /// Plan-change analysis.
    #[serde(default)]
    pub plan_check: PlanCheckConfig,
    /// Recorders.
    #[serde(default)]
    pub recording: RecordingConfig,
    /// Files.
    #[serde(default)]
    pub output: OutputConfig,
    /// Log filter and file output.
    #[serde(default)]
    pub logging: LogConfig,
}

impl SitterConfig {
    /// Load, normalize and validate a sitter config file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or wraps the
    /// [`ConfigError`] found by validation.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let mut config: Self = load_toml(path)?;
        config.database = config.database.normalized();
        config
            .validate()
            .map_err(|e| anyhow::anyhow!("invalid config at {}: {e}", path.display()))?;
        Ok(config)
    }

    /// Check every setting that does not need the database.
    ///
    /// # Errors
    ///
    /// Returns the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.connection.validate().map_err(ConfigError::Invalid)?;
        self.database.validate().map_err(ConfigError::Invalid)?;
        self.notify.validate().map_err(ConfigError::Invalid)?;
        self.cpu.validate().map_err(ConfigError::Invalid)?;
        self.recording.validate()?;
        self.feature_rules()?;

        let checks = &self.checks;
        if checks.host_mode && !self.database.is_scale_out() {
            warn!("host_mode is set on a single-host system and has no effect");
        }
        if checks.host_mode && checks.log_features {
            return Err(ConfigError::Invalid(
                "log_features cannot be combined with host_mode".into(),
            ));
        }
        if checks.host_mode && self.recording.gstack.count > 0 {
            return Err(ConfigError::Invalid(
                "gstack recording is not supported in host_mode".into(),
            ));
        }
        if checks.log_features && self.features.is_empty() {
            return Err(ConfigError::Invalid(
                "log_features is set but no feature rule is configured".into(),
            ));
        }
        if self.plan_check.enabled && self.plan_check.min_drift_pct < 0.0 {
            return Err(ConfigError::Invalid(
                "plan_check.min_drift_pct must not be negative".into(),
            ));
        }

        let kills = self.features.iter().any(|f| f.kill != KillAction::None);
        if !self.recording.any_enabled()
            && !kills
            && !checks.log_features
            && self.notify.receivers.is_empty()
        {
            return Err(ConfigError::Invalid(
                "nothing to do: no recorder, kill action, feature log or e-mail receiver".into(),
            ));
        }
        Ok(())
    }

    /// Build the rules from `[[features]]`, numbered from 1.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MalformedRule`] for the first bad entry.
    pub fn feature_rules(&self) -> Result<Vec<FeatureRule>, ConfigError> {
        let host_scoped = self.checks.host_mode && self.database.is_scale_out();
        self.features
            .iter()
            .enumerate()
            .map(|(index, feature)| {
                FeatureRule::from_config(index.saturating_add(1), feature, host_scoped)
            })
            .collect()
    }
}
