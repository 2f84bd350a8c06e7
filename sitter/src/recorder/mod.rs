//! Diagnostic recorders and the scheduler that runs them.
//!
//! A recording episode runs every enabled [`RecorderTask`] `repeat_count`
//! times under one of three [`RecordingMode`]s. Repetitions are never
//! retried; a failed repetition is reported and the episode goes on.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::scope::HostScope;

pub mod console;

/// Kinds of diagnostic capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
pub enum RecorderKind {
    /// Runtime environment dump.
    #[serde(rename = "rte")]
    Rte,
    /// Thread call stacks from the database console.
    #[serde(rename = "callstack")]
    CallStack,
    /// OS stack snapshot of the index server process.
    #[serde(rename = "gstack")]
    GStack,
    /// Kernel profiler trace.
    #[serde(rename = "kernel_profile")]
    KernelProfile,
    /// Output of a configured query.
    #[serde(rename = "custom_query")]
    CustomQuery,
}

impl RecorderKind {
    /// Every kind, in the default priority order.
    pub const ALL: [Self; 5] = [
        Self::Rte,
        Self::CallStack,
        Self::GStack,
        Self::KernelProfile,
        Self::CustomQuery,
    ];

    /// Name used in report lines.
    pub fn label(self) -> &'static str {
        match self {
            Self::Rte => "RTE Dump Record",
            Self::CallStack => "Call Stack Record",
            Self::GStack => "GStack Record",
            Self::KernelProfile => "Kernel Profiler",
            Self::CustomQuery => "Custom Query Record",
        }
    }

    /// Whether a repetition runs once per host in scope.
    ///
    /// The stack snapshot targets the local process and the custom query
    /// runs through the SQL connection, so both run once.
    pub fn is_host_scoped(self) -> bool {
        !matches!(self, Self::GStack | Self::CustomQuery)
    }
}

/// How repetitions of different kinds are interleaved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordingMode {
    /// Every repetition of one kind before the next kind.
    #[default]
    Sequential,
    /// One repetition of each active kind per round.
    RoundRobin,
    /// Like round robin, with a round's repetitions running concurrently.
    Parallel,
}

/// Depth of a runtime environment dump.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RteMode {
    /// Full dump.
    #[default]
    Normal,
    /// Short stacks and threads plus selected statistics-registry sections.
    Light,
}

/// Kind-specific parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskParams {
    /// Nothing beyond the kind.
    None,
    /// Runtime dump depth.
    Rte {
        /// Dump depth.
        mode: RteMode,
    },
    /// Kernel profiler capture window.
    KernelProfile {
        /// How long the profiler runs.
        duration: Duration,
        /// Profiler wait parameter in milliseconds.
        wait_ms: u64,
    },
    /// Query whose output is captured.
    CustomQuery {
        /// Statement text.
        sql: String,
    },
}

/// One kind of recording with its repetition plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecorderTask {
    /// What to record.
    pub kind: RecorderKind,
    /// Repetitions per episode; zero disables the kind.
    pub repeat_count: u32,
    /// Pause after each repetition except the last.
    pub interval: Duration,
    /// Kind-specific parameters.
    pub params: TaskParams,
}

/// Result of one repetition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RepetitionReport {
    /// What was recorded.
    pub kind: RecorderKind,
    /// Zero-based repetition index.
    pub repetition: u32,
    /// Whether every sub-operation succeeded.
    pub success: bool,
    /// Files written.
    pub artifacts: Vec<PathBuf>,
    /// One-line summary.
    pub line: String,
}

/// Performs one repetition of a recording task.
#[async_trait]
pub trait Recorder: Send + Sync {
    /// Record once, targeting `scope` for host-scoped kinds.
    async fn record(
        &self,
        task: &RecorderTask,
        repetition: u32,
        scope: &HostScope,
    ) -> RepetitionReport;
}

/// Everything one episode produced.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EpisodeReport {
    /// Reports in execution order (priority order within a parallel round).
    pub reports: Vec<RepetitionReport>,
    /// Concurrent workers per round; empty unless parallel.
    pub round_sizes: Vec<usize>,
}

impl EpisodeReport {
    /// Kinds in the order they were reported.
    pub fn kinds(&self) -> Vec<RecorderKind> {
        self.reports.iter().map(|r| r.kind).collect()
    }

    /// Every artifact written.
    pub fn artifacts(&self) -> Vec<PathBuf> {
        self.reports
            .iter()
            .flat_map(|r| r.artifacts.iter().cloned())
            .collect()
    }
}

/// Runs recording episodes.
pub struct Scheduler {
    recorder: Arc<dyn Recorder>,
    mode: RecordingMode,
    tasks: Vec<Arc<RecorderTask>>,
}

impl Scheduler {
    /// Order `tasks` by `priority` and keep the enabled ones.
    ///
    /// Kinds missing from `priority` follow in their default order.
    pub fn new(
        recorder: Arc<dyn Recorder>,
        mode: RecordingMode,
        priority: &[RecorderKind],
        tasks: Vec<RecorderTask>,
    ) -> Self {
        let rank = |kind: RecorderKind| {
            priority
                .iter()
                .position(|p| *p == kind)
                .unwrap_or_else(|| priority.len().saturating_add(kind as usize))
        };
        let mut tasks: Vec<RecorderTask> =
            tasks.into_iter().filter(|t| t.repeat_count > 0).collect();
        tasks.sort_by_key(|t| rank(t.kind));
        Self {
            recorder,
            mode,
            tasks: tasks.into_iter().map(Arc::new).collect(),
        }
    }

    /// Enabled kinds in priority order.
    pub fn kinds(&self) -> Vec<RecorderKind> {
        self.tasks.iter().map(|t| t.kind).collect()
    }

    /// Run one episode to completion.
    pub async fn run_episode(&self, scope: &HostScope) -> EpisodeReport {
        info!(
            mode = ?self.mode,
            kinds = ?self.kinds(),
            hosts = ?scope.hosts(),
            "recording episode started"
        );
        let report = match self.mode {
            RecordingMode::Sequential => self.run_sequential(scope).await,
            RecordingMode::RoundRobin => self.run_round_robin(scope).await,
            RecordingMode::Parallel => self.run_parallel(scope).await,
        };
        info!(repetitions = report.reports.len(), "recording episode finished");
        report
    }

    fn rounds(&self) -> u32 {
        self.tasks.iter().map(|t| t.repeat_count).max().unwrap_or(0)
    }

    async fn run_sequential(&self, scope: &HostScope) -> EpisodeReport {
        let mut episode = EpisodeReport::default();
        for task in &self.tasks {
            for repetition in 0..task.repeat_count {
                let report = self.recorder.record(task, repetition, scope).await;
                episode.reports.push(report);
                pause_after(task, repetition).await;
            }
        }
        episode
    }

    async fn run_round_robin(&self, scope: &HostScope) -> EpisodeReport {
        let mut episode = EpisodeReport::default();
        for round in 0..self.rounds() {
            for task in self.tasks.iter().filter(|t| t.repeat_count > round) {
                let report = self.recorder.record(task, round, scope).await;
                episode.reports.push(report);
                pause_after(task, round).await;
            }
        }
        episode
    }

    async fn run_parallel(&self, scope: &HostScope) -> EpisodeReport {
        let mut episode = EpisodeReport::default();
        let scope = Arc::new(scope.clone());

        for round in 0..self.rounds() {
            // A fresh set per round, sized to the kinds still active.
            let mut workers = JoinSet::new();
            for (rank, task) in self.tasks.iter().enumerate() {
                if task.repeat_count <= round {
                    continue;
                }
                let recorder = Arc::clone(&self.recorder);
                let task = Arc::clone(task);
                let scope = Arc::clone(&scope);
                workers.spawn(async move {
                    let report = recorder.record(&task, round, &scope).await;
                    pause_after(&task, round).await;
                    (rank, report)
                });
            }
            episode.round_sizes.push(workers.len());

            let mut finished = Vec::with_capacity(workers.len());
            while let Some(joined) = workers.join_next().await {
                match joined {
                    Ok(done) => finished.push(done),
                    Err(e) => warn!(round, error = %e, "recording worker failed"),
                }
            }
            finished.sort_by_key(|(rank, _)| *rank);
            episode
                .reports
                .extend(finished.into_iter().map(|(_, report)| report));
        }
        episode
    }
}

async fn pause_after(task: &RecorderTask, repetition: u32) {
    if repetition.saturating_add(1) < task.repeat_count && !task.interval.is_zero() {
        tokio::time::sleep(task.interval).await;
    }
}
