//! Cheap checks run at the top of every cycle: CPU load, the online and
//! primary precondition, and the database ping.

use std::sync::Arc;
use std::time::Duration;

use dbkeeper::gateway::{GatewayError, ProcessLauncher, QueryExecutor};
use dbkeeper::liveness::{self, Liveness};
use dbkeeper::topology::Topology;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::deadline::{CallOutcome, DeadlineGuard, ProbeCategory};

/// Slack on top of the sampling window before a `sar` run counts as hung.
const SAR_SLACK: Duration = Duration::from_secs(30);

/// Which CPU figure the CPU check compares.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CpuKind {
    /// No CPU check.
    #[default]
    None,
    /// User CPU.
    User,
    /// System CPU.
    System,
    /// User and system CPU, each against the same limit.
    Both,
}

/// One figure read from `sar`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CpuReading {
    /// [`CpuKind::User`] or [`CpuKind::System`].
    pub kind: CpuKind,
    /// Average percent over the sampling window.
    pub percent: f64,
    /// Whether it exceeded the limit.
    pub tripped: bool,
}

/// Parse the requested figures from `sar -u` output.
///
/// User CPU is the second and system CPU the fourth column after
/// `Average:`.
pub fn parse_sar(output: &str, kind: CpuKind) -> Result<Vec<(CpuKind, f64)>, GatewayError> {
    let words: Vec<&str> = output.split_whitespace().collect();
    let Some(average) = words.iter().position(|w| *w == "Average:") else {
        return Err(GatewayError::Output("sar output has no Average line".into()));
    };
    let columns: &[(CpuKind, usize)] = match kind {
        CpuKind::None => &[],
        CpuKind::User => &[(CpuKind::User, 2)],
        CpuKind::System => &[(CpuKind::System, 4)],
        CpuKind::Both => &[(CpuKind::User, 2), (CpuKind::System, 4)],
    };
    columns
        .iter()
        .map(|(figure, offset)| {
            let word = words
                .get(average.saturating_add(*offset))
                .ok_or_else(|| GatewayError::Output("sar Average line is too short".into()))?;
            let percent = word
                .replace(',', ".")
                .parse::<f64>()
                .map_err(|_| GatewayError::Output(format!("sar value '{word}' is not a number")))?;
            Ok((*figure, percent))
        })
        .collect()
}

/// `[cpu]` section: trip a recording when the host is saturated.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CpuCheck {
    /// Figure to watch.
    pub kind: CpuKind,
    /// `sar` samples per check.
    pub samples: u32,
    /// Seconds between `sar` samples.
    pub interval_secs: u64,
    /// Allowed average percent; 100 disables the check.
    pub max_percent: u32,
}

impl Default for CpuCheck {
    fn default() -> Self {
        Self {
            kind: CpuKind::None,
            samples: 0,
            interval_secs: 0,
            max_percent: 100,
        }
    }
}

impl CpuCheck {
    /// Whether the check does anything.
    pub fn is_enabled(&self) -> bool {
        self.kind != CpuKind::None && self.samples > 0 && self.max_percent < 100
    }

    /// Validate parameter consistency.
    pub fn validate(&self) -> Result<(), String> {
        if self.kind == CpuKind::None {
            return Ok(());
        }
        if self.max_percent > 100 {
            return Err(format!("cpu.max_percent {} is above 100", self.max_percent));
        }
        if self.samples > 0 && self.interval_secs == 0 {
            return Err("cpu.interval_secs must be positive when cpu.samples is set".into());
        }
        Ok(())
    }

    /// `sar` invocation: interval first, then the sample count.
    pub fn sar_command(&self) -> String {
        format!("sar -u {} {}", self.interval_secs, self.samples)
    }

    /// Budget for one `sar` run.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
            .saturating_mul(self.samples)
            .saturating_add(SAR_SLACK)
    }

    /// Sample the CPU once and compare against the limit.
    pub async fn run(
        &self,
        guard: &DeadlineGuard,
        launcher: &Arc<dyn ProcessLauncher>,
    ) -> CallOutcome<Vec<CpuReading>> {
        let kind = self.kind;
        let limit = f64::from(self.max_percent);
        match guard
            .run(ProbeCategory::Os, self.timeout(), launcher, self.sar_command())
            .await
        {
            CallOutcome::Completed(output) => match parse_sar(&output, kind) {
                Ok(figures) => CallOutcome::Completed(
                    figures
                        .into_iter()
                        .map(|(kind, percent)| CpuReading {
                            kind,
                            percent,
                            tripped: percent > limit,
                        })
                        .collect(),
                ),
                Err(e) => CallOutcome::Failed(e),
            },
            CallOutcome::Hanging => CallOutcome::Hanging,
            CallOutcome::Failed(e) => CallOutcome::Failed(e),
        }
    }
}

/// Query used to ping the database.
pub const PING_SQL: &str = "select * from dummy";

/// What the ping found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingOutcome {
    /// Answered with the dummy row.
    Responsive,
    /// Did not answer within the timeout.
    Hanging,
    /// Kept failing for longer than the timeout.
    Offline,
}

fn is_dummy_row(rows: &[dbkeeper::gateway::Row]) -> bool {
    matches!(rows, [row] if row.len() == 1 && row[0].trim() == "X")
}

/// Ping the database.
///
/// A failing ping is retried every tenth of `timeout` until the retries
/// have used up the whole timeout. A zero timeout disables the ping.
pub async fn ping(
    guard: &DeadlineGuard,
    executor: &Arc<dyn QueryExecutor>,
    timeout: Duration,
) -> PingOutcome {
    if timeout.is_zero() {
        return PingOutcome::Responsive;
    }
    let retry_every = timeout.checked_div(10).unwrap_or(Duration::ZERO);
    let mut waited = Duration::ZERO;
    loop {
        match guard.query(ProbeCategory::Ping, timeout, executor, PING_SQL).await {
            CallOutcome::Completed(rows) if is_dummy_row(&rows) => {
                return PingOutcome::Responsive;
            }
            CallOutcome::Completed(rows) => {
                debug!(rows = rows.len(), "unexpected ping answer");
            }
            CallOutcome::Hanging => return PingOutcome::Hanging,
            CallOutcome::Failed(e) => debug!(error = %e, "ping failed"),
        }
        if waited > timeout {
            warn!(waited_ms = waited.as_millis(), "ping kept failing, database is offline");
            return PingOutcome::Offline;
        }
        tokio::time::sleep(retry_every).await;
        waited = waited.saturating_add(retry_every);
    }
}

/// Online and primary check through the deadline guard.
pub async fn online(
    guard: &DeadlineGuard,
    launcher: &Arc<dyn ProcessLauncher>,
    topology: &Topology,
    timeout: Duration,
) -> CallOutcome<Liveness> {
    let launcher = Arc::clone(launcher);
    let topology = topology.clone();
    guard
        .call(ProbeCategory::Os, timeout, async move {
            liveness::check(launcher.as_ref(), &topology).await
        })
        .await
}
