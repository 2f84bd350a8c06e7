//! Production recorder driving the database console and OS tools.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Local;
use dbkeeper::gateway::{ProcessLauncher, QueryExecutor};
use dbkeeper::topology::Topology;
use tracing::{debug, info, warn};

use super::{Recorder, RecorderKind, RecorderTask, RepetitionReport, RteMode, TaskParams};
use crate::scope::HostScope;

/// Statistics-registry sections appended to a light runtime dump.
pub const LIGHT_RTE_SECTIONS: [&str; 6] = [
    "M_JOBEXECUTORS_",
    "M_DEV_JOBEX_THREADGROUPS",
    "M_DEV_JOBEXWAITING",
    "M_DEV_CONTEXTS",
    "M_CONNECTIONS",
    "M_DEV_SESSION_PARTITIONS",
];

/// Marker the console prints when a profiler command fails.
const CONSOLE_ERROR_MARKER: &str = "[ERROR]";

const DEFAULT_PROFILE_DURATION: Duration = Duration::from_secs(60);
const DEFAULT_PROFILE_WAIT_MS: u64 = 0;

/// Records through `hdbcons`, `gstack` and the SQL client, writing one file
/// per repetition and host into the output directory.
pub struct ConsoleRecorder {
    launcher: Arc<dyn ProcessLauncher>,
    executor: Arc<dyn QueryExecutor>,
    topology: Topology,
    output_dir: PathBuf,
    sequence: AtomicU64,
}

/// Text captured from one command plus whether it succeeded.
struct Capture {
    text: String,
    ok: bool,
}

impl ConsoleRecorder {
    /// Recorder writing into `output_dir`.
    pub fn new(
        launcher: Arc<dyn ProcessLauncher>,
        executor: Arc<dyn QueryExecutor>,
        topology: Topology,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            launcher,
            executor,
            topology,
            output_dir: output_dir.into(),
            sequence: AtomicU64::new(0),
        }
    }

    /// Console command line addressing `host`.
    ///
    /// Single-host systems talk to the local console directly. Scale-out
    /// systems route through `distribute exec`, and multitenant systems go
    /// through the name server.
    pub fn console_command(&self, host: &str, command: &str) -> String {
        let port = self.topology.communication_port;
        if self.topology.multitenant {
            format!("hdbcons -e hdbnameserver \"distribute exec {host}:{port} {command}\"")
        } else if self.topology.is_scale_out() {
            format!("hdbcons \"distribute exec {host}:{port} {command}\"")
        } else {
            format!("hdbcons \"{command}\"")
        }
    }

    /// Deterministic artifact path: stem, host, system, port, tenant,
    /// timestamp and a process-wide sequence number.
    pub fn artifact_path(&self, stem: &str, host: Option<&str>, extension: &str) -> PathBuf {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let timestamp = Local::now().format("%Y-%m-%d_%H-%M-%S");
        let host = host.map(|h| format!("{h}_")).unwrap_or_default();
        let name = format!(
            "{stem}_{host}{sid}_{port}_{tenant}{timestamp}_{sequence}.{extension}",
            sid = self.topology.sid,
            port = self.topology.communication_port,
            tenant = self.topology.tenant_infix(),
        );
        self.output_dir.join(name)
    }

    async fn capture(&self, command_line: &str) -> Capture {
        debug!(command = command_line, "recorder command");
        match self.launcher.run(command_line).await {
            Ok(text) => Capture { text, ok: true },
            Err(e) => {
                warn!(command = command_line, error = %e, "recorder command failed");
                Capture {
                    text: format!("{CONSOLE_ERROR_MARKER} {command_line}: {e}\n"),
                    ok: false,
                }
            }
        }
    }

    /// Write `contents` and report whether it landed.
    async fn write(&self, path: &Path, contents: &str) -> bool {
        match tokio::fs::write(path, contents).await {
            Ok(()) => true,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "could not write artifact");
                false
            }
        }
    }

    async fn record_rte(&self, host: &str, mode: RteMode) -> (bool, Vec<PathBuf>) {
        let (stem, dump) = match mode {
            RteMode::Normal => ("rtedump_normal", "runtimedump dump -c"),
            RteMode::Light => ("rtedump_light", "runtimedump dump -c -s STACK_SHORT,THREADS"),
        };
        let mut capture = self.capture(&self.console_command(host, dump)).await;
        if mode == RteMode::Light {
            for section in LIGHT_RTE_SECTIONS {
                let command = format!("statreg print -h -n {section}");
                let part = self.capture(&self.console_command(host, &command)).await;
                capture.text.push_str(&part.text);
                capture.ok &= part.ok;
            }
        }
        let path = self.artifact_path(stem, Some(host), "trc");
        let written = self.write(&path, &capture.text).await;
        (capture.ok && written, vec![path])
    }

    async fn record_call_stack(&self, host: &str) -> (bool, Vec<PathBuf>) {
        let capture = self
            .capture(&self.console_command(host, "context list -s"))
            .await;
        let path = self.artifact_path("callstack", Some(host), "txt");
        let written = self.write(&path, &capture.text).await;
        (capture.ok && written, vec![path])
    }

    async fn record_gstack(&self) -> (bool, Vec<PathBuf>) {
        let pgrep = self.capture("pgrep hdbindexserver").await;
        let pids: Vec<&str> = pgrep
            .text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && line.chars().all(|c| c.is_ascii_digit()))
            .collect();
        if pids.is_empty() {
            warn!("no indexserver process found for gstack");
            let path = self.artifact_path("gstack", None, "txt");
            let text = format!("{}{CONSOLE_ERROR_MARKER} no indexserver process\n", pgrep.text);
            self.write(&path, &text).await;
            return (false, vec![path]);
        }

        let mut ok = true;
        let mut artifacts = Vec::with_capacity(pids.len());
        for pid in pids {
            let capture = self.capture(&format!("gstack {pid}")).await;
            let path = self.artifact_path(&format!("gstack_{pid}"), None, "txt");
            ok &= capture.ok && self.write(&path, &capture.text).await;
            artifacts.push(path);
        }
        (ok, artifacts)
    }

    async fn record_kernel_profile(
        &self,
        host: &str,
        duration: Duration,
        wait_ms: u64,
    ) -> (bool, Vec<PathBuf>) {
        let cpu = self.artifact_path(&format!("kernel_profiler_cpu_{host}"), None, "dot");
        let wait = self.artifact_path(&format!("kernel_profiler_wait_{host}"), None, "dot");
        let log_path = self.artifact_path(&format!("kernel_profiler_output_{host}"), None, "txt");

        let mut log = String::new();
        for command in ["profiler clear".to_string(), format!("profiler start -w {wait_ms}")] {
            log.push_str(&self.capture(&self.console_command(host, &command)).await.text);
        }
        tokio::time::sleep(duration).await;
        let print = format!("profiler print -o {},{}", cpu.display(), wait.display());
        for command in ["profiler stop".to_string(), print, "profiler clear".to_string()] {
            log.push_str(&self.capture(&self.console_command(host, &command)).await.text);
        }

        let mut artifacts = Vec::with_capacity(3);
        for dot in [cpu, wait] {
            if tokio::fs::try_exists(&dot).await.unwrap_or(false) {
                artifacts.push(dot);
            } else {
                warn!(host, path = %dot.display(), "profiler graph missing");
                log.push_str(&format!(
                    "{CONSOLE_ERROR_MARKER} {} was not produced\n",
                    dot.display()
                ));
            }
        }
        let ok = !log.contains(CONSOLE_ERROR_MARKER);
        let written = self.write(&log_path, &log).await;
        artifacts.insert(0, log_path);
        (ok && written, artifacts)
    }

    async fn record_custom_query(&self, sql: Option<&str>) -> (bool, Vec<PathBuf>) {
        let path = self.artifact_path("custom_sql", None, "txt");
        let Some(sql) = sql else {
            warn!("custom query recorder has no statement");
            self.write(&path, &format!("{CONSOLE_ERROR_MARKER} no statement\n")).await;
            return (false, vec![path]);
        };
        let (text, ok) = match self.executor.query(sql).await {
            Ok(rows) => {
                let mut text = String::new();
                for row in rows {
                    text.push_str(&row.join(" | "));
                    text.push('\n');
                }
                (text, true)
            }
            Err(e) => {
                warn!(error = %e, "custom query failed");
                (format!("{CONSOLE_ERROR_MARKER} {e}\n"), false)
            }
        };
        let written = self.write(&path, &text).await;
        (ok && written, vec![path])
    }
}

#[async_trait]
impl Recorder for ConsoleRecorder {
    async fn record(
        &self,
        task: &RecorderTask,
        repetition: u32,
        scope: &HostScope,
    ) -> RepetitionReport {
        let mut success = true;
        let mut artifacts = Vec::new();
        let hosts = scope.hosts();

        if task.kind.is_host_scoped() {
            for host in &hosts {
                let (ok, files) = match task.kind {
                    RecorderKind::Rte => {
                        let mode = match task.params {
                            TaskParams::Rte { mode } => mode,
                            _ => RteMode::Normal,
                        };
                        self.record_rte(host, mode).await
                    }
                    RecorderKind::KernelProfile => {
                        let (duration, wait_ms) = match task.params {
                            TaskParams::KernelProfile { duration, wait_ms } => (duration, wait_ms),
                            _ => (DEFAULT_PROFILE_DURATION, DEFAULT_PROFILE_WAIT_MS),
                        };
                        self.record_kernel_profile(host, duration, wait_ms).await
                    }
                    _ => self.record_call_stack(host).await,
                };
                success &= ok;
                artifacts.extend(files);
            }
        } else {
            let (ok, files) = if task.kind == RecorderKind::CustomQuery {
                let sql = match &task.params {
                    TaskParams::CustomQuery { sql } => Some(sql.as_str()),
                    _ => None,
                }
                .filter(|sql| !sql.trim().is_empty());
                self.record_custom_query(sql).await
            } else {
                self.record_gstack().await
            };
            success = ok;
            artifacts = files;
        }

        let status = if success { "done" } else { "failed" };
        let target = if task.kind.is_host_scoped() {
            hosts.join(",")
        } else {
            self.topology.local_host.clone()
        };
        let line = format!(
            "{} {}/{} {status} on {target}: {} file(s)",
            task.kind.label(),
            repetition.saturating_add(1),
            task.repeat_count,
            artifacts.len(),
        );
        info!(
            kind = ?task.kind,
            repetition,
            success,
            files = artifacts.len(),
            "recording done"
        );
        RepetitionReport {
            kind: task.kind,
            repetition,
            success,
            artifacts,
            line,
        }
    }
}
