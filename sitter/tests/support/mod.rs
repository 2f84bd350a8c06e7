//! Fakes shared by the sitter integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dbkeeper::gateway::{GatewayError, ProcessLauncher, QueryExecutor, Row};
use dbkeeper::notify::{Notifier, NotifyError};
use dbkeeper::topology::Topology;
use sitter::recorder::{Recorder, RecorderKind, RecorderTask, RepetitionReport};
use sitter::scope::HostScope;
use tokio::time::Instant;

/// Canned answer to a query or command.
#[derive(Debug, Clone)]
pub enum Reply {
    /// Rows for a query, stdout lines for a command.
    Rows(Vec<Row>),
    /// Raw stdout for a command.
    Text(String),
    /// A gateway error.
    Fail(String),
    /// Never answers.
    Hang,
    /// Answers after a delay.
    Slow(Duration, Box<Reply>),
}

impl Reply {
    pub fn count(n: i64) -> Self {
        Self::Rows(vec![vec![n.to_string()]])
    }

    pub fn rows(rows: &[&[&str]]) -> Self {
        Self::Rows(
            rows.iter()
                .map(|row| row.iter().map(|cell| (*cell).to_owned()).collect())
                .collect(),
        )
    }

    pub fn text(text: &str) -> Self {
        Self::Text(text.to_owned())
    }
}

/// Scripted answers keyed by a substring of the request. The first
/// matching script wins; a script with several replies hands them out in
/// order and repeats the last.
#[derive(Default)]
struct Script {
    entries: Mutex<Vec<(String, VecDeque<Reply>)>>,
    calls: Mutex<Vec<String>>,
}

impl Script {
    fn add(&self, needle: &str, replies: Vec<Reply>) {
        self.entries
            .lock()
            .expect("lock")
            .push((needle.to_owned(), replies.into()));
    }

    fn next(&self, request: &str) -> Option<Reply> {
        self.calls.lock().expect("lock").push(request.to_owned());
        let mut entries = self.entries.lock().expect("lock");
        let (_, replies) = entries
            .iter_mut()
            .find(|(needle, _)| request.contains(needle.as_str()))?;
        if replies.len() > 1 {
            replies.pop_front()
        } else {
            replies.front().cloned()
        }
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("lock").clone()
    }
}

async fn resolve(reply: Reply) -> Result<Vec<Row>, GatewayError> {
    let mut reply = reply;
    loop {
        match reply {
            Reply::Rows(rows) => return Ok(rows),
            Reply::Text(text) => {
                return Ok(text.lines().map(|line| vec![line.to_owned()]).collect());
            }
            Reply::Fail(message) => return Err(GatewayError::Output(message)),
            Reply::Hang => std::future::pending::<()>().await,
            Reply::Slow(delay, inner) => {
                tokio::time::sleep(delay).await;
                reply = *inner;
            }
        }
    }
}

/// Query executor answering from a script.
#[derive(Default)]
pub struct FakeExecutor {
    script: Script,
}

impl FakeExecutor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Answer queries containing `needle` with `reply`.
    pub fn on(self: &Arc<Self>, needle: &str, reply: Reply) -> Arc<Self> {
        self.script.add(needle, vec![reply]);
        Arc::clone(self)
    }

    /// Answer queries containing `needle` with `replies` in order.
    pub fn on_seq(self: &Arc<Self>, needle: &str, replies: Vec<Reply>) -> Arc<Self> {
        self.script.add(needle, replies);
        Arc::clone(self)
    }

    /// Every query received, in order.
    pub fn calls(&self) -> Vec<String> {
        self.script.calls()
    }

    pub fn calls_containing(&self, needle: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|sql| sql.contains(needle))
            .collect()
    }

    pub fn as_dyn(self: &Arc<Self>) -> Arc<dyn QueryExecutor> {
        Arc::clone(self) as Arc<dyn QueryExecutor>
    }
}

#[async_trait]
impl QueryExecutor for FakeExecutor {
    async fn query(&self, sql: &str) -> Result<Vec<Row>, GatewayError> {
        match self.script.next(sql) {
            Some(reply) => resolve(reply).await,
            None => Err(GatewayError::Output(format!("unexpected query: {sql}"))),
        }
    }
}

/// Process launcher answering from a script.
#[derive(Default)]
pub struct FakeLauncher {
    script: Script,
}

impl FakeLauncher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Answer commands containing `needle` with `reply`.
    pub fn on(self: &Arc<Self>, needle: &str, reply: Reply) -> Arc<Self> {
        self.script.add(needle, vec![reply]);
        Arc::clone(self)
    }

    /// Every command received, in order.
    pub fn calls(&self) -> Vec<String> {
        self.script.calls()
    }

    pub fn as_dyn(self: &Arc<Self>) -> Arc<dyn ProcessLauncher> {
        Arc::clone(self) as Arc<dyn ProcessLauncher>
    }
}

#[async_trait]
impl ProcessLauncher for FakeLauncher {
    async fn run(&self, command_line: &str) -> Result<String, GatewayError> {
        let reply = self
            .script
            .next(command_line)
            .ok_or_else(|| GatewayError::Output(format!("unexpected command: {command_line}")))?;
        let rows = resolve(reply).await?;
        let mut out = String::new();
        for row in rows {
            out.push_str(&row.join("|"));
            out.push('\n');
        }
        Ok(out)
    }
}

/// Notifier remembering every message.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<(String, String)>>,
}

impl RecordingNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn bodies(&self) -> Vec<String> {
        self.sent
            .lock()
            .expect("lock")
            .iter()
            .map(|(_, body)| body.clone())
            .collect()
    }

    pub fn count(&self) -> usize {
        self.sent.lock().expect("lock").len()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, subject: &str, body: &str) -> Result<(), NotifyError> {
        self.sent
            .lock()
            .expect("lock")
            .push((subject.to_owned(), body.to_owned()));
        Ok(())
    }
}

/// One call seen by [`FakeRecorder`].
#[derive(Debug, Clone)]
pub struct RecorderCall {
    pub kind: RecorderKind,
    pub repetition: u32,
    pub hosts: Vec<String>,
    pub started: Instant,
    pub finished: Instant,
}

/// Recorder that takes a fixed time per kind and remembers its calls.
#[derive(Default)]
pub struct FakeRecorder {
    durations: Mutex<Vec<(RecorderKind, Duration)>>,
    failing: Mutex<Vec<RecorderKind>>,
    calls: Mutex<Vec<RecorderCall>>,
    running: AtomicUsize,
    max_running: AtomicUsize,
}

impl FakeRecorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_duration(self: &Arc<Self>, kind: RecorderKind, duration: Duration) -> Arc<Self> {
        self.durations.lock().expect("lock").push((kind, duration));
        Arc::clone(self)
    }

    pub fn failing(self: &Arc<Self>, kind: RecorderKind) -> Arc<Self> {
        self.failing.lock().expect("lock").push(kind);
        Arc::clone(self)
    }

    pub fn calls(&self) -> Vec<RecorderCall> {
        self.calls.lock().expect("lock").clone()
    }

    /// Kinds in the order their repetitions started.
    pub fn started_kinds(&self) -> Vec<RecorderKind> {
        let mut calls = self.calls();
        calls.sort_by_key(|c| c.started);
        calls.into_iter().map(|c| c.kind).collect()
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Recorder for FakeRecorder {
    async fn record(
        &self,
        task: &RecorderTask,
        repetition: u32,
        scope: &HostScope,
    ) -> RepetitionReport {
        let started = Instant::now();
        let now_running = self.running.fetch_add(1, Ordering::SeqCst).saturating_add(1);
        self.max_running.fetch_max(now_running, Ordering::SeqCst);

        let duration = self
            .durations
            .lock()
            .expect("lock")
            .iter()
            .find(|(kind, _)| *kind == task.kind)
            .map(|(_, d)| *d);
        if let Some(duration) = duration {
            tokio::time::sleep(duration).await;
        }
        self.running.fetch_sub(1, Ordering::SeqCst);

        let success = !self.failing.lock().expect("lock").contains(&task.kind);
        let hosts: Vec<String> = scope.hosts().into_iter().map(str::to_owned).collect();
        self.calls.lock().expect("lock").push(RecorderCall {
            kind: task.kind,
            repetition,
            hosts: hosts.clone(),
            started,
            finished: Instant::now(),
        });
        RepetitionReport {
            kind: task.kind,
            repetition,
            success,
            artifacts: Vec::new(),
            line: format!("{:?} {repetition} on {}", task.kind, hosts.join(",")),
        }
    }
}

/// Single-host system `HB1`.
pub fn single_host() -> Topology {
    Topology {
        sid: "HB1".to_owned(),
        instance_number: "00".to_owned(),
        local_host: "hana1".to_owned(),
        hosts: vec!["hana1".to_owned()],
        communication_port: 30003,
        multitenant: false,
        tenant: None,
    }
}

/// Three-host scale-out system `HB1`.
pub fn scale_out() -> Topology {
    Topology {
        hosts: vec!["hana1".to_owned(), "hana2".to_owned(), "hana3".to_owned()],
        ..single_host()
    }
}

/// Process list with every service GREEN.
pub const ALL_GREEN: &str = "\
hdbdaemon, HDB Daemon, GREEN, Running, 2024 01 01 10:00:00, 10:00:00, 100
hdbnameserver, HDB Nameserver, GREEN, Running, 2024 01 01 10:00:00, 10:00:00, 101
hdbindexserver, HDB Indexserver-HB1, GREEN, Running, 2024 01 01 10:00:00, 10:00:00, 102
";
