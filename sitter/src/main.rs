//! `sitter` CLI entry point.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use dbkeeper::config::resolve_config_path;
use dbkeeper::gateway::hdbsql::HdbsqlExecutor;
use dbkeeper::gateway::shell::ShellLauncher;
use dbkeeper::gateway::{ProcessLauncher, QueryExecutor};
use dbkeeper::{logging, notify};
use sitter::config::SitterConfig;
use sitter::recorder::console::ConsoleRecorder;
use sitter::rules::MatchMode;
use sitter::tracker::Tracker;

/// Watch a database and record diagnostics when it misbehaves.
#[derive(Parser)]
#[command(name = "sitter", version, about)]
struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

/// Available CLI subcommands.
#[derive(Subcommand)]
enum Command {
    /// Track until stopped (or until the first recording, if configured).
    Start {
        /// Config file (default `~/.dbkeeper/sitter.toml`).
        #[arg(long)]
        config: Option<PathBuf>,
        /// Run a single cycle and print its outcome.
        #[arg(long)]
        once: bool,
    },
    /// Run one cycle without recording or stopping sessions; print JSON.
    Check {
        /// Config file (default `~/.dbkeeper/sitter.toml`).
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Print the compiled feature rules as JSON.
    Rules {
        /// Config file (default `~/.dbkeeper/sitter.toml`).
        #[arg(long)]
        config: Option<PathBuf>,
        /// Test value-match rules against this column value.
        #[arg(long)]
        sample: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Start { config, once } => handle_start(config, once).await,
        Command::Check { config } => handle_check(config).await,
        Command::Rules { config, sample } => handle_rules(config, sample.as_deref()),
    }
}

fn load(config: Option<PathBuf>) -> anyhow::Result<SitterConfig> {
    let path = resolve_config_path(config.as_deref(), "sitter.toml")?;
    SitterConfig::load(&path).with_context(|| format!("failed to load {}", path.display()))
}

async fn build_tracker(config: SitterConfig) -> anyhow::Result<Tracker> {
    tokio::fs::create_dir_all(&config.output.output_dir)
        .await
        .with_context(|| format!("failed to create {}", config.output.output_dir.display()))?;

    let launcher: Arc<dyn ProcessLauncher> =
        Arc::new(ShellLauncher::new(config.connection.shell.clone()));
    let executor: Arc<dyn QueryExecutor> = Arc::new(HdbsqlExecutor::new(
        config.connection.sql_client.clone(),
        config.connection.user_key.clone(),
        config.connection.ssl,
    ));
    let recorder = Arc::new(ConsoleRecorder::new(
        Arc::clone(&launcher),
        Arc::clone(&executor),
        config.database.clone(),
        config.output.output_dir.clone(),
    ));
    let notifier = notify::from_config(&config.notify);
    Tracker::new(config, executor, launcher, recorder, notifier)
}

fn handle_rules(config: Option<PathBuf>, sample: Option<&str>) -> anyhow::Result<()> {
    logging::init_cli();
    let config = load(config)?;
    let rules: Vec<serde_json::Value> = config
        .feature_rules()?
        .iter()
        .map(|rule| {
            let matches_sample = match (&rule.match_mode, sample) {
                (MatchMode::ValueMatch { .. }, Some(sample)) => {
                    rule.predicate.matches(&|_: &str| Some(sample.to_owned()))
                }
                _ => None,
            };
            serde_json::json!({
                "rule": rule.id,
                "view": rule.view,
                "where": rule.where_clause(),
                "check": rule.info(),
                "kill": format!("{:?}", rule.kill).to_lowercase(),
                "matches_sample": matches_sample,
            })
        })
        .collect();
    println!("{}", serde_json::to_string_pretty(&rules)?);
    Ok(())
}

async fn handle_check(config: Option<PathBuf>) -> anyhow::Result<()> {
    logging::init_cli();
    let config = load(config)?;
    let mut tracker = build_tracker(config).await?;
    tracker.set_dry_run(true);
    let outcome = tracker.run_cycle().await?;
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(())
}

async fn handle_start(config: Option<PathBuf>, once: bool) -> anyhow::Result<()> {
    let config = load(config)?;
    let _logging_guard =
        logging::init_production(&config.output.log_dir, "sitter", &config.logging)?;

    let checks = config.checks.clone();
    let online_pause = Duration::from_secs(checks.online_test_interval_secs);
    let check_pause = Duration::from_secs(checks.check_interval_secs);
    info!(
        sid = %config.database.sid,
        hosts = ?config.database.hosts,
        rules = config.features.len(),
        mode = ?config.recording.mode,
        "sitter started"
    );
    let mut tracker = build_tracker(config).await?;

    let mut was_online = true;
    loop {
        let outcome = tracker.run_cycle().await?;
        if once {
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            break;
        }

        if outcome.went_offline {
            if was_online {
                tracker
                    .reporter()
                    .escalate(&format!(
                        "The instance is not online or not primary. Next check in {} seconds.",
                        online_pause.as_secs()
                    ))
                    .await;
            }
            was_online = false;
            if !pause(online_pause).await {
                break;
            }
            continue;
        }
        if !was_online {
            tracker
                .reporter()
                .escalate("The instance is online and primary again, tracking resumed.")
                .await;
            was_online = true;
        }

        let next = if outcome.recorded {
            match u64::try_from(checks.after_recording_secs) {
                Ok(secs) => Duration::from_secs(secs),
                Err(_) => {
                    info!("recording done, exiting");
                    break;
                }
            }
        } else {
            check_pause
        };
        if !pause(next).await {
            break;
        }
    }

    Ok(())
}

/// Sleep unless interrupted; `false` means stop.
async fn pause(duration: Duration) -> bool {
    tokio::select! {
        () = tokio::time::sleep(duration) => true,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, shutting down");
            false
        }
    }
}
