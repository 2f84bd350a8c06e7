//! `dbcleaner` CLI entry point.
//!
//! Runs the configured housekeeping tasks once or on a day interval, or
//! prints the statements a run would execute.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use dbkeeper::config::{config_dir, resolve_config_path};
use dbkeeper::gateway::hdbsql::HdbsqlExecutor;
use dbkeeper::gateway::shell::ShellLauncher;
use dbkeeper::housekeeping::{planned_tasks, CleanerConfig, Housekeeper};
use dbkeeper::liveness::{self, Liveness};
use dbkeeper::{logging, notify};

/// Housekeeping for the statistics schema and system tables.
#[derive(Parser)]
#[command(name = "dbcleaner", version, about)]
struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

/// Available CLI subcommands.
#[derive(Subcommand)]
enum Command {
    /// Run the cleanup tasks.
    Run {
        /// Config file (default `~/.dbkeeper/dbcleaner.toml`).
        #[arg(long)]
        config: Option<PathBuf>,
        /// Count and log, but never execute a cleanup statement.
        #[arg(long)]
        dry_run: bool,
    },
    /// Print the statements a run would execute, as JSON.
    Plan {
        /// Config file (default `~/.dbkeeper/dbcleaner.toml`).
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run { config, dry_run } => handle_run(config, dry_run).await,
        Command::Plan { config } => handle_plan(config),
    }
}

fn load(config: Option<PathBuf>) -> anyhow::Result<CleanerConfig> {
    let path = resolve_config_path(config.as_deref(), "dbcleaner.toml")?;
    CleanerConfig::load(&path).with_context(|| format!("failed to load {}", path.display()))
}

fn handle_plan(config: Option<PathBuf>) -> anyhow::Result<()> {
    logging::init_cli();
    let config = load(config)?;
    let now = chrono::Local::now().naive_local();
    let statements: Vec<serde_json::Value> = planned_tasks(&config.housekeeping)
        .iter()
        .map(|task| {
            serde_json::json!({
                "task": task.name(),
                "count": task.count_sql(),
                "statement": task.render(now),
            })
        })
        .collect();
    println!("{}", serde_json::to_string_pretty(&statements)?);
    Ok(())
}

async fn handle_run(config: Option<PathBuf>, dry_run: bool) -> anyhow::Result<()> {
    let config = load(config)?;
    let logs_dir = match &config.housekeeping.log_dir {
        Some(dir) => dir.clone(),
        None => config_dir()?.join("logs"),
    };
    let _logging_guard = logging::init_production(&logs_dir, "dbcleaner", &config.logging)?;

    let launcher = ShellLauncher::new(config.connection.shell.clone());
    let executor = Arc::new(HdbsqlExecutor::new(
        config.connection.sql_client.clone(),
        config.connection.user_key.clone(),
        config.connection.ssl,
    ));
    let notifier = notify::from_config(&config.notify);
    let subject = format!("Message from dbcleaner about {}", config.database.sid);

    let execute = config.housekeeping.execute_sql && !dry_run;
    let output_sql = config.housekeeping.output_sql || dry_run;
    let housekeeper = Housekeeper::new(executor, execute, output_sql);
    let tasks = planned_tasks(&config.housekeeping);

    info!(sid = %config.database.sid, tasks = tasks.len(), dry_run, "dbcleaner started");

    loop {
        match liveness::check(&launcher, &config.database).await {
            Ok(Liveness::Online) => {
                let now = chrono::Local::now().naive_local();
                let reports = housekeeper.run_all(&tasks, now).await;
                println!("{}", serde_json::to_string_pretty(&reports)?);
                if reports.len() < tasks.len() {
                    let body = format!(
                        "{} of {} cleanup tasks failed on {}, see the dbcleaner log",
                        tasks.len().saturating_sub(reports.len()),
                        tasks.len(),
                        config.database.local_host
                    );
                    if let Err(e) = notifier.notify(&subject, &body).await {
                        warn!(error = %e, "failed to send notification");
                    }
                }
            }
            Ok(state) => warn!(?state, "database is not an online primary, nothing cleaned"),
            Err(e) => warn!(error = %e, "liveness check failed, nothing cleaned"),
        }

        let days = match u64::try_from(config.housekeeping.interval_days) {
            Ok(days) if days > 0 => days,
            _ => break,
        };
        let pause = Duration::from_secs(days.saturating_mul(86_400));
        tokio::select! {
            () = tokio::time::sleep(pause) => {}
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, shutting down");
                break;
            }
        }
    }

    Ok(())
}
