//! Tests for kill actions on violating rules.

mod support;

use std::time::Duration;

use sitter::config::FeatureConfig;
use sitter::deadline::DeadlineGuard;
use sitter::rules::{FeatureRule, LimitSpec};
use sitter::sessions::{stop_sessions, KillAction};
use support::{FakeExecutor, Reply};

const TIMEOUT: Duration = Duration::from_secs(5);

fn rule(kill: KillAction) -> FeatureRule {
    let config = FeatureConfig {
        view: "M_ACTIVE_STATEMENTS".to_owned(),
        column: "APPLICATION_USER_NAME".to_owned(),
        value: "BATCH".to_owned(),
        limit: LimitSpec::Count(0),
        samples: 1,
        interval_secs: 0,
        kill,
        text: None,
    };
    FeatureRule::from_config(2, &config, false).expect("valid rule")
}

#[tokio::test(start_paused = true)]
async fn none_does_nothing() {
    let executor = FakeExecutor::new();
    let report = stop_sessions(
        &rule(KillAction::None),
        &DeadlineGuard::new(),
        &executor.as_dyn(),
        TIMEOUT,
    )
    .await;
    assert_eq!(report.matched, 0);
    assert!(executor.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn disconnects_matching_sessions() {
    let executor = FakeExecutor::new()
        .on("view_column_name = 'CONNECTION_ID'", Reply::count(1))
        .on("select distinct CONNECTION_ID", Reply::rows(&[&["200101"], &["200102"]]))
        .on_seq("CONNECTION_ID = '200101'", vec![Reply::count(1), Reply::count(0)])
        .on("CONNECTION_ID = '200102'", Reply::count(0))
        .on("ALTER SYSTEM", Reply::Rows(Vec::new()));

    let report = stop_sessions(
        &rule(KillAction::Disconnect),
        &DeadlineGuard::new(),
        &executor.as_dyn(),
        TIMEOUT,
    )
    .await;

    assert_eq!(report.matched, 2);
    assert_eq!(report.stopped, 1);
    assert!(report.failures.is_empty());
    assert_eq!(
        executor.calls_containing("ALTER SYSTEM"),
        vec!["ALTER SYSTEM DISCONNECT SESSION '200101'"]
    );
    let lookup = executor.calls_containing("select distinct CONNECTION_ID");
    assert!(lookup[0].contains("APPLICATION_USER_NAME = 'BATCH'"));
}

#[tokio::test(start_paused = true)]
async fn view_without_connection_column_only_warns() {
    let executor = FakeExecutor::new().on("view_column_name = 'CONNECTION_ID'", Reply::count(0));
    let report = stop_sessions(
        &rule(KillAction::Cancel),
        &DeadlineGuard::new(),
        &executor.as_dyn(),
        TIMEOUT,
    )
    .await;
    assert_eq!(report.matched, 0);
    assert_eq!(report.failures.len(), 1);
    assert!(executor.calls_containing("ALTER SYSTEM").is_empty());
}

#[tokio::test(start_paused = true)]
async fn failed_statement_is_recorded_and_next_session_tried() {
    let executor = FakeExecutor::new()
        .on("view_column_name = 'CONNECTION_ID'", Reply::count(1))
        .on("select distinct CONNECTION_ID", Reply::rows(&[&["1"], &["2"]]))
        .on("CONNECTION_ID = '1'", Reply::count(1))
        .on("CONNECTION_ID = '2'", Reply::count(1))
        .on("SESSION '1'", Reply::Fail("insufficient privilege".to_owned()))
        .on("SESSION '2'", Reply::Rows(Vec::new()));

    let report = stop_sessions(
        &rule(KillAction::Cancel),
        &DeadlineGuard::new(),
        &executor.as_dyn(),
        TIMEOUT,
    )
    .await;

    assert_eq!(report.matched, 2);
    assert_eq!(report.stopped, 0);
    assert_eq!(report.failures.len(), 1);
    assert!(report.failures[0].contains("insufficient privilege"));
    assert_eq!(executor.calls_containing("ALTER SYSTEM CANCEL").len(), 2);
}

#[tokio::test(start_paused = true)]
async fn hanging_step_stops_the_action() {
    let executor = FakeExecutor::new()
        .on("view_column_name = 'CONNECTION_ID'", Reply::count(1))
        .on("select distinct CONNECTION_ID", Reply::rows(&[&["1"], &["2"]]))
        .on("CONNECTION_ID = '1'", Reply::Hang);

    let report = stop_sessions(
        &rule(KillAction::Cancel),
        &DeadlineGuard::new(),
        &executor.as_dyn(),
        TIMEOUT,
    )
    .await;

    assert_eq!(report.failures.len(), 1);
    assert!(executor.calls_containing("CONNECTION_ID = '2'").is_empty());
}
