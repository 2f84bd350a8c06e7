//! Tests for the `hdbsql` executor and its row parser.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use dbkeeper::gateway::hdbsql::{parse_rows, HdbsqlExecutor};
use dbkeeper::gateway::{first_integer, sql_literal, GatewayError, QueryExecutor};

fn write_script(dir: &Path, name: &str, body: &str) -> String {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write script");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).expect("chmod");
    path.to_string_lossy().into_owned()
}

#[test]
fn parses_pipe_separated_rows() {
    let rows = parse_rows("|HOST1   |12 |\n\n|HOST2|7|\n");
    assert_eq!(
        rows,
        vec![
            vec!["HOST1".to_owned(), "12".to_owned()],
            vec!["HOST2".to_owned(), "7".to_owned()],
        ]
    );
}

#[test]
fn bare_value_becomes_single_cell() {
    assert_eq!(parse_rows("  42  \n"), vec![vec!["42".to_owned()]]);
}

#[test]
fn first_integer_rejects_text_and_empty() {
    assert_eq!(first_integer(&[vec!["17".to_owned()]]).ok(), Some(17));
    assert!(matches!(
        first_integer(&[vec!["abc".to_owned()]]),
        Err(GatewayError::Output(_))
    ));
    assert!(matches!(first_integer(&[]), Err(GatewayError::Output(_))));
}

#[test]
fn literal_doubles_quotes() {
    assert_eq!(sql_literal("it's"), "'it''s'");
}

#[test]
fn args_carry_key_and_statement_last() {
    let executor = HdbsqlExecutor::new("hdbsql", "MONKEY", true);
    let args = executor.args("select 1 from dummy");
    assert_eq!(args.first().map(String::as_str), Some("-j"));
    assert!(args.windows(2).any(|w| w[0] == "-U" && w[1] == "MONKEY"));
    assert!(args.contains(&"-ssltrustcert".to_owned()));
    assert_eq!(args.last().map(String::as_str), Some("select 1 from dummy"));
}

#[tokio::test]
async fn runs_client_and_parses_stdout() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let args_file = tmp.path().join("args.txt");
    let program = write_script(
        tmp.path(),
        "fake_hdbsql",
        &format!(
            "printf '%s\\n' \"$@\" > '{}'\nprintf '|X |\\n'",
            args_file.display()
        ),
    );

    let executor = HdbsqlExecutor::new(program, "SYSTEMKEY", false);
    let rows = executor.query("select * from dummy").await.expect("query");
    assert_eq!(rows, vec![vec!["X".to_owned()]]);

    let recorded = std::fs::read_to_string(&args_file).expect("args");
    assert_eq!(recorded.lines().last(), Some("select * from dummy"));
}

#[tokio::test]
async fn nonzero_exit_is_an_error() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let program = write_script(tmp.path(), "failing", "echo 'connection refused' >&2\nexit 3");

    let executor = HdbsqlExecutor::new(program, "SYSTEMKEY", false);
    match executor.query("select * from dummy").await {
        Err(GatewayError::NonZeroExit { code, stderr, .. }) => {
            assert_eq!(code, Some(3));
            assert_eq!(stderr, "connection refused");
        }
        other => panic!("expected NonZeroExit, got {other:?}"),
    }
}

#[tokio::test]
async fn missing_client_is_a_spawn_error() {
    let executor = HdbsqlExecutor::new("/nonexistent/hdbsql", "SYSTEMKEY", false);
    assert!(matches!(
        executor.query("select 1 from dummy").await,
        Err(GatewayError::Spawn { .. })
    ));
}

#[tokio::test]
async fn query_count_reads_first_cell() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let program = write_script(tmp.path(), "counting", "echo 5");
    let executor = HdbsqlExecutor::new(program, "SYSTEMKEY", false);
    assert_eq!(executor.query_count("select count(*) from dummy").await.ok(), Some(5));
}
