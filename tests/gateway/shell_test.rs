//! Tests for the shell process launcher.

use dbkeeper::gateway::shell::ShellLauncher;
use dbkeeper::gateway::{GatewayError, ProcessLauncher};

#[tokio::test]
async fn captures_stdout_without_trailing_newline() {
    let launcher = ShellLauncher::new("/bin/sh");
    assert_eq!(launcher.run("echo hello").await.ok().as_deref(), Some("hello"));
}

#[tokio::test]
async fn nonzero_exit_with_output_still_returns_output() {
    let launcher = ShellLauncher::new("/bin/sh");
    let out = launcher.run("echo partial; exit 3").await;
    assert_eq!(out.ok().as_deref(), Some("partial"));
}

#[tokio::test]
async fn nonzero_exit_without_output_is_an_error() {
    let launcher = ShellLauncher::new("/bin/sh");
    assert!(matches!(
        launcher.run("echo oops >&2; exit 4").await,
        Err(GatewayError::NonZeroExit { code: Some(4), .. })
    ));
}

#[tokio::test]
async fn command_line_goes_through_the_shell() {
    let launcher = ShellLauncher::new("/bin/sh");
    let out = launcher.run("printf 'a b c' | wc -w").await;
    assert_eq!(out.ok().map(|s| s.trim().to_owned()).as_deref(), Some("3"));
}
