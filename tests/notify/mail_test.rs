//! The mail notifier pipes the body to a client program.

use std::os::unix::fs::PermissionsExt;

use dbkeeper::notify::{
    from_config, LogOnlyNotifier, MailClient, MailNotifier, NotifyConfig, NotifyError, Notifier,
};

fn config() -> NotifyConfig {
    NotifyConfig {
        receivers: vec!["ops@example.com".to_owned()],
        client: MailClient::Mailx,
        sender: None,
        mail_server: None,
    }
}

#[tokio::test]
async fn body_goes_to_stdin_and_subject_to_args() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let args = tmp.path().join("args.txt");
    let body = tmp.path().join("body.txt");
    let client = tmp.path().join("fake_mailx");
    std::fs::write(
        &client,
        format!(
            "#!/bin/sh\nprintf '%s\\n' \"$@\" > '{}'\ncat > '{}'\n",
            args.display(),
            body.display()
        ),
    )
    .expect("write client");
    std::fs::set_permissions(&client, std::fs::Permissions::from_mode(0o755)).expect("chmod");

    let notifier = MailNotifier::new(client.to_string_lossy(), &config());
    notifier
        .notify("Message from sitter about HB1", "Hi Team,\nthe index server hangs")
        .await
        .expect("notify");

    let recorded_args = std::fs::read_to_string(&args).expect("args");
    assert_eq!(
        recorded_args.lines().collect::<Vec<_>>(),
        vec!["-s", "Message from sitter about HB1", "ops@example.com"]
    );
    let recorded_body = std::fs::read_to_string(&body).expect("body");
    assert!(recorded_body.contains("the index server hangs"));
}

#[tokio::test]
async fn failing_client_is_reported() {
    let notifier = MailNotifier::new("false", &config());
    assert!(matches!(
        notifier.notify("s", "b").await,
        Err(NotifyError::Rejected { .. })
    ));
}

#[tokio::test]
async fn log_only_never_fails() {
    assert!(LogOnlyNotifier.notify("s", "b").await.is_ok());
}

#[test]
fn validation_rejects_bad_addresses() {
    let mut config = config();
    assert!(config.validate().is_ok());
    config.receivers.push("not-an-address".to_owned());
    assert!(config.validate().is_err());
}

#[test]
fn client_parses_lowercase() {
    let parsed: NotifyConfig =
        toml::from_str("receivers = []\nclient = \"mutt\"\n").expect("parse");
    assert_eq!(parsed.client, MailClient::Mutt);
    assert_eq!(parsed.client.program(), "mutt");
    // No receivers: falls back to logging only.
    let _notifier = from_config(&parsed);
}
