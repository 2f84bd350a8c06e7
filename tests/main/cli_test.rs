//! CLI contract tests.

use assert_cmd::Command;

const CONFIG: &str = r#"
[database]
sid = "HB1"
instance_number = "00"
local_host = "hana01"
communication_port = 30001

[housekeeping]
alert_retention_days = 30
audit_log_retention_days = 90
"#;

#[test]
fn help_lists_subcommands() {
    let output = Command::cargo_bin("dbcleaner")
        .expect("binary")
        .arg("--help")
        .output()
        .expect("run");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("run"));
    assert!(stdout.contains("plan"));
}

#[test]
fn plan_prints_rendered_statements() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let path = tmp.path().join("dbcleaner.toml");
    std::fs::write(&path, CONFIG).expect("write config");

    let output = Command::cargo_bin("dbcleaner")
        .expect("binary")
        .args(["plan", "--config"])
        .arg(&path)
        .output()
        .expect("run");
    assert!(output.status.success());

    let stdout = String::from_utf8_lossy(&output.stdout);
    let plan: serde_json::Value = serde_json::from_str(&stdout).expect("json");
    let tasks = plan.as_array().expect("array");
    assert_eq!(tasks.len(), 2);
    assert_eq!(tasks[0]["task"], "alerts");
    assert!(tasks[1]["statement"]
        .as_str()
        .is_some_and(|s| s.starts_with("ALTER SYSTEM CLEAR AUDIT LOG UNTIL")));
}

#[test]
fn config_without_tasks_is_rejected() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let path = tmp.path().join("dbcleaner.toml");
    let without_tasks = CONFIG
        .replace("alert_retention_days = 30\n", "")
        .replace("audit_log_retention_days = 90\n", "");
    std::fs::write(&path, without_tasks).expect("write config");

    let output = Command::cargo_bin("dbcleaner")
        .expect("binary")
        .args(["plan", "--config"])
        .arg(&path)
        .output()
        .expect("run");
    assert!(!output.status.success());
}
