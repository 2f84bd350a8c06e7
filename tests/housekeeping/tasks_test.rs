//! Statement rendering and task selection.

use chrono::NaiveDate;
use dbkeeper::housekeeping::{planned_tasks, CleanupTask, HousekeepingConfig};

fn noon() -> chrono::NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 3, 15)
        .and_then(|d| d.and_hms_opt(12, 30, 0))
        .expect("valid timestamp")
}

#[test]
fn nothing_enabled_by_default() {
    let config = HousekeepingConfig::default();
    assert!(planned_tasks(&config).is_empty());
    assert!(config.execute_sql);
    assert_eq!(config.interval_days, -1);
}

#[test]
fn tasks_follow_fixed_order() {
    let config = HousekeepingConfig {
        ini_history_retention_days: Some(60),
        alert_retention_days: Some(30),
        ..HousekeepingConfig::default()
    };
    assert_eq!(
        planned_tasks(&config),
        vec![
            CleanupTask::Alerts { days: 30 },
            CleanupTask::IniHistory { days: 60 }
        ]
    );
}

#[test]
fn alerts_statement_uses_add_days() {
    let sql = CleanupTask::Alerts { days: 42 }.render(noon());
    assert_eq!(
        sql,
        "DELETE FROM _SYS_STATISTICS.STATISTICS_ALERTS_BASE WHERE ALERT_TIMESTAMP < ADD_DAYS(CURRENT_TIMESTAMP, -42)"
    );
}

#[test]
fn object_locks_only_touch_unknown_objects() {
    let task = CleanupTask::UnknownObjectLocks { days: 7 };
    assert!(task.render(noon()).contains("OBJECT_NAME = '(unknown)'"));
    assert!(task.count_sql().contains("OBJECT_NAME = '(unknown)'"));
}

#[test]
fn audit_log_and_ini_history_use_absolute_dates() {
    assert_eq!(
        CleanupTask::AuditLog { days: 10 }.render(noon()),
        "ALTER SYSTEM CLEAR AUDIT LOG UNTIL '2024-03-05 12:30:00'"
    );
    assert_eq!(
        CleanupTask::IniHistory { days: 15 }.render(noon()),
        "ALTER SYSTEM CLEAR INIFILE CONTENT HISTORY UNTIL '2024-02-29 12:30:00'"
    );
}

#[test]
fn pending_emails_measured_in_seconds() {
    let sql = CleanupTask::PendingEmails { days: 3 }.render(noon());
    assert!(sql.ends_with("> 3 * 86400"));
}

#[test]
fn config_parses_from_toml() {
    let config: HousekeepingConfig = toml::from_str(
        r"
        alert_retention_days = 30
        output_sql = true
        execute_sql = false
        interval_days = 1
        ",
    )
    .expect("parse");
    assert_eq!(config.alert_retention_days, Some(30));
    assert!(config.output_sql);
    assert!(!config.execute_sql);
    assert_eq!(config.interval_days, 1);
}
