//! Coverage for config parsing and path resolution.

use std::io::Write;
use std::path::Path;

use dbkeeper::config::{config_dir, load_toml, resolve_config_path, ConnectionConfig};
use dbkeeper::housekeeping::CleanerConfig;

fn write_config(contents: &str) -> tempfile::NamedTempFile {
    let mut file = match tempfile::NamedTempFile::new() {
        Ok(file) => file,
        Err(err) => panic!("temp file should be created: {err}"),
    };
    if let Err(err) = file.write_all(contents.as_bytes()) {
        panic!("temp file should be writable: {err}");
    }
    file
}

#[test]
fn config_dir_resolves() {
    let path = match config_dir() {
        Ok(path) => path,
        Err(err) => panic!("config dir should resolve: {err}"),
    };
    assert!(path.ends_with(".dbkeeper"));
}

#[test]
fn default_path_uses_file_name() {
    let path = match resolve_config_path(None, "dbcleaner.toml") {
        Ok(path) => path,
        Err(err) => panic!("default path should resolve: {err}"),
    };
    assert!(path.ends_with(".dbkeeper/dbcleaner.toml"));
}

#[test]
fn connection_defaults_fill_missing_keys() {
    let parsed = toml::from_str::<ConnectionConfig>("user_key = \"CLEANKEY\"");
    let connection = match parsed {
        Ok(connection) => connection,
        Err(err) => panic!("connection should parse: {err}"),
    };
    assert_eq!(connection.user_key, "CLEANKEY");
    assert_eq!(connection.sql_client, "hdbsql");
    assert_eq!(connection.shell, "/bin/bash");
    assert!(!connection.ssl);
}

#[test]
fn empty_user_key_rejected() {
    let connection = ConnectionConfig {
        user_key: "  ".to_owned(),
        ..ConnectionConfig::default()
    };
    assert!(connection.validate().is_err());
}

#[test]
fn load_reports_the_path_on_parse_errors() {
    let file = write_config("[database\nsid = ");
    let err = match load_toml::<CleanerConfig>(file.path()) {
        Ok(_) => panic!("broken toml should not parse"),
        Err(err) => err,
    };
    assert!(err.to_string().contains("failed to parse config"));
}

#[test]
fn load_missing_file_fails() {
    assert!(load_toml::<CleanerConfig>(Path::new("/nonexistent/dbcleaner.toml")).is_err());
}

#[test]
fn cleaner_config_loads_and_normalizes_hosts() {
    let file = write_config(
        r#"
[connection]
user_key = "CLEANKEY"

[database]
sid = "HB1"
instance_number = "00"
local_host = "hana1"
communication_port = 30003

[notify]
receivers = ["ops@example.com"]

[housekeeping]
alert_retention_days = 30
output_sql = true
"#,
    );
    let config = match CleanerConfig::load(file.path()) {
        Ok(config) => config,
        Err(err) => panic!("config should load: {err}"),
    };
    assert_eq!(config.database.hosts, vec!["hana1"]);
    assert_eq!(config.housekeeping.alert_retention_days, Some(30));
    assert!(config.housekeeping.execute_sql);
    assert_eq!(config.housekeeping.interval_days, -1);
}

#[test]
fn cleaner_config_without_tasks_is_rejected() {
    let file = write_config(
        r#"
[database]
sid = "HB1"
instance_number = "00"
local_host = "hana1"
communication_port = 30003
"#,
    );
    let err = match CleanerConfig::load(file.path()) {
        Ok(_) => panic!("config without tasks should be rejected"),
        Err(err) => err,
    };
    assert!(err.to_string().contains("no housekeeping task is enabled"));
}

#[test]
fn local_host_must_be_listed() {
    let file = write_config(
        r#"
[database]
sid = "HB1"
instance_number = "00"
local_host = "hana9"
hosts = ["hana1", "hana2"]
communication_port = 30003

[housekeeping]
audit_log_retention_days = 90
"#,
    );
    assert!(CleanerConfig::load(file.path()).is_err());
}
