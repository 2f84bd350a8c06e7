//! Tests for `src/logging.rs`.

use dbkeeper::logging::{LogConfig, LoggingGuard};

#[test]
fn logging_guard_is_send() {
    fn assert_send<T: Send>() {}
    assert_send::<LoggingGuard>();
}

#[test]
fn init_production_creates_logs_dir() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let logs_dir = tmp.path().join("logs");
    assert!(!logs_dir.exists());

    // The global subscriber can be installed once per process; the
    // directory is created before that happens either way.
    let config = LogConfig::default();
    let _result = dbkeeper::logging::init_production(&logs_dir, "dbcleaner", &config);
    assert!(logs_dir.exists(), "logs directory should be created");
}

#[test]
fn console_only_leaves_the_logs_dir_alone() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let logs_dir = tmp.path().join("logs");
    let config = LogConfig {
        json_file: false,
        ..LogConfig::default()
    };

    let _result = dbkeeper::logging::init_production(&logs_dir, "sitter", &config);
    assert!(!logs_dir.exists());
}

#[test]
fn invalid_level_is_rejected() {
    if std::env::var_os("RUST_LOG").is_some() {
        return;
    }
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let config = LogConfig {
        level: "info,dbkeeper=loud".to_owned(),
        json_file: false,
    };

    let err = dbkeeper::logging::init_production(tmp.path(), "sitter", &config)
        .err()
        .expect("invalid level");
    assert!(err.to_string().contains("invalid logging.level"), "{err}");
}

#[test]
fn log_config_defaults_and_overrides() {
    assert_eq!(
        LogConfig::default(),
        LogConfig {
            level: "info".to_owned(),
            json_file: true,
        }
    );

    let config: LogConfig = toml::from_str("level = \"sitter=debug,info\"").expect("toml");
    assert_eq!(config.level, "sitter=debug,info");
    assert!(config.json_file);
}

#[test]
fn init_cli_keeps_the_first_subscriber() {
    dbkeeper::logging::init_cli();
    assert!(!dbkeeper::logging::init_cli());
}
