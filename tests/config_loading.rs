use std::io::Write;
use std::time::Duration;

use strand_core::config::AppConfig;

#[test]
fn test_load_full_config_from_file() {
    let toml_content = r#"
[engine]
max_execution_steps = 50
max_execution_time_secs = 30
max_workers = 4
command_poll_interval_ms = 20
max_call_depth = 3

[containers]
max_iterations = 12
max_parallel_iterations = 2

[agent]
max_iterations = 5
tool_timeout_secs = 15

[log]
enabled = true
log_dir = "/tmp/strand-test-logs"
level = 3

[persistence]
sqlite_path = "/tmp/strand-test.db"

[command]
redis_url = "redis://127.0.0.1:6379"
key_prefix = "test:commands"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.engine.max_execution_steps, 50);
    assert_eq!(config.engine.max_call_depth, 3);
    assert_eq!(config.containers.max_iterations, 12);
    assert_eq!(config.containers.max_parallel_iterations, 2);
    assert_eq!(config.agent.max_iterations, 5);
    assert_eq!(config.agent.tool_timeout_secs, 15);

    let limits = config.engine.limits();
    assert_eq!(limits.max_execution_steps, 50);
    assert_eq!(limits.max_execution_time, Duration::from_secs(30));
    assert_eq!(limits.max_workers, 4);
    assert_eq!(limits.command_poll_interval, Duration::from_millis(20));

    let log = config.log.expect("log present");
    assert_eq!(log.level, 3);
    assert_eq!(log.log_dir().to_str(), Some("/tmp/strand-test-logs"));

    assert_eq!(
        config.persistence.expect("persistence present").sqlite_path,
        "/tmp/strand-test.db"
    );
    let command = config.command.expect("command present");
    assert_eq!(command.redis_url.as_deref(), Some("redis://127.0.0.1:6379"));
    assert_eq!(command.key_prefix, "test:commands");
}

#[test]
fn test_env_var_expansion_in_config() {
    std::env::set_var("STRAND_TEST_SQLITE_PATH", "/var/lib/strand/runs.db");

    let toml_content = r#"
[persistence]
sqlite_path = "${STRAND_TEST_SQLITE_PATH}"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");
    assert_eq!(
        config.persistence.map(|p| p.sqlite_path),
        Some("/var/lib/strand/runs.db".to_string())
    );

    std::env::remove_var("STRAND_TEST_SQLITE_PATH");
}

#[test]
fn test_minimal_config_uses_defaults() {
    let toml_content = r#"
[engine]
max_workers = 2
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.engine.max_workers, 2);
    assert_eq!(config.engine.max_execution_steps, 500);
    assert_eq!(config.engine.max_execution_time_secs, 1200);
    assert_eq!(config.engine.command_poll_interval_ms, 100);
    assert_eq!(config.containers.max_iterations, 100);
    assert_eq!(config.agent.max_iterations, 10);
    assert!(config.log.is_none());
    assert!(config.persistence.is_none());
    assert!(config.command.is_none());
}

#[test]
fn test_missing_file_falls_back_to_defaults() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = AppConfig::load_or_default(&dir.path().join("absent.toml")).expect("defaults");
    assert_eq!(config.engine.max_call_depth, 5);
    assert!(AppConfig::load(&dir.path().join("absent.toml")).is_err());
}

#[test]
fn test_invalid_toml_is_rejected() {
    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(b"[engine\nmax_workers = ").expect("write toml");
    assert!(AppConfig::load(tmp.path()).is_err());
}
