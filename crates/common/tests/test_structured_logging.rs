use common::{
    init_structured_logging, ExecutionContext, LoggingConfig, LoggingSettings, OperationTimer,
    PerformanceMetrics, RuntimeConfig, StructuredLogEntry,
};
use serde_json::Value;
use serial_test::serial;
use std::collections::HashMap;
use std::io::Write;
use std::time::Duration;

#[test]
fn test_log_entry_flattens_fields() {
    let mut fields = HashMap::new();
    fields.insert("unit_id".to_string(), Value::String("game/Player".to_string()));
    fields.insert("cache_hit".to_string(), Value::Bool(true));

    let entry = StructuredLogEntry {
        timestamp: chrono::Utc::now().to_rfc3339(),
        level: "INFO".to_string(),
        target: "orchestrator::pipeline".to_string(),
        message: "Unit transformed".to_string(),
        fields,
        context: None,
        performance: None,
    };

    let json: Value = serde_json::to_value(&entry).expect("serialize");
    assert_eq!(json["unit_id"], "game/Player");
    assert_eq!(json["cache_hit"], true);
    assert!(json.get("context").is_none());
    assert!(json.get("performance").is_none());
}

#[test]
fn test_execution_context_describes_current_thread() {
    let handle = std::thread::Builder::new()
        .name("aegis-worker-7".to_string())
        .spawn(ExecutionContext::default)
        .expect("spawn");
    let context = handle.join().expect("join");

    assert_eq!(context.pid, std::process::id());
    assert_eq!(context.thread_name.as_deref(), Some("aegis-worker-7"));
    assert!(!context.hostname.is_empty());
}

#[test]
fn test_performance_metrics_roundtrip() {
    let metrics = PerformanceMetrics {
        duration_ms: Some(12),
        bytes: Some(4096),
        units_processed: Some(1000),
        transforms_applied: None,
    };
    let json = serde_json::to_string(&metrics).expect("serialize");
    let back: PerformanceMetrics = serde_json::from_str(&json).expect("deserialize");
    assert_eq!(back.units_processed, Some(1000));
    assert_eq!(back.transforms_applied, None);
}

#[test]
fn test_logging_config_follows_runtime_config() {
    let mut runtime = RuntimeConfig::production();
    runtime.logging.level = "warn".to_string();

    let config = LoggingConfig::from_settings(&runtime.logging);
    assert_eq!(config.level, tracing::Level::WARN);
    assert!(config.json_output);
}

#[test]
fn test_logging_settings_from_toml_file() {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    writeln!(file, "[logging]\nlevel = \"trace\"\njson = true").expect("write");

    let config = RuntimeConfig::load(file.path()).expect("load");
    assert_eq!(
        config.logging,
        LoggingSettings {
            level: "trace".to_string(),
            json: true,
        }
    );
}

#[test]
fn test_operation_timer_reports_failure() {
    let mut timer = OperationTimer::new("cache.compact");
    timer.add_field("stripes", 16);
    let outcome: Result<(), String> = Err("lock busy".to_string());
    timer.finish_with_result(&outcome);

    let timer = OperationTimer::new("cache.purge");
    std::thread::sleep(Duration::from_millis(2));
    assert!(timer.finish() >= Duration::from_millis(2));
}

/// The global subscriber can only be installed once per process
#[test]
#[serial]
fn test_init_structured_logging_once() {
    let config = LoggingConfig {
        json_output: true,
        include_context: true,
        ..LoggingConfig::default()
    };

    init_structured_logging(config.clone()).expect("first init");
    assert!(init_structured_logging(config).is_err());

    tracing::info!(duration_ms = 5u64, units = 3u64, "Structured event after init");
}
