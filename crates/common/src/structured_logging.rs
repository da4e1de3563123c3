//! Structured logging for the runtime
//!
//! Two outputs: a human-readable `fmt` layer for development and a JSON line
//! layer for production. The JSON layer lifts well-known numeric fields
//! (`duration_ms`, `bytes`, `units`, `transforms_applied`) into a separate
//! `performance` object.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::io::{self, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

use crate::config::LoggingSettings;
use crate::metrics::Histogram;

/// Одна JSON-строка лога
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructuredLogEntry {
    /// RFC 3339
    pub timestamp: String,
    pub level: String,
    pub target: String,
    pub message: String,
    #[serde(flatten)]
    pub fields: HashMap<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<ExecutionContext>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub performance: Option<PerformanceMetrics>,
}

/// Process and thread the event was emitted from
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub app_version: String,
    pub hostname: String,
    pub pid: u32,
    pub thread_id: String,
    pub thread_name: Option<String>,
    /// Names of the enclosing spans, outermost first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub spans: Vec<String>,
}

impl Default for ExecutionContext {
    fn default() -> Self {
        let current = std::thread::current();
        Self {
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            hostname: hostname::get()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "unknown".to_string()),
            pid: std::process::id(),
            thread_id: format!("{:?}", current.id()),
            thread_name: current.name().map(str::to_string),
            spans: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub duration_ms: Option<u64>,
    pub bytes: Option<u64>,
    pub units_processed: Option<u64>,
    pub transforms_applied: Option<u64>,
}

impl PerformanceMetrics {
    fn from_fields(fields: &HashMap<String, Value>) -> Option<Self> {
        let field = |name: &str| fields.get(name).and_then(Value::as_u64);
        let metrics = Self {
            duration_ms: field("duration_ms"),
            bytes: field("bytes"),
            units_processed: field("units"),
            transforms_applied: field("transforms_applied"),
        };
        (metrics != Self::default()).then_some(metrics)
    }
}

/// JSON line layer. Writes through any `MakeWriter`, stdout by default.
pub struct JsonFormatter<W = fn() -> io::Stdout> {
    include_context: bool,
    make_writer: W,
}

impl JsonFormatter {
    pub fn new(include_context: bool) -> Self {
        Self {
            include_context,
            make_writer: io::stdout,
        }
    }
}

impl<W> JsonFormatter<W> {
    pub fn with_writer<W2>(self, make_writer: W2) -> JsonFormatter<W2> {
        JsonFormatter {
            include_context: self.include_context,
            make_writer,
        }
    }
}

impl<S, W> Layer<S> for JsonFormatter<W>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    W: for<'w> MakeWriter<'w> + 'static,
{
    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let mut visitor = FieldCollector::default();
        event.record(&mut visitor);

        let context = self.include_context.then(|| {
            let mut context = ExecutionContext::default();
            if let Some(scope) = ctx.event_scope(event) {
                context.spans = scope.from_root().map(|span| span.name().to_string()).collect();
            }
            context
        });

        let entry = StructuredLogEntry {
            timestamp: Utc::now().to_rfc3339(),
            level: event.metadata().level().as_str().to_string(),
            target: event.metadata().target().to_string(),
            message: visitor.message.unwrap_or_default(),
            performance: PerformanceMetrics::from_fields(&visitor.fields),
            fields: visitor.fields,
            context,
        };

        if let Ok(mut line) = serde_json::to_vec(&entry) {
            line.push(b'\n');
            let _ = self.make_writer.make_writer().write_all(&line);
        }
    }
}

#[derive(Default)]
struct FieldCollector {
    message: Option<String>,
    fields: HashMap<String, Value>,
}

impl FieldCollector {
    fn insert(&mut self, field: &Field, value: Value) {
        if field.name() == "message" {
            self.message = Some(match value {
                Value::String(s) => s,
                other => other.to_string(),
            });
        } else {
            self.fields.insert(field.name().to_string(), value);
        }
    }
}

impl Visit for FieldCollector {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.insert(field, Value::String(format!("{value:?}")));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.insert(field, Value::String(value.to_string()));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.insert(field, value.into());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.insert(field, value.into());
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        if let Some(n) = serde_json::Number::from_f64(value) {
            self.insert(field, Value::Number(n));
        }
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.insert(field, value.into());
    }
}

/// Конфигурация для structured logging
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: Level,
    pub json_output: bool,
    /// Only for non-JSON output
    pub color_output: bool,
    pub include_context: bool,
    pub include_line_numbers: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            json_output: false,
            color_output: true,
            include_context: true,
            include_line_numbers: cfg!(debug_assertions),
        }
    }
}

impl LoggingConfig {
    /// Unknown level names fall back to INFO
    pub fn from_settings(settings: &LoggingSettings) -> Self {
        Self {
            level: settings.level.parse().unwrap_or(Level::INFO),
            json_output: settings.json,
            color_output: !settings.json,
            ..Self::default()
        }
    }
}

/// Install the global subscriber. `RUST_LOG` overrides the configured level.
///
/// Fails if a global subscriber is already installed; callers that may
/// initialise twice (tests, embedded hosts) can ignore the error.
pub fn init_structured_logging(config: LoggingConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str()));

    let output: Box<dyn Layer<Registry> + Send + Sync> = if config.json_output {
        Box::new(JsonFormatter::new(config.include_context))
    } else {
        Box::new(
            fmt::layer()
                .with_target(true)
                .with_thread_names(true)
                .with_line_number(config.include_line_numbers)
                .with_ansi(config.color_output)
                .with_span_events(FmtSpan::CLOSE),
        )
    };

    tracing::subscriber::set_global_default(Registry::default().with(output).with(filter))?;
    Ok(())
}

/// Times one named operation and logs the outcome. Optionally feeds the
/// elapsed time into a metrics histogram.
pub struct OperationTimer {
    start: Instant,
    operation: String,
    fields: HashMap<String, Value>,
    histogram: Option<Arc<Histogram>>,
}

impl OperationTimer {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            start: Instant::now(),
            operation: operation.into(),
            fields: HashMap::new(),
            histogram: None,
        }
    }

    pub fn with_histogram(mut self, histogram: Arc<Histogram>) -> Self {
        self.histogram = Some(histogram);
        self
    }

    pub fn add_field(&mut self, key: impl Into<String>, value: impl Serialize) {
        if let Ok(v) = serde_json::to_value(value) {
            self.fields.insert(key.into(), v);
        }
    }

    fn stop(&self) -> Duration {
        let elapsed = self.start.elapsed();
        if let Some(histogram) = &self.histogram {
            histogram.record(elapsed);
        }
        elapsed
    }

    pub fn finish(self) -> Duration {
        let elapsed = self.stop();
        tracing::info!(
            operation = %self.operation,
            duration_ms = elapsed.as_millis() as u64,
            success = true,
            fields = ?self.fields,
            "Operation completed"
        );
        elapsed
    }

    pub fn finish_with_result<T>(self, result: &Result<T, impl std::fmt::Display>) -> Duration {
        let Err(e) = result else {
            return self.finish();
        };
        let elapsed = self.stop();
        tracing::error!(
            operation = %self.operation,
            duration_ms = elapsed.as_millis() as u64,
            success = false,
            error = %e,
            fields = ?self.fields,
            "Operation failed"
        );
        elapsed
    }
}
