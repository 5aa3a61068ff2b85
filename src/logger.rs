use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram};
use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
use opentelemetry_otlp::{LogExporter, MetricExporter, Protocol, WithExportConfig};
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::{logs::SdkLoggerProvider, metrics::SdkMeterProvider};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Registry, fmt as tracing_fmt};

pub const LOG_FILE_NAME: &str = "manager_store.log";
const SERVICE_NAME: &str = "langpong";

/// What log levels are supported?
/// Higher‐value variants are more severe.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, PartialOrd, Ord, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace = 0,
    Debug = 1,
    #[default]
    Info = 2,
    Warn = 3,
    Error = 4,
    Critical = 5,
}

impl LogLevel {
    /// The `EnvFilter` directive for this level. `tracing` has no critical level.
    pub fn as_directive(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error | LogLevel::Critical => "error",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogLevel::Critical => "critical",
            other => other.as_directive(),
        };
        f.write_str(name)
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(level: &str) -> Result<Self, Self::Err> {
        match level.to_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            "critical" => Ok(LogLevel::Critical),
            other => Err(format!("unknown log level `{other}`")),
        }
    }
}

/// Keeps the background log writer and the OTLP providers alive.
/// Dropping it flushes whatever is still buffered.
pub struct LogGuard {
    _file: WorkerGuard,
    logger_provider: Option<SdkLoggerProvider>,
    meter_provider: Option<SdkMeterProvider>,
}

impl Drop for LogGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.logger_provider.take() {
            let _ = provider.shutdown();
        }
        if let Some(provider) = self.meter_provider.take() {
            let _ = provider.shutdown();
        }
    }
}

/// Install the global subscriber:
/// - stdout, human readable
/// - `<log_dir>/manager_store.log`, rolled daily, no ansi
/// - optionally an OTLP bridge for logs plus an OTLP metrics exporter
pub fn init_tracing(log_dir: &Path, log_level: LogLevel, otel_endpoint: Option<&str>) -> Result<LogGuard> {
    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("could not create log directory {}", log_dir.display()))?;

    let file_appender = RollingFileAppender::new(Rotation::DAILY, log_dir, LOG_FILE_NAME);
    let (file_writer, file_guard) = tracing_appender::non_blocking(file_appender);
    let file_layer = tracing_fmt::layer()
        .with_writer(file_writer)
        .with_ansi(false)
        .with_filter(EnvFilter::new(log_level.as_directive()));

    let stdout_layer = tracing_fmt::layer()
        .with_thread_names(true)
        .with_filter(EnvFilter::new(log_level.as_directive()));

    let (logger_provider, meter_provider) = match otel_endpoint {
        Some(endpoint) => {
            let logger_provider = init_logs(endpoint)?;
            let meter_provider = init_metrics(endpoint)?;
            global::set_meter_provider(meter_provider.clone());
            (Some(logger_provider), Some(meter_provider))
        }
        None => (None, None),
    };

    let otel_layer = logger_provider.as_ref().map(|provider| {
        let filter = EnvFilter::new(log_level.as_directive())
            .add_directive("hyper=off".parse().expect("static directive"))
            .add_directive("tonic=off".parse().expect("static directive"))
            .add_directive("h2=off".parse().expect("static directive"))
            .add_directive("reqwest=off".parse().expect("static directive"));
        OpenTelemetryTracingBridge::new(provider).with_filter(filter)
    });

    Registry::default()
        .with(file_layer)
        .with(stdout_layer)
        .with(otel_layer)
        .try_init()
        .context("a global tracing subscriber is already installed")?;

    Ok(LogGuard { _file: file_guard, logger_provider, meter_provider })
}

static RESOURCE: OnceLock<Resource> = OnceLock::new();
fn get_resource() -> Resource {
    RESOURCE
        .get_or_init(|| Resource::builder().with_service_name(SERVICE_NAME).build())
        .clone()
}

fn init_logs(end_point: &str) -> Result<SdkLoggerProvider> {
    let exporter = LogExporter::builder()
        .with_http()
        .with_protocol(Protocol::HttpBinary)
        .with_endpoint(end_point)
        .build()
        .context("could not build the OTLP log exporter")?;
    Ok(SdkLoggerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(get_resource())
        .build())
}

fn init_metrics(end_point: &str) -> Result<SdkMeterProvider> {
    let exporter = MetricExporter::builder()
        .with_http()
        .with_protocol(Protocol::HttpBinary)
        .with_endpoint(end_point)
        .build()
        .context("could not build the OTLP metric exporter")?;
    Ok(SdkMeterProvider::builder()
        .with_periodic_exporter(exporter)
        .with_resource(get_resource())
        .build())
}

/// Task level counters and latency, recorded on the global meter.
/// Without an installed meter provider these are no-ops.
#[derive(Clone)]
pub struct TaskMetrics {
    pub tasks_started: Counter<u64>,
    pub tasks_succeeded: Counter<u64>,
    pub tasks_failed: Counter<u64>,
    pub task_latency_ms: Histogram<f64>,
}

impl TaskMetrics {
    pub fn new() -> Self {
        let meter = global::meter(SERVICE_NAME);
        Self {
            tasks_started: meter
                .u64_counter("tasks_started")
                .with_description("Tasks handed to an engine")
                .build(),
            tasks_succeeded: meter.u64_counter("tasks_succeeded").build(),
            tasks_failed: meter.u64_counter("tasks_failed").build(),
            task_latency_ms: meter
                .f64_histogram("task_latency_ms")
                .with_description("Latency per task in ms")
                .with_unit("ms")
                .build(),
        }
    }

    pub fn record_outcome(&self, kind: &'static str, ok: bool, elapsed_ms: f64) {
        let attrs = [opentelemetry::KeyValue::new("kind", kind)];
        self.task_latency_ms.record(elapsed_ms, &attrs);
        if ok {
            self.tasks_succeeded.add(1, &attrs);
        } else {
            self.tasks_failed.add(1, &attrs);
        }
    }
}

impl Default for TaskMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TaskMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TaskMetrics")
    }
}
