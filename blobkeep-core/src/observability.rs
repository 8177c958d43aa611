/*!
Observability setup for blobkeep.

- Structured logging through `tracing`, written to stderr so that commands
  streaming object data to stdout stay clean
- Prometheus metrics for service operations (with the `metrics` feature)
*/

#[cfg(feature = "metrics")]
use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};
#[cfg(feature = "metrics")]
use std::sync::OnceLock;
#[cfg(feature = "metrics")]
use std::time::Instant;
use tracing::subscriber::set_global_default;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry as TracingRegistry};

use crate::{BackupError, Result};

/// Directive applied on top of `RUST_LOG`.
pub const DEFAULT_DIRECTIVE: &str = "blobkeep=info";

/// Global metrics instance; `None` if registration failed.
#[cfg(feature = "metrics")]
static METRICS: OnceLock<Option<BackupMetrics>> = OnceLock::new();

/// Metrics collection for backup service operations
///
/// Every series carries an `operation` label (`backup`, `delete`, `reader`,
/// `write`).
#[cfg(feature = "metrics")]
#[derive(Debug)]
pub struct BackupMetrics {
    pub operations_total: IntCounterVec,
    pub errors_total: IntCounterVec,
    pub latency_seconds: HistogramVec,

    // Prometheus registry for scraping
    registry: Registry,
}

#[cfg(feature = "metrics")]
impl BackupMetrics {
    fn new() -> Result<Self> {
        let registry = Registry::new();

        let operations_total = IntCounterVec::new(
            Opts::new(
                "blobkeep_operations_total",
                "Total backup service operations started",
            ),
            &["operation"],
        )
        .map_err(|e| BackupError::storage(format!("Failed to create operations_total metric: {e}")))?;

        let errors_total = IntCounterVec::new(
            Opts::new(
                "blobkeep_errors_total",
                "Total backup service operations that returned an error",
            ),
            &["operation"],
        )
        .map_err(|e| BackupError::storage(format!("Failed to create errors_total metric: {e}")))?;

        let latency_seconds = HistogramVec::new(
            HistogramOpts::new(
                "blobkeep_operation_latency_seconds",
                "Duration of backup service operations in seconds",
            ),
            &["operation"],
        )
        .map_err(|e| BackupError::storage(format!("Failed to create latency_seconds metric: {e}")))?;

        registry
            .register(Box::new(operations_total.clone()))
            .map_err(|e| BackupError::storage(format!("Failed to register operations_total: {e}")))?;
        registry
            .register(Box::new(errors_total.clone()))
            .map_err(|e| BackupError::storage(format!("Failed to register errors_total: {e}")))?;
        registry
            .register(Box::new(latency_seconds.clone()))
            .map_err(|e| BackupError::storage(format!("Failed to register latency_seconds: {e}")))?;

        Ok(Self {
            operations_total,
            errors_total,
            latency_seconds,
            registry,
        })
    }

    /// Get or initialize the global metrics instance
    pub fn global() -> Option<&'static BackupMetrics> {
        METRICS
            .get_or_init(|| match Self::new() {
                Ok(metrics) => Some(metrics),
                Err(e) => {
                    tracing::warn!(error = %e, "Metrics disabled");
                    None
                }
            })
            .as_ref()
    }

    pub fn record_operation(&self, operation: &str) {
        self.operations_total.with_label_values(&[operation]).inc();
    }

    pub fn record_error(&self, operation: &str) {
        self.errors_total.with_label_values(&[operation]).inc();
    }

    pub fn record_latency(&self, operation: &str, duration: std::time::Duration) {
        self.latency_seconds
            .with_label_values(&[operation])
            .observe(duration.as_secs_f64());
    }

    /// Gather metrics in Prometheus format
    pub fn gather_metrics(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| BackupError::storage(format!("Failed to encode metrics: {e}")))?;

        String::from_utf8(buffer)
            .map_err(|e| BackupError::storage(format!("Failed to convert metrics to string: {e}")))
    }
}

/// Prometheus text export of the global metrics.
#[cfg(feature = "metrics")]
pub fn gather_metrics() -> Result<String> {
    match BackupMetrics::global() {
        Some(metrics) => metrics.gather_metrics(),
        None => Err(BackupError::storage("metrics are not initialized")),
    }
}

/// Metrics timer helper for measuring operation durations
#[cfg(feature = "metrics")]
pub struct MetricsTimer {
    start: Instant,
    operation: &'static str,
}

#[cfg(feature = "metrics")]
impl MetricsTimer {
    /// Start a new timer for the given operation
    pub fn new(operation: &'static str) -> Self {
        if let Some(metrics) = BackupMetrics::global() {
            metrics.record_operation(operation);
        }
        Self {
            start: Instant::now(),
            operation,
        }
    }

    /// Complete the timer, recording success latency
    pub fn finish(self) {
        if let Some(metrics) = BackupMetrics::global() {
            metrics.record_latency(self.operation, self.start.elapsed());
        }
    }

    /// Complete the timer with an error, recording both latency and error
    pub fn finish_with_error(self) {
        if let Some(metrics) = BackupMetrics::global() {
            metrics.record_latency(self.operation, self.start.elapsed());
            metrics.record_error(self.operation);
        }
    }

    pub fn finish_for<T>(self, result: &Result<T>) {
        match result {
            Ok(_) => self.finish(),
            Err(_) => self.finish_with_error(),
        }
    }
}

/// Initialize the global tracing subscriber
///
/// Filtering follows `RUST_LOG`, with [`DEFAULT_DIRECTIVE`] added on top.
/// With `json` set, events are emitted as one JSON object per line;
/// otherwise in the compact human-readable format.
///
/// # Errors
/// Fails if a global subscriber is already installed.
pub fn init_observability(json: bool) -> Result<()> {
    #[cfg(feature = "metrics")]
    BackupMetrics::global();

    let directive: Directive = DEFAULT_DIRECTIVE
        .parse()
        .map_err(|e| BackupError::validation(format!("Invalid log directive: {e}")))?;
    let filter = EnvFilter::from_default_env().add_directive(directive);

    let json_layer = json.then(|| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_target(false)
            .with_current_span(false)
    });
    let text_layer = (!json).then(|| {
        tracing_subscriber::fmt::layer()
            .compact()
            .with_writer(std::io::stderr)
    });

    let subscriber = TracingRegistry::default()
        .with(filter)
        .with(json_layer)
        .with(text_layer);

    set_global_default(subscriber).map_err(|e| {
        BackupError::storage(format!("Failed to set global tracing subscriber: {e}"))
    })?;

    tracing::debug!(json, "Observability initialized");
    Ok(())
}
