/*!
Observability infrastructure for Tally.

This module provides:
- Structured logging setup (`tracing-subscriber`, plain text or JSON)
- Prometheus counters about Tally itself (`metrics` feature)

The `record_*` helpers are always available and compile to no-ops when the
`metrics` feature is disabled, so call sites never need feature gates.
*/

#[cfg(feature = "metrics")]
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
#[cfg(feature = "metrics")]
use std::sync::OnceLock;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::{Result, TallyError};

/// Global metrics instance; `None` if registration failed
#[cfg(feature = "metrics")]
static METRICS: OnceLock<Option<TallyMetrics>> = OnceLock::new();

/// Counters describing ingestion, snapshotting and delivery
#[cfg(feature = "metrics")]
#[derive(Debug)]
pub struct TallyMetrics {
    /// Requests handled by the ingest service, labelled by front door
    pub ingest_requests_total: IntCounterVec,
    /// Requests rejected by the ingest service, labelled by front door
    pub ingest_errors_total: IntCounterVec,
    /// Metric records accepted into storage
    pub ingested_records_total: IntCounter,

    pub snapshot_flushes_total: IntCounter,
    pub snapshot_failures_total: IntCounter,

    pub delivery_attempts_total: IntCounter,
    pub delivery_failures_total: IntCounter,

    registry: Registry,
}

#[cfg(feature = "metrics")]
fn metric_error(name: &str, e: prometheus::Error) -> TallyError {
    TallyError::storage(format!("Failed to create {name} metric: {e}"))
}

#[cfg(feature = "metrics")]
impl TallyMetrics {
    fn new() -> Result<Self> {
        let registry = Registry::new();

        let ingest_requests_total = IntCounterVec::new(
            Opts::new("tally_ingest_requests_total", "Ingest requests handled"),
            &["transport"],
        )
        .map_err(|e| metric_error("ingest_requests_total", e))?;

        let ingest_errors_total = IntCounterVec::new(
            Opts::new("tally_ingest_errors_total", "Ingest requests rejected"),
            &["transport"],
        )
        .map_err(|e| metric_error("ingest_errors_total", e))?;

        let ingested_records_total = IntCounter::new(
            "tally_ingested_records_total",
            "Metric records merged into storage",
        )
        .map_err(|e| metric_error("ingested_records_total", e))?;

        let snapshot_flushes_total =
            IntCounter::new("tally_snapshot_flushes_total", "Snapshot files written")
                .map_err(|e| metric_error("snapshot_flushes_total", e))?;

        let snapshot_failures_total =
            IntCounter::new("tally_snapshot_failures_total", "Snapshot writes that failed")
                .map_err(|e| metric_error("snapshot_failures_total", e))?;

        let delivery_attempts_total = IntCounter::new(
            "tally_delivery_attempts_total",
            "Batches the agent tried to deliver",
        )
        .map_err(|e| metric_error("delivery_attempts_total", e))?;

        let delivery_failures_total = IntCounter::new(
            "tally_delivery_failures_total",
            "Batches the agent gave up on after retries",
        )
        .map_err(|e| metric_error("delivery_failures_total", e))?;

        registry
            .register(Box::new(ingest_requests_total.clone()))
            .map_err(|e| metric_error("ingest_requests_total", e))?;
        registry
            .register(Box::new(ingest_errors_total.clone()))
            .map_err(|e| metric_error("ingest_errors_total", e))?;
        registry
            .register(Box::new(ingested_records_total.clone()))
            .map_err(|e| metric_error("ingested_records_total", e))?;
        registry
            .register(Box::new(snapshot_flushes_total.clone()))
            .map_err(|e| metric_error("snapshot_flushes_total", e))?;
        registry
            .register(Box::new(snapshot_failures_total.clone()))
            .map_err(|e| metric_error("snapshot_failures_total", e))?;
        registry
            .register(Box::new(delivery_attempts_total.clone()))
            .map_err(|e| metric_error("delivery_attempts_total", e))?;
        registry
            .register(Box::new(delivery_failures_total.clone()))
            .map_err(|e| metric_error("delivery_failures_total", e))?;

        Ok(Self {
            ingest_requests_total,
            ingest_errors_total,
            ingested_records_total,
            snapshot_flushes_total,
            snapshot_failures_total,
            delivery_attempts_total,
            delivery_failures_total,
            registry,
        })
    }

    /// Get or initialize the global metrics instance
    pub fn global() -> Option<&'static TallyMetrics> {
        METRICS
            .get_or_init(|| match Self::new() {
                Ok(metrics) => Some(metrics),
                Err(e) => {
                    tracing::error!(error = %e, "Failed to initialize Tally metrics");
                    None
                }
            })
            .as_ref()
    }

    /// Gather metrics in Prometheus text format
    pub fn gather_metrics(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| TallyError::storage(format!("Failed to encode metrics: {e}")))?;

        String::from_utf8(buffer)
            .map_err(|e| TallyError::storage(format!("Failed to convert metrics to string: {e}")))
    }
}

/// Record one ingest request on `transport` ("http" or "rpc")
#[cfg(feature = "metrics")]
pub fn record_ingest(transport: &str, records: usize, ok: bool) {
    if let Some(m) = TallyMetrics::global() {
        m.ingest_requests_total.with_label_values(&[transport]).inc();
        if ok {
            m.ingested_records_total.inc_by(records as u64);
        } else {
            m.ingest_errors_total.with_label_values(&[transport]).inc();
        }
    }
}

/// Record the outcome of one snapshot write
#[cfg(feature = "metrics")]
pub fn record_snapshot(ok: bool) {
    if let Some(m) = TallyMetrics::global() {
        if ok {
            m.snapshot_flushes_total.inc();
        } else {
            m.snapshot_failures_total.inc();
        }
    }
}

/// Record the outcome of one delivery round (after retries)
#[cfg(feature = "metrics")]
pub fn record_delivery(ok: bool) {
    if let Some(m) = TallyMetrics::global() {
        m.delivery_attempts_total.inc();
        if !ok {
            m.delivery_failures_total.inc();
        }
    }
}

#[cfg(not(feature = "metrics"))]
pub fn record_ingest(_transport: &str, _records: usize, _ok: bool) {}

#[cfg(not(feature = "metrics"))]
pub fn record_snapshot(_ok: bool) {}

#[cfg(not(feature = "metrics"))]
pub fn record_delivery(_ok: bool) {}

/// Install the global tracing subscriber
///
/// # Arguments
/// * `json` - Emit one JSON object per event instead of human-readable lines
/// * `verbose` - Default to `debug` instead of `info` when `RUST_LOG` is unset
///
/// # Errors
/// Returns a configuration error if a subscriber is already installed.
pub fn init_observability(json: bool, verbose: bool) -> Result<()> {
    #[cfg(feature = "metrics")]
    let _ = TallyMetrics::global();

    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "tally={default_level},tally_core={default_level},tally_retry={default_level}"
        ))
    });

    let registry = tracing_subscriber::registry().with(filter);
    let installed = if json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(false)
                    .with_current_span(false),
            )
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .try_init()
    };

    installed.map_err(|e| {
        TallyError::config(format!("Failed to set global tracing subscriber: {e}"))
    })?;

    tracing::debug!(json, verbose, "Tally observability initialized");
    Ok(())
}
