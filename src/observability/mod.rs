//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Telemetry::install (once, at startup)
//!     → PrometheusRecorder (+ optional HTTP scrape endpoint)
//!     → MetricsRegistry (label validation, duplicate detection)
//!     → ProxyMetrics (typed handle, cloned into every connection)
//!
//! Connections produce:
//!     → metrics.rs (counters, gauges, histograms)
//!     → logging.rs (structured log events)
//!     → tracing.rs (per-connection spans)
//! ```
//!
//! # Design Decisions
//! - No process-global recorder: the composition root owns it and hands out handles
//! - Metric updates never fail connection handling

pub mod logging;
pub mod metrics;
pub mod tracing;

use std::net::SocketAddr;
use std::sync::Arc;

use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use tokio::task::JoinHandle;

use crate::config::ObservabilityConfig;
use self::metrics::{MetricsError, MetricsRegistry, ProxyMetrics, REQUEST_DURATION};

/// Process-scoped metrics state, built once by the composition root.
pub struct Telemetry {
    metrics: ProxyMetrics,
    handle: PrometheusHandle,
    exporter: Option<JoinHandle<()>>,
}

impl Telemetry {
    /// Build the Prometheus recorder and register the connection metrics.
    ///
    /// With `metrics_enabled` the scrape endpoint is bound on `metrics_address`;
    /// outside a Tokio runtime that fails with [`MetricsError::NoRuntime`].
    pub fn install(config: &ObservabilityConfig) -> Result<Self, MetricsError> {
        let builder = PrometheusBuilder::new().set_buckets_for_metric(
            Matcher::Full(REQUEST_DURATION.name.to_string()),
            &config.duration_buckets,
        )?;

        let (recorder, exporter) = if config.metrics_enabled {
            let addr: SocketAddr = config
                .metrics_address
                .parse()
                .map_err(|_| MetricsError::InvalidAddress(config.metrics_address.clone()))?;
            let runtime = tokio::runtime::Handle::try_current().map_err(|_| MetricsError::NoRuntime)?;
            let (recorder, exporter) = builder.with_http_listener(addr).build()?;

            let task = runtime.spawn(async move {
                if let Err(error) = exporter.await {
                    ::tracing::error!(?error, "Prometheus exporter stopped");
                }
            });
            ::tracing::info!(address = %addr, "Metrics endpoint listening");
            (recorder, Some(task))
        } else {
            (builder.build_recorder(), None)
        };

        let handle = recorder.handle();
        let metrics = ProxyMetrics::new(MetricsRegistry::new(Arc::new(recorder)))?;

        Ok(Self {
            metrics,
            handle,
            exporter,
        })
    }

    pub fn metrics(&self) -> &ProxyMetrics {
        &self.metrics
    }

    /// Current metric values in the Prometheus text format.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

impl Drop for Telemetry {
    fn drop(&mut self) {
        if let Some(exporter) = self.exporter.take() {
            exporter.abort();
        }
    }
}
