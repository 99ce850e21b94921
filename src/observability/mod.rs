pub mod metrics;
pub(crate) mod structured_log;
pub mod tracing;

use std::sync::Arc;

use anyhow::Result;
use prometheus::{Encoder, Registry, TextEncoder};

use self::metrics::Metrics;
use self::tracing::TracingSettings;

/// Tracing setup plus the metrics registry served on `/metrics`.
#[derive(Debug, Clone)]
pub struct Telemetry {
    registry: Arc<Registry>,
    metrics: Arc<Metrics>,
}

impl Telemetry {
    /// Installs tracing (once per process) and registers a fresh metric set.
    ///
    /// # Errors
    /// Fails when the subscriber or the metrics cannot be registered.
    pub fn new(settings: &TracingSettings) -> Result<Self> {
        tracing::init(settings)?;
        Ok(Self::with_registry(Arc::new(Registry::new()))?)
    }

    /// Metrics only, without touching the global subscriber.
    ///
    /// # Errors
    /// Fails when a metric name is already taken in `registry`.
    pub fn with_registry(registry: Arc<Registry>) -> Result<Self, prometheus::Error> {
        let metrics = Arc::new(Metrics::new(Arc::clone(&registry))?);
        Ok(Self { registry, metrics })
    }

    #[must_use]
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    #[must_use]
    pub fn metrics_arc(&self) -> Arc<Metrics> {
        Arc::clone(&self.metrics)
    }

    pub fn record_ready_check(&self) {
        ::tracing::debug!("service ready check");
    }

    pub fn record_live_check(&self) {
        ::tracing::debug!("service live check");
    }

    /// Text exposition of this instance's registry.
    #[must_use]
    pub fn render_prometheus(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if let Err(error) = encoder.encode(&metric_families, &mut buffer) {
            ::tracing::warn!(%error, "failed to encode prometheus metrics");
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_includes_registered_metrics() {
        let telemetry = Telemetry::with_registry(Arc::new(Registry::new())).expect("telemetry");
        telemetry.metrics().reports_requested.inc();

        let rendered = telemetry.render_prometheus();
        assert!(rendered.contains("selflearn_reports_requested_total 1"));
        assert!(rendered.contains("selflearn_active_runs"));
    }
}
