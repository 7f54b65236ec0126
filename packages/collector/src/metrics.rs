//! Prometheus Metrics
//!
//! Per-source receive counters, rendered in the text exposition format at
//! `/metrics`.

use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};

pub use prometheus::Error as PrometheusError;

/// Collector metrics backed by their own registry
///
/// Cloning is cheap; clones share the registry and counters.
#[derive(Clone, Debug)]
pub struct Metrics {
    registry: Registry,
    received_total: IntCounterVec,
    received_first: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Result<Self, PrometheusError> {
        let registry = Registry::new();

        let received_total = IntCounterVec::new(
            Opts::new("tx_received_total", "Transactions received, by source"),
            &["source"],
        )?;
        let received_first = IntCounterVec::new(
            Opts::new("tx_received_first", "Transactions first seen at a source"),
            &["source"],
        )?;

        registry.register(Box::new(received_total.clone()))?;
        registry.register(Box::new(received_first.clone()))?;

        Ok(Self {
            registry,
            received_total,
            received_first,
        })
    }

    /// Count one observation from `source`
    pub fn observe(&self, source: &str, first: bool) {
        self.received_total.with_label_values(&[source]).inc();
        if first {
            self.received_first.with_label_values(&[source]).inc();
        }
    }

    pub fn received_total(&self, source: &str) -> u64 {
        self.received_total.with_label_values(&[source]).get()
    }

    pub fn received_first(&self, source: &str) -> u64 {
        self.received_first.with_label_values(&[source]).get()
    }

    /// Content type of [`Metrics::render`] output
    pub fn content_type(&self) -> String {
        TextEncoder::new().format_type().to_string()
    }

    /// Render every metric in the text format
    pub fn render(&self) -> Result<String, PrometheusError> {
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| PrometheusError::Msg(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observe_counts_total_and_first() {
        let metrics = Metrics::new().unwrap();
        metrics.observe("local", true);
        metrics.observe("local", false);
        metrics.observe("blx", false);

        assert_eq!(metrics.received_total("local"), 2);
        assert_eq!(metrics.received_first("local"), 1);
        assert_eq!(metrics.received_total("blx"), 1);
        assert_eq!(metrics.received_first("blx"), 0);
    }

    #[test]
    fn test_render_text_format() {
        let metrics = Metrics::new().unwrap();
        metrics.observe("eden", true);

        let text = metrics.render().unwrap();
        assert!(text.contains("# TYPE tx_received_total counter"));
        assert!(text.contains("tx_received_total{source=\"eden\"} 1"));
        assert!(text.contains("tx_received_first{source=\"eden\"} 1"));
    }

    #[test]
    fn test_clones_share_counters() {
        let metrics = Metrics::new().unwrap();
        let clone = metrics.clone();
        clone.observe("merkle", false);
        assert_eq!(metrics.received_total("merkle"), 1);
    }
}
