//! Metrics sink interface consumed by the rate limiter, forwarder, and
//! server.
//!
//! The core never depends on a concrete backend -- only on the
//! [`MetricsSink`] trait. [`NullMetricsSink`] is the default for tests and
//! anywhere a caller has no metrics backend wired up; [`PrometheusMetricsSink`]
//! registers a counter vector and a gauge vector against a
//! `prometheus::Registry` supplied at construction. Neither implementation
//! serves an HTTP endpoint -- that is left to the binary's caller.

use prometheus::{GaugeVec, IntCounterVec, Opts, Registry};

/// Counter and gauge updates emitted by the core.
pub trait MetricsSink: Send + Sync {
    /// Increments the named counter by one.
    fn increment_counter(&self, name: &str);

    /// Sets the named gauge to an absolute value.
    fn set_gauge(&self, name: &str, value: f64);
}

/// A metrics sink that discards every update.
#[derive(Debug, Default)]
pub struct NullMetricsSink;

impl MetricsSink for NullMetricsSink {
    fn increment_counter(&self, _name: &str) {}
    fn set_gauge(&self, _name: &str, _value: f64) {}
}

/// A metrics sink backed by a `prometheus::Registry`.
///
/// Registers one counter vector (labeled `name`) and one gauge vector
/// (labeled `name`) on construction. Scraping the registry is the caller's
/// responsibility.
pub struct PrometheusMetricsSink {
    counters: IntCounterVec,
    gauges: GaugeVec,
}

impl PrometheusMetricsSink {
    /// Creates the sink and registers its metric families on `registry`.
    ///
    /// # Errors
    ///
    /// Returns an error if registration fails, which only happens if the
    /// registry already has a conflicting metric family registered.
    pub fn new(registry: Registry) -> Result<Self, prometheus::Error> {
        let counters = IntCounterVec::new(
            Opts::new("mqtt_rate_proxy_events_total", "Cumulative proxy events"),
            &["name"],
        )?;
        let gauges = GaugeVec::new(
            Opts::new("mqtt_rate_proxy_gauge", "Point-in-time proxy gauges"),
            &["name"],
        )?;
        registry.register(Box::new(counters.clone()))?;
        registry.register(Box::new(gauges.clone()))?;
        Ok(Self { counters, gauges })
    }
}

impl MetricsSink for PrometheusMetricsSink {
    fn increment_counter(&self, name: &str) {
        self.counters.with_label_values(&[name]).inc();
    }

    fn set_gauge(&self, name: &str, value: f64) {
        self.gauges.with_label_values(&[name]).set(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_sink_accepts_any_update() {
        let sink = NullMetricsSink;
        sink.increment_counter("total_connections");
        sink.set_gauge("active_buckets", 3.0);
    }

    #[test]
    fn prometheus_sink_records_counter() {
        let registry = Registry::new();
        let sink = PrometheusMetricsSink::new(registry.clone()).unwrap();
        sink.increment_counter("allowed_messages");
        sink.increment_counter("allowed_messages");

        let families = registry.gather();
        let counter_family = families
            .iter()
            .find(|f| f.name() == "mqtt_rate_proxy_events_total")
            .expect("counter family registered");
        let metric = &counter_family.get_metric()[0];
        assert_eq!(metric.get_counter().get_value(), 2.0);
    }

    #[test]
    fn prometheus_sink_records_gauge() {
        let registry = Registry::new();
        let sink = PrometheusMetricsSink::new(registry.clone()).unwrap();
        sink.set_gauge("active_buckets", 7.0);

        let families = registry.gather();
        let gauge_family = families
            .iter()
            .find(|f| f.name() == "mqtt_rate_proxy_gauge")
            .expect("gauge family registered");
        let metric = &gauge_family.get_metric()[0];
        assert_eq!(metric.get_gauge().get_value(), 7.0);
    }
}
