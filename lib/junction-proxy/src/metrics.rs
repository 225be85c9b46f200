//! Prometheus metrics for the gateway and registry

use anyhow::Result;
use prometheus::{CounterVec, Encoder, HistogramVec, IntGauge, Opts, Registry, TextEncoder};
use std::sync::Arc;

/// Metrics collector shared by the gateway and the control API.
pub struct MetricsCollector {
    /// Routed requests by service and terminal outcome.
    pub gateway_requests_total: CounterVec,
    /// End-to-end request latency per service, including the failover retry.
    pub gateway_request_duration_seconds: HistogramVec,
    /// Instances currently held by the registry, any status.
    pub registry_instances: IntGauge,
    pub registry: Arc<Registry>,
}

impl MetricsCollector {
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new());

        let gateway_requests_total = CounterVec::new(
            Opts::new("gateway_requests_total", "Total routed requests"),
            &["service", "outcome"],
        )?;

        let gateway_request_duration_seconds = HistogramVec::new(
            Opts::new(
                "gateway_request_duration_seconds",
                "Routed request latency in seconds",
            )
            .into(),
            &["service"],
        )?;

        let registry_instances = IntGauge::new(
            "registry_instances",
            "Instances currently registered, any status",
        )?;

        registry.register(Box::new(gateway_requests_total.clone()))?;
        registry.register(Box::new(gateway_request_duration_seconds.clone()))?;
        registry.register(Box::new(registry_instances.clone()))?;

        Ok(Self {
            gateway_requests_total,
            gateway_request_duration_seconds,
            registry_instances,
            registry,
        })
    }

    pub fn observe_request(&self, service: &str, outcome: &str, seconds: f64) {
        self.gateway_requests_total
            .with_label_values(&[service, outcome])
            .inc();
        self.gateway_request_duration_seconds
            .with_label_values(&[service])
            .observe(seconds);
    }

    pub fn set_instance_count(&self, count: i64) {
        self.registry_instances.set(count);
    }

    /// All metrics in Prometheus text format.
    pub fn gather(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = vec![];
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

impl Clone for MetricsCollector {
    fn clone(&self) -> Self {
        // Clones share the same underlying registry and series.
        Self {
            gateway_requests_total: self.gateway_requests_total.clone(),
            gateway_request_duration_seconds: self.gateway_request_duration_seconds.clone(),
            registry_instances: self.registry_instances.clone(),
            registry: self.registry.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collector_gathers_text_format() {
        let collector = MetricsCollector::new().expect("collector");
        collector.observe_request("inventory", "forwarded", 0.012);
        collector.set_instance_count(3);

        let text = collector.gather().expect("gather");
        assert!(text.contains("# HELP"));
        assert!(text.contains("gateway_requests_total"));
        assert!(text.contains("registry_instances 3"));
    }

    #[test]
    fn test_clone_shares_registry() {
        let collector = MetricsCollector::new().expect("collector");
        let clone = collector.clone();
        clone.observe_request("billing", "service_not_found", 0.001);

        let text = collector.gather().expect("gather");
        assert!(text.contains("service_not_found"));
    }
}
