//! Prometheus metrics for plug lifecycle and calls.

use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry};

use crate::error::{Error, Result};

/// Configuration for plug metrics collection.
#[derive(Debug, Clone)]
pub struct MetricsConfig {
    /// Metric prefix for all plug metrics.
    pub prefix: String,
    /// Whether to label invocation counters with the plug name.
    pub per_plug_labels: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            prefix: "plugos".to_string(),
            per_plug_labels: true,
        }
    }
}

impl MetricsConfig {
    /// Create a new metrics configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the metric prefix.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Enable or disable per-plug labels.
    pub fn with_per_plug_labels(mut self, enabled: bool) -> Self {
        self.per_plug_labels = enabled;
        self
    }
}

fn metric_error(e: prometheus::Error) -> Error {
    Error::Registry(format!("metrics: {}", e))
}

/// Plug metrics collector.
pub struct PlugMetrics {
    config: MetricsConfig,
    registry: Registry,
    loaded: IntCounter,
    unloaded: IntCounter,
    load_failures: IntCounter,
    invocations: IntCounterVec,
    invocation_errors: IntCounterVec,
    syscalls: IntCounter,
    load_duration: Histogram,
    invoke_duration: Histogram,
}

impl PlugMetrics {
    /// Create a collector with its own prometheus registry.
    pub fn new(config: MetricsConfig) -> Result<Self> {
        let prefix = &config.prefix;
        let registry = Registry::new();

        let loaded = IntCounter::new(format!("{}_plugs_loaded_total", prefix), "Plugs loaded")
            .map_err(metric_error)?;
        let unloaded =
            IntCounter::new(format!("{}_plugs_unloaded_total", prefix), "Plugs unloaded")
                .map_err(metric_error)?;
        let load_failures = IntCounter::new(
            format!("{}_plug_load_failures_total", prefix),
            "Plug loads that failed",
        )
        .map_err(metric_error)?;
        let invocations = IntCounterVec::new(
            Opts::new(format!("{}_invocations_total", prefix), "Plug function invocations"),
            &["plug"],
        )
        .map_err(metric_error)?;
        let invocation_errors = IntCounterVec::new(
            Opts::new(
                format!("{}_invocation_errors_total", prefix),
                "Plug function invocations that failed",
            ),
            &["plug"],
        )
        .map_err(metric_error)?;
        let syscalls = IntCounter::new(format!("{}_syscalls_total", prefix), "Syscalls dispatched")
            .map_err(metric_error)?;
        let load_duration = Histogram::with_opts(
            HistogramOpts::new(
                format!("{}_load_duration_seconds", prefix),
                "Plug load duration in seconds",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        )
        .map_err(metric_error)?;
        let invoke_duration = Histogram::with_opts(
            HistogramOpts::new(
                format!("{}_invoke_duration_seconds", prefix),
                "Plug invocation duration in seconds",
            )
            .buckets(vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        )
        .map_err(metric_error)?;

        registry.register(Box::new(loaded.clone())).map_err(metric_error)?;
        registry.register(Box::new(unloaded.clone())).map_err(metric_error)?;
        registry.register(Box::new(load_failures.clone())).map_err(metric_error)?;
        registry.register(Box::new(invocations.clone())).map_err(metric_error)?;
        registry.register(Box::new(invocation_errors.clone())).map_err(metric_error)?;
        registry.register(Box::new(syscalls.clone())).map_err(metric_error)?;
        registry.register(Box::new(load_duration.clone())).map_err(metric_error)?;
        registry.register(Box::new(invoke_duration.clone())).map_err(metric_error)?;

        Ok(Self {
            config,
            registry,
            loaded,
            unloaded,
            load_failures,
            invocations,
            invocation_errors,
            syscalls,
            load_duration,
            invoke_duration,
        })
    }

    /// Get the configuration.
    pub fn config(&self) -> &MetricsConfig {
        &self.config
    }

    /// Get the Prometheus registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    fn label<'a>(&self, plug: &'a str) -> &'a str {
        if self.config.per_plug_labels {
            plug
        } else {
            "all"
        }
    }

    /// Record a successful load.
    pub fn record_load(&self, duration_secs: f64) {
        self.loaded.inc();
        self.load_duration.observe(duration_secs);
    }

    /// Record a failed load.
    pub fn record_load_failure(&self) {
        self.load_failures.inc();
    }

    /// Record an unload.
    pub fn record_unload(&self) {
        self.unloaded.inc();
    }

    /// Record a function invocation.
    pub fn record_invoke(&self, plug: &str, duration_secs: f64, failed: bool) {
        let label = self.label(plug);
        self.invocations.with_label_values(&[label]).inc();
        if failed {
            self.invocation_errors.with_label_values(&[label]).inc();
        }
        self.invoke_duration.observe(duration_secs);
    }

    /// Record a dispatched syscall.
    pub fn record_syscall(&self) {
        self.syscalls.inc();
    }

    /// Total plugs loaded.
    pub fn loaded_total(&self) -> u64 {
        self.loaded.get()
    }

    /// Total plugs unloaded.
    pub fn unloaded_total(&self) -> u64 {
        self.unloaded.get()
    }

    /// Total failed loads.
    pub fn load_failures_total(&self) -> u64 {
        self.load_failures.get()
    }

    /// Invocations recorded for `plug`.
    pub fn invocations_total(&self, plug: &str) -> u64 {
        self.invocations.with_label_values(&[self.label(plug)]).get()
    }

    /// Failed invocations recorded for `plug`.
    pub fn invocation_errors_total(&self, plug: &str) -> u64 {
        self.invocation_errors
            .with_label_values(&[self.label(plug)])
            .get()
    }

    /// Total syscalls dispatched.
    pub fn syscalls_total(&self) -> u64 {
        self.syscalls.get()
    }
}

impl std::fmt::Debug for PlugMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlugMetrics")
            .field("config", &self.config)
            .field("loaded", &self.loaded_total())
            .field("unloaded", &self.unloaded_total())
            .field("load_failures", &self.load_failures_total())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_config_builder() {
        let config = MetricsConfig::new()
            .with_prefix("test")
            .with_per_plug_labels(false);

        assert_eq!(config.prefix, "test");
        assert!(!config.per_plug_labels);
    }

    #[test]
    fn test_metrics_recording() {
        let metrics = PlugMetrics::new(MetricsConfig::default()).unwrap();

        metrics.record_load(0.1);
        metrics.record_load(0.2);
        metrics.record_unload();
        metrics.record_load_failure();
        metrics.record_invoke("greeter", 0.01, false);
        metrics.record_invoke("greeter", 0.02, true);
        metrics.record_syscall();

        assert_eq!(metrics.loaded_total(), 2);
        assert_eq!(metrics.unloaded_total(), 1);
        assert_eq!(metrics.load_failures_total(), 1);
        assert_eq!(metrics.invocations_total("greeter"), 2);
        assert_eq!(metrics.invocation_errors_total("greeter"), 1);
        assert_eq!(metrics.invocations_total("other"), 0);
        assert_eq!(metrics.syscalls_total(), 1);
    }

    #[test]
    fn test_unlabelled() {
        let metrics =
            PlugMetrics::new(MetricsConfig::new().with_per_plug_labels(false)).unwrap();
        metrics.record_invoke("a", 0.01, false);
        metrics.record_invoke("b", 0.01, false);
        assert_eq!(metrics.invocations_total("anything"), 2);
    }
}
