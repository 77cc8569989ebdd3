//! Prometheus metrics of the manager
//!
//! Registered once on the default registry and exposed by the metrics
//! server in `main.rs`.

use prometheus::{Histogram, HistogramOpts, IntCounterVec, IntGauge, Opts};
use std::sync::OnceLock;

/// Process-wide metric handles
#[derive(Debug, Clone)]
pub struct Metrics {
    /// Reconciles started, by controller
    pub reconciles: IntCounterVec,
    /// Reconciles that returned an error, by controller
    pub reconcile_errors: IntCounterVec,
    /// Pipeline runs, by result (`success`/`failure`)
    pub pipeline_runs: IntCounterVec,
    pub pipeline_duration: Histogram,
    /// Nodes in the last successful pipeline output
    pub node_configs: IntGauge,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Metric handles, registering them on first use
pub fn metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::register)
}

impl Metrics {
    fn register() -> Self {
        // Static definitions; construction only fails on malformed names
        let metrics = Self {
            reconciles: IntCounterVec::new(
                Opts::new("clusterlink_reconcile_total", "Total number of reconciles"),
                &["controller"],
            )
            .expect("valid metric definition"),
            reconcile_errors: IntCounterVec::new(
                Opts::new(
                    "clusterlink_reconcile_errors_total",
                    "Total number of failed reconciles",
                ),
                &["controller"],
            )
            .expect("valid metric definition"),
            pipeline_runs: IntCounterVec::new(
                Opts::new(
                    "clusterlink_pipeline_runs_total",
                    "Total number of network pipeline runs",
                ),
                &["result"],
            )
            .expect("valid metric definition"),
            pipeline_duration: Histogram::with_opts(HistogramOpts::new(
                "clusterlink_pipeline_duration_seconds",
                "Duration of network pipeline runs",
            ))
            .expect("valid metric definition"),
            node_configs: IntGauge::new(
                "clusterlink_node_configs",
                "Number of nodes with a computed network config",
            )
            .expect("valid metric definition"),
        };

        let registry = prometheus::default_registry();
        for collector in [
            Box::new(metrics.reconciles.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(metrics.reconcile_errors.clone()),
            Box::new(metrics.pipeline_runs.clone()),
            Box::new(metrics.pipeline_duration.clone()),
            Box::new(metrics.node_configs.clone()),
        ] {
            if let Err(e) = registry.register(collector) {
                tracing::warn!(error = %e, "Failed to register metric");
            }
        }
        metrics
    }
}
