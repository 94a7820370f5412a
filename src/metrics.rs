//! Operator metrics
//!
//! One prometheus registry is created at startup and handed to every
//! component by reference; nothing reads metrics through ambient globals.
//! The registry is served on `/metrics` by the axum server in `main`.

use std::time::Duration;

use prometheus::{HistogramOpts, HistogramVec, IntGauge, Opts, Registry};

/// Action label values are the action-loop action names plus `sync` for the
/// whole reconciliation.
pub const SYNC_ACTION: &str = "sync";

/// Metric set of the operator
pub struct Metrics {
    registry: Registry,
    release_duration: HistogramVec,
    release_count: IntGauge,
    queue_length: IntGauge,
}

impl Metrics {
    /// Create the registry and register all operator metrics
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let release_duration = HistogramVec::new(
            HistogramOpts::new(
                "release_duration_seconds",
                "Duration of release actions, by target namespace, release and outcome.",
            )
            .buckets(vec![0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0]),
            &["target_namespace", "release_name", "action", "success"],
        )?;
        registry.register(Box::new(release_duration.clone()))?;

        let release_count = IntGauge::with_opts(Opts::new(
            "release_count",
            "Number of HelmRelease resources the operator watches.",
        ))?;
        registry.register(Box::new(release_count.clone()))?;

        let queue_length = IntGauge::with_opts(Opts::new(
            "release_queue_length",
            "Number of work items waiting in the release queue.",
        ))?;
        registry.register(Box::new(queue_length.clone()))?;

        Ok(Self {
            registry,
            release_duration,
            release_count,
            queue_length,
        })
    }

    /// Registry backing the `/metrics` endpoint
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Record the duration and outcome of one action
    pub fn observe_action(
        &self,
        namespace: &str,
        release_name: &str,
        action: &str,
        success: bool,
        duration: Duration,
    ) {
        self.release_duration
            .with_label_values(&[
                namespace,
                release_name,
                action,
                if success { "true" } else { "false" },
            ])
            .observe(duration.as_secs_f64());
    }

    /// A HelmRelease appeared
    pub fn inc_release_count(&self) {
        self.release_count.inc();
    }

    /// A HelmRelease was deleted
    pub fn dec_release_count(&self) {
        self.release_count.dec();
    }

    /// Export the current queue length
    pub fn set_queue_length(&self, len: usize) {
        self.queue_length.set(len as i64);
    }
}
