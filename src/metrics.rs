//! Prometheus metrics handle and HTTP exposition.
//!
//! All metrics live in a registry owned by [`Metrics`]; the handle is
//! created once at startup and shared by `Arc`. The `node` label is read
//! from `NODE_NAME` (set by the downward API in a DaemonSet) and falls back
//! to `"unknown"`.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};

pub struct Metrics {
    registry: Registry,
    node: String,

    zombies_found: IntGaugeVec,
    tracked_containers: IntGaugeVec,
    containers_cleaned: IntCounterVec,
    cleanup_failures: IntCounterVec,
    operation_timeouts: IntCounterVec,
    check_duration: HistogramVec,
}

pub fn node_name() -> String {
    std::env::var("NODE_NAME").unwrap_or_else(|_| "unknown".to_string())
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let zombies_found = IntGaugeVec::new(
            Opts::new(
                "zombie_processes_found",
                "Number of zombie processes found in the last detection pass",
            ),
            &["node"],
        )?;
        let tracked_containers = IntGaugeVec::new(
            Opts::new(
                "tracked_containers",
                "Number of containers examined in the last detection pass",
            ),
            &["node"],
        )?;
        let containers_cleaned = IntCounterVec::new(
            Opts::new("containers_cleaned_total", "Containers removed"),
            &["node", "namespace", "pod_name"],
        )?;
        let cleanup_failures = IntCounterVec::new(
            Opts::new("cleanup_failures_total", "Failed detection or cleanup attempts"),
            &["node", "reason"],
        )?;
        let operation_timeouts = IntCounterVec::new(
            Opts::new(
                "container_operation_timeouts_total",
                "Container runtime operations that exceeded their deadline",
            ),
            &["node", "operation"],
        )?;
        let check_duration = HistogramVec::new(
            HistogramOpts::new("check_duration_seconds", "Duration of detection passes"),
            &["node"],
        )?;

        registry.register(Box::new(zombies_found.clone()))?;
        registry.register(Box::new(tracked_containers.clone()))?;
        registry.register(Box::new(containers_cleaned.clone()))?;
        registry.register(Box::new(cleanup_failures.clone()))?;
        registry.register(Box::new(operation_timeouts.clone()))?;
        registry.register(Box::new(check_duration.clone()))?;

        Ok(Self {
            registry,
            node: node_name(),
            zombies_found,
            tracked_containers,
            containers_cleaned,
            cleanup_failures,
            operation_timeouts,
            check_duration,
        })
    }

    pub fn set_zombies_found(&self, count: usize) {
        self.zombies_found
            .with_label_values(&[&self.node])
            .set(count as i64);
    }

    pub fn set_tracked_containers(&self, count: usize) {
        self.tracked_containers
            .with_label_values(&[&self.node])
            .set(count as i64);
    }

    pub fn inc_containers_cleaned(&self, namespace: &str, pod_name: &str) {
        self.containers_cleaned
            .with_label_values(&[&self.node, namespace, pod_name])
            .inc();
    }

    pub fn inc_cleanup_failure(&self, reason: &str) {
        self.cleanup_failures
            .with_label_values(&[&self.node, reason])
            .inc();
    }

    pub fn inc_operation_timeout(&self, operation: &str) {
        self.operation_timeouts
            .with_label_values(&[&self.node, operation])
            .inc();
    }

    pub fn observe_check_duration(&self, elapsed: Duration) {
        self.check_duration
            .with_label_values(&[&self.node])
            .observe(elapsed.as_secs_f64());
    }

    /// Render the registry in the text exposition format.
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buf = Vec::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buf) {
            tracing::error!(error = %e, "Failed to encode metrics");
            return String::new();
        }
        String::from_utf8(buf).unwrap_or_default()
    }

    #[cfg(test)]
    pub fn cleanup_failure_count(&self, reason: &str) -> u64 {
        self.cleanup_failures
            .with_label_values(&[&self.node, reason])
            .get()
    }

    #[cfg(test)]
    pub fn containers_cleaned_count(&self, namespace: &str, pod_name: &str) -> u64 {
        self.containers_cleaned
            .with_label_values(&[&self.node, namespace, pod_name])
            .get()
    }

    #[cfg(test)]
    pub fn operation_timeout_count(&self, operation: &str) -> u64 {
        self.operation_timeouts
            .with_label_values(&[&self.node, operation])
            .get()
    }

    #[cfg(test)]
    pub fn zombies_found_value(&self) -> i64 {
        self.zombies_found.with_label_values(&[&self.node]).get()
    }
}

async fn metrics_handler(State(metrics): State<Arc<Metrics>>) -> String {
    metrics.render()
}

async fn health_handler() -> &'static str {
    "OK"
}

/// Serve the exposition endpoint until the process exits.
pub async fn serve(metrics: Arc<Metrics>, port: u16, path: &str) -> anyhow::Result<()> {
    let app = Router::new()
        .route(path, get(metrics_handler))
        .route("/health", get(health_handler))
        .with_state(metrics);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!(port = port, path = path, "Metrics endpoint listening");
    axum::serve(listener, app).await?;
    Ok(())
}
