//! Prometheus metrics shared by the SSH server and the debug endpoint.

use std::sync::Arc;

use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::registry::Registry;

/// Counters for the SSH front-end. Cheap-to-clone handles live here; the
/// registry they are registered in is held by [`MetricsRegistry`].
#[derive(Default)]
pub struct Metrics {
    /// Accepted TCP connections.
    pub connections: Counter,
    /// Public-key authentications refused.
    pub auth_rejections: Counter,
    /// Exec requests handed to a dispatcher.
    pub execs: Counter,
    /// Dispatches that ended in an error (the client saw exit-status 1).
    pub exec_failures: Counter,
    /// Interactive shell requests turned away.
    pub shells_rejected: Counter,
}

pub struct MetricsRegistry {
    registry: Registry,
    pub metrics: Arc<Metrics>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        let metrics = Arc::new(Metrics::default());
        let mut registry = Registry::default();
        registry.register(
            "gitserve_connections",
            "Accepted SSH connections",
            metrics.connections.clone(),
        );
        registry.register(
            "gitserve_auth_rejections",
            "Rejected public-key authentications",
            metrics.auth_rejections.clone(),
        );
        registry.register(
            "gitserve_execs",
            "Exec requests dispatched",
            metrics.execs.clone(),
        );
        registry.register(
            "gitserve_exec_failures",
            "Exec dispatches that failed",
            metrics.exec_failures.clone(),
        );
        registry.register(
            "gitserve_shells_rejected",
            "Interactive shell requests rejected",
            metrics.shells_rejected.clone(),
        );
        Self { registry, metrics }
    }

    /// Render the registry in the Prometheus text exposition format.
    pub fn encode(&self) -> String {
        let mut out = String::new();
        // Encoding only fails on fmt::Write, which String never does.
        let _ = encode(&mut out, &self.registry);
        out
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}
