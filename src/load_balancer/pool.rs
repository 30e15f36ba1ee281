//! The configured set of backends.
//!
//! # Responsibilities
//! - Build every backend from configuration
//! - Apply the configured strategy to order candidates for a request
//! - Expose the backends for retry timers, metrics and shutdown

use std::sync::{Arc, Weak};

use crate::config::{BackendConfig, BackoffConfig, Strategy};
use crate::load_balancer::{
    backend::{Backend, BackendError, BackendSpec, UpstreamConnector},
    least_conn::LeastConnections,
    round_robin::RoundRobin,
    LoadBalancer,
};
use crate::net::connection::ConnectionRole;
use crate::resilience::backoff::BackoffPolicy;

/// Resolve every backend's URI and TLS settings up front.
pub fn resolve_backends(configs: &[BackendConfig]) -> Result<Vec<BackendSpec>, BackendError> {
    configs.iter().map(BackendSpec::resolve).collect()
}

/// All backends plus the strategy that orders them.
#[derive(Debug)]
pub struct BackendSet {
    backends: Vec<Arc<Backend>>,
    strategy: Box<dyn LoadBalancer>,
}

impl BackendSet {
    pub fn new(
        specs: Vec<BackendSpec>,
        backoff: &BackoffConfig,
        strategy: Strategy,
        connector: Weak<dyn UpstreamConnector>,
    ) -> Self {
        let policy = BackoffPolicy::from(backoff);
        let backends = specs
            .into_iter()
            .map(|spec| Arc::new(Backend::new(spec, policy, connector.clone())))
            .collect();
        Self::with_backends(backends, strategy)
    }

    pub fn with_backends(backends: Vec<Arc<Backend>>, strategy: Strategy) -> Self {
        let strategy: Box<dyn LoadBalancer> = match strategy {
            Strategy::RoundRobin => Box::new(RoundRobin::new()),
            Strategy::LeastConnections => Box::new(LeastConnections::new()),
        };
        Self { backends, strategy }
    }

    /// Backends able to serve `role`, in preference order.
    pub fn candidates(&self, role: ConnectionRole) -> Vec<Arc<Backend>> {
        let serving: Vec<Arc<Backend>> = self.backends.iter().filter(|b| b.serves(role)).cloned().collect();
        let ranked = self.strategy.rank(&serving);
        if ranked.is_empty() {
            tracing::debug!(role = ?role, backend_count = self.backends.len(), "No backend serves role");
        }
        ranked
    }

    pub fn all(&self) -> &[Arc<Backend>] {
        &self.backends
    }

    pub fn get(&self, name: &str) -> Option<&Arc<Backend>> {
        self.backends.iter().find(|b| b.name() == name)
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}
