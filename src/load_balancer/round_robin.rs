//! Round-robin load balancing strategy.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::load_balancer::{available_first, backend::Backend, LoadBalancer};

/// Round-robin selector.
/// Stores an internal counter to rotate the first choice through backends.
#[derive(Debug, Default)]
pub struct RoundRobin {
    counter: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancer for RoundRobin {
    fn rank(&self, backends: &[Arc<Backend>]) -> Vec<Arc<Backend>> {
        if backends.is_empty() {
            return Vec::new();
        }

        let start = self.counter.fetch_add(1, Ordering::Relaxed);
        let len = backends.len();
        let rotated = (0..len).map(|i| Arc::clone(&backends[(start + i) % len])).collect();
        available_first(rotated)
    }
}
