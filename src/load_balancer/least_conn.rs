//! Least outstanding requests load balancing strategy.

use std::sync::Arc;

use crate::load_balancer::{available_first, backend::Backend, LoadBalancer};

/// Least connections selector.
/// Orders backends by queued requests plus requests pending on their open
/// connections.
#[derive(Debug, Default)]
pub struct LeastConnections;

impl LeastConnections {
    pub fn new() -> Self {
        Self
    }
}

impl LoadBalancer for LeastConnections {
    fn rank(&self, backends: &[Arc<Backend>]) -> Vec<Arc<Backend>> {
        // In case of tie, configuration order wins (stable sort)
        let mut ranked: Vec<(usize, Arc<Backend>)> = backends.iter().map(|b| (b.load(), Arc::clone(b))).collect();
        ranked.sort_by_key(|(load, _)| *load);
        available_first(ranked.into_iter().map(|(_, b)| b).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load_balancer::pool::tests::{backend, queued_operation};
    use crate::net::connection::ConnectionRole;

    #[test]
    fn test_least_conn() {
        let lb = LeastConnections::new();
        let b1 = backend("dir1");
        let b2 = backend("dir2");
        let backends = vec![b1.clone(), b2.clone()];

        let (_client, op) = queued_operation();
        b1.enqueue(op, ConnectionRole::Open).unwrap();

        let ranked = lb.rank(&backends);
        assert_eq!(ranked[0].name(), "dir2");

        let (_client2, op2) = queued_operation();
        let (_client3, op3) = queued_operation();
        b2.enqueue(op2, ConnectionRole::Open).unwrap();
        b2.enqueue(op3, ConnectionRole::Open).unwrap();

        let ranked = lb.rank(&backends);
        assert_eq!(ranked[0].name(), "dir1");
    }
}
