//! Load balancing subsystem.
//!
//! # Data Flow
//! ```text
//! Request needs an upstream (open or bind)
//!     → pool.rs (backends that serve the role)
//!     → Apply load balancing algorithm to order them:
//!         - round_robin.rs (rotate the starting backend)
//!         - least_conn.rs (fewest outstanding requests first)
//!     → backend.rs (least recently used ready connection)
//!     → None ready: queue on the first backend and open a connection
//! ```
//!
//! # Design Decisions
//! - Strategies only order backends; each backend owns its pools
//! - Backends in backoff with nothing ready are tried last
//! - A backend is never dropped from the set, only retried

use std::fmt;
use std::sync::Arc;

use crate::load_balancer::backend::Backend;

pub mod backend;
pub mod least_conn;
pub mod pool;
pub mod round_robin;

/// Orders backends by preference for the next request.
pub trait LoadBalancer: Send + Sync + fmt::Debug {
    fn rank(&self, backends: &[Arc<Backend>]) -> Vec<Arc<Backend>>;
}

/// Stable partition: available backends first.
fn available_first(mut ranked: Vec<Arc<Backend>>) -> Vec<Arc<Backend>> {
    let (mut available, unavailable): (Vec<_>, Vec<_>) = ranked.drain(..).partition(|b| b.is_available());
    available.extend(unavailable);
    available
}
