//! LDAP load balancer library

pub mod config;
pub mod lifecycle;
pub mod load_balancer;
pub mod net;
pub mod observability;
pub mod pdu;
pub mod resilience;
pub mod routing;
pub mod runtime;

pub use config::schema::BalancerConfig;
pub use lifecycle::{Daemon, Shutdown, ShutdownMode, ShutdownReport};
pub use runtime::Context;
