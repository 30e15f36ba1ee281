//! Routing subsystem.
//!
//! # Data Flow
//! ```text
//! Client PDU (client message id)
//!     → router.rs (operation created, indexed on the client)
//!     → load_balancer (backend + upstream connection)
//!     → upstream message id allocated, request forwarded
//!
//! Upstream PDU (upstream message id)
//!     → router.rs (operation found in the upstream's pending index)
//!     → message id rewritten, PDU queued on the client
//! ```
//!
//! # Design Decisions
//! - operation.rs holds per-request state; the router holds no locks of its own
//! - Either side of an operation may go away first; the operation is freed
//!   only once both sides have detached

pub mod operation;
pub mod router;
