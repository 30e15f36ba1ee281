//! Threads and the state they share.
//!
//! # Data Flow
//! ```text
//! daemon thread (accept loops, retry timers, scanner, upstream connects)
//!     → Context::accept_client / connect_upstream
//!     → WorkerJob::Serve, sharded by descriptor
//!     → I/O worker thread owns the connection until it closes
//! ```
//!
//! # Design Decisions
//! - Every thread runs its own current-thread runtime
//! - Sockets cross threads as std sockets and are registered by the
//!   runtime that will drive them

pub mod context;
pub mod worker;

pub use context::Context;
pub use worker::{WorkerHandle, WorkerReport};
