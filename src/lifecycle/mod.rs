//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Validate config → Bind listeners → Start I/O workers
//!         → Start backend retry timers → Activate listeners
//!
//! Shutdown (shutdown.rs):
//!     Trigger → Stop accepting → Join daemon thread
//!         → Wake and join workers (drain or abort) → Release the rest
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → graceful; a second one → abrupt
//! ```
//!
//! # Design Decisions
//! - Ordered startup: listeners bind first but accept last
//! - Graceful drain has a deadline; missing it makes the shutdown unclean

pub mod shutdown;
pub mod signals;
pub mod startup;

pub use shutdown::{Shutdown, ShutdownMode, ShutdownSignal};
pub use startup::{Daemon, ShutdownReport, StartupError};
