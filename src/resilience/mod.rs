//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Upstream connect fails:
//!     → backoff.rs (record failure, grow the delay, schedule next attempt)
//!     → backend retry timer (one attempt once the delay has passed)
//!     → On success: reset delay, back to full pool size
//! ```
//!
//! # Design Decisions
//! - Delays grow exponentially up to a cap and never shrink while failing
//! - Jitter applies to the scheduled time, not the stored delay
//! - Retries continue indefinitely; the balancer never gives up on a backend

pub mod backoff;
