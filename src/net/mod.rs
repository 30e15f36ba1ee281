//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! ldap:// | ldaps:// | ldapi:// URL
//!     → address.rs (transport and endpoint)
//!     → listener.rs (bind, accept loop, mute on descriptor exhaustion)
//!     → stream.rs (std socket handed to its I/O worker)
//!     → tls.rs (optional TLS handshake on the worker)
//!     → connection.rs (refcount, live token, pending message ids)
//!
//! Connection phases:
//!     Active (handshake) → Ready ⇄ Binding → Closing
//! ```
//!
//! # Design Decisions
//! - Liveness is a separate token from the reference count
//! - Teardown runs once, after the last reference is released
//! - TLS is optional and handled transparently

pub mod address;
pub mod connection;
pub mod listener;
pub mod stream;
pub mod tls;
