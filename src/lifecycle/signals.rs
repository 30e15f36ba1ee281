//! OS signal handling.
//!
//! # Responsibilities
//! - Register signal handlers (SIGTERM, SIGINT)
//! - First signal requests a graceful shutdown
//! - A second signal escalates to abrupt
//!
//! # Design Decisions
//! - Uses Tokio's signal handling (async-safe)
//! - Runs on its own thread so it keeps working while the daemon drains

use std::io;
use std::thread;

use tokio::signal::unix::{signal, SignalKind};

use crate::lifecycle::shutdown::{Shutdown, ShutdownMode};

/// Translate SIGINT/SIGTERM into shutdown requests until shutdown is abrupt.
pub async fn handle_signals(shutdown: Shutdown) -> io::Result<()> {
    let mut terminate = signal(SignalKind::terminate())?;
    let mut interrupt = signal(SignalKind::interrupt())?;

    loop {
        let name = tokio::select! {
            _ = terminate.recv() => "SIGTERM",
            _ = interrupt.recv() => "SIGINT",
        };
        let mode = if shutdown.is_triggered() {
            ShutdownMode::Abrupt
        } else {
            ShutdownMode::Graceful
        };
        tracing::warn!(signal = name, mode = ?mode, "Signal received");
        shutdown.trigger(mode);
        if mode == ShutdownMode::Abrupt {
            return Ok(());
        }
    }
}

/// Run [`handle_signals`] on a dedicated thread.
pub fn spawn_signal_thread(shutdown: Shutdown) -> io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name("ldap-balancer-signals".to_string())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                Ok(runtime) => runtime,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to start signal runtime");
                    return;
                }
            };
            if let Err(e) = runtime.block_on(handle_signals(shutdown)) {
                tracing::error!(error = %e, "Failed to install signal handlers");
            }
        })
}
