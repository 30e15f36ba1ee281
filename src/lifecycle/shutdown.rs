//! Shutdown coordination.
//!
//! A single process-wide flag: unset, graceful, or abrupt. Graceful may be
//! escalated to abrupt (second signal); nothing goes back.

use std::sync::Arc;

use tokio::sync::watch;

/// How the process is going down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Stop accepting, let in-flight writes finish, then exit.
    Graceful,
    /// Stop now; queued writes are abandoned.
    Abrupt,
}

/// Coordinator for shutdown.
///
/// Provides a watch channel that all long-running tasks can subscribe to.
#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<Option<ShutdownMode>>>,
}

impl Shutdown {
    /// Create a new shutdown coordinator.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Subscribe to the shutdown signal.
    pub fn subscribe(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
        }
    }

    /// Trigger shutdown. Returns false if `mode` changes nothing.
    pub fn trigger(&self, mode: ShutdownMode) -> bool {
        let changed = self.tx.send_if_modified(|current| match (*current, mode) {
            (None, _) | (Some(ShutdownMode::Graceful), ShutdownMode::Abrupt) => {
                *current = Some(mode);
                true
            }
            _ => false,
        });
        if changed {
            tracing::info!(mode = ?mode, "Shutdown triggered");
        }
        changed
    }

    pub fn mode(&self) -> Option<ShutdownMode> {
        *self.tx.borrow()
    }

    pub fn is_triggered(&self) -> bool {
        self.mode().is_some()
    }

    /// Get the number of active subscribers (tasks still running).
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving end of [`Shutdown`].
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<Option<ShutdownMode>>,
}

impl ShutdownSignal {
    /// Wait until shutdown is triggered. Cancel safe.
    pub async fn wait(&mut self) -> ShutdownMode {
        match self.rx.wait_for(Option::is_some).await {
            Ok(mode) => mode.unwrap_or(ShutdownMode::Graceful),
            Err(_) => ShutdownMode::Graceful,
        }
    }

    /// Wait until shutdown becomes abrupt. Cancel safe.
    pub async fn abrupt(&mut self) {
        if self
            .rx
            .wait_for(|mode| *mode == Some(ShutdownMode::Abrupt))
            .await
            .is_err()
        {
            std::future::pending::<()>().await;
        }
    }

    pub fn mode(&self) -> Option<ShutdownMode> {
        *self.rx.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn graceful_escalates_but_never_relaxes() {
        let shutdown = Shutdown::new();
        assert!(!shutdown.is_triggered());
        assert!(shutdown.trigger(ShutdownMode::Graceful));
        assert!(!shutdown.trigger(ShutdownMode::Graceful));
        assert!(shutdown.trigger(ShutdownMode::Abrupt));
        assert!(!shutdown.trigger(ShutdownMode::Graceful));
        assert_eq!(shutdown.mode(), Some(ShutdownMode::Abrupt));
    }

    #[tokio::test]
    async fn subscribers_see_trigger() {
        let shutdown = Shutdown::new();
        let mut signal = shutdown.subscribe();
        let waiter = tokio::spawn(async move { signal.wait().await });

        shutdown.trigger(ShutdownMode::Graceful);
        let mode = tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert_eq!(mode, ShutdownMode::Graceful);

        let mut late = shutdown.subscribe();
        assert_eq!(late.wait().await, ShutdownMode::Graceful);

        let abrupt = tokio::spawn(async move { late.abrupt().await });
        shutdown.trigger(ShutdownMode::Abrupt);
        tokio::time::timeout(Duration::from_secs(1), abrupt).await.unwrap().unwrap();
    }
}
