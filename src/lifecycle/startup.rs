//! Startup orchestration.
//!
//! # Responsibilities
//! - Validate configuration and resolve every backend
//! - Initialize all subsystems in dependency order
//! - Start the daemon thread: retry timers, staleness scanner, accept loops
//! - Run the shutdown sequence and report how it went
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal
//! - Listeners are bound first and accept last (traffic only when ready)
//! - Shutdown reverses startup: stop accepting, join the daemon thread,
//!   wake and join the workers, then release what is left

use std::io;
use std::net::SocketAddr;
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tokio::runtime::Handle;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;

use crate::config::validation::{validate_config, ValidationError};
use crate::config::BalancerConfig;
use crate::lifecycle::shutdown::{Shutdown, ShutdownMode, ShutdownSignal};
use crate::lifecycle::signals::spawn_signal_thread;
use crate::load_balancer::backend::{Backend, BackendError};
use crate::load_balancer::pool::resolve_backends;
use crate::net::listener::{Listener, ListenerError};
use crate::runtime::context::Context;
use crate::runtime::worker::{join_workers, spawn_workers, WorkerHandle, WorkerReport};

/// Error type for startup.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("invalid configuration: {}", join(.0))]
    Validation(Vec<ValidationError>),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Listener(#[from] ListenerError),
    #[error("failed to start thread: {0}")]
    Thread(#[from] io::Error),
    #[error("daemon thread exited during startup")]
    DaemonExited,
}

fn join(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Outcome of a shutdown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    pub mode: Option<ShutdownMode>,
    /// A listener failed with a non-recoverable accept error.
    pub fatal: bool,
    pub daemon_panicked: bool,
    pub workers: Vec<WorkerReport>,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.mode == Some(ShutdownMode::Graceful)
            && !self.fatal
            && !self.daemon_panicked
            && self.workers.iter().all(WorkerReport::is_clean)
    }

    /// Process exit status.
    pub fn exit_code(&self) -> u8 {
        if self.is_clean() {
            0
        } else {
            1
        }
    }
}

/// A running balancer.
#[derive(Debug)]
pub struct Daemon {
    ctx: Arc<Context>,
    daemon_thread: Option<thread::JoinHandle<()>>,
    workers: Vec<WorkerHandle>,
}

impl Daemon {
    /// Bring the balancer up. Returns once every listener is accepting.
    pub fn start(config: BalancerConfig) -> Result<Self, StartupError> {
        validate_config(&config).map_err(StartupError::Validation)?;
        let config = Arc::new(config);

        let specs = resolve_backends(&config.backends)?;
        let listeners = config
            .listeners
            .iter()
            .map(|listener| Listener::open(listener).map(Arc::new))
            .collect::<Result<Vec<_>, _>>()?;

        let ctx = Context::new(Arc::clone(&config), specs, listeners, Shutdown::new());
        let workers = spawn_workers(&ctx, config.workers.threads)?;

        let (ready_tx, ready_rx) = std_mpsc::channel();
        let daemon_ctx = Arc::clone(&ctx);
        let spawned = thread::Builder::new()
            .name("ldap-balancer-daemon".to_string())
            .spawn(move || daemon_thread(daemon_ctx, ready_tx));

        let mut daemon = Self {
            ctx,
            daemon_thread: None,
            workers,
        };
        match spawned {
            Ok(handle) => daemon.daemon_thread = Some(handle),
            Err(e) => {
                daemon.abort_startup();
                return Err(StartupError::Thread(e));
            }
        }

        let ready = ready_rx.recv().unwrap_or(Err(StartupError::DaemonExited));
        if let Err(e) = ready {
            daemon.abort_startup();
            return Err(e);
        }

        tracing::info!(
            listeners = daemon.ctx.listeners().len(),
            backends = daemon.ctx.backends().len(),
            workers = config.workers.threads,
            "Balancer started"
        );
        Ok(daemon)
    }

    /// Start, handle SIGINT/SIGTERM, and block until shut down.
    pub fn run(config: BalancerConfig) -> Result<ShutdownReport, StartupError> {
        let daemon = Self::start(config)?;
        spawn_signal_thread(daemon.ctx.shutdown().clone())?;
        Ok(daemon.wait())
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    /// TCP addresses the listeners are bound to.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.ctx.listeners().iter().filter_map(|l| l.local_addr()).collect()
    }

    /// Request shutdown. Does not wait; see [`Daemon::wait`].
    pub fn shutdown(&self, mode: ShutdownMode) {
        self.ctx.shutdown().trigger(mode);
    }

    /// Block until shutdown has been requested and carried out.
    pub fn wait(mut self) -> ShutdownReport {
        let daemon_panicked = match self.daemon_thread.take().map(thread::JoinHandle::join) {
            Some(Err(_)) => {
                tracing::error!("Daemon thread panicked");
                self.ctx.shutdown().trigger(ShutdownMode::Abrupt);
                true
            }
            _ => false,
        };

        self.ctx.wake_workers();
        let workers = join_workers(std::mem::take(&mut self.workers));
        self.ctx.release_all();

        let report = ShutdownReport {
            mode: self.ctx.shutdown().mode(),
            fatal: self.ctx.is_fatal(),
            daemon_panicked,
            workers,
        };
        tracing::info!(
            clean = report.is_clean(),
            mode = ?report.mode,
            remaining_connections = self.ctx.connection_count(),
            "Shutdown complete"
        );
        report
    }

    fn abort_startup(&mut self) {
        self.ctx.shutdown().trigger(ShutdownMode::Abrupt);
        if let Some(handle) = self.daemon_thread.take() {
            let _ = handle.join();
        }
        self.ctx.wake_workers();
        join_workers(std::mem::take(&mut self.workers));
        self.ctx.release_all();
    }
}

impl Drop for Daemon {
    fn drop(&mut self) {
        if self.daemon_thread.is_some() || !self.workers.is_empty() {
            self.abort_startup();
        }
    }
}

fn daemon_thread(ctx: Arc<Context>, ready: std_mpsc::Sender<Result<(), StartupError>>) {
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            let _ = ready.send(Err(StartupError::Thread(e)));
            return;
        }
    };
    runtime.block_on(run_daemon(ctx, ready));
}

async fn run_daemon(ctx: Arc<Context>, ready: std_mpsc::Sender<Result<(), StartupError>>) {
    ctx.set_daemon_handle(Handle::current());

    let mut background = JoinSet::new();
    let retry_interval = Duration::from_millis(ctx.config().backoff.retry_interval_ms);
    for backend in ctx.backends().all() {
        background.spawn(retry_timer(Arc::clone(backend), retry_interval, ctx.shutdown().subscribe()));
    }
    background.spawn(scanner(Arc::clone(&ctx), ctx.shutdown().subscribe()));

    let mut accepts = JoinSet::new();
    for listener in ctx.listeners() {
        let socket = match listener.activate() {
            Ok(socket) => socket,
            Err(e) => {
                let _ = ready.send(Err(e.into()));
                return;
            }
        };
        let accept_ctx = Arc::clone(&ctx);
        accepts.spawn(Arc::clone(listener).accept_loop(
            socket,
            ctx.shutdown().subscribe(),
            move |raw, listener| accept_ctx.accept_client(raw, listener),
        ));
    }
    let _ = ready.send(Ok(()));

    let mut shutdown = ctx.shutdown().subscribe();
    loop {
        tokio::select! {
            mode = shutdown.wait() => {
                tracing::info!(mode = ?mode, "Stopping listeners");
                break;
            }
            Some(joined) = accepts.join_next() => {
                let failed = match joined {
                    Ok(Ok(())) => false,
                    Ok(Err(e)) => {
                        tracing::error!(error = %e, "Listener failed, shutting down");
                        true
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Accept loop panicked, shutting down");
                        true
                    }
                };
                if failed {
                    ctx.set_fatal();
                    ctx.shutdown().trigger(ShutdownMode::Graceful);
                }
            }
        }
    }

    while accepts.join_next().await.is_some() {}
    while background.join_next().await.is_some() {}
    ctx.wake_workers();
}

async fn retry_timer(backend: Arc<Backend>, period: Duration, mut shutdown: ShutdownSignal) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.wait() => break,
            _ = ticker.tick() => {
                let started = backend.retry();
                if started > 0 {
                    tracing::debug!(backend = %backend.name(), started = started, "Retry timer opened connections");
                }
            }
        }
    }
}

async fn scanner(ctx: Arc<Context>, mut shutdown: ShutdownSignal) {
    let mut ticker = tokio::time::interval(ctx.config().timeouts.scan_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.wait() => break,
            _ = ticker.tick() => ctx.scan(Instant::now()),
        }
    }
}
