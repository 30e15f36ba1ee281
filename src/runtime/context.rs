//! The orchestration context shared by every thread.
//!
//! # Responsibilities
//! - Own the listeners, backends, router and the worker senders
//! - Receive connection lifecycle callbacks and route them
//! - Start upstream connects on the daemon thread
//! - Shard connections onto I/O workers
//! - Run the periodic scan for stale operations and idle clients
//!
//! # Design Decisions
//! - Created once at startup and passed around as `Arc<Context>`; there is
//!   no process-global state, so tests can run several daemons at once
//! - Listener and worker tables are fixed after startup and read lock-free

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Instant;

use dashmap::DashMap;
use tokio::runtime::Handle;
use tokio::sync::mpsc;

use crate::config::BalancerConfig;
use crate::lifecycle::shutdown::Shutdown;
use crate::load_balancer::backend::{Backend, BackendSpec, UpstreamConnector};
use crate::load_balancer::pool::BackendSet;
use crate::net::connection::{Connection, ConnectionEvents, ConnectionId, ConnectionKind, ConnectionRole};
use crate::net::listener::Listener;
use crate::net::stream::RawSocket;
use crate::observability::metrics;
use crate::routing::operation::Operation;
use crate::routing::router::{Router, RouterSettings};
use crate::runtime::worker::{Handshake, Served, WorkerJob};

/// Process-wide state for one running balancer.
pub struct Context {
    me: Weak<Context>,
    config: Arc<BalancerConfig>,
    shutdown: Shutdown,
    backends: Arc<BackendSet>,
    router: Router,
    listeners: Vec<Arc<Listener>>,
    workers: OnceLock<Vec<mpsc::UnboundedSender<WorkerJob>>>,
    daemon: OnceLock<Handle>,
    connections: DashMap<ConnectionId, Arc<Connection>>,
    fatal: AtomicBool,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("listeners", &self.listeners.len())
            .field("backends", &self.backends.len())
            .field("connections", &self.connections.len())
            .finish_non_exhaustive()
    }
}

impl Context {
    pub fn new(
        config: Arc<BalancerConfig>,
        specs: Vec<BackendSpec>,
        listeners: Vec<Arc<Listener>>,
        shutdown: Shutdown,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me: &Weak<Context>| {
            let connector: Weak<dyn UpstreamConnector> = me.clone();
            let backends = Arc::new(BackendSet::new(
                specs,
                &config.backoff,
                config.routing.strategy,
                connector,
            ));
            let router = Router::new(
                Arc::clone(&backends),
                RouterSettings {
                    upstream_loss: config.routing.upstream_loss,
                    operation_timeout: config.timeouts.operation(),
                },
            );
            Self {
                me: me.clone(),
                config,
                shutdown,
                backends,
                router,
                listeners,
                workers: OnceLock::new(),
                daemon: OnceLock::new(),
                connections: DashMap::new(),
                fatal: AtomicBool::new(false),
            }
        })
    }

    pub fn config(&self) -> &BalancerConfig {
        &self.config
    }

    pub fn shutdown(&self) -> &Shutdown {
        &self.shutdown
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn backends(&self) -> &Arc<BackendSet> {
        &self.backends
    }

    pub fn listeners(&self) -> &[Arc<Listener>] {
        &self.listeners
    }

    /// Connections not yet torn down.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn connection(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    /// Whether a listener failed fatally.
    pub fn is_fatal(&self) -> bool {
        self.fatal.load(Ordering::Acquire)
    }

    pub(crate) fn set_fatal(&self) {
        self.fatal.store(true, Ordering::Release);
    }

    pub(crate) fn set_workers(&self, senders: Vec<mpsc::UnboundedSender<WorkerJob>>) {
        if self.workers.set(senders).is_err() {
            tracing::warn!("Worker table already installed");
        }
    }

    pub(crate) fn set_daemon_handle(&self, handle: Handle) {
        if self.daemon.set(handle).is_err() {
            tracing::warn!("Daemon runtime already installed");
        }
    }

    fn events(&self) -> Weak<dyn ConnectionEvents> {
        self.me.clone()
    }

    fn register(&self, conn: &Arc<Connection>) {
        self.connections.insert(conn.id(), Arc::clone(conn));
        metrics::record_connection_opened(conn.kind());
    }

    /// Hand a socket accepted on `listener` to its worker.
    pub fn accept_client(&self, socket: RawSocket, listener: &Listener) {
        if self.shutdown.is_triggered() {
            return;
        }
        let role = if listener.is_privileged() {
            ConnectionRole::Privileged
        } else {
            ConnectionRole::Open
        };
        let (conn, outbound) = Connection::client(socket.peer(), role, self.events());
        self.register(&conn);
        tracing::info!(
            connection_id = %conn.id(),
            peer = %conn.peer(),
            listener = %listener.url(),
            "Client connected"
        );

        let handshake = match listener.tls() {
            Some(acceptor) => Handshake::Accept(acceptor.clone()),
            None => Handshake::None,
        };
        self.hand_off(Served {
            socket,
            conn,
            outbound,
            handshake,
        });
    }

    async fn connect_upstream(self: Arc<Self>, backend: Arc<Backend>, role: ConnectionRole) {
        let socket = match tokio::time::timeout(self.config.timeouts.connect(), backend.connect_socket()).await {
            Ok(Ok(socket)) => socket,
            Ok(Err(e)) => {
                backend.connect_failed(role, &e.to_string());
                return;
            }
            Err(_) => {
                backend.connect_failed(role, "connect timed out");
                return;
            }
        };

        let (conn, outbound) = Connection::upstream(backend.endpoint().to_string(), &backend, self.events());
        backend.connection_preparing(&conn, role);
        self.register(&conn);
        tracing::debug!(backend = %backend.name(), connection_id = %conn.id(), role = ?role, "Upstream connected");

        let handshake = match backend.tls() {
            Some(tls) => Handshake::Connect(tls.clone()),
            None => Handshake::None,
        };
        self.hand_off(Served {
            socket,
            conn,
            outbound,
            handshake,
        });
    }

    /// Send a connection to the worker owning its descriptor.
    pub(crate) fn hand_off(&self, served: Served) {
        let Some(workers) = self.workers.get().filter(|w| !w.is_empty()) else {
            tracing::warn!(connection_id = %served.conn.id(), "No I/O workers, dropping connection");
            served.conn.mark_dead();
            return;
        };
        let index = served.socket.fd().unsigned_abs() as usize % workers.len();
        if let Err(mpsc::error::SendError(job)) = workers[index].send(WorkerJob::Serve(served)) {
            if let WorkerJob::Serve(served) = job {
                tracing::debug!(connection_id = %served.conn.id(), worker = index, "Worker gone, dropping connection");
                served.conn.mark_dead();
            }
        }
    }

    /// Ask every worker to look at the shutdown flag.
    pub fn wake_workers(&self) {
        for worker in self.workers.get().into_iter().flatten() {
            let _ = worker.send(WorkerJob::Wake);
        }
    }

    /// Fail stale operations, close idle clients and prune backend queues.
    pub fn scan(&self, now: Instant) {
        let expired = self.router.expire_stale(now);
        if expired > 0 {
            tracing::info!(expired = expired, "Expired stale operations");
        }

        if let Some(limit) = self.config.timeouts.idle() {
            let idle: Vec<Arc<Connection>> = self
                .connections
                .iter()
                .filter(|entry| entry.kind() == ConnectionKind::Client && entry.idle_for() >= limit)
                .map(|entry| Arc::clone(entry.value()))
                .collect();
            for conn in idle {
                let quiet = conn.lock().pending_len() == 0;
                if quiet && conn.is_live() {
                    tracing::info!(connection_id = %conn.id(), peer = %conn.peer(), "Closing idle client");
                    conn.mark_dead();
                }
            }
        }

        for backend in self.backends.all() {
            backend.prune_waiting();
            metrics::record_backend_pool(backend.name(), &backend.stats());
        }
    }

    /// Administrative cancel of an in-flight operation.
    pub fn cancel_operation(&self, id: u64) -> bool {
        self.router.cancel_by_id(id)
    }

    /// Mark every remaining connection dead and drop all queued work.
    pub fn release_all(&self) {
        let remaining: Vec<Arc<Connection>> = self
            .connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for conn in &remaining {
            conn.mark_dead();
        }
        self.router.clear();
        for backend in self.backends.all() {
            let dropped = backend.clear();
            if !dropped.is_empty() {
                tracing::debug!(backend = %backend.name(), dropped = dropped.len(), "Dropped queued requests");
            }
        }
        tracing::debug!(remaining = self.connections.len(), "Released connections");
    }
}

impl ConnectionEvents for Context {
    fn connection_dead(&self, conn: &Arc<Connection>, orphans: Vec<Arc<Operation>>) {
        self.router.connection_lost(conn, orphans);
    }

    fn connection_destroyed(&self, conn: &Connection) {
        self.connections.remove(&conn.id());
        metrics::record_connection_closed(conn.kind());
        for listener in &self.listeners {
            listener.unmute();
        }
    }
}

impl UpstreamConnector for Context {
    fn connect(&self, backend: Arc<Backend>, role: ConnectionRole) {
        let (Some(handle), Some(ctx)) = (self.daemon.get(), self.me.upgrade()) else {
            backend.connect_failed(role, "daemon not running");
            return;
        };
        if self.shutdown.is_triggered() {
            backend.connect_failed(role, "shutting down");
            return;
        }
        handle.spawn(ctx.connect_upstream(backend, role));
    }
}
