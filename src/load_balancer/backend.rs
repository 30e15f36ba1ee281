//! Backend abstraction.
//!
//! # Responsibilities
//! - Represent a single upstream directory server
//! - Keep pools of ready open and bind connections, in LRU order
//! - Count connections being established and enforce the ceilings
//! - Queue requests that arrive while no connection is ready
//! - Track connect failures and the backoff before the next attempt
//!
//! # Invariants
//! - ready + preparing + connecting never exceeds the per-role ceiling
//! - preparing + connecting never exceeds `max_connecting`
//! - while failed, at most one attempt is in progress
//! - a connection is in at most one collection at a time

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use tokio::net::{TcpStream, UnixStream};

use crate::config::BackendConfig;
use crate::net::address::{Endpoint, LdapUrl, Transport, UrlError};
use crate::net::connection::{Connection, ConnectionPhase, ConnectionRef, ConnectionRole};
use crate::net::stream::RawSocket;
use crate::net::tls::{load_connector, TlsError, UpstreamTls};
use crate::resilience::backoff::{BackoffPolicy, RetryState};
use crate::routing::operation::{Operation, OperationPhase};

/// Error type for resolving backend configuration.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("backend '{name}': {source}")]
    Uri { name: String, source: UrlError },
    #[error("backend '{name}': {source}")]
    Tls { name: String, source: TlsError },
}

/// Starts asynchronous connects on behalf of a backend.
pub trait UpstreamConnector: Send + Sync {
    /// Begin connecting. Must eventually report back through
    /// [`Backend::connect_failed`] or [`Backend::connection_preparing`].
    fn connect(&self, backend: Arc<Backend>, role: ConnectionRole);
}

/// Per-backend ceilings.
#[derive(Debug, Clone, Copy)]
pub struct BackendLimits {
    pub max_connections: usize,
    pub max_bind_connections: usize,
    pub max_connecting: usize,
    pub max_pending_ops: usize,
    /// 0 means unlimited.
    pub max_pending_per_connection: usize,
}

/// A backend's configuration with its URI and TLS settings resolved.
#[derive(Debug, Clone)]
pub struct BackendSpec {
    pub name: String,
    pub uri: String,
    pub transport: Transport,
    pub endpoint: Endpoint,
    pub tls: Option<UpstreamTls>,
    pub limits: BackendLimits,
}

impl BackendSpec {
    pub fn resolve(config: &BackendConfig) -> Result<Self, BackendError> {
        let url: LdapUrl = config.uri.parse().map_err(|source| BackendError::Uri {
            name: config.name.clone(),
            source,
        })?;

        let tls = match (url.transport, url.endpoint.host()) {
            (Transport::Tls, Some(host)) => Some(load_connector(host, config.tls.as_ref()).map_err(|source| {
                BackendError::Tls {
                    name: config.name.clone(),
                    source,
                }
            })?),
            _ => None,
        };

        Ok(Self {
            name: config.name.clone(),
            uri: config.uri.clone(),
            transport: url.transport,
            endpoint: url.endpoint,
            tls,
            limits: BackendLimits {
                max_connections: config.max_connections,
                max_bind_connections: config.max_bind_connections,
                max_connecting: config.max_connecting,
                max_pending_ops: config.max_pending_ops,
                max_pending_per_connection: config.max_pending_per_connection,
            },
        })
    }
}

/// Point-in-time view of a backend.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendStats {
    pub open: usize,
    pub bind: usize,
    pub preparing: usize,
    pub connecting: usize,
    pub waiting: usize,
    pub failed: bool,
    pub failures: u32,
    pub delay: Duration,
}

#[derive(Default)]
struct BackendState {
    open: VecDeque<Arc<Connection>>,
    bind: VecDeque<Arc<Connection>>,
    preparing: Vec<(Arc<Connection>, ConnectionRole)>,
    connecting_open: usize,
    connecting_bind: usize,
    waiting_open: VecDeque<Arc<Operation>>,
    waiting_bind: VecDeque<Arc<Operation>>,
    retry: RetryState,
}

impl BackendState {
    fn pool_mut(&mut self, role: ConnectionRole) -> &mut VecDeque<Arc<Connection>> {
        if role == ConnectionRole::Bind {
            &mut self.bind
        } else {
            &mut self.open
        }
    }

    fn connecting_mut(&mut self, role: ConnectionRole) -> &mut usize {
        if role == ConnectionRole::Bind {
            &mut self.connecting_bind
        } else {
            &mut self.connecting_open
        }
    }

    fn waiting_mut(&mut self, role: ConnectionRole) -> &mut VecDeque<Arc<Operation>> {
        if role == ConnectionRole::Bind {
            &mut self.waiting_bind
        } else {
            &mut self.waiting_open
        }
    }

    /// Ready, preparing and connecting connections of one role.
    fn count(&self, role: ConnectionRole) -> usize {
        let bind = role == ConnectionRole::Bind;
        let (ready, connecting) = if bind {
            (self.bind.len(), self.connecting_bind)
        } else {
            (self.open.len(), self.connecting_open)
        };
        let preparing = self
            .preparing
            .iter()
            .filter(|(_, r)| (*r == ConnectionRole::Bind) == bind)
            .count();
        ready + preparing + connecting
    }

    fn in_progress(&self) -> usize {
        self.connecting_open + self.connecting_bind + self.preparing.len()
    }

    /// Queued operations that still want an upstream.
    fn waiting(&self) -> usize {
        self.waiting_open
            .iter()
            .chain(self.waiting_bind.iter())
            .filter(|op| still_waiting(op))
            .count()
    }

    /// Move out queued operations that were answered, cancelled or lost
    /// their client. The caller drops them after unlocking.
    fn prune_waiting(&mut self) -> Vec<Arc<Operation>> {
        let mut gone = Vec::new();
        for queue in [&mut self.waiting_open, &mut self.waiting_bind] {
            let (keep, stale): (VecDeque<_>, VecDeque<_>) = queue.drain(..).partition(|op| still_waiting(op));
            *queue = keep;
            gone.extend(stale);
        }
        gone
    }
}

fn still_waiting(op: &Operation) -> bool {
    !op.is_completed() && !op.is_cancelled() && op.client().is_some()
}

/// A named upstream directory server.
pub struct Backend {
    name: String,
    uri: String,
    transport: Transport,
    endpoint: Endpoint,
    tls: Option<UpstreamTls>,
    limits: BackendLimits,
    backoff: BackoffPolicy,
    connector: Weak<dyn UpstreamConnector>,
    state: Mutex<BackendState>,
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backend")
            .field("name", &self.name)
            .field("uri", &self.uri)
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

impl Backend {
    pub fn new(spec: BackendSpec, backoff: BackoffPolicy, connector: Weak<dyn UpstreamConnector>) -> Self {
        Self {
            name: spec.name,
            uri: spec.uri,
            transport: spec.transport,
            endpoint: spec.endpoint,
            tls: spec.tls,
            limits: spec.limits,
            backoff,
            connector,
            state: Mutex::new(BackendState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BackendState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn tls(&self) -> Option<&UpstreamTls> {
        self.tls.as_ref()
    }

    pub fn limits(&self) -> &BackendLimits {
        &self.limits
    }

    /// Connection ceiling for one role.
    pub fn ceiling(&self, role: ConnectionRole) -> usize {
        if role == ConnectionRole::Bind {
            self.limits.max_bind_connections
        } else {
            self.limits.max_connections
        }
    }

    /// Whether requests of this role can ever be served here.
    pub fn serves(&self, role: ConnectionRole) -> bool {
        self.ceiling(role) > 0
    }

    /// Not in backoff, or still holding ready connections.
    pub fn is_available(&self) -> bool {
        let state = self.lock();
        !state.retry.is_failed() || !state.open.is_empty() || !state.bind.is_empty()
    }

    /// Outstanding requests: queued here plus pending on open connections.
    pub fn load(&self) -> usize {
        let state = self.lock();
        let pending: usize = state.open.iter().map(|conn| conn.lock().pending_len()).sum();
        pending + state.waiting()
    }

    /// Take a reference to the least recently used ready connection of `role`.
    pub fn select_upstream(&self, role: ConnectionRole) -> Option<ConnectionRef> {
        let max_pending = self.limits.max_pending_per_connection;
        let mut state = self.lock();
        let pool = state.pool_mut(role);
        for _ in 0..pool.len() {
            let Some(conn) = pool.pop_front() else {
                break;
            };
            let mut locked = conn.lock();
            let usable = locked.is_live()
                && locked.phase() == ConnectionPhase::Ready
                && (role == ConnectionRole::Bind || max_pending == 0 || locked.pending_len() < max_pending);
            let reference = usable.then(|| locked.acquire());
            drop(locked);
            pool.push_back(conn);
            if reference.is_some() {
                return reference;
            }
        }
        None
    }

    /// Start connecting if the ceilings and backoff allow it.
    pub fn open_connection(self: &Arc<Self>, role: ConnectionRole) -> bool {
        let now = Instant::now();
        {
            let mut state = self.lock();
            if state.count(role) >= self.ceiling(role) || state.in_progress() >= self.limits.max_connecting {
                return false;
            }
            if state.retry.is_failed() && (state.in_progress() > 0 || !state.retry.ready(now)) {
                return false;
            }
            *state.connecting_mut(role) += 1;
        }

        let Some(connector) = self.connector.upgrade() else {
            let mut state = self.lock();
            let connecting = state.connecting_mut(role);
            *connecting = connecting.saturating_sub(1);
            return false;
        };
        tracing::debug!(backend = %self.name, role = ?role, "Opening upstream connection");
        connector.connect(Arc::clone(self), role);
        true
    }

    /// Open connections until a ceiling or the backoff stops us.
    pub fn retry(self: &Arc<Self>) -> usize {
        let mut started = 0;
        for role in [ConnectionRole::Open, ConnectionRole::Bind] {
            while self.open_connection(role) {
                started += 1;
            }
        }
        started
    }

    /// Resolve and connect the socket for a new upstream connection.
    pub async fn connect_socket(&self) -> io::Result<RawSocket> {
        match &self.endpoint {
            Endpoint::Tcp { .. } => RawSocket::from_tcp(TcpStream::connect(self.endpoint.to_string()).await?),
            Endpoint::Unix(path) => RawSocket::from_unix(UnixStream::connect(path).await?),
        }
    }

    /// A connect attempt for `role` failed before a connection existed.
    pub fn connect_failed(&self, role: ConnectionRole, reason: &str) {
        let (failures, delay) = {
            let mut state = self.lock();
            let connecting = state.connecting_mut(role);
            *connecting = connecting.saturating_sub(1);
            state.retry.record_failure(self.backoff, Instant::now());
            (state.retry.failures(), state.retry.delay())
        };
        tracing::warn!(
            backend = %self.name,
            error = %reason,
            failures = failures,
            retry_in_ms = delay.as_millis() as u64,
            "Upstream connect failed"
        );
        crate::observability::metrics::record_backend_connect(&self.name, false);
    }

    /// The socket is connected; the connection now counts as preparing.
    pub fn connection_preparing(&self, conn: &Arc<Connection>, role: ConnectionRole) {
        let mut state = self.lock();
        let connecting = state.connecting_mut(role);
        *connecting = connecting.saturating_sub(1);
        state.preparing.push((Arc::clone(conn), role));
    }

    /// Handshake finished: move `conn` into its ready pool.
    ///
    /// Returns false if the connection is no longer tracked here.
    pub fn connection_established(&self, conn: &Arc<Connection>) -> bool {
        let (role, recovered) = {
            let mut state = self.lock();
            let Some(pos) = state.preparing.iter().position(|(c, _)| Arc::ptr_eq(c, conn)) else {
                return false;
            };
            let (conn, role) = state.preparing.swap_remove(pos);
            conn.lock().set_role(role);
            state.pool_mut(role).push_back(conn);
            let recovered = state.retry.is_failed();
            state.retry.record_success();
            (role, recovered)
        };

        tracing::info!(backend = %self.name, connection_id = %conn.id(), role = ?role, "Upstream connection ready");
        if recovered {
            tracing::info!(backend = %self.name, "Backend recovered");
        }
        crate::observability::metrics::record_backend_connect(&self.name, true);
        true
    }

    /// Handshake on a preparing connection failed.
    pub fn handshake_failed(&self, conn: &Arc<Connection>, reason: &str) {
        let failures = {
            let mut state = self.lock();
            state.preparing.retain(|(c, _)| !Arc::ptr_eq(c, conn));
            state.retry.record_failure(self.backoff, Instant::now());
            state.retry.failures()
        };
        tracing::warn!(backend = %self.name, connection_id = %conn.id(), error = %reason, failures = failures, "Upstream handshake failed");
        crate::observability::metrics::record_backend_connect(&self.name, false);
    }

    /// Forget a connection, whatever collection it is in.
    pub fn remove_connection(&self, conn: &Arc<Connection>) -> bool {
        let mut state = self.lock();
        let before = state.open.len() + state.bind.len() + state.preparing.len();
        state.open.retain(|c| !Arc::ptr_eq(c, conn));
        state.bind.retain(|c| !Arc::ptr_eq(c, conn));
        state.preparing.retain(|(c, _)| !Arc::ptr_eq(c, conn));
        before != state.open.len() + state.bind.len() + state.preparing.len()
    }

    /// Queue `op` until a connection of `role` is ready.
    ///
    /// Fails once `max_pending_ops` requests are queued, unless the
    /// operation comes from a privileged client.
    pub fn enqueue(self: &Arc<Self>, op: Arc<Operation>, role: ConnectionRole) -> Result<(), Arc<Operation>> {
        let (gone, admitted) = {
            let mut state = self.lock();
            let gone = state.prune_waiting();
            let admitted = op.is_privileged() || state.waiting() < self.limits.max_pending_ops;
            if admitted {
                op.set_phase(OperationPhase::AwaitingUpstream);
                state.waiting_mut(role).push_back(Arc::clone(&op));
            }
            (gone, admitted)
        };
        drop(gone);
        if !admitted {
            return Err(op);
        }
        self.open_connection(role);
        Ok(())
    }

    /// Drop queued operations nobody waits for any more. Returns how many.
    pub fn prune_waiting(&self) -> usize {
        let gone = self.lock().prune_waiting();
        if !gone.is_empty() {
            tracing::debug!(backend = %self.name, pruned = gone.len(), "Pruned abandoned queued requests");
        }
        gone.len()
    }

    /// Next queued operation of `role` that still has a client.
    pub fn next_waiting(&self, role: ConnectionRole) -> Option<Arc<Operation>> {
        let mut gone = Vec::new();
        let mut state = self.lock();
        let queue = state.waiting_mut(role);
        let next = loop {
            match queue.pop_front() {
                Some(op) if still_waiting(&op) => break Some(op),
                Some(op) => gone.push(op),
                None => break None,
            }
        };
        drop(state);
        drop(gone);
        next
    }

    /// Put an operation back at the head of its queue.
    pub fn requeue(&self, op: Arc<Operation>, role: ConnectionRole) {
        self.lock().waiting_mut(role).push_front(op);
    }

    pub fn has_waiting(&self) -> bool {
        self.lock().waiting() > 0
    }

    /// Empty the pools and queues. Used at shutdown.
    pub fn clear(&self) -> Vec<Arc<Operation>> {
        let mut state = self.lock();
        state.open.clear();
        state.bind.clear();
        state.preparing.clear();
        let mut waiting: Vec<Arc<Operation>> = state.waiting_open.drain(..).collect();
        waiting.extend(state.waiting_bind.drain(..));
        waiting
    }

    pub fn stats(&self) -> BackendStats {
        let state = self.lock();
        BackendStats {
            open: state.open.len(),
            bind: state.bind.len(),
            preparing: state.preparing.len(),
            connecting: state.connecting_open + state.connecting_bind,
            waiting: state.waiting(),
            failed: state.retry.is_failed(),
            failures: state.retry.failures(),
            delay: state.retry.delay(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::connection::ConnectionEvents;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingConnector {
        calls: AtomicUsize,
    }

    impl UpstreamConnector for CountingConnector {
        fn connect(&self, _backend: Arc<Backend>, _role: ConnectionRole) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct NoEvents;

    impl ConnectionEvents for NoEvents {
        fn connection_dead(&self, _conn: &Arc<Connection>, _orphans: Vec<Arc<Operation>>) {}
        fn connection_destroyed(&self, _conn: &Connection) {}
    }

    fn backend(connector: &Arc<CountingConnector>, max_connections: usize, max_connecting: usize) -> Arc<Backend> {
        let mut config = BackendConfig::new("dir1", "ldap://127.0.0.1:389");
        config.max_connections = max_connections;
        config.max_connecting = max_connecting;
        let spec = BackendSpec::resolve(&config).unwrap();
        let weak: Weak<CountingConnector> = Arc::downgrade(connector);
        Arc::new(Backend::new(spec, BackoffPolicy { base_ms: 100, max_ms: 1000 }, weak))
    }

    fn upstream(backend: &Arc<Backend>) -> Arc<Connection> {
        let events: Weak<dyn ConnectionEvents> = Weak::<NoEvents>::new();
        Connection::upstream("test".into(), backend, events).0
    }

    #[test]
    fn burst_never_exceeds_connecting_ceiling() {
        let connector = Arc::new(CountingConnector::default());
        let backend = backend(&connector, 8, 3);

        let handles: Vec<_> = (0..32)
            .map(|_| {
                let backend = Arc::clone(&backend);
                std::thread::spawn(move || backend.open_connection(ConnectionRole::Open))
            })
            .collect();
        let started = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(started, 3);

        assert_eq!(connector.calls.load(Ordering::SeqCst), 3);
        assert_eq!(backend.stats().connecting, 3);
    }

    #[test]
    fn ready_plus_connecting_stays_under_ceiling() {
        let connector = Arc::new(CountingConnector::default());
        let backend = backend(&connector, 2, 2);

        assert_eq!(backend.retry(), 2);
        let a = upstream(&backend);
        let b = upstream(&backend);
        backend.connection_preparing(&a, ConnectionRole::Open);
        backend.connection_preparing(&b, ConnectionRole::Open);
        assert!(backend.connection_established(&a));
        assert!(backend.connection_established(&b));

        assert!(!backend.open_connection(ConnectionRole::Open));
        assert_eq!(backend.retry(), 1);
        let stats = backend.stats();
        assert_eq!(stats.open, 2);
        assert_eq!(stats.bind, 0);
        assert_eq!(stats.connecting, 1);
    }

    #[test]
    fn selection_rotates_least_recently_used() {
        let connector = Arc::new(CountingConnector::default());
        let backend = backend(&connector, 2, 2);
        backend.retry();
        let a = upstream(&backend);
        let b = upstream(&backend);
        for conn in [&a, &b] {
            backend.connection_preparing(conn, ConnectionRole::Open);
            backend.connection_established(conn);
        }

        let first = backend.select_upstream(ConnectionRole::Open).unwrap();
        let second = backend.select_upstream(ConnectionRole::Open).unwrap();
        let third = backend.select_upstream(ConnectionRole::Open).unwrap();
        assert_eq!(first.id(), a.id());
        assert_eq!(second.id(), b.id());
        assert_eq!(third.id(), a.id());
        assert!(backend.select_upstream(ConnectionRole::Bind).is_none());
    }

    #[test]
    fn dead_connections_are_skipped_and_removed() {
        let connector = Arc::new(CountingConnector::default());
        let backend = backend(&connector, 1, 1);
        backend.retry();
        let a = upstream(&backend);
        backend.connection_preparing(&a, ConnectionRole::Open);
        backend.connection_established(&a);

        a.mark_dead();
        assert!(backend.select_upstream(ConnectionRole::Open).is_none());
        assert!(backend.remove_connection(&a));
        assert!(!backend.remove_connection(&a));
        assert_eq!(backend.stats().open, 0);
    }

    #[test]
    fn failure_allows_one_attempt_after_delay() {
        let connector = Arc::new(CountingConnector::default());
        let backend = backend(&connector, 4, 4);

        assert!(backend.open_connection(ConnectionRole::Open));
        backend.connect_failed(ConnectionRole::Open, "refused");
        let stats = backend.stats();
        assert!(stats.failed);
        assert_eq!(stats.failures, 1);
        assert_eq!(stats.delay, Duration::from_millis(100));
        assert!(!backend.open_connection(ConnectionRole::Open));
        assert!(!backend.is_available());

        std::thread::sleep(Duration::from_millis(120));
        assert!(backend.open_connection(ConnectionRole::Open));
        assert!(!backend.open_connection(ConnectionRole::Open));

        let conn = upstream(&backend);
        backend.connection_preparing(&conn, ConnectionRole::Open);
        backend.connection_established(&conn);
        let stats = backend.stats();
        assert!(!stats.failed);
        assert_eq!(stats.delay, Duration::ZERO);
    }
}
