//! Connection lifecycle, reference counting and the pending-operation index.
//!
//! # Responsibilities
//! - Generate unique connection IDs for tracing
//! - Track liveness separately from the reference count
//! - Tear a connection down exactly once, when it is dead and unreferenced
//! - Map message ids to the operations pending on this connection
//!
//! # Locking
//! Each connection has one state mutex. The lock order is
//! backend → connection → operation; nothing takes a connection lock while
//! holding an operation lock. A [`ConnectionRef`] must never be dropped while
//! the same connection is locked, so removals hand operations back to the
//! caller instead of dropping them under the lock.

use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::{mpsc, watch};

use crate::load_balancer::backend::Backend;
use crate::pdu::{MessageId, Pdu, MAX_MESSAGE_ID};
use crate::routing::operation::Operation;

/// Global atomic counter for connection IDs.
/// Using relaxed ordering is sufficient since we only need uniqueness, not synchronization.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Which side of the balancer a connection faces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    Client,
    Upstream,
}

impl ConnectionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionKind::Client => "client",
            ConnectionKind::Upstream => "upstream",
        }
    }
}

/// Protocol state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    /// Able to carry requests.
    Ready,
    /// An exclusive operation (TLS handshake) is in progress.
    Active,
    /// A bind is outstanding.
    Binding,
    /// Dead; waiting for the last reference to go.
    Closing,
}

/// Type tag of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionRole {
    /// Ordinary traffic.
    Open,
    /// Upstream connection not yet assigned a role.
    Preparing,
    /// Upstream connection dedicated to bind requests.
    Bind,
    /// Client connection exempt from pending-request ceilings.
    Privileged,
}

/// Callbacks from the connection lifecycle into the orchestration layer.
pub trait ConnectionEvents: Send + Sync {
    /// The live token was revoked; `orphans` were pending on the connection.
    fn connection_dead(&self, conn: &Arc<Connection>, orphans: Vec<Arc<Operation>>);

    /// The connection is dead and unreferenced. Called exactly once.
    fn connection_destroyed(&self, conn: &Connection);
}

/// A PDU queued for the connection's writer.
#[derive(Debug)]
pub struct Outbound {
    pub bytes: Bytes,
    /// Operation to advance once the bytes are on the wire.
    pub operation: Option<Weak<Operation>>,
}

impl Outbound {
    pub fn new(pdu: Pdu) -> Self {
        Self {
            bytes: pdu.into_bytes(),
            operation: None,
        }
    }

    pub fn for_operation(pdu: Pdu, op: &Arc<Operation>) -> Self {
        Self {
            bytes: pdu.into_bytes(),
            operation: Some(Arc::downgrade(op)),
        }
    }

    /// Record that the bytes were written.
    pub fn written(self) {
        if let Some(op) = self.operation.and_then(|op| op.upgrade()) {
            op.mark_written();
        }
    }
}

struct ConnectionState {
    /// Counted references, including the live token while `live` is set.
    refcnt: usize,
    live: bool,
    destroyed: bool,
    phase: ConnectionPhase,
    role: ConnectionRole,
    pending: HashMap<MessageId, Arc<Operation>>,
    next_message_id: MessageId,
}

impl ConnectionState {
    fn release(&mut self) -> bool {
        debug_assert!(self.refcnt > 0, "connection reference count underflow");
        self.refcnt = self.refcnt.saturating_sub(1);
        self.take_teardown()
    }

    fn take_teardown(&mut self) -> bool {
        if self.refcnt == 0 && !self.live && !self.destroyed {
            self.destroyed = true;
            return true;
        }
        false
    }
}

/// A client or upstream endpoint.
pub struct Connection {
    id: ConnectionId,
    kind: ConnectionKind,
    peer: String,
    created: Instant,
    /// Milliseconds since `created` of the last inbound PDU.
    last_activity: AtomicU64,
    state: Mutex<ConnectionState>,
    outbound: mpsc::UnboundedSender<Outbound>,
    closed: watch::Sender<bool>,
    backend: Option<Weak<Backend>>,
    events: Weak<dyn ConnectionEvents>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// A connection accepted from a client.
    pub fn client(
        peer: String,
        role: ConnectionRole,
        events: Weak<dyn ConnectionEvents>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Outbound>) {
        Self::new(ConnectionKind::Client, peer, role, None, events)
    }

    /// A connection opened towards `backend`, still `Preparing`.
    pub fn upstream(
        peer: String,
        backend: &Arc<Backend>,
        events: Weak<dyn ConnectionEvents>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Outbound>) {
        Self::new(
            ConnectionKind::Upstream,
            peer,
            ConnectionRole::Preparing,
            Some(Arc::downgrade(backend)),
            events,
        )
    }

    fn new(
        kind: ConnectionKind,
        peer: String,
        role: ConnectionRole,
        backend: Option<Weak<Backend>>,
        events: Weak<dyn ConnectionEvents>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Outbound>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);
        let conn = Arc::new(Self {
            id: ConnectionId::new(),
            kind,
            peer,
            created: Instant::now(),
            last_activity: AtomicU64::new(0),
            state: Mutex::new(ConnectionState {
                refcnt: 1,
                live: true,
                destroyed: false,
                phase: ConnectionPhase::Ready,
                role,
                pending: HashMap::new(),
                next_message_id: 1,
            }),
            outbound,
            closed,
            backend,
            events,
        });
        tracing::trace!(connection_id = %conn.id, kind = kind.as_str(), peer = %conn.peer, "Connection created");
        (conn, rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn kind(&self) -> ConnectionKind {
        self.kind
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn created(&self) -> Instant {
        self.created
    }

    /// Backend this upstream connection belongs to.
    pub fn backend(&self) -> Option<Arc<Backend>> {
        self.backend.as_ref().and_then(Weak::upgrade)
    }

    fn lock_state(&self) -> MutexGuard<'_, ConnectionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take the state lock.
    pub fn lock(self: &Arc<Self>) -> Locked<'_> {
        Locked {
            conn: self,
            state: self.lock_state(),
        }
    }

    /// Take a counted reference if the connection is still live.
    pub fn acquire(self: &Arc<Self>) -> Option<ConnectionRef> {
        let mut locked = self.lock();
        locked.is_live().then(|| locked.acquire())
    }

    pub fn is_live(&self) -> bool {
        self.lock_state().live
    }

    /// Whether teardown has run.
    pub fn is_destroyed(&self) -> bool {
        self.lock_state().destroyed
    }

    pub fn ref_count(&self) -> usize {
        self.lock_state().refcnt
    }

    /// Revoke the live token.
    ///
    /// Pending operations are handed to [`ConnectionEvents::connection_dead`];
    /// teardown happens once they and every other holder have released.
    pub fn mark_dead(self: &Arc<Self>) {
        let (orphans, destroy) = {
            let mut state = self.lock_state();
            if !state.live {
                return;
            }
            state.live = false;
            state.phase = ConnectionPhase::Closing;
            let orphans: Vec<Arc<Operation>> = state.pending.drain().map(|(_, op)| op).collect();
            (orphans, state.release())
        };

        tracing::debug!(
            connection_id = %self.id,
            kind = self.kind.as_str(),
            orphans = orphans.len(),
            "Connection marked dead"
        );
        self.closed.send_replace(true);

        match self.events.upgrade() {
            Some(events) => events.connection_dead(self, orphans),
            None => drop(orphans),
        }
        if destroy {
            self.destroy();
        }
    }

    fn release(self: &Arc<Self>) {
        let destroy = self.lock_state().release();
        if destroy {
            self.destroy();
        }
    }

    fn destroy(&self) {
        tracing::debug!(connection_id = %self.id, kind = self.kind.as_str(), "Connection destroyed");
        if let Some(events) = self.events.upgrade() {
            events.connection_destroyed(self);
        }
    }

    /// Queue bytes for the writer. Returns false once the connection is dead.
    pub fn send(&self, outbound: Outbound) -> bool {
        if !self.is_live() {
            return false;
        }
        self.outbound.send(outbound).is_ok()
    }

    /// Resolves once the connection has been marked dead.
    pub fn closed(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }

    /// Record inbound activity.
    pub fn touch(&self) {
        let elapsed = self.created.elapsed().as_millis() as u64;
        self.last_activity.store(elapsed, Ordering::Relaxed);
    }

    /// Time since the last inbound PDU (or since creation).
    pub fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_activity.load(Ordering::Relaxed));
        self.created.elapsed().saturating_sub(last)
    }
}

/// The state lock of a connection.
pub struct Locked<'a> {
    conn: &'a Arc<Connection>,
    state: MutexGuard<'a, ConnectionState>,
}

impl Locked<'_> {
    pub fn is_live(&self) -> bool {
        self.state.live
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.state.phase
    }

    /// Change phase. A dead connection stays `Closing`.
    pub fn set_phase(&mut self, phase: ConnectionPhase) {
        if self.state.live {
            self.state.phase = phase;
        }
    }

    pub fn role(&self) -> ConnectionRole {
        self.state.role
    }

    pub fn set_role(&mut self, role: ConnectionRole) {
        self.state.role = role;
    }

    pub fn ref_count(&self) -> usize {
        self.state.refcnt
    }

    /// Take a counted reference.
    pub fn acquire(&mut self) -> ConnectionRef {
        self.state.refcnt += 1;
        ConnectionRef {
            conn: Arc::clone(self.conn),
            armed: true,
        }
    }

    /// Give back `reference` without re-taking the lock; tears the
    /// connection down after unlocking if that was the last reference.
    pub fn release_locked(mut self, reference: ConnectionRef) {
        debug_assert!(Arc::ptr_eq(&reference.conn, self.conn));
        reference.disarm();
        let destroy = self.state.release();
        let conn = self.conn;
        drop(self);
        if destroy {
            conn.destroy();
        }
    }

    /// Take a reference and unlock, so the caller can lock again later
    /// knowing the connection still exists.
    pub fn unlock_keep_alive(mut self) -> ConnectionRef {
        self.acquire()
    }

    /// Allocate a message id not currently pending.
    pub fn next_message_id(&mut self) -> MessageId {
        loop {
            let id = self.state.next_message_id;
            self.state.next_message_id = if id >= MAX_MESSAGE_ID { 1 } else { id + 1 };
            if !self.state.pending.contains_key(&id) {
                return id;
            }
        }
    }

    /// Register `op` under `id`. Fails if `id` is taken.
    pub fn insert_pending(&mut self, id: MessageId, op: Arc<Operation>) -> Result<(), Arc<Operation>> {
        if self.state.pending.contains_key(&id) {
            return Err(op);
        }
        self.state.pending.insert(id, op);
        Ok(())
    }

    pub fn pending(&self, id: MessageId) -> Option<Arc<Operation>> {
        self.state.pending.get(&id).cloned()
    }

    pub fn is_pending(&self, id: MessageId) -> bool {
        self.state.pending.contains_key(&id)
    }

    /// Remove whatever is pending under `id`.
    #[must_use]
    pub fn take_pending(&mut self, id: MessageId) -> Option<Arc<Operation>> {
        self.state.pending.remove(&id)
    }

    /// Remove `id` only if it still maps to `op`.
    #[must_use]
    pub fn remove_pending(&mut self, id: MessageId, op: &Operation) -> Option<Arc<Operation>> {
        match self.state.pending.get(&id) {
            Some(existing) if std::ptr::eq(Arc::as_ptr(existing), op) => self.state.pending.remove(&id),
            _ => None,
        }
    }

    pub fn pending_len(&self) -> usize {
        self.state.pending.len()
    }
}

/// A counted reference; released when dropped.
pub struct ConnectionRef {
    conn: Arc<Connection>,
    armed: bool,
}

impl ConnectionRef {
    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Deref for ConnectionRef {
    type Target = Arc<Connection>;

    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}

impl fmt::Debug for ConnectionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ConnectionRef").field(&self.conn.id).finish()
    }
}

impl Drop for ConnectionRef {
    fn drop(&mut self) {
        if self.armed {
            self.conn.release();
        }
    }
}
