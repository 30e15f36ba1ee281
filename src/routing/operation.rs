//! A single request in flight between one client and one upstream.
//!
//! # Responsibilities
//! - Remember the client's message id and the one used upstream
//! - Hold a counted reference to each side while attached
//! - Detach each side exactly once and report when both are gone
//!
//! # Design Decisions
//! - Flags are monotonic: a side that started detaching never reattaches
//! - Detaching removes the pending entry from that side's connection, but
//!   only if the entry still points at this operation

use std::fmt;
use std::ops::BitOr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::net::connection::{Connection, ConnectionId, ConnectionRef};
use crate::pdu::{tag, MessageId, Pdu};

static OPERATION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Which end of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Upstream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum OperationPhase {
    Created,
    /// Waiting for an upstream connection.
    AwaitingUpstream,
    /// Queued on the upstream writer.
    Forwarded,
    /// On the wire; waiting for the final response.
    AwaitingResponse,
    Completed,
}

/// Lifecycle flags of an operation.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct OperationFlags(u8);

impl OperationFlags {
    pub const CLIENT_DETACHING: Self = Self(0x01);
    pub const CLIENT_FREEING: Self = Self(0x02);
    pub const UPSTREAM_DETACHING: Self = Self(0x04);
    pub const UPSTREAM_FREEING: Self = Self(0x08);
    pub const CANCELLED: Self = Self(0x10);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    fn detaching(side: Side) -> Self {
        match side {
            Side::Client => Self::CLIENT_DETACHING,
            Side::Upstream => Self::UPSTREAM_DETACHING,
        }
    }

    fn freeing(side: Side) -> Self {
        match side {
            Side::Client => Self::CLIENT_FREEING,
            Side::Upstream => Self::UPSTREAM_FREEING,
        }
    }

    fn is_freed(self) -> bool {
        self.contains(Self::CLIENT_FREEING | Self::UPSTREAM_FREEING)
    }
}

impl BitOr for OperationFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Debug for OperationFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OperationFlags({:#04x})", self.0)
    }
}

/// Result of [`Operation::detach`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Detach {
    /// This call performed the detach.
    pub detached: bool,
    /// This call completed the operation's teardown.
    pub freed: bool,
}

struct OperationInner {
    phase: OperationPhase,
    flags: OperationFlags,
    client: Option<ConnectionRef>,
    upstream: Option<ConnectionRef>,
    upstream_message_id: Option<MessageId>,
    request: Option<Pdu>,
}

pub struct Operation {
    id: u64,
    created: Instant,
    request_tag: u8,
    client_message_id: MessageId,
    client_id: ConnectionId,
    privileged: bool,
    inner: Mutex<OperationInner>,
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("id", &self.id)
            .field("client_id", &self.client_id)
            .field("client_message_id", &self.client_message_id)
            .field("request_tag", &format_args!("{:#04x}", self.request_tag))
            .finish_non_exhaustive()
    }
}

impl Operation {
    /// Create an operation owned by `client` for `request`.
    pub fn new(client: ConnectionRef, request: Pdu, privileged: bool) -> Arc<Self> {
        Arc::new(Self {
            id: OPERATION_ID_COUNTER.fetch_add(1, Ordering::Relaxed),
            created: Instant::now(),
            request_tag: request.op_tag(),
            client_message_id: request.message_id(),
            client_id: client.id(),
            privileged,
            inner: Mutex::new(OperationInner {
                phase: OperationPhase::Created,
                flags: OperationFlags::default(),
                client: Some(client),
                upstream: None,
                upstream_message_id: None,
                request: Some(request),
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, OperationInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn created(&self) -> Instant {
        self.created
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.created)
    }

    pub fn request_tag(&self) -> u8 {
        self.request_tag
    }

    pub fn is_bind(&self) -> bool {
        self.request_tag == tag::BIND_REQUEST
    }

    pub fn client_message_id(&self) -> MessageId {
        self.client_message_id
    }

    pub fn client_id(&self) -> ConnectionId {
        self.client_id
    }

    pub fn is_privileged(&self) -> bool {
        self.privileged
    }

    pub fn phase(&self) -> OperationPhase {
        self.lock().phase
    }

    /// Advance the phase. Phases never move backwards.
    pub fn set_phase(&self, phase: OperationPhase) {
        let mut inner = self.lock();
        if phase > inner.phase {
            inner.phase = phase;
        }
    }

    /// Claim the final response. Only the first caller gets true.
    pub fn complete(&self) -> bool {
        let mut inner = self.lock();
        if inner.phase == OperationPhase::Completed {
            return false;
        }
        inner.phase = OperationPhase::Completed;
        true
    }

    pub fn is_completed(&self) -> bool {
        self.phase() == OperationPhase::Completed
    }

    pub(crate) fn mark_written(&self) {
        self.set_phase(OperationPhase::AwaitingResponse);
    }

    pub fn flags(&self) -> OperationFlags {
        self.lock().flags
    }

    pub fn is_cancelled(&self) -> bool {
        self.flags().contains(OperationFlags::CANCELLED)
    }

    /// Flag the operation cancelled. Returns false if it already was.
    pub fn cancel(&self) -> bool {
        let mut inner = self.lock();
        if inner.flags.contains(OperationFlags::CANCELLED) {
            return false;
        }
        inner.flags.insert(OperationFlags::CANCELLED);
        true
    }

    /// Both sides have been released.
    pub fn is_freed(&self) -> bool {
        self.flags().is_freed()
    }

    /// The client connection while it is attached.
    pub fn client(&self) -> Option<Arc<Connection>> {
        let inner = self.lock();
        if inner.flags.contains(OperationFlags::CLIENT_DETACHING) {
            return None;
        }
        inner.client.as_ref().map(|c| Arc::clone(c.connection()))
    }

    /// The upstream connection and the message id used on it, while attached.
    pub fn upstream(&self) -> Option<(Arc<Connection>, MessageId)> {
        let inner = self.lock();
        if inner.flags.contains(OperationFlags::UPSTREAM_DETACHING) {
            return None;
        }
        let conn = inner.upstream.as_ref()?;
        Some((Arc::clone(conn.connection()), inner.upstream_message_id?))
    }

    /// Take the request for forwarding. `None` once forwarded or detached.
    pub fn take_request(&self) -> Option<Pdu> {
        let mut inner = self.lock();
        if inner.flags.contains(OperationFlags::CLIENT_DETACHING)
            || inner.flags.contains(OperationFlags::CANCELLED)
        {
            return None;
        }
        inner.request.take()
    }

    /// Put back a request that could not be forwarded.
    pub fn restore_request(&self, request: Pdu) {
        let mut inner = self.lock();
        if inner.upstream.is_none() {
            inner.request = Some(request);
        }
    }

    /// Attach the upstream side under message id `message_id`.
    ///
    /// Called with the upstream connection locked. On refusal the reference
    /// is handed back so the caller can release it under that lock.
    pub fn attach_upstream(&self, upstream: ConnectionRef, message_id: MessageId) -> Result<(), ConnectionRef> {
        let mut inner = self.lock();
        let refused = OperationFlags::CLIENT_DETACHING | OperationFlags::UPSTREAM_DETACHING;
        if inner.upstream.is_some()
            || inner.flags.0 & refused.0 != 0
            || inner.flags.contains(OperationFlags::CANCELLED)
        {
            return Err(upstream);
        }
        inner.upstream = Some(upstream);
        inner.upstream_message_id = Some(message_id);
        Ok(())
    }

    /// Release one side.
    ///
    /// Runs at most once per side. The reference is released under the
    /// connection's lock, after removing the pending entry that still points
    /// here. Must not be called with any connection lock held.
    pub fn detach(&self, side: Side) -> Detach {
        let (reference, message_id) = {
            let mut inner = self.lock();
            let detaching = OperationFlags::detaching(side);
            if inner.flags.contains(detaching) {
                return Detach {
                    detached: false,
                    freed: false,
                };
            }
            inner.flags.insert(detaching);
            match side {
                Side::Client => (inner.client.take(), Some(self.client_message_id)),
                Side::Upstream => (inner.upstream.take(), inner.upstream_message_id),
            }
        };

        if let Some(reference) = reference {
            let conn = Arc::clone(reference.connection());
            let mut locked = conn.lock();
            let removed = message_id.and_then(|id| locked.remove_pending(id, self));
            locked.release_locked(reference);
            drop(removed);
        }

        let mut inner = self.lock();
        inner.flags.insert(OperationFlags::freeing(side));
        if side == Side::Client {
            inner.request = None;
        }
        Detach {
            detached: true,
            freed: inner.flags.is_freed(),
        }
    }
}
