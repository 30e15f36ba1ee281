//! Request routing and message-id translation.
//!
//! # Responsibilities
//! - Turn client requests into operations and pick an upstream for each
//! - Rewrite message ids on the way up and back down
//! - React to either side of an operation going away
//! - Expire operations that outlive the configured timeout
//!
//! # Design Decisions
//! - Message ids are allocated per upstream connection, under its lock
//! - A response is matched only through the upstream's pending index
//! - Exactly one final response reaches the client, claimed via
//!   [`Operation::complete`]
//! - Binds use dedicated connections, one bind at a time
//! - Failures are observed as state (a dead connection), never unwound

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::config::UpstreamLoss;
use crate::load_balancer::backend::Backend;
use crate::load_balancer::pool::BackendSet;
use crate::net::connection::{Connection, ConnectionKind, ConnectionPhase, ConnectionRef, ConnectionRole, Outbound};
use crate::observability::metrics;
use crate::pdu::{is_final_response, response_tag_for, tag, MessageId, Pdu, ResultCode};
use crate::routing::operation::{Operation, OperationPhase, Side};

#[derive(Debug, Clone, Copy)]
pub struct RouterSettings {
    pub upstream_loss: UpstreamLoss,
    pub operation_timeout: Duration,
}

enum Forward {
    Sent,
    /// The upstream could not take it; try elsewhere.
    Retry,
    /// The operation went away in the meantime.
    Dropped,
}

fn role_for(op: &Operation) -> ConnectionRole {
    if op.is_bind() {
        ConnectionRole::Bind
    } else {
        ConnectionRole::Open
    }
}

fn end_bind(client: &Arc<Connection>) {
    let mut locked = client.lock();
    if locked.phase() == ConnectionPhase::Binding {
        locked.set_phase(ConnectionPhase::Ready);
    }
}

/// Routes operations between client and upstream connections.
#[derive(Debug)]
pub struct Router {
    backends: Arc<BackendSet>,
    operations: DashMap<u64, Arc<Operation>>,
    settings: RouterSettings,
}

impl Router {
    pub fn new(backends: Arc<BackendSet>, settings: RouterSettings) -> Self {
        Self {
            backends,
            operations: DashMap::new(),
            settings,
        }
    }

    pub fn backends(&self) -> &Arc<BackendSet> {
        &self.backends
    }

    /// Operations not yet freed.
    pub fn in_flight(&self) -> usize {
        self.operations.len()
    }

    pub fn operation(&self, id: u64) -> Option<Arc<Operation>> {
        self.operations.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    /// Handle a PDU read from a client connection.
    pub fn client_request(&self, client: &Arc<Connection>, pdu: Pdu) {
        client.touch();
        let message_id = pdu.message_id();
        match pdu.op_tag() {
            tag::UNBIND_REQUEST => {
                tracing::debug!(connection_id = %client.id(), "Client unbind");
                client.mark_dead();
                return;
            }
            tag::ABANDON_REQUEST => {
                self.client_abandon(client, &pdu);
                return;
            }
            _ => {}
        }

        if message_id == 0 {
            tracing::warn!(connection_id = %client.id(), "Client request with message id 0, closing");
            client.mark_dead();
            return;
        }

        let op = {
            let mut locked = client.lock();
            if !locked.is_live() {
                return;
            }
            if locked.phase() == ConnectionPhase::Binding {
                drop(locked);
                tracing::debug!(connection_id = %client.id(), message_id = message_id, "Request during bind rejected");
                Self::reply(client, &pdu, ResultCode::ProtocolError, "bind in progress");
                return;
            }
            if pdu.op_tag() == tag::BIND_REQUEST {
                locked.set_phase(ConnectionPhase::Binding);
            }
            let privileged = locked.role() == ConnectionRole::Privileged;
            let op = Operation::new(locked.acquire(), pdu, privileged);
            match locked.insert_pending(message_id, Arc::clone(&op)) {
                Ok(()) => op,
                Err(duplicate) => {
                    drop(locked);
                    drop(duplicate);
                    op.detach(Side::Client);
                    op.detach(Side::Upstream);
                    tracing::warn!(connection_id = %client.id(), message_id = message_id, "Duplicate message id, closing");
                    client.mark_dead();
                    return;
                }
            }
        };

        self.operations.insert(op.id(), Arc::clone(&op));
        tracing::trace!(
            operation_id = op.id(),
            connection_id = %client.id(),
            message_id = message_id,
            op_tag = op.request_tag(),
            "Request received"
        );
        self.route(&op);
    }

    fn client_abandon(&self, client: &Arc<Connection>, pdu: &Pdu) {
        let Some(target) = pdu.abandon_target() else {
            tracing::debug!(connection_id = %client.id(), "Malformed abandon request ignored");
            return;
        };
        let op = client.lock().pending(target);
        match op {
            Some(op) => {
                self.cancel_operation(&op, false);
            }
            None => tracing::debug!(connection_id = %client.id(), target = target, "Abandon for unknown message id"),
        }
    }

    /// Answer a request that never became an operation.
    fn reply(client: &Arc<Connection>, request: &Pdu, code: ResultCode, message: &str) {
        if let Some(response_tag) = response_tag_for(request.op_tag()) {
            client.send(Outbound::new(Pdu::result(request.message_id(), response_tag, code, message)));
        }
    }

    fn route(&self, op: &Arc<Operation>) {
        let role = role_for(op);
        op.set_phase(OperationPhase::AwaitingUpstream);

        let candidates = self.backends.candidates(role);
        if candidates.is_empty() {
            self.fail(op, ResultCode::Busy, "no backend available", "no_backend");
            return;
        }

        for backend in &candidates {
            if let Some(upstream) = backend.select_upstream(role) {
                match self.forward(op, upstream) {
                    Forward::Retry => continue,
                    Forward::Sent | Forward::Dropped => return,
                }
            }
        }

        let mut op = Arc::clone(op);
        for backend in &candidates {
            match backend.enqueue(op, role) {
                Ok(()) => {
                    tracing::debug!(backend = %backend.name(), role = ?role, "Request queued");
                    // A connection may have become ready while we were queueing.
                    self.dispatch_waiting(backend);
                    return;
                }
                Err(returned) => op = returned,
            }
        }

        tracing::warn!(operation_id = op.id(), "Pending request ceiling reached on every backend");
        self.fail(&op, ResultCode::Busy, "too many pending requests", "busy");
    }

    /// Forward `op` on `upstream` under a freshly allocated message id.
    fn forward(&self, op: &Arc<Operation>, upstream: ConnectionRef) -> Forward {
        let Some(request) = op.take_request() else {
            return Forward::Dropped;
        };

        let pdu = {
            let mut locked = upstream.lock();
            if !locked.is_live() || locked.phase() != ConnectionPhase::Ready {
                drop(locked);
                op.restore_request(request);
                return Forward::Retry;
            }
            let message_id = locked.next_message_id();
            let reference = locked.acquire();
            if let Err(reference) = op.attach_upstream(reference, message_id) {
                locked.release_locked(reference);
                return Forward::Dropped;
            }
            let inserted = locked.insert_pending(message_id, Arc::clone(op));
            debug_assert!(inserted.is_ok(), "allocated message id already pending");
            if op.is_bind() {
                locked.set_phase(ConnectionPhase::Binding);
            }
            request.with_message_id(message_id)
        };

        op.set_phase(OperationPhase::Forwarded);
        tracing::debug!(
            operation_id = op.id(),
            client_message_id = op.client_message_id(),
            upstream_id = %upstream.id(),
            upstream_message_id = pdu.message_id(),
            "Request forwarded"
        );
        if !upstream.send(Outbound::for_operation(pdu, op)) {
            upstream.mark_dead();
        }
        Forward::Sent
    }

    /// Handle a PDU read from an upstream connection.
    pub fn upstream_response(&self, upstream: &Arc<Connection>, pdu: Pdu) {
        upstream.touch();
        let message_id = pdu.message_id();
        if message_id == 0 {
            tracing::info!(upstream_id = %upstream.id(), op_tag = pdu.op_tag(), "Unsolicited notification from upstream, closing");
            upstream.mark_dead();
            return;
        }

        let last = is_final_response(pdu.op_tag());
        let op = {
            let mut locked = upstream.lock();
            if last && locked.phase() == ConnectionPhase::Binding {
                locked.set_phase(ConnectionPhase::Ready);
            }
            if last {
                locked.take_pending(message_id)
            } else {
                locked.pending(message_id)
            }
        };

        let Some(op) = op else {
            tracing::debug!(upstream_id = %upstream.id(), message_id = message_id, "Discarding response for unknown message id");
            if last {
                self.upstream_available(upstream);
            }
            return;
        };

        let deliver = if last { op.complete() } else { !op.is_completed() };
        match op.client() {
            Some(client) if deliver && !op.is_cancelled() => {
                let response = pdu.with_message_id(op.client_message_id());
                if !client.send(Outbound::new(response)) {
                    tracing::debug!(operation_id = op.id(), "Client gone, response dropped");
                }
                if last && op.is_bind() {
                    end_bind(&client);
                }
            }
            _ => tracing::debug!(operation_id = op.id(), "Client detached, discarding response"),
        }

        if last {
            self.finish(&op, "completed");
            self.upstream_available(upstream);
        }
    }

    fn upstream_available(&self, upstream: &Arc<Connection>) {
        if let Some(backend) = upstream.backend() {
            if backend.has_waiting() {
                self.dispatch_waiting(&backend);
            }
        }
    }

    /// Forward queued operations while `backend` has ready connections.
    pub fn dispatch_waiting(&self, backend: &Arc<Backend>) {
        for role in [ConnectionRole::Open, ConnectionRole::Bind] {
            while let Some(op) = backend.next_waiting(role) {
                let Some(upstream) = backend.select_upstream(role) else {
                    backend.requeue(op, role);
                    break;
                };
                if let Forward::Retry = self.forward(&op, upstream) {
                    backend.requeue(op, role);
                    break;
                }
            }
        }
    }

    /// A connection died with `orphans` still pending on it.
    pub fn connection_lost(&self, conn: &Arc<Connection>, orphans: Vec<Arc<Operation>>) {
        match conn.kind() {
            ConnectionKind::Client => {
                for op in &orphans {
                    self.client_lost(op);
                }
            }
            ConnectionKind::Upstream => {
                let backend = conn.backend();
                if let Some(backend) = &backend {
                    backend.remove_connection(conn);
                }
                for op in &orphans {
                    self.upstream_lost(op);
                }
                if let Some(backend) = backend {
                    if backend.has_waiting() {
                        backend.retry();
                    }
                }
            }
        }
    }

    fn client_lost(&self, op: &Arc<Operation>) {
        self.detach(op, Side::Client, "client_lost");
        match op.upstream() {
            // A bind cannot be abandoned; its response is discarded on arrival.
            Some(_) if op.is_bind() => {}
            Some((upstream, message_id)) => {
                Self::abandon_upstream(&upstream, message_id);
                self.detach(op, Side::Upstream, "client_lost");
            }
            None => self.detach(op, Side::Upstream, "client_lost"),
        }
    }

    fn upstream_lost(&self, op: &Arc<Operation>) {
        self.detach(op, Side::Upstream, "upstream_lost");
        let Some(client) = op.client() else {
            return;
        };
        if op.is_cancelled() {
            self.detach(op, Side::Client, "upstream_lost");
            return;
        }
        match self.settings.upstream_loss {
            UpstreamLoss::Error => self.fail(op, ResultCode::Unavailable, "upstream connection lost", "upstream_lost"),
            UpstreamLoss::Close => {
                self.detach(op, Side::Client, "upstream_lost");
                tracing::info!(connection_id = %client.id(), operation_id = op.id(), "Closing client after upstream loss");
                client.mark_dead();
            }
        }
    }

    /// Cancel the operation with internal id `id`; the client is told
    /// with a `cancelled` result.
    pub fn cancel_by_id(&self, id: u64) -> bool {
        match self.operation(id) {
            Some(op) => self.cancel_operation(&op, true),
            None => false,
        }
    }

    /// Cancel `op`, abandoning it upstream if it was forwarded.
    pub fn cancel_operation(&self, op: &Arc<Operation>, notify_client: bool) -> bool {
        if op.is_bind() && op.upstream().is_some() {
            tracing::debug!(operation_id = op.id(), "Outstanding bind cannot be abandoned");
            return false;
        }
        if !op.cancel() {
            return false;
        }
        let claimed = op.complete();
        if let Some((upstream, message_id)) = op.upstream() {
            Self::abandon_upstream(&upstream, message_id);
        }
        if let Some(client) = op.client() {
            if notify_client && claimed {
                if let Some(response_tag) = response_tag_for(op.request_tag()) {
                    client.send(Outbound::new(Pdu::result(
                        op.client_message_id(),
                        response_tag,
                        ResultCode::Cancelled,
                        "operation cancelled",
                    )));
                }
            }
            if op.is_bind() {
                end_bind(&client);
            }
        }
        tracing::debug!(operation_id = op.id(), "Operation cancelled");
        self.finish(op, "cancelled");
        true
    }

    /// Fail every operation older than the timeout. Returns how many.
    pub fn expire_stale(&self, now: Instant) -> usize {
        let timeout = self.settings.operation_timeout;
        let stale: Vec<Arc<Operation>> = self
            .operations
            .iter()
            .filter(|entry| entry.value().age(now) >= timeout)
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        for op in &stale {
            tracing::warn!(
                operation_id = op.id(),
                client_message_id = op.client_message_id(),
                age_ms = op.age(now).as_millis() as u64,
                "Operation timed out"
            );
            let upstream = op.upstream();
            self.fail(op, ResultCode::TimeLimitExceeded, "operation timed out", "timed_out");
            if let Some((upstream, message_id)) = upstream {
                if op.is_bind() {
                    // The bind connection's state is unknown now.
                    upstream.mark_dead();
                } else {
                    Self::abandon_upstream(&upstream, message_id);
                }
            }
        }
        stale.len()
    }

    /// Free every remaining operation. Used at shutdown.
    pub fn clear(&self) {
        let remaining: Vec<Arc<Operation>> = self.operations.iter().map(|entry| Arc::clone(entry.value())).collect();
        for op in &remaining {
            self.finish(op, "shutdown");
        }
    }

    fn abandon_upstream(upstream: &Arc<Connection>, target: MessageId) {
        let message_id = upstream.lock().next_message_id();
        if upstream.send(Outbound::new(Pdu::abandon(message_id, target))) {
            tracing::debug!(upstream_id = %upstream.id(), target = target, "Abandon forwarded upstream");
        }
    }

    /// Send a synthesized final result to the client, if still attached and
    /// nothing else answered first, then free the operation.
    fn fail(&self, op: &Arc<Operation>, code: ResultCode, message: &str, outcome: &'static str) {
        if op.complete() {
            if let Some(client) = op.client() {
                if let Some(response_tag) = response_tag_for(op.request_tag()) {
                    client.send(Outbound::new(Pdu::result(op.client_message_id(), response_tag, code, message)));
                }
                if op.is_bind() {
                    end_bind(&client);
                }
            }
        }
        self.finish(op, outcome);
    }

    fn finish(&self, op: &Arc<Operation>, outcome: &'static str) {
        self.detach(op, Side::Upstream, outcome);
        self.detach(op, Side::Client, outcome);
    }

    fn detach(&self, op: &Arc<Operation>, side: Side, outcome: &'static str) {
        if op.detach(side).freed && self.operations.remove(&op.id()).is_some() {
            metrics::record_operation(outcome);
            tracing::trace!(operation_id = op.id(), outcome = outcome, "Operation freed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendConfig;
    use crate::config::Strategy;
    use crate::load_balancer::backend::{BackendSpec, UpstreamConnector};
    use crate::net::connection::ConnectionEvents;
    use crate::resilience::backoff::BackoffPolicy;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Weak;
    use tokio::sync::mpsc::UnboundedReceiver;

    struct NullConnector;

    impl UpstreamConnector for NullConnector {
        fn connect(&self, _backend: Arc<Backend>, _role: ConnectionRole) {}
    }

    struct Harness {
        router: Router,
        backend: Arc<Backend>,
        destroyed: AtomicUsize,
    }

    impl ConnectionEvents for Harness {
        fn connection_dead(&self, conn: &Arc<Connection>, orphans: Vec<Arc<Operation>>) {
            self.router.connection_lost(conn, orphans);
        }

        fn connection_destroyed(&self, _conn: &Connection) {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn harness_with(config: BackendConfig, upstream_loss: UpstreamLoss) -> Arc<Harness> {
        let connector: Weak<dyn UpstreamConnector> = Weak::<NullConnector>::new();
        let spec = BackendSpec::resolve(&config).unwrap();
        let backend = Arc::new(Backend::new(spec, BackoffPolicy { base_ms: 10, max_ms: 100 }, connector));
        let set = Arc::new(BackendSet::with_backends(vec![Arc::clone(&backend)], Strategy::RoundRobin));
        Arc::new(Harness {
            router: Router::new(
                set,
                RouterSettings {
                    upstream_loss,
                    operation_timeout: Duration::from_secs(10),
                },
            ),
            backend,
            destroyed: AtomicUsize::new(0),
        })
    }

    fn harness() -> Arc<Harness> {
        harness_with(BackendConfig::new("dir1", "ldap://127.0.0.1:389"), UpstreamLoss::Error)
    }

    fn events(h: &Arc<Harness>) -> Weak<dyn ConnectionEvents> {
        let weak: Weak<Harness> = Arc::downgrade(h);
        weak
    }

    fn client(h: &Arc<Harness>) -> (Arc<Connection>, UnboundedReceiver<Outbound>) {
        Connection::client("client".into(), ConnectionRole::Open, events(h))
    }

    fn ready_upstream(h: &Arc<Harness>, role: ConnectionRole) -> (Arc<Connection>, UnboundedReceiver<Outbound>) {
        let (conn, rx) = Connection::upstream("upstream".into(), &h.backend, events(h));
        h.backend.connection_preparing(&conn, role);
        assert!(h.backend.connection_established(&conn));
        (conn, rx)
    }

    fn search(id: MessageId) -> Pdu {
        Pdu::encode(id, tag::SEARCH_REQUEST, &[0x04, 0x00])
    }

    fn next(rx: &mut UnboundedReceiver<Outbound>) -> Pdu {
        Pdu::parse(rx.try_recv().expect("expected an outbound PDU").bytes).unwrap()
    }

    #[test]
    fn response_carries_client_message_id() {
        let h = harness();
        let (client, mut client_rx) = client(&h);
        let (upstream, mut upstream_rx) = ready_upstream(&h, ConnectionRole::Open);

        h.router.client_request(&client, search(7));
        let forwarded = next(&mut upstream_rx);
        assert_eq!(forwarded.message_id(), 1);
        assert_eq!(forwarded.op_tag(), tag::SEARCH_REQUEST);
        assert_eq!(h.router.in_flight(), 1);

        let entry = Pdu::encode(1, tag::SEARCH_RESULT_ENTRY, &[0x04, 0x00]);
        h.router.upstream_response(&upstream, entry);
        let done = Pdu::result(1, tag::SEARCH_RESULT_DONE, ResultCode::Success, "");
        h.router.upstream_response(&upstream, done);

        let entry = next(&mut client_rx);
        assert_eq!(entry.message_id(), 7);
        assert_eq!(entry.op_tag(), tag::SEARCH_RESULT_ENTRY);
        let done = next(&mut client_rx);
        assert_eq!(done.message_id(), 7);
        assert_eq!(done.result_code(), Some(0));

        assert_eq!(h.router.in_flight(), 0);
        assert_eq!(client.ref_count(), 1);
        assert_eq!(upstream.ref_count(), 1);
    }

    #[test]
    fn queued_request_is_forwarded_once_connection_is_ready() {
        let h = harness();
        let (client, _client_rx) = client(&h);

        h.router.client_request(&client, search(3));
        assert_eq!(h.backend.stats().waiting, 1);

        let (_upstream, mut upstream_rx) = ready_upstream(&h, ConnectionRole::Open);
        h.router.dispatch_waiting(&h.backend);
        assert_eq!(h.backend.stats().waiting, 0);
        assert_eq!(next(&mut upstream_rx).message_id(), 1);
    }

    #[test]
    fn upstream_loss_synthesizes_unavailable() {
        let h = harness();
        let (client, mut client_rx) = client(&h);
        let (upstream, _upstream_rx) = ready_upstream(&h, ConnectionRole::Open);

        h.router.client_request(&client, search(7));
        upstream.mark_dead();

        let result = next(&mut client_rx);
        assert_eq!(result.message_id(), 7);
        assert_eq!(result.result_code(), Some(ResultCode::Unavailable as u8));
        assert!(upstream.is_destroyed());
        assert!(client.is_live());
        assert_eq!(client.ref_count(), 1);
        assert_eq!(h.router.in_flight(), 0);
        assert_eq!(h.backend.stats().open, 0);
    }

    #[test]
    fn upstream_loss_can_close_the_client() {
        let h = harness_with(BackendConfig::new("dir1", "ldap://127.0.0.1:389"), UpstreamLoss::Close);
        let (client, _client_rx) = client(&h);
        let (upstream, _upstream_rx) = ready_upstream(&h, ConnectionRole::Open);

        h.router.client_request(&client, search(7));
        upstream.mark_dead();

        assert!(!client.is_live());
        assert!(client.is_destroyed());
        assert!(upstream.is_destroyed());
        assert_eq!(h.destroyed.load(Ordering::SeqCst), 2);
        assert_eq!(h.router.in_flight(), 0);
    }

    #[test]
    fn client_loss_abandons_upstream() {
        let h = harness();
        let (client, _client_rx) = client(&h);
        let (upstream, mut upstream_rx) = ready_upstream(&h, ConnectionRole::Open);

        h.router.client_request(&client, search(7));
        let _ = next(&mut upstream_rx);
        client.mark_dead();

        let abandon = next(&mut upstream_rx);
        assert_eq!(abandon.op_tag(), tag::ABANDON_REQUEST);
        assert_eq!(abandon.abandon_target(), Some(1));
        assert!(client.is_destroyed());
        assert_eq!(h.router.in_flight(), 0);

        // A late response is discarded.
        let done = Pdu::result(1, tag::SEARCH_RESULT_DONE, ResultCode::Success, "");
        h.router.upstream_response(&upstream, done);
        assert_eq!(upstream.ref_count(), 1);
    }

    #[test]
    fn client_abandon_cancels_without_response() {
        let h = harness();
        let (client, mut client_rx) = client(&h);
        let (upstream, mut upstream_rx) = ready_upstream(&h, ConnectionRole::Open);

        h.router.client_request(&client, search(7));
        let _ = next(&mut upstream_rx);
        h.router.client_request(&client, Pdu::abandon(8, 7));

        assert_eq!(next(&mut upstream_rx).abandon_target(), Some(1));
        assert_eq!(h.router.in_flight(), 0);

        let done = Pdu::result(1, tag::SEARCH_RESULT_DONE, ResultCode::Success, "");
        h.router.upstream_response(&upstream, done);
        assert!(client_rx.try_recv().is_err());
    }

    #[test]
    fn administrative_cancel_tells_the_client() {
        let h = harness();
        let (client, mut client_rx) = client(&h);
        let (_upstream, _upstream_rx) = ready_upstream(&h, ConnectionRole::Open);

        h.router.client_request(&client, search(7));
        let id = h.router.operations.iter().map(|e| *e.key()).next().unwrap();
        assert!(h.router.cancel_by_id(id));
        assert!(!h.router.cancel_by_id(id));

        let result = next(&mut client_rx);
        assert_eq!(result.result_code(), Some(ResultCode::Cancelled as u8));
    }

    #[test]
    fn stale_operations_time_out() {
        let h = harness();
        let (client, mut client_rx) = client(&h);
        let (_upstream, mut upstream_rx) = ready_upstream(&h, ConnectionRole::Open);

        h.router.client_request(&client, search(7));
        let _ = next(&mut upstream_rx);
        assert_eq!(h.router.expire_stale(Instant::now()), 0);
        assert_eq!(h.router.expire_stale(Instant::now() + Duration::from_secs(11)), 1);

        let result = next(&mut client_rx);
        assert_eq!(result.result_code(), Some(ResultCode::TimeLimitExceeded as u8));
        assert_eq!(next(&mut upstream_rx).op_tag(), tag::ABANDON_REQUEST);
        assert_eq!(h.router.in_flight(), 0);
    }

    #[test]
    fn pending_ceiling_answers_busy() {
        let mut config = BackendConfig::new("dir1", "ldap://127.0.0.1:389");
        config.max_pending_ops = 1;
        let h = harness_with(config, UpstreamLoss::Error);
        let (client, mut client_rx) = client(&h);

        h.router.client_request(&client, search(1));
        h.router.client_request(&client, search(2));

        let result = next(&mut client_rx);
        assert_eq!(result.message_id(), 2);
        assert_eq!(result.result_code(), Some(ResultCode::Busy as u8));
        assert_eq!(h.router.in_flight(), 1);
    }

    #[test]
    fn expired_queued_request_frees_the_ceiling() {
        let mut config = BackendConfig::new("dir1", "ldap://127.0.0.1:389");
        config.max_pending_ops = 1;
        let h = harness_with(config, UpstreamLoss::Error);
        let (client, mut client_rx) = client(&h);

        h.router.client_request(&client, search(1));
        assert_eq!(h.backend.stats().waiting, 1);
        assert_eq!(h.router.expire_stale(Instant::now() + Duration::from_secs(11)), 1);
        assert_eq!(next(&mut client_rx).result_code(), Some(ResultCode::TimeLimitExceeded as u8));
        assert_eq!(h.backend.stats().waiting, 0);
        assert_eq!(h.backend.load(), 0);

        // Nothing is outstanding, so the next request queues instead of failing.
        h.router.client_request(&client, search(2));
        assert!(client_rx.try_recv().is_err());
        assert_eq!(h.backend.stats().waiting, 1);
        assert_eq!(h.router.in_flight(), 1);

        let (_upstream, mut upstream_rx) = ready_upstream(&h, ConnectionRole::Open);
        h.router.dispatch_waiting(&h.backend);
        let forwarded = next(&mut upstream_rx);
        assert_eq!(forwarded.op_tag(), tag::SEARCH_REQUEST);
        assert!(upstream_rx.try_recv().is_err());
    }

    #[test]
    fn abandoned_queued_request_frees_the_ceiling() {
        let mut config = BackendConfig::new("dir1", "ldap://127.0.0.1:389");
        config.max_pending_ops = 1;
        let h = harness_with(config, UpstreamLoss::Error);
        let (client, mut client_rx) = client(&h);

        h.router.client_request(&client, search(1));
        h.router.client_request(&client, Pdu::abandon(2, 1));
        assert_eq!(h.router.in_flight(), 0);
        assert_eq!(h.backend.prune_waiting(), 1);

        h.router.client_request(&client, search(3));
        assert!(client_rx.try_recv().is_err());
        assert_eq!(h.backend.stats().waiting, 1);
    }

    #[test]
    fn no_serving_backend_answers_busy() {
        let mut config = BackendConfig::new("dir1", "ldap://127.0.0.1:389");
        config.max_bind_connections = 0;
        let h = harness_with(config, UpstreamLoss::Error);
        let (client, mut client_rx) = client(&h);

        h.router.client_request(&client, Pdu::encode(1, tag::BIND_REQUEST, &[0x02, 0x01, 0x03]));
        let result = next(&mut client_rx);
        assert_eq!(result.message_id(), 1);
        assert_eq!(result.op_tag(), tag::BIND_RESPONSE);
        assert_eq!(result.result_code(), Some(ResultCode::Busy as u8));
        assert_eq!(h.router.in_flight(), 0);
        assert_eq!(h.backend.stats().waiting, 0);

        // The client is not stuck in a bind.
        assert_eq!(client.lock().phase(), ConnectionPhase::Ready);
    }

    #[test]
    fn protocol_violations_close_the_client() {
        let h = harness();
        let (client, _rx) = client(&h);
        h.router.client_request(&client, search(0));
        assert!(!client.is_live());

        let (client, _rx) = self::client(&h);
        h.router.client_request(&client, search(4));
        h.router.client_request(&client, search(4));
        assert!(!client.is_live());
        assert!(client.is_destroyed());
        assert_eq!(h.router.in_flight(), 0);
    }

    #[test]
    fn bind_holds_the_client_until_answered() {
        let h = harness();
        let (client, mut client_rx) = client(&h);
        let (upstream, mut upstream_rx) = ready_upstream(&h, ConnectionRole::Bind);

        h.router.client_request(&client, Pdu::encode(1, tag::BIND_REQUEST, &[0x02, 0x01, 0x03]));
        assert_eq!(next(&mut upstream_rx).op_tag(), tag::BIND_REQUEST);

        h.router.client_request(&client, search(2));
        let rejected = next(&mut client_rx);
        assert_eq!(rejected.message_id(), 2);
        assert_eq!(rejected.result_code(), Some(ResultCode::ProtocolError as u8));

        h.router.upstream_response(&upstream, Pdu::result(1, tag::BIND_RESPONSE, ResultCode::Success, ""));
        assert_eq!(next(&mut client_rx).message_id(), 1);
        assert_eq!(client.lock().phase(), ConnectionPhase::Ready);
        assert_eq!(upstream.lock().phase(), ConnectionPhase::Ready);
    }
}
