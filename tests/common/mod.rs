//! Shared utilities for integration tests: a mock directory server and a
//! minimal LDAP client speaking framed PDUs.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use ldap_balancer::config::{BackendConfig, BalancerConfig, ListenerConfig};
use ldap_balancer::pdu::{is_final_response, response_tag_for, tag, MessageId, Pdu, PduReader, ResultCode};

/// Minimal search request body; the balancer never looks inside it.
pub const SEARCH_BODY: &[u8] = &[0x04, 0x00, 0x0a, 0x01, 0x00];
/// Simple bind as "cn=test".
pub const BIND_BODY: &[u8] = &[0x02, 0x01, 0x03, 0x04, 0x07, b'c', b'n', b'=', b't', b'e', b's', b't', 0x80, 0x00];

/// Reserve a free port on localhost.
pub fn get_available_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// A PDU as the mock directory received it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Received {
    pub message_id: MessageId,
    pub op_tag: u8,
}

#[derive(Default)]
struct MockState {
    accepted: AtomicUsize,
    silent: AtomicBool,
    entries: AtomicUsize,
    received: Mutex<Vec<Received>>,
}

/// A directory server that answers every request with success.
///
/// Searches get `entries` search result entries (default one) and a done.
pub struct MockDirectory {
    pub addr: SocketAddr,
    state: Arc<MockState>,
    kill: watch::Sender<u64>,
}

impl MockDirectory {
    pub async fn start() -> Self {
        Self::start_on("127.0.0.1:0".parse().unwrap()).await
    }

    pub async fn start_on(addr: SocketAddr) -> Self {
        let listener = TcpListener::bind(addr).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(MockState::default());
        state.entries.store(1, Ordering::SeqCst);
        let (kill, _) = watch::channel(0u64);

        let accept_state = Arc::clone(&state);
        let accept_kill = kill.clone();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                accept_state.accepted.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve(socket, Arc::clone(&accept_state), accept_kill.subscribe()));
            }
        });

        Self { addr, state, kill }
    }

    /// Stop answering (requests are still recorded).
    pub fn set_silent(&self, silent: bool) {
        self.state.silent.store(silent, Ordering::SeqCst);
    }

    pub fn set_entries(&self, entries: usize) {
        self.state.entries.store(entries, Ordering::SeqCst);
    }

    /// Drop every open connection.
    pub fn kill_connections(&self) {
        self.kill.send_modify(|generation| *generation += 1);
    }

    pub fn accepted(&self) -> usize {
        self.state.accepted.load(Ordering::SeqCst)
    }

    pub fn received(&self) -> Vec<Received> {
        self.state.received.lock().unwrap().clone()
    }

    pub fn uri(&self) -> String {
        format!("ldap://{}", self.addr)
    }
}

async fn serve(socket: TcpStream, state: Arc<MockState>, mut kill: watch::Receiver<u64>) {
    let (read_half, mut write_half) = socket.into_split();
    let mut reader = PduReader::new(read_half, 1 << 20);
    loop {
        tokio::select! {
            _ = kill.changed() => return,
            next = reader.next() => {
                let Ok(Some(pdu)) = next else { return };
                state.received.lock().unwrap().push(Received {
                    message_id: pdu.message_id(),
                    op_tag: pdu.op_tag(),
                });
                if state.silent.load(Ordering::SeqCst) {
                    continue;
                }
                for response in responses(&pdu, state.entries.load(Ordering::SeqCst)) {
                    if write_half.write_all(response.as_bytes()).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

fn responses(request: &Pdu, entries: usize) -> Vec<Pdu> {
    let id = request.message_id();
    match request.op_tag() {
        tag::SEARCH_REQUEST => {
            let mut out: Vec<Pdu> = (0..entries)
                .map(|n| {
                    let dn = format!("cn=entry{},dc=example,dc=com", n);
                    let mut body = vec![0x04, dn.len() as u8];
                    body.extend_from_slice(dn.as_bytes());
                    body.extend_from_slice(&[0x30, 0x00]);
                    Pdu::encode(id, tag::SEARCH_RESULT_ENTRY, &body)
                })
                .collect();
            out.push(Pdu::result(id, tag::SEARCH_RESULT_DONE, ResultCode::Success, ""));
            out
        }
        other => response_tag_for(other)
            .map(|response_tag| vec![Pdu::result(id, response_tag, ResultCode::Success, "")])
            .unwrap_or_default(),
    }
}

/// A client speaking raw PDUs to the balancer.
pub struct LdapClient {
    reader: PduReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl LdapClient {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read_half, writer) = stream.into_split();
        Self {
            reader: PduReader::new(read_half, 16 << 20),
            writer,
        }
    }

    pub async fn send(&mut self, pdu: &Pdu) {
        self.writer.write_all(pdu.as_bytes()).await.unwrap();
    }

    pub async fn search(&mut self, message_id: MessageId) {
        self.send(&Pdu::encode(message_id, tag::SEARCH_REQUEST, SEARCH_BODY)).await;
    }

    pub async fn bind(&mut self, message_id: MessageId) {
        self.send(&Pdu::encode(message_id, tag::BIND_REQUEST, BIND_BODY)).await;
    }

    /// Next PDU; panics if none arrives within five seconds.
    pub async fn recv(&mut self) -> Pdu {
        tokio::time::timeout(Duration::from_secs(5), self.reader.next())
            .await
            .expect("timed out waiting for a PDU")
            .expect("read failed")
            .expect("connection closed")
    }

    /// Read until the final response, returning everything received.
    pub async fn recv_final(&mut self) -> Vec<Pdu> {
        let mut pdus = Vec::new();
        loop {
            let pdu = self.recv().await;
            let last = is_final_response(pdu.op_tag());
            pdus.push(pdu);
            if last {
                return pdus;
            }
        }
    }

    /// True if nothing arrives within `wait`.
    pub async fn is_silent_for(&mut self, wait: Duration) -> bool {
        tokio::time::timeout(wait, self.reader.next()).await.is_err()
    }

    /// True if the balancer closes the connection within five seconds.
    pub async fn is_closed(&mut self) -> bool {
        loop {
            match tokio::time::timeout(Duration::from_secs(5), self.reader.next()).await {
                Ok(Ok(Some(_))) => continue,
                Ok(Ok(None)) | Ok(Err(_)) => return true,
                Err(_) => return false,
            }
        }
    }
}

/// A balancer config with one plain listener and fast timers.
pub fn balancer_config(backends: &[(&str, String)]) -> BalancerConfig {
    let mut config = BalancerConfig::default();
    config.workers.threads = 2;
    config.listeners.push(ListenerConfig {
        url: "ldap://127.0.0.1:0".to_string(),
        ..ListenerConfig::default()
    });
    for (name, uri) in backends {
        config.backends.push(BackendConfig::new(*name, uri.clone()));
    }
    config.backoff.base_ms = 10;
    config.backoff.max_ms = 200;
    config.backoff.retry_interval_ms = 50;
    config.timeouts.connect_secs = 2;
    config.timeouts.drain_secs = 5;
    config.timeouts.scan_interval_ms = 50;
    config
}

/// Poll `check` until it holds or five seconds pass.
pub async fn wait_until<F: FnMut() -> bool>(mut check: F) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
