//! I/O worker threads.
//!
//! # Responsibilities
//! - Run one single-threaded event loop per OS thread
//! - Own the connections sharded onto it, from handshake to close
//! - Split each connection into a reader feeding the router and a writer
//!   draining the connection's ordered outbound queue
//! - Drain (graceful) or abort (abrupt) its connections at shutdown
//!
//! # Data Flow
//! ```text
//! daemon thread ──WorkerJob::Serve──▶ worker loop ──spawn──▶ serve()
//!                                                   ├─ read_loop  → Router
//!                                                   └─ write_loop ← Connection::send
//! ```
//!
//! # Design Decisions
//! - A worker is woken only through its job channel; on `Wake` it checks
//!   the shutdown flag, everything else is ordinary connection work
//! - The writer keeps going after the connection is marked dead until the
//!   queue is empty, bounded by the drain timeout

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;

use crate::lifecycle::shutdown::ShutdownMode;
use crate::net::connection::{Connection, ConnectionId, ConnectionKind, ConnectionPhase, Outbound};
use crate::net::stream::{is_connection_reset, BoxedStream, RawSocket};
use crate::net::tls::UpstreamTls;
use crate::pdu::{PduError, PduReader};
use crate::runtime::context::Context;

/// TLS work to do before a connection carries PDUs.
pub enum Handshake {
    None,
    /// Server side, for an `ldaps` listener.
    Accept(TlsAcceptor),
    /// Client side, for an `ldaps` backend.
    Connect(UpstreamTls),
}

/// A connection handed to a worker.
pub struct Served {
    pub socket: RawSocket,
    pub conn: Arc<Connection>,
    pub outbound: mpsc::UnboundedReceiver<Outbound>,
    pub handshake: Handshake,
}

/// Messages to a worker's event loop.
pub enum WorkerJob {
    Serve(Served),
    /// Check the shutdown flag.
    Wake,
}

/// What a worker did before it exited.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerReport {
    pub index: usize,
    pub served: usize,
    /// Connections cut off by an abrupt shutdown or the drain timeout.
    pub aborted: usize,
    pub panicked: bool,
}

impl WorkerReport {
    pub fn is_clean(&self) -> bool {
        self.aborted == 0 && !self.panicked
    }
}

/// A running worker thread.
#[derive(Debug)]
pub struct WorkerHandle {
    index: usize,
    thread: thread::JoinHandle<WorkerReport>,
}

impl WorkerHandle {
    pub fn index(&self) -> usize {
        self.index
    }

    /// Wait for the thread to exit.
    pub fn join(self) -> WorkerReport {
        match self.thread.join() {
            Ok(report) => report,
            Err(_) => {
                tracing::error!(worker = self.index, "I/O worker panicked");
                WorkerReport {
                    index: self.index,
                    panicked: true,
                    ..WorkerReport::default()
                }
            }
        }
    }
}

/// Start `count` workers and install their job senders in `ctx`.
pub fn spawn_workers(ctx: &Arc<Context>, count: usize) -> io::Result<Vec<WorkerHandle>> {
    let mut senders = Vec::with_capacity(count);
    let mut handles = Vec::with_capacity(count);
    for index in 0..count {
        let (tx, rx) = mpsc::unbounded_channel();
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
        let ctx = Arc::clone(ctx);
        let thread = thread::Builder::new()
            .name(format!("ldap-balancer-io-{}", index))
            .spawn(move || runtime.block_on(run_worker(index, ctx, rx)))?;
        senders.push(tx);
        handles.push(WorkerHandle { index, thread });
    }
    ctx.set_workers(senders);
    tracing::info!(workers = count, "I/O workers started");
    Ok(handles)
}

/// Wait for every worker to exit.
pub fn join_workers(handles: Vec<WorkerHandle>) -> Vec<WorkerReport> {
    handles.into_iter().map(WorkerHandle::join).collect()
}

async fn run_worker(index: usize, ctx: Arc<Context>, mut jobs: mpsc::UnboundedReceiver<WorkerJob>) -> WorkerReport {
    let mut report = WorkerReport {
        index,
        ..WorkerReport::default()
    };
    let mut owned: HashMap<ConnectionId, Arc<Connection>> = HashMap::new();
    let mut tasks: JoinSet<ConnectionId> = JoinSet::new();

    tracing::debug!(worker = index, "I/O worker running");
    loop {
        tokio::select! {
            job = jobs.recv() => match job {
                Some(WorkerJob::Serve(served)) => {
                    owned.insert(served.conn.id(), Arc::clone(&served.conn));
                    report.served += 1;
                    tasks.spawn(serve(Arc::clone(&ctx), served));
                }
                Some(WorkerJob::Wake) => {
                    if ctx.shutdown().is_triggered() {
                        break;
                    }
                }
                None => break,
            },
            Some(done) = tasks.join_next(), if !tasks.is_empty() => {
                if let Ok(id) = done {
                    owned.remove(&id);
                }
            }
        }
    }

    // Connections still queued for this worker were never served.
    jobs.close();
    while let Ok(job) = jobs.try_recv() {
        if let WorkerJob::Serve(served) = job {
            served.conn.mark_dead();
        }
    }

    report.aborted = drain(index, &ctx, owned, tasks).await;
    tracing::debug!(worker = index, served = report.served, aborted = report.aborted, "I/O worker exiting");
    report
}

/// Close owned connections and wait for their tasks. Returns how many had
/// to be aborted.
async fn drain(
    index: usize,
    ctx: &Context,
    owned: HashMap<ConnectionId, Arc<Connection>>,
    mut tasks: JoinSet<ConnectionId>,
) -> usize {
    let mut shutdown = ctx.shutdown().subscribe();
    if shutdown.mode() == Some(ShutdownMode::Abrupt) {
        let aborted = tasks.len();
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
        return aborted;
    }

    for conn in owned.values() {
        conn.mark_dead();
    }
    drop(owned);

    let finished = tokio::select! {
        _ = async { while tasks.join_next().await.is_some() {} } => true,
        _ = tokio::time::sleep(ctx.config().timeouts.drain()) => false,
        _ = shutdown.abrupt() => false,
    };
    if finished {
        return 0;
    }

    let aborted = tasks.len();
    tracing::warn!(worker = index, remaining = aborted, "Drain incomplete, aborting connections");
    tasks.abort_all();
    while tasks.join_next().await.is_some() {}
    aborted
}

async fn serve(ctx: Arc<Context>, served: Served) -> ConnectionId {
    let Served {
        socket,
        conn,
        outbound,
        handshake,
    } = served;
    let id = conn.id();

    let stream = match socket.into_stream() {
        Ok(stream) => stream,
        Err(e) => {
            tracing::warn!(connection_id = %id, error = %e, "Failed to register socket");
            lost_before_ready(&conn, &e.to_string());
            return id;
        }
    };

    let stream = match handshake_stream(&ctx, &conn, stream, handshake).await {
        Ok(stream) => stream,
        Err(reason) => {
            lost_before_ready(&conn, &reason);
            return id;
        }
    };

    if conn.kind() == ConnectionKind::Upstream {
        match conn.backend() {
            Some(backend) if backend.connection_established(&conn) => ctx.router().dispatch_waiting(&backend),
            _ => {
                conn.mark_dead();
                return id;
            }
        }
    }

    run_connection(&ctx, &conn, stream, outbound).await;
    id
}

fn lost_before_ready(conn: &Arc<Connection>, reason: &str) {
    if let Some(backend) = conn.backend() {
        backend.handshake_failed(conn, reason);
    } else {
        tracing::info!(connection_id = %conn.id(), peer = %conn.peer(), error = %reason, "Client handshake failed");
    }
    conn.mark_dead();
}

async fn handshake_stream(
    ctx: &Context,
    conn: &Arc<Connection>,
    stream: BoxedStream,
    handshake: Handshake,
) -> Result<BoxedStream, String> {
    let limit = ctx.config().timeouts.connect();
    let result = match handshake {
        Handshake::None => return Ok(stream),
        Handshake::Accept(acceptor) => {
            conn.lock().set_phase(ConnectionPhase::Active);
            tokio::time::timeout(limit, acceptor.accept(stream))
                .await
                .map(|r| r.map(|s| Box::new(s) as BoxedStream))
        }
        Handshake::Connect(tls) => {
            conn.lock().set_phase(ConnectionPhase::Active);
            tokio::time::timeout(limit, tls.connector.connect(tls.server_name, stream))
                .await
                .map(|r| r.map(|s| Box::new(s) as BoxedStream))
        }
    };

    match result {
        Ok(Ok(stream)) => {
            conn.lock().set_phase(ConnectionPhase::Ready);
            tracing::debug!(connection_id = %conn.id(), "TLS established");
            Ok(stream)
        }
        Ok(Err(e)) => Err(format!("TLS handshake failed: {}", e)),
        Err(_) => Err("TLS handshake timed out".to_string()),
    }
}

async fn run_connection(
    ctx: &Context,
    conn: &Arc<Connection>,
    stream: BoxedStream,
    outbound: mpsc::UnboundedReceiver<Outbound>,
) {
    let (read_half, write_half) = tokio::io::split(stream);
    let drain = ctx.config().timeouts.drain();
    tokio::join!(
        read_loop(ctx, conn, read_half),
        write_loop(conn, write_half, outbound, drain),
    );
    tracing::debug!(connection_id = %conn.id(), kind = conn.kind().as_str(), "Connection closed");
}

async fn read_loop(ctx: &Context, conn: &Arc<Connection>, read_half: ReadHalf<BoxedStream>) {
    let mut reader = PduReader::new(read_half, ctx.config().routing.max_pdu_size);
    let mut closed = conn.closed();
    loop {
        tokio::select! {
            _ = marked_dead(&mut closed) => break,
            next = reader.next() => match next {
                Ok(Some(pdu)) => match conn.kind() {
                    ConnectionKind::Client => ctx.router().client_request(conn, pdu),
                    ConnectionKind::Upstream => ctx.router().upstream_response(conn, pdu),
                },
                Ok(None) => {
                    tracing::debug!(connection_id = %conn.id(), "Peer closed connection");
                    break;
                }
                Err(PduError::Io(e)) if is_connection_reset(&e) => break,
                Err(e) => {
                    tracing::warn!(connection_id = %conn.id(), peer = %conn.peer(), error = %e, "Read failed");
                    break;
                }
            },
        }
    }
    conn.mark_dead();
}

async fn write_loop(
    conn: &Arc<Connection>,
    mut write_half: WriteHalf<BoxedStream>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    drain: Duration,
) {
    let mut closed = conn.closed();
    loop {
        tokio::select! {
            biased;
            next = outbound.recv() => match next {
                Some(item) => {
                    if let Err(e) = write_one(&mut write_half, item).await {
                        if !is_connection_reset(&e) {
                            tracing::warn!(connection_id = %conn.id(), error = %e, "Write failed");
                        }
                        conn.mark_dead();
                        return;
                    }
                }
                None => break,
            },
            _ = marked_dead(&mut closed) => break,
        }
    }

    // Whatever was queued before the connection died still goes out.
    let flush = async {
        while let Ok(item) = outbound.try_recv() {
            write_one(&mut write_half, item).await?;
        }
        write_half.shutdown().await
    };
    match tokio::time::timeout(drain, flush).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::debug!(connection_id = %conn.id(), error = %e, "Flush on close failed"),
        Err(_) => tracing::warn!(connection_id = %conn.id(), "Flush on close timed out"),
    }
}

/// Resolves once the connection has been marked dead.
///
/// The `!Send` guard from `wait_for` must not reach a `select!` output.
async fn marked_dead(closed: &mut watch::Receiver<bool>) {
    let _ = closed.wait_for(|closed| *closed).await;
}

async fn write_one<W: AsyncWrite + Unpin>(writer: &mut W, item: Outbound) -> io::Result<()> {
    writer.write_all(&item.bytes).await?;
    writer.flush().await?;
    item.written();
    Ok(())
}
