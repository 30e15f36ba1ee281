//! End-to-end tests: real sockets, a mock directory, a running daemon.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use ldap_balancer::config::{BalancerConfig, UpstreamLoss};
use ldap_balancer::lifecycle::{Daemon, ShutdownMode, ShutdownReport};
use ldap_balancer::pdu::{tag, ResultCode};

mod common;

use common::{balancer_config, get_available_port, wait_until, LdapClient, MockDirectory, Received};

fn start(config: BalancerConfig) -> (Daemon, SocketAddr) {
    let daemon = Daemon::start(config).unwrap();
    let addr = daemon.local_addrs()[0];
    (daemon, addr)
}

async fn stop(daemon: Daemon, mode: ShutdownMode) -> ShutdownReport {
    daemon.shutdown(mode);
    tokio::task::spawn_blocking(move || daemon.wait()).await.unwrap()
}

fn searches(mock: &MockDirectory) -> Vec<Received> {
    mock.received()
        .into_iter()
        .filter(|r| r.op_tag == tag::SEARCH_REQUEST)
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_response_carries_client_message_id() {
    let mock = MockDirectory::start().await;
    let mut config = balancer_config(&[("dir1", mock.uri())]);
    config.backends[0].max_connections = 1;
    let (daemon, addr) = start(config);
    let ctx = Arc::clone(daemon.context());
    assert!(wait_until(|| ctx.backends().get("dir1").unwrap().stats().open == 1).await);

    let mut client = LdapClient::connect(addr).await;
    client.search(7).await;
    let pdus = client.recv_final().await;
    assert_eq!(pdus.len(), 2);
    assert!(pdus.iter().all(|p| p.message_id() == 7));
    assert_eq!(pdus[0].op_tag(), tag::SEARCH_RESULT_ENTRY);
    assert_eq!(pdus[1].op_tag(), tag::SEARCH_RESULT_DONE);
    assert_eq!(pdus[1].result_code(), Some(ResultCode::Success as u8));
    assert_eq!(
        searches(&mock),
        vec![Received {
            message_id: 1,
            op_tag: tag::SEARCH_REQUEST
        }]
    );

    // The next request gets the next id on the same upstream connection.
    client.search(7).await;
    let pdus = client.recv_final().await;
    assert!(pdus.iter().all(|p| p.message_id() == 7));
    assert_eq!(searches(&mock)[1].message_id, 2);

    let report = stop(daemon, ShutdownMode::Graceful).await;
    assert!(report.is_clean(), "{:?}", report);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_queued_request_survives_backend_outage() {
    let backend_addr: SocketAddr = format!("127.0.0.1:{}", get_available_port()).parse().unwrap();
    let config = balancer_config(&[("dir1", format!("ldap://{}", backend_addr))]);
    let (daemon, addr) = start(config);
    let ctx = Arc::clone(daemon.context());
    let backend = Arc::clone(ctx.backends().get("dir1").unwrap());
    assert!(wait_until(|| backend.stats().failures > 0).await);

    let mut client = LdapClient::connect(addr).await;
    client.search(3).await;
    assert!(client.is_silent_for(Duration::from_millis(200)).await);
    assert_eq!(backend.stats().waiting, 1);

    let mock = MockDirectory::start_on(backend_addr).await;
    let pdus = client.recv_final().await;
    assert!(pdus.iter().all(|p| p.message_id() == 3));
    assert_eq!(pdus.last().unwrap().result_code(), Some(ResultCode::Success as u8));
    assert_eq!(searches(&mock).len(), 1);
    assert!(!backend.stats().failed);

    let report = stop(daemon, ShutdownMode::Graceful).await;
    assert!(report.is_clean(), "{:?}", report);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_upstream_loss_synthesizes_unavailable() {
    let mock = MockDirectory::start().await;
    let (daemon, addr) = start(balancer_config(&[("dir1", mock.uri())]));
    let ctx = Arc::clone(daemon.context());

    let mut client = LdapClient::connect(addr).await;
    mock.set_silent(true);
    client.search(5).await;
    assert!(wait_until(|| searches(&mock).len() == 1).await);
    assert_eq!(ctx.router().in_flight(), 1);

    mock.kill_connections();
    let pdus = client.recv_final().await;
    assert_eq!(pdus.len(), 1);
    assert_eq!(pdus[0].message_id(), 5);
    assert_eq!(pdus[0].result_code(), Some(ResultCode::Unavailable as u8));
    assert!(wait_until(|| ctx.router().in_flight() == 0).await);

    // The client connection is untouched and works once the backend is back.
    mock.set_silent(false);
    client.search(6).await;
    let pdus = client.recv_final().await;
    assert_eq!(pdus.last().unwrap().result_code(), Some(ResultCode::Success as u8));

    let report = stop(daemon, ShutdownMode::Graceful).await;
    assert!(report.is_clean(), "{:?}", report);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_upstream_loss_can_close_client() {
    let mock = MockDirectory::start().await;
    let mut config = balancer_config(&[("dir1", mock.uri())]);
    config.routing.upstream_loss = UpstreamLoss::Close;
    let (daemon, addr) = start(config);
    let ctx = Arc::clone(daemon.context());

    let mut client = LdapClient::connect(addr).await;
    mock.set_silent(true);
    client.search(5).await;
    assert!(wait_until(|| searches(&mock).len() == 1).await);

    mock.kill_connections();
    assert!(client.is_closed().await);
    let backend = Arc::clone(ctx.backends().get("dir1").unwrap());
    assert!(
        wait_until(|| {
            let stats = backend.stats();
            ctx.router().in_flight() == 0 && ctx.connection_count() == stats.open + stats.bind + stats.preparing
        })
        .await
    );

    let report = stop(daemon, ShutdownMode::Graceful).await;
    assert!(report.is_clean(), "{:?}", report);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_listener_mutes_on_descriptor_exhaustion() {
    let mock = MockDirectory::start().await;
    let (daemon, addr) = start(balancer_config(&[("dir1", mock.uri())]));
    let listener = Arc::clone(&daemon.context().listeners()[0]);

    let mut first = LdapClient::connect(addr).await;
    first.search(1).await;
    first.recv_final().await;

    listener
        .handle_accept_error(io::Error::from_raw_os_error(libc::EMFILE))
        .unwrap();
    assert!(listener.is_muted());

    // The kernel completes the handshake; the balancer does not accept.
    let mut second = LdapClient::connect(addr).await;
    second.search(1).await;
    assert!(second.is_silent_for(Duration::from_millis(300)).await);

    drop(first);
    let pdus = second.recv_final().await;
    assert_eq!(pdus.last().unwrap().result_code(), Some(ResultCode::Success as u8));
    assert!(!listener.is_muted());

    let report = stop(daemon, ShutdownMode::Graceful).await;
    assert!(report.is_clean(), "{:?}", report);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_graceful_shutdown_flushes_queued_responses() {
    let mock = MockDirectory::start().await;
    mock.set_entries(2000);
    let (daemon, addr) = start(balancer_config(&[("dir1", mock.uri())]));

    let mut client = LdapClient::connect(addr).await;
    client.search(9).await;
    // Let the responses pile up in the balancer while nobody reads them.
    tokio::time::sleep(Duration::from_millis(300)).await;

    daemon.shutdown(ShutdownMode::Graceful);
    let waiter = tokio::task::spawn_blocking(move || daemon.wait());

    let pdus = client.recv_final().await;
    assert_eq!(pdus.len(), 2001);
    assert!(pdus.iter().all(|p| p.message_id() == 9));
    assert!(client.is_closed().await);

    let report = waiter.await.unwrap();
    assert!(report.is_clean(), "{:?}", report);
    assert_eq!(report.exit_code(), 0);
    assert!(tokio::net::TcpStream::connect(addr).await.is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_abrupt_shutdown_is_unclean() {
    let mock = MockDirectory::start().await;
    let (daemon, addr) = start(balancer_config(&[("dir1", mock.uri())]));
    let _client = LdapClient::connect(addr).await;

    let report = stop(daemon, ShutdownMode::Abrupt).await;
    assert_eq!(report.mode, Some(ShutdownMode::Abrupt));
    assert_eq!(report.exit_code(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_bind_uses_bind_pool() {
    let mock = MockDirectory::start().await;
    let (daemon, addr) = start(balancer_config(&[("dir1", mock.uri())]));
    let ctx = Arc::clone(daemon.context());

    let mut client = LdapClient::connect(addr).await;
    client.bind(1).await;
    let pdus = client.recv_final().await;
    assert_eq!(pdus.len(), 1);
    assert_eq!(pdus[0].op_tag(), tag::BIND_RESPONSE);
    assert_eq!(pdus[0].message_id(), 1);
    assert_eq!(pdus[0].result_code(), Some(ResultCode::Success as u8));
    assert!(mock.received().iter().any(|r| r.op_tag == tag::BIND_REQUEST));
    assert!(ctx.backends().get("dir1").unwrap().stats().bind >= 1);

    // After the bind completes, ordinary requests flow again.
    client.search(2).await;
    let pdus = client.recv_final().await;
    assert_eq!(pdus.last().unwrap().result_code(), Some(ResultCode::Success as u8));

    let report = stop(daemon, ShutdownMode::Graceful).await;
    assert!(report.is_clean(), "{:?}", report);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_idle_client_is_closed() {
    let mock = MockDirectory::start().await;
    let mut config = balancer_config(&[("dir1", mock.uri())]);
    config.timeouts.idle_secs = 1;
    let (daemon, addr) = start(config);

    let mut client = LdapClient::connect(addr).await;
    assert!(client.is_closed().await);

    let report = stop(daemon, ShutdownMode::Graceful).await;
    assert!(report.is_clean(), "{:?}", report);
}
