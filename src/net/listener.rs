//! Listening sockets with mute/unmute under descriptor exhaustion.
//!
//! # Responsibilities
//! - Bind `ldap`, `ldaps` and `ldapi` listeners before anything accepts
//! - Register the bound socket with the accepting runtime on activation
//! - Stop accepting while the process is out of descriptors
//!
//! # Design Decisions
//! - Binding and activation are separate steps so the daemon can bind
//!   everything, start the workers, and only then take traffic
//! - The mute flag is a watch channel: the accept loop parks on it and
//!   wakes as soon as a closing connection unmutes the listener
//! - Accept errors other than EMFILE/ENFILE end the loop and are fatal

use std::fs;
use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::UnixListener as StdUnixListener;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::net::{TcpListener, UnixListener};
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;

use crate::config::validation::parse_permissions;
use crate::config::ListenerConfig;
use crate::lifecycle::shutdown::ShutdownSignal;
use crate::net::address::{Endpoint, LdapUrl, Transport, UrlError};
use crate::net::stream::{is_fd_exhaustion, RawSocket};
use crate::net::tls::{load_acceptor, TlsError};
use crate::observability::metrics;

/// Error type for listener operations.
#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("listener '{url}': {source}")]
    Url { url: String, source: UrlError },
    #[error("listener '{url}': {source}")]
    Tls { url: String, source: TlsError },
    #[error("listener '{0}' uses ldaps but has no tls section")]
    MissingTls(String),
    #[error("failed to bind {url}: {source}")]
    Bind { url: String, source: io::Error },
    #[error("listener '{0}' is already active")]
    AlreadyActive(String),
    #[error("accept failed on {url}: {source}")]
    Accept { url: String, source: io::Error },
}

enum BoundSocket {
    Tcp(std::net::TcpListener),
    Unix(StdUnixListener),
}

/// A listening socket registered with the accepting runtime.
#[derive(Debug)]
pub enum AcceptSocket {
    Tcp(TcpListener),
    Unix(UnixListener),
}

impl AcceptSocket {
    /// Accept one connection, detached from this runtime for hand-off.
    pub async fn accept(&self) -> io::Result<RawSocket> {
        match self {
            AcceptSocket::Tcp(listener) => {
                let (stream, _) = listener.accept().await?;
                RawSocket::from_tcp(stream)
            }
            AcceptSocket::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                RawSocket::from_unix(stream)
            }
        }
    }
}

/// A bound listener.
pub struct Listener {
    url: String,
    transport: Transport,
    socket: Mutex<Option<BoundSocket>>,
    fd: RawFd,
    local_addr: Option<SocketAddr>,
    unix_path: Option<PathBuf>,
    tls: Option<TlsAcceptor>,
    privileged: bool,
    muted: watch::Sender<bool>,
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("url", &self.url)
            .field("local_addr", &self.local_addr)
            .field("privileged", &self.privileged)
            .field("muted", &self.is_muted())
            .finish_non_exhaustive()
    }
}

impl Listener {
    /// Bind the socket described by `config`. Nothing is accepted until
    /// [`Listener::activate`].
    pub fn open(config: &ListenerConfig) -> Result<Self, ListenerError> {
        let url = config.url.clone();
        let parsed: LdapUrl = url.parse().map_err(|source| ListenerError::Url {
            url: url.clone(),
            source,
        })?;

        let tls = match parsed.transport {
            Transport::Tls => {
                let tls_config = config.tls.as_ref().ok_or_else(|| ListenerError::MissingTls(url.clone()))?;
                let acceptor = load_acceptor(tls_config).map_err(|source| ListenerError::Tls {
                    url: url.clone(),
                    source,
                })?;
                Some(acceptor)
            }
            Transport::Plain | Transport::Local => None,
        };

        let bind_err = |source| ListenerError::Bind {
            url: url.clone(),
            source,
        };
        let (socket, local_addr, unix_path) = match &parsed.endpoint {
            Endpoint::Tcp { .. } => {
                let listener = std::net::TcpListener::bind(parsed.endpoint.to_string()).map_err(bind_err)?;
                listener.set_nonblocking(true).map_err(bind_err)?;
                let addr = listener.local_addr().map_err(bind_err)?;
                (BoundSocket::Tcp(listener), Some(addr), None)
            }
            Endpoint::Unix(path) => {
                remove_stale_socket(path).map_err(bind_err)?;
                let listener = StdUnixListener::bind(path).map_err(bind_err)?;
                listener.set_nonblocking(true).map_err(bind_err)?;
                if let Some(mode) = config.permissions.as_deref().and_then(parse_permissions) {
                    fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(bind_err)?;
                }
                (BoundSocket::Unix(listener), None, Some(path.clone()))
            }
        };

        let fd = match &socket {
            BoundSocket::Tcp(listener) => listener.as_raw_fd(),
            BoundSocket::Unix(listener) => listener.as_raw_fd(),
        };
        tracing::info!(
            url = %url,
            fd = fd,
            address = %local_addr.map(|a| a.to_string()).unwrap_or_else(|| parsed.endpoint.to_string()),
            privileged = config.privileged,
            "Listener bound"
        );

        let (muted, _) = watch::channel(false);
        Ok(Self {
            url,
            transport: parsed.transport,
            socket: Mutex::new(Some(socket)),
            fd,
            local_addr,
            unix_path,
            tls,
            privileged: config.privileged,
            muted,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    /// Bound TCP address, `None` for `ldapi`.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn unix_path(&self) -> Option<&Path> {
        self.unix_path.as_deref()
    }

    pub fn tls(&self) -> Option<&TlsAcceptor> {
        self.tls.as_ref()
    }

    pub fn is_privileged(&self) -> bool {
        self.privileged
    }

    /// Register the bound socket with the calling runtime.
    pub fn activate(&self) -> Result<AcceptSocket, ListenerError> {
        let bound = self
            .socket
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| ListenerError::AlreadyActive(self.url.clone()))?;
        let bind_err = |source| ListenerError::Bind {
            url: self.url.clone(),
            source,
        };
        let socket = match bound {
            BoundSocket::Tcp(listener) => AcceptSocket::Tcp(TcpListener::from_std(listener).map_err(bind_err)?),
            BoundSocket::Unix(listener) => AcceptSocket::Unix(UnixListener::from_std(listener).map_err(bind_err)?),
        };
        tracing::info!(url = %self.url, "Listener accepting");
        Ok(socket)
    }

    pub fn is_muted(&self) -> bool {
        *self.muted.borrow()
    }

    /// Stop accepting. Returns false if already muted.
    pub fn mute(&self) -> bool {
        let changed = self.muted.send_if_modified(|muted| !std::mem::replace(muted, true));
        if changed {
            tracing::warn!(url = %self.url, "Listener muted, out of file descriptors");
            metrics::record_listener_muted(&self.url);
        }
        changed
    }

    /// Resume accepting. Returns false if not muted.
    pub fn unmute(&self) -> bool {
        let changed = self.muted.send_if_modified(|muted| std::mem::replace(muted, false));
        if changed {
            tracing::info!(url = %self.url, "Listener unmuted");
        }
        changed
    }

    /// Classify an accept error: descriptor exhaustion mutes the listener,
    /// anything else is returned as fatal.
    pub fn handle_accept_error(&self, error: io::Error) -> Result<(), ListenerError> {
        if is_fd_exhaustion(&error) {
            self.mute();
            return Ok(());
        }
        Err(ListenerError::Accept {
            url: self.url.clone(),
            source: error,
        })
    }

    /// Accept until shutdown, handing every connection to `on_accept`.
    ///
    /// Returns an error only for a fatal accept failure.
    pub async fn accept_loop<F>(
        self: Arc<Self>,
        socket: AcceptSocket,
        mut shutdown: ShutdownSignal,
        mut on_accept: F,
    ) -> Result<(), ListenerError>
    where
        F: FnMut(RawSocket, &Arc<Listener>),
    {
        let mut muted = self.muted.subscribe();
        loop {
            if *muted.borrow_and_update() {
                tokio::select! {
                    _ = shutdown.wait() => break,
                    _ = muted.wait_for(|muted| !*muted) => continue,
                }
            }

            tokio::select! {
                biased;
                _ = shutdown.wait() => break,
                _ = muted.changed() => continue,
                accepted = socket.accept() => match accepted {
                    Ok(raw) => on_accept(raw, &self),
                    Err(e) => {
                        if let Err(fatal) = self.handle_accept_error(e) {
                            tracing::error!(url = %self.url, error = %fatal, "Listener failed");
                            return Err(fatal);
                        }
                    }
                },
            }
        }
        tracing::info!(url = %self.url, "Listener stopped accepting");
        Ok(())
    }
}

/// The listening descriptor. It stays open while the accept loop runs.
impl AsRawFd for Listener {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Some(path) = &self.unix_path {
            let _ = fs::remove_file(path);
        }
    }
}

fn remove_stale_socket(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
