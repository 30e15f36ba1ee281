//! Sockets as they move between threads, and the streams built from them.
//!
//! Sockets are accepted or connected on the daemon thread and then handed to
//! the I/O worker that owns them as plain std sockets, because a tokio socket
//! is bound to the reactor of the runtime that registered it.

use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream as StdUnixStream;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UnixStream};

/// Object-safe alias for a bidirectional byte stream.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// A boxed stream: plain TCP, Unix, or TLS over either.
pub type BoxedStream = Box<dyn AsyncStream>;

/// A connected socket that has not been registered with a reactor yet.
#[derive(Debug)]
pub enum RawSocket {
    Tcp(std::net::TcpStream),
    Unix(StdUnixStream),
}

impl RawSocket {
    /// Detach a tokio TCP stream from the current reactor.
    pub fn from_tcp(stream: TcpStream) -> io::Result<Self> {
        let std = stream.into_std()?;
        std.set_nonblocking(true)?;
        Ok(RawSocket::Tcp(std))
    }

    /// Detach a tokio Unix stream from the current reactor.
    pub fn from_unix(stream: UnixStream) -> io::Result<Self> {
        let std = stream.into_std()?;
        std.set_nonblocking(true)?;
        Ok(RawSocket::Unix(std))
    }

    /// Descriptor used to shard the socket onto a worker.
    pub fn fd(&self) -> RawFd {
        match self {
            RawSocket::Tcp(s) => s.as_raw_fd(),
            RawSocket::Unix(s) => s.as_raw_fd(),
        }
    }

    /// Human readable peer name for logs.
    pub fn peer(&self) -> String {
        match self {
            RawSocket::Tcp(s) => s
                .peer_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "unknown".to_string()),
            RawSocket::Unix(_) => "local".to_string(),
        }
    }

    /// Register with the reactor of the calling thread's runtime.
    pub fn into_stream(self) -> io::Result<BoxedStream> {
        match self {
            RawSocket::Tcp(s) => {
                let stream = TcpStream::from_std(s)?;
                stream.set_nodelay(true)?;
                Ok(Box::new(stream))
            }
            RawSocket::Unix(s) => Ok(Box::new(UnixStream::from_std(s)?)),
        }
    }
}

/// Whether an accept error means the process ran out of descriptors.
pub fn is_fd_exhaustion(error: &io::Error) -> bool {
    matches!(error.raw_os_error(), Some(libc::EMFILE) | Some(libc::ENFILE))
}

/// Errors that just mean the peer went away.
pub fn is_connection_reset(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::UnexpectedEof
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_descriptor_exhaustion() {
        assert!(is_fd_exhaustion(&io::Error::from_raw_os_error(libc::EMFILE)));
        assert!(is_fd_exhaustion(&io::Error::from_raw_os_error(libc::ENFILE)));
        assert!(!is_fd_exhaustion(&io::Error::from_raw_os_error(libc::ECONNABORTED)));
        assert!(!is_fd_exhaustion(&io::Error::new(io::ErrorKind::Other, "boom")));
    }

    #[tokio::test]
    async fn socket_survives_reactor_handoff() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
        let (accepted, _) = listener.accept().await.unwrap();
        let _client = client.await.unwrap();

        let raw = RawSocket::from_tcp(accepted).unwrap();
        assert!(raw.fd() >= 0);
        assert!(raw.peer().starts_with("127.0.0.1:"));

        let handle = std::thread::spawn(move || {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            rt.block_on(async move { raw.into_stream().is_ok() })
        });
        assert!(handle.join().unwrap());
    }
}
