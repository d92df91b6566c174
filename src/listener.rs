//! # Listener acquisition and descriptor handoff.
//!
//! A [`Listener`] is an exclusively-owned listening socket plus an optional
//! TCP keepalive period applied to accepted connections. Listeners come from
//! three sources, in the priority order used by [`Graceful`](crate::Graceful):
//!
//! 1. a socket-activation supervisor (`LISTEN_PID`/`LISTEN_FDS`, descriptors
//!    starting at 3);
//! 2. a predecessor process of the same service, detected via the
//!    [`RESTART_ENV`] marker set only on restart children;
//! 3. a fresh bind ([`Listener::bind_tcp`] / [`Listener::bind_unix`]).
//!
//! On unix every listener can export its raw descriptor for the restart
//! handoff; [`listener_fds`] fails closed if any listener cannot.

use std::io;
use std::net::IpAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};

#[cfg(unix)]
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};

use crate::error::SetupError;

/// Marker variable set by a restarting parent; its presence tells the child
/// to inherit listeners instead of binding fresh ones. The value is the
/// generation number.
pub const RESTART_ENV: &str = "GRACESERVE_RESTART";

/// Number of listener descriptors handed to a restart child, renumbered
/// from [`INHERIT_FDS_START`].
pub const FD_COUNT_ENV: &str = "GRACESERVE_FD_COUNT";

/// Descriptor the restart child writes one byte to once its serve stage is
/// up. See [`Graceful`](crate::Graceful).
pub const READY_FD_ENV: &str = "GRACESERVE_READY_FD";

/// First descriptor number used for handed-off listeners. Matches the
/// socket-activation convention (stdin/stdout/stderr occupy 0..=2).
pub const INHERIT_FDS_START: i32 = 3;

const LISTEN_PID_ENV: &str = "LISTEN_PID";
const LISTEN_FDS_ENV: &str = "LISTEN_FDS";

/// A listening socket owned by this process.
pub struct Listener {
    kind: Kind,
    keepalive: Option<Duration>,
}

enum Kind {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener),
}

impl Listener {
    /// Binds a fresh TCP listener.
    pub async fn bind_tcp(addr: &str) -> Result<Self, SetupError> {
        let listener = TcpListener::bind(addr).await.map_err(|source| SetupError::Bind {
            addr: addr.to_string(),
            source,
        })?;
        Ok(Self {
            kind: Kind::Tcp(listener),
            keepalive: None,
        })
    }

    /// Binds a fresh unix-domain listener.
    #[cfg(unix)]
    pub fn bind_unix(path: &str) -> Result<Self, SetupError> {
        let listener = UnixListener::bind(path).map_err(|source| SetupError::Bind {
            addr: path.to_string(),
            source,
        })?;
        Ok(Self {
            kind: Kind::Unix(listener),
            keepalive: None,
        })
    }

    /// Sets the keepalive period enabled on accepted TCP connections.
    /// Zero disables keepalive.
    pub fn with_keepalive(mut self, period: Duration) -> Self {
        self.keepalive = (!period.is_zero()).then_some(period);
        self
    }

    /// Accepts one connection, applying the keepalive period for TCP.
    pub async fn accept(&self) -> io::Result<Stream> {
        match &self.kind {
            Kind::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                if let Some(period) = self.keepalive {
                    let keepalive = TcpKeepalive::new().with_time(period);
                    SockRef::from(&stream).set_tcp_keepalive(&keepalive)?;
                }
                Ok(Stream::Tcp {
                    stream,
                    peer: peer.ip(),
                })
            }
            #[cfg(unix)]
            Kind::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(Stream::Unix(stream))
            }
        }
    }

    /// Local TCP address, for tests and logs. Unix listeners report
    /// `Unsupported`.
    pub fn local_addr(&self) -> io::Result<std::net::SocketAddr> {
        match &self.kind {
            Kind::Tcp(listener) => listener.local_addr(),
            #[cfg(unix)]
            Kind::Unix(_) => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "unix listener has no socket address",
            )),
        }
    }

    /// Human-readable address for diagnostics.
    pub fn describe(&self) -> String {
        match &self.kind {
            Kind::Tcp(listener) => listener
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "tcp:?".to_string()),
            #[cfg(unix)]
            Kind::Unix(listener) => listener
                .local_addr()
                .ok()
                .and_then(|a| a.as_pathname().map(|p| p.display().to_string()))
                .unwrap_or_else(|| "unix:?".to_string()),
        }
    }

    /// Exposes the raw OS descriptor underlying this listener.
    ///
    /// This is the export capability the restart handoff depends on.
    #[cfg(unix)]
    pub fn raw_fd(&self) -> io::Result<RawFd> {
        match &self.kind {
            Kind::Tcp(listener) => Ok(listener.as_raw_fd()),
            Kind::Unix(listener) => Ok(listener.as_raw_fd()),
        }
    }
}

/// Collects the raw descriptor of every listener, failing closed if any
/// listener cannot export one.
#[cfg(unix)]
pub(crate) fn listener_fds(listeners: &[Listener]) -> Result<Vec<RawFd>, SetupError> {
    let mut fds = Vec::with_capacity(listeners.len());
    for listener in listeners {
        let fd = listener.raw_fd().map_err(|source| SetupError::ExportFd {
            addr: listener.describe(),
            source,
        })?;
        fds.push(fd);
    }
    Ok(fds)
}

/// An accepted connection.
pub enum Stream {
    /// TCP connection with its peer address.
    Tcp {
        stream: TcpStream,
        peer: IpAddr,
    },
    /// Unix-domain connection.
    #[cfg(unix)]
    Unix(UnixStream),
}

impl Stream {
    /// Peer IP address, when the transport has one.
    pub fn peer_ip(&self) -> Option<IpAddr> {
        match self {
            Stream::Tcp { peer, .. } => Some(*peer),
            #[cfg(unix)]
            Stream::Unix(_) => None,
        }
    }
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp { stream, .. } => Pin::new(stream).poll_read(cx, buf),
            #[cfg(unix)]
            Stream::Unix(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Stream::Tcp { stream, .. } => Pin::new(stream).poll_write(cx, buf),
            #[cfg(unix)]
            Stream::Unix(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp { stream, .. } => Pin::new(stream).poll_flush(cx),
            #[cfg(unix)]
            Stream::Unix(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp { stream, .. } => Pin::new(stream).poll_shutdown(cx),
            #[cfg(unix)]
            Stream::Unix(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

/// Returns listeners handed over by a socket-activation supervisor, or
/// `None` when the process was not activated.
///
/// Implements the `LISTEN_PID`/`LISTEN_FDS` protocol: descriptors start at
/// [`INHERIT_FDS_START`], and the variables are cleared after use so child
/// processes do not misread them.
#[cfg(unix)]
pub fn activated_listeners() -> Result<Option<Vec<Listener>>, SetupError> {
    let count = match activation_fd_count(
        std::env::var(LISTEN_PID_ENV).ok().as_deref(),
        std::env::var(LISTEN_FDS_ENV).ok().as_deref(),
        std::process::id(),
    ) {
        Some(count) => count,
        None => return Ok(None),
    };
    std::env::remove_var(LISTEN_PID_ENV);
    std::env::remove_var(LISTEN_FDS_ENV);

    let listeners = (0..count)
        .map(|i| listener_from_fd(INHERIT_FDS_START + i))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Some(listeners))
}

/// Parses the activation environment. `None` when the process was not
/// activated (missing/malformed variables, PID mismatch, zero descriptors).
fn activation_fd_count(pid: Option<&str>, fds: Option<&str>, my_pid: u32) -> Option<i32> {
    let count: i32 = fds?.trim().parse().ok()?;
    if count <= 0 {
        return None;
    }
    let pid: u32 = pid?.trim().parse().ok()?;
    if pid != my_pid {
        return None;
    }
    Some(count)
}

/// Returns listeners inherited from a predecessor generation, or `None`
/// when this process is a cold start (no restart marker).
#[cfg(unix)]
pub fn inherited_listeners() -> Result<Option<Vec<Listener>>, SetupError> {
    if std::env::var_os(RESTART_ENV).is_none() {
        return Ok(None);
    }
    let count: i32 = std::env::var(FD_COUNT_ENV)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .ok_or_else(|| SetupError::SocketActivation {
            reason: format!("{FD_COUNT_ENV} missing or malformed on restart child"),
        })?;

    let listeners = (0..count)
        .map(|i| listener_from_fd(INHERIT_FDS_START + i))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Some(listeners))
}

/// Reconstructs a [`Listener`] from an inherited raw descriptor.
///
/// The socket family decides the flavor: inet/inet6 become TCP, unix becomes
/// a unix-domain listener. The descriptor is switched to nonblocking before
/// it is handed to tokio.
#[cfg(unix)]
pub(crate) fn listener_from_fd(fd: RawFd) -> Result<Listener, SetupError> {
    let inherit = |source: io::Error| SetupError::Inherit { fd, source };

    let socket = unsafe { socket2::Socket::from_raw_fd(fd) };
    socket.set_nonblocking(true).map_err(inherit)?;
    let domain = socket.local_addr().map_err(inherit)?.domain();

    let kind = if domain == socket2::Domain::IPV4 || domain == socket2::Domain::IPV6 {
        let listener: std::net::TcpListener = socket.into();
        Kind::Tcp(TcpListener::from_std(listener).map_err(inherit)?)
    } else if domain == socket2::Domain::UNIX {
        let listener: std::os::unix::net::UnixListener = socket.into();
        Kind::Unix(UnixListener::from_std(listener).map_err(inherit)?)
    } else {
        return Err(inherit(io::Error::new(
            io::ErrorKind::Unsupported,
            "inherited descriptor is not an inet or unix socket",
        )));
    };

    Ok(Listener {
        kind,
        keepalive: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_activation_requires_matching_pid() {
        assert_eq!(activation_fd_count(Some("42"), Some("2"), 42), Some(2));
        assert_eq!(activation_fd_count(Some("41"), Some("2"), 42), None);
    }

    #[test]
    fn test_activation_rejects_malformed() {
        assert_eq!(activation_fd_count(None, Some("2"), 42), None);
        assert_eq!(activation_fd_count(Some("42"), None, 42), None);
        assert_eq!(activation_fd_count(Some("42"), Some("zero"), 42), None);
        assert_eq!(activation_fd_count(Some("42"), Some("0"), 42), None);
        assert_eq!(activation_fd_count(Some("42"), Some("-1"), 42), None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_listener_from_fd_roundtrip() {
        use std::os::unix::io::IntoRawFd;

        let std_listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = std_listener.local_addr().expect("addr");
        let fd = std_listener.into_raw_fd();

        let listener = listener_from_fd(fd).expect("reconstruct");
        assert_eq!(listener.local_addr().expect("addr"), addr);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_listener_fds_exports_every_listener() {
        let a = Listener::bind_tcp("127.0.0.1:0").await.expect("bind");
        let b = Listener::bind_tcp("127.0.0.1:0").await.expect("bind");
        let fds = listener_fds(&[a, b]).expect("export");
        assert_eq!(fds.len(), 2);
        assert!(fds.iter().all(|fd| *fd >= 0));
    }
}
