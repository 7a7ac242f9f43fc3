// SPDX-FileCopyrightText: 2025 Caution SEZC
// SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-Commercial

//! Address resolution for the three transports the protocol runs over.
//!
//! `tcp://host:port`, `unix:///path/to.sock` and `vsock://cid:port` all map to
//! a [`TransportListener`] on the serving side and a [`TransportStream`] on the
//! dialing side. The vsock listen form may leave the context id empty
//! (`vsock://:12345`), meaning "any".

use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::pin::Pin;
use std::str::FromStr;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio_vsock::{VsockAddr, VsockListener, VsockStream};

/// Port the worker listens on inside the enclave.
pub const WORKER_PORT: u32 = 12345;

/// `VMADDR_CID_ANY`: bind on whatever context id the kernel assigned us.
const VSOCK_CID_ANY: u32 = u32::MAX;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport address {uri:?} is missing a `scheme://` prefix")]
    MissingScheme { uri: String },

    #[error("unsupported transport scheme {scheme:?} in {uri:?} (expected unix, tcp or vsock)")]
    UnknownScheme { scheme: String, uri: String },

    #[error("malformed {scheme} address {uri:?}: {reason}")]
    Malformed {
        scheme: &'static str,
        uri: String,
        reason: String,
    },

    #[error("could not listen on {transport}")]
    Bind {
        transport: Transport,
        #[source]
        source: io::Error,
    },

    #[error("could not connect to {transport}")]
    Connect {
        transport: Transport,
        #[source]
        source: io::Error,
    },

    #[error("could not determine the address peers should use for {transport}")]
    LocalAddr {
        transport: Transport,
        #[source]
        source: io::Error,
    },
}

impl TransportError {
    /// True for errors in the address itself, as opposed to socket failures.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::MissingScheme { .. } | Self::UnknownScheme { .. } | Self::Malformed { .. }
        )
    }
}

/// A resolved transport address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Transport {
    Tcp(String),
    Unix(PathBuf),
    Vsock { cid: Option<u32>, port: u32 },
}

impl Transport {
    pub fn parse(uri: &str) -> Result<Self, TransportError> {
        let (scheme, rest) = uri
            .split_once("://")
            .ok_or_else(|| TransportError::MissingScheme { uri: uri.to_string() })?;

        match scheme {
            "tcp" => {
                let malformed = |reason: &str| TransportError::Malformed {
                    scheme: "tcp",
                    uri: uri.to_string(),
                    reason: reason.to_string(),
                };
                let (host, port) = rest.rsplit_once(':').ok_or_else(|| malformed("expected host:port"))?;
                if host.is_empty() {
                    return Err(malformed("host is empty"));
                }
                port.parse::<u16>()
                    .map_err(|e| malformed(&format!("invalid port {port:?}: {e}")))?;
                Ok(Self::Tcp(rest.to_string()))
            }
            "unix" => {
                if rest.is_empty() {
                    return Err(TransportError::Malformed {
                        scheme: "unix",
                        uri: uri.to_string(),
                        reason: "socket path is empty".to_string(),
                    });
                }
                Ok(Self::Unix(PathBuf::from(rest)))
            }
            "vsock" => parse_vsock(uri, rest),
            other => Err(TransportError::UnknownScheme {
                scheme: other.to_string(),
                uri: uri.to_string(),
            }),
        }
    }

    pub fn vsock(cid: u32, port: u32) -> Self {
        Self::Vsock { cid: Some(cid), port }
    }

    pub fn tcp(addr: SocketAddr) -> Self {
        Self::Tcp(addr.to_string())
    }

    pub async fn bind(&self) -> Result<TransportListener, TransportError> {
        let bind_err = |source| TransportError::Bind {
            transport: self.clone(),
            source,
        };
        let inner = match self {
            Self::Tcp(addr) => ListenerKind::Tcp(TcpListener::bind(addr.as_str()).await.map_err(bind_err)?),
            Self::Unix(path) => ListenerKind::Unix(UnixListener::bind(path).map_err(bind_err)?),
            Self::Vsock { cid, port } => {
                let addr = VsockAddr::new(cid.unwrap_or(VSOCK_CID_ANY), *port);
                ListenerKind::Vsock(VsockListener::bind(addr).map_err(bind_err)?)
            }
        };
        tracing::debug!(transport = %self, "Listening");
        Ok(TransportListener {
            requested: self.clone(),
            inner,
        })
    }

    pub async fn connect(&self) -> Result<TransportStream, TransportError> {
        let connect_err = |source| TransportError::Connect {
            transport: self.clone(),
            source,
        };
        match self {
            Self::Tcp(addr) => TcpStream::connect(addr.as_str())
                .await
                .map(TransportStream::Tcp)
                .map_err(connect_err),
            Self::Unix(path) => UnixStream::connect(path)
                .await
                .map(TransportStream::Unix)
                .map_err(connect_err),
            Self::Vsock { cid: Some(cid), port } => VsockStream::connect(VsockAddr::new(*cid, *port))
                .await
                .map(TransportStream::Vsock)
                .map_err(connect_err),
            Self::Vsock { cid: None, .. } => Err(connect_err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "a vsock context id is required to dial",
            ))),
        }
    }
}

fn parse_vsock(uri: &str, rest: &str) -> Result<Transport, TransportError> {
    let malformed = |reason: String| TransportError::Malformed {
        scheme: "vsock",
        uri: uri.to_string(),
        reason,
    };
    let (cid, port) = rest
        .split_once(':')
        .ok_or_else(|| malformed("expected {contextID}:{port}".to_string()))?;
    let cid = if cid.is_empty() {
        None
    } else {
        Some(cid.parse::<u32>().map_err(|e| malformed(format!("invalid context id {cid:?}: {e}")))?)
    };
    let port = port
        .parse::<u32>()
        .map_err(|e| malformed(format!("invalid port {port:?}: {e}")))?;
    Ok(Transport::Vsock { cid, port })
}

impl FromStr for Transport {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(addr) => write!(f, "tcp://{addr}"),
            Self::Unix(path) => write!(f, "unix://{}", path.display()),
            Self::Vsock { cid: Some(cid), port } => write!(f, "vsock://{cid}:{port}"),
            Self::Vsock { cid: None, port } => write!(f, "vsock://:{port}"),
        }
    }
}

enum ListenerKind {
    Tcp(TcpListener),
    Unix(UnixListener),
    Vsock(VsockListener),
}

/// A bound listener for any of the supported transports.
pub struct TransportListener {
    requested: Transport,
    inner: ListenerKind,
}

/// Peer address of an accepted connection.
#[derive(Debug, Clone)]
pub enum PeerAddr {
    Tcp(SocketAddr),
    Unix,
    Vsock { cid: u32, port: u32 },
}

impl TransportListener {
    /// The address a peer has to dial to reach this listener.
    ///
    /// Wildcard binds are rewritten to something dialable: unspecified IPs
    /// become loopback and a vsock "any" bind becomes this machine's own
    /// context id.
    pub fn dial_address(&self) -> Result<Transport, TransportError> {
        let local_err = |source| TransportError::LocalAddr {
            transport: self.requested.clone(),
            source,
        };
        match &self.inner {
            ListenerKind::Tcp(listener) => {
                let mut addr = listener.local_addr().map_err(local_err)?;
                if addr.ip().is_unspecified() {
                    addr.set_ip(IpAddr::V4(Ipv4Addr::LOCALHOST));
                }
                Ok(Transport::tcp(addr))
            }
            ListenerKind::Unix(_) => Ok(self.requested.clone()),
            ListenerKind::Vsock(listener) => {
                let addr = listener.local_addr().map_err(local_err)?;
                let cid = match addr.cid() {
                    VSOCK_CID_ANY => vsock::get_local_cid().map_err(local_err)?,
                    cid => cid,
                };
                Ok(Transport::vsock(cid, addr.port()))
            }
        }
    }

    async fn accept_once(&mut self) -> io::Result<(TransportStream, PeerAddr)> {
        match &mut self.inner {
            ListenerKind::Tcp(listener) => {
                let (stream, addr) = listener.accept().await?;
                Ok((TransportStream::Tcp(stream), PeerAddr::Tcp(addr)))
            }
            ListenerKind::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok((TransportStream::Unix(stream), PeerAddr::Unix))
            }
            ListenerKind::Vsock(listener) => {
                let (stream, addr) = listener.accept().await?;
                Ok((
                    TransportStream::Vsock(stream),
                    PeerAddr::Vsock {
                        cid: addr.cid(),
                        port: addr.port(),
                    },
                ))
            }
        }
    }
}

impl axum::serve::Listener for TransportListener {
    type Io = TransportStream;
    type Addr = PeerAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        loop {
            match self.accept_once().await {
                Ok(accepted) => return accepted,
                Err(e) if is_connection_error(&e) => continue,
                Err(e) => {
                    tracing::error!(transport = %self.requested, "accept error: {e}");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        match &self.inner {
            ListenerKind::Tcp(listener) => listener.local_addr().map(PeerAddr::Tcp),
            ListenerKind::Unix(_) => Ok(PeerAddr::Unix),
            ListenerKind::Vsock(listener) => listener.local_addr().map(|addr| PeerAddr::Vsock {
                cid: addr.cid(),
                port: addr.port(),
            }),
        }
    }
}

fn is_connection_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
    )
}

/// A connected byte stream over any of the supported transports.
pub enum TransportStream {
    Tcp(TcpStream),
    Unix(UnixStream),
    Vsock(VsockStream),
}

impl AsyncRead for TransportStream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            Self::Unix(s) => Pin::new(s).poll_read(cx, buf),
            Self::Vsock(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for TransportStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            Self::Unix(s) => Pin::new(s).poll_write(cx, buf),
            Self::Vsock(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(s) => Pin::new(s).poll_flush(cx),
            Self::Unix(s) => Pin::new(s).poll_flush(cx),
            Self::Vsock(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            Self::Unix(s) => Pin::new(s).poll_shutdown(cx),
            Self::Vsock(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Ask the kernel for a free loopback port.
///
/// Used to hand a local fallback worker a port before it starts; the port is
/// released again before returning, so another process could still race us
/// for it.
pub fn pick_loopback_port() -> io::Result<u16> {
    let listener = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
    Ok(listener.local_addr()?.port())
}
