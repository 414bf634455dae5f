//! Tagged listener stacks: TCP, optionally wrapped with TLS and/or
//! WebSocket framing.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio_rustls::TlsAcceptor;

use super::{tls, ws, BoxedIo, ConnInfo, TransportError};
use crate::config::ListenerConfig;

pub struct Listener {
    inner: TcpListener,
    local_addr: SocketAddr,
    tls: Option<TlsAcceptor>,
    websocket: bool,
}

impl Listener {
    /// Bind the configured address with the configured accept backlog and
    /// prepare the upper layers. The listening socket closes when the
    /// listener is dropped.
    pub async fn bind(cfg: &ListenerConfig) -> Result<Self> {
        let addr: SocketAddr = cfg
            .bind
            .parse()
            .with_context(|| format!("invalid bind address {}", cfg.bind))?;
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket
            .bind(addr)
            .with_context(|| format!("failed to bind {}", cfg.bind))?;
        let inner = socket
            .listen(cfg.backlog)
            .with_context(|| format!("failed to listen on {}", cfg.bind))?;
        let local_addr = inner.local_addr()?;
        let tls = cfg.tls.as_ref().map(tls::build_acceptor).transpose()?;
        tracing::info!(
            %local_addr,
            tls = tls.is_some(),
            websocket = cfg.websocket,
            "listener bound"
        );
        Ok(Listener {
            inner,
            local_addr,
            tls,
            websocket: cfg.websocket,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Wait for the next TCP connection. Only the raw accept happens here;
    /// the TLS handshake and WebSocket upgrade belong to
    /// [`Pending::establish`], which callers run on the connection's own
    /// task.
    pub async fn accept(&self) -> Result<Pending, TransportError> {
        let (stream, peer) = self.inner.accept().await?;
        Ok(Pending {
            stream,
            peer,
            tls: self.tls.clone(),
            websocket: self.websocket,
        })
    }
}

/// An accepted TCP connection whose upper layers are not yet established.
pub struct Pending {
    stream: TcpStream,
    peer: SocketAddr,
    tls: Option<TlsAcceptor>,
    websocket: bool,
}

impl Pending {
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Run the handshakes this stack requires and erase the result to a
    /// byte stream. The accepted socket closes on drop, so a failed
    /// handshake cleans up on its own.
    pub async fn establish(self) -> Result<Established, TransportError> {
        let mut info = ConnInfo::new(self.peer);
        let io: BoxedIo = match self.tls {
            Some(acceptor) => {
                let tls_stream = acceptor
                    .accept(self.stream)
                    .await
                    .map_err(|e| TransportError::Tls(e.to_string()))?;
                {
                    let (_, conn) = tls_stream.get_ref();
                    if let Some(certs) = conn.peer_certificates() {
                        info.peer_certificates = certs.to_vec();
                    }
                }
                if self.websocket {
                    Box::new(ws::upgrade(tls_stream, &mut info).await?)
                } else {
                    Box::new(tls_stream)
                }
            }
            None if self.websocket => Box::new(ws::upgrade(self.stream, &mut info).await?),
            None => Box::new(self.stream),
        };
        Ok(Established { io, info })
    }
}

/// A fully established connection: erased byte stream plus the facts the
/// layers gathered on the way up.
pub struct Established {
    pub io: BoxedIo,
    pub info: ConnInfo,
}
