//! Layered connection transports.
//!
//! A [`Listener`] is bound from configuration as one of four tagged stacks:
//! plain TCP, TCP+TLS, TCP+WebSocket, or TCP+TLS+WebSocket. `accept` blocks
//! only on the raw TCP accept; the returned [`Pending`] performs the TLS
//! handshake and WebSocket upgrade when `establish` is awaited, so slow
//! handshakes run on the per-connection task and never stall the accept
//! loop. Established connections are erased to a boxed byte stream and
//! wrapped by [`framed::MqttStream`] for packet-level I/O.

pub mod framed;
pub mod listener;
pub mod tls;
pub mod ws;

use std::net::SocketAddr;

use rustls::pki_types::CertificateDer;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::protocol::ProtocolError;

pub use framed::MqttStream;
pub use listener::{Established, Listener, Pending};
pub use ws::UpgradeRequest;

/// Combined byte-stream trait, implemented for every transport the layers
/// can produce, so established connections erase to a single object type.
pub trait Io: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Io for T {}

/// Byte-stream erasure applied once a connection's layers are established.
pub type BoxedIo = Box<dyn Io>;

/// Failures on an individual connection. Fatal for that connection only;
/// broker state is never affected.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("connection closed by peer")]
    Closed,
    #[error("tls handshake failed: {0}")]
    Tls(String),
    #[error("websocket upgrade failed: {0}")]
    Ws(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Per-connection facts gathered while the transport layers come up.
#[derive(Debug, Clone)]
pub struct ConnInfo {
    pub peer_addr: SocketAddr,
    /// Certificate chain the peer presented during TLS client auth, if any.
    pub peer_certificates: Vec<CertificateDer<'static>>,
    /// Head of the HTTP request that upgraded to WebSocket, if any.
    pub upgrade_request: Option<UpgradeRequest>,
}

impl ConnInfo {
    pub fn new(peer_addr: SocketAddr) -> Self {
        ConnInfo {
            peer_addr,
            peer_certificates: Vec::new(),
            upgrade_request: None,
        }
    }
}
