//! WebSocket layer: HTTP upgrade handling and a byte-stream adapter over
//! the binary message channel.

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::BytesMut;
use futures_util::{Sink, Stream};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};

use super::{ConnInfo, TransportError};

/// Head of the HTTP request that initiated the WebSocket upgrade.
#[derive(Debug, Clone)]
pub struct UpgradeRequest {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
}

/// Read the upgrade request from `io`, accept it (echoing the `mqtt`
/// subprotocol when offered), record the request head into `info`, and
/// expose the connection as a binary byte stream.
pub async fn upgrade<S>(io: S, info: &mut ConnInfo) -> Result<WsByteStream<S>, TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut head = None;
    let callback = |req: &Request, mut resp: Response| -> Result<Response, ErrorResponse> {
        head = Some(UpgradeRequest {
            method: req.method().to_string(),
            path: req.uri().to_string(),
            headers: req
                .headers()
                .iter()
                .map(|(name, value)| {
                    (
                        name.to_string(),
                        String::from_utf8_lossy(value.as_bytes()).into_owned(),
                    )
                })
                .collect(),
        });
        let offered_mqtt = req
            .headers()
            .get("sec-websocket-protocol")
            .and_then(|value| value.to_str().ok())
            .is_some_and(|protocols| protocols.split(',').any(|p| p.trim() == "mqtt"));
        if offered_mqtt {
            resp.headers_mut()
                .insert("sec-websocket-protocol", HeaderValue::from_static("mqtt"));
        }
        Ok(resp)
    };
    let stream = accept_hdr_async(io, callback)
        .await
        .map_err(|e| TransportError::Ws(e.to_string()))?;
    info.upgrade_request = head;
    Ok(WsByteStream::new(stream))
}

/// `AsyncRead`/`AsyncWrite` over a WebSocket's binary messages. Reads
/// buffer partial messages; writes emit one binary frame per call; shutdown
/// sends a Close frame before the underlying stream goes away.
pub struct WsByteStream<S> {
    inner: WebSocketStream<S>,
    readable: BytesMut,
}

impl<S> WsByteStream<S> {
    pub fn new(inner: WebSocketStream<S>) -> Self {
        WsByteStream {
            inner,
            readable: BytesMut::new(),
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncRead for WsByteStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.readable.is_empty() {
                let take = this.readable.len().min(buf.remaining());
                buf.put_slice(&this.readable.split_to(take));
                return Poll::Ready(Ok(()));
            }
            match ready!(Pin::new(&mut this.inner).poll_next(cx)) {
                Some(Ok(Message::Binary(data))) => this.readable.extend_from_slice(&data),
                Some(Ok(Message::Text(_))) => {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "text frame on mqtt websocket",
                    )))
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
                Some(Ok(Message::Close(_))) | None => return Poll::Ready(Ok(())),
                Some(Err(e)) => return Poll::Ready(Err(io::Error::other(e))),
            }
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncWrite for WsByteStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if let Err(e) = ready!(Pin::new(&mut this.inner).poll_ready(cx)) {
            return Poll::Ready(Err(io::Error::other(e)));
        }
        Pin::new(&mut this.inner)
            .start_send(Message::binary(data.to_vec()))
            .map_err(io::Error::other)?;
        Poll::Ready(Ok(data.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        Pin::new(&mut this.inner)
            .poll_flush(cx)
            .map_err(io::Error::other)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        Pin::new(&mut this.inner)
            .poll_close(cx)
            .map_err(io::Error::other)
    }
}
