//! MQTT framing over an established byte stream.
//!
//! Each connection owns a leftover buffer of unparsed bytes. Reads run the
//! incremental codec against that buffer, fetching more from the underlying
//! stream only when a complete packet is not yet available; trailing bytes
//! stay buffered for the next read.

use std::ops::ControlFlow;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::TransportError;
use crate::protocol::{codec, Packet};

const READ_CHUNK: usize = 4096;

pub struct MqttStream<S> {
    io: S,
    leftover: BytesMut,
    write_buf: BytesMut,
}

impl<S: AsyncRead + AsyncWrite + Unpin> MqttStream<S> {
    pub fn new(io: S) -> Self {
        MqttStream {
            io,
            leftover: BytesMut::with_capacity(READ_CHUNK),
            write_buf: BytesMut::new(),
        }
    }

    /// Unparsed bytes currently buffered for this connection.
    pub fn leftover(&self) -> &[u8] {
        &self.leftover
    }

    /// Read exactly one packet, consuming exactly its bytes. Cancel-safe:
    /// bytes fetched before cancellation stay in the leftover buffer.
    pub async fn read_packet(&mut self) -> Result<Packet, TransportError> {
        loop {
            if let Some(packet) = codec::decode(&mut self.leftover)? {
                return Ok(packet);
            }
            self.leftover.reserve(READ_CHUNK);
            let n = self.io.read_buf(&mut self.leftover).await?;
            if n == 0 {
                return Err(TransportError::Closed);
            }
        }
    }

    /// Parse and hand packets to `f` until it breaks, preserving whatever
    /// bytes remain unparsed.
    pub async fn consume_packets<F>(&mut self, mut f: F) -> Result<(), TransportError>
    where
        F: FnMut(Packet) -> ControlFlow<()>,
    {
        loop {
            let packet = self.read_packet().await?;
            if let ControlFlow::Break(()) = f(packet) {
                return Ok(());
            }
        }
    }

    pub async fn write_packet(&mut self, packet: &Packet) -> Result<(), TransportError> {
        self.write_buf.clear();
        codec::encode(packet, &mut self.write_buf)?;
        let frame = self.write_buf.split();
        self.io.write_all(&frame).await?;
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<(), TransportError> {
        self.io.flush().await?;
        Ok(())
    }

    /// Shut the stream down cleanly; lower layers emit their own goodbyes
    /// (TLS close-notify, WebSocket close frame).
    pub async fn shutdown(&mut self) -> Result<(), TransportError> {
        self.io.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Packet;

    #[tokio::test]
    async fn reads_packet_and_keeps_trailing_bytes() {
        let (mut client, server) = tokio::io::duplex(256);
        let mut stream = MqttStream::new(server);

        let mut wire = BytesMut::new();
        codec::encode(&Packet::PingReq, &mut wire).unwrap();
        codec::encode(&Packet::Disconnect, &mut wire).unwrap();
        tokio::io::AsyncWriteExt::write_all(&mut client, &wire)
            .await
            .unwrap();

        assert_eq!(stream.read_packet().await.unwrap(), Packet::PingReq);
        assert_eq!(stream.leftover(), &[0xE0, 0x00]);
        assert_eq!(stream.read_packet().await.unwrap(), Packet::Disconnect);
        assert!(stream.leftover().is_empty());
    }

    #[tokio::test]
    async fn consume_packets_stops_on_break_and_preserves_leftover() {
        let (mut client, server) = tokio::io::duplex(256);
        let mut stream = MqttStream::new(server);

        let mut wire = BytesMut::new();
        codec::encode(&Packet::PingReq, &mut wire).unwrap();
        codec::encode(&Packet::PingReq, &mut wire).unwrap();
        codec::encode(&Packet::Disconnect, &mut wire).unwrap();
        tokio::io::AsyncWriteExt::write_all(&mut client, &wire)
            .await
            .unwrap();

        let mut seen = 0;
        stream
            .consume_packets(|packet| {
                seen += 1;
                if packet == Packet::PingReq {
                    ControlFlow::Continue(())
                } else {
                    ControlFlow::Break(())
                }
            })
            .await
            .unwrap();
        assert_eq!(seen, 3);
        assert!(stream.leftover().is_empty());
    }
}
