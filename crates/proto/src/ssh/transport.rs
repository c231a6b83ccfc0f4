//! Per-connection packet transport.
//!
//! A [`Transport`] owns the connection handle of exactly one session and
//! moves whole packet payloads over it. Framing is buffered in a
//! [`PacketCodec`], so a receive that is abandoned (timeout or close) never
//! loses bytes of a partially read packet.

use crate::ssh::packet::{PacketCodec, PacketProtection};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::Framed;

/// Byte stream a session can run over (TCP, Unix socket, in-memory pipe).
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// Framed connection handle of one session.
pub struct Transport {
    framed: Framed<Box<dyn AsyncStream>, PacketCodec>,
    peer: Option<SocketAddr>,
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("peer", &self.peer)
            .field("codec", self.framed.codec())
            .finish()
    }
}

impl Transport {
    /// Wraps a connected stream.
    pub fn new(stream: Box<dyn AsyncStream>, peer: Option<SocketAddr>) -> Self {
        Self {
            framed: Framed::new(stream, PacketCodec::new()),
            peer,
        }
    }

    /// Remote address, when the stream has one.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Raw stream, for the identification exchange that precedes packets.
    ///
    /// Reading through this handle bypasses the packet buffer; it is only
    /// meaningful before the first packet is received.
    pub fn stream_mut(&mut self) -> &mut Box<dyn AsyncStream> {
        self.framed.get_mut()
    }

    /// Sends one payload as a packet and flushes it.
    pub async fn send_payload(&mut self, payload: Vec<u8>) -> io::Result<()> {
        self.framed.send(Bytes::from(payload)).await
    }

    /// Receives the next payload.
    ///
    /// Returns `Ok(None)` once the peer has closed the connection. The future
    /// is cancel-safe.
    pub async fn recv_payload(&mut self) -> io::Result<Option<Bytes>> {
        self.framed.next().await.transpose()
    }

    /// Sequence number of the last received packet (0 before any).
    pub fn incoming_sequence(&self) -> u32 {
        self.framed.codec().last_incoming_sequence().unwrap_or(0)
    }

    /// Sequence number the next sent packet will carry.
    pub fn outgoing_sequence(&self) -> u32 {
        self.framed.codec().outgoing_sequence()
    }

    /// Applies `protection` to every packet received after this call.
    ///
    /// Bytes already buffered but not yet decoded are treated as protected.
    pub fn set_inbound_protection(&mut self, protection: Box<dyn PacketProtection>) {
        self.framed.codec_mut().set_inbound_protection(protection);
    }

    /// Applies `protection` to every packet sent after this call.
    pub fn set_outbound_protection(&mut self, protection: Box<dyn PacketProtection>) {
        self.framed.codec_mut().set_outbound_protection(protection);
    }

    /// Shuts down the write half of the connection.
    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.framed.get_mut().shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::packet::Packet;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_send_and_receive() {
        let (server, client) = tokio::io::duplex(4096);
        let mut server = Transport::new(Box::new(server), None);
        let mut client = Transport::new(Box::new(client), None);

        server.send_payload(vec![6, 1, 2]).await.unwrap();
        let payload = client.recv_payload().await.unwrap().unwrap();
        assert_eq!(&payload[..], &[6, 1, 2]);
        assert_eq!(server.outgoing_sequence(), 1);
        assert_eq!(client.incoming_sequence(), 0);
    }

    #[tokio::test]
    async fn test_recv_eof() {
        let (server, client) = tokio::io::duplex(64);
        let mut server = Transport::new(Box::new(server), None);
        drop(client);

        assert!(server.recv_payload().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_recv_survives_cancellation() {
        let (server, mut client) = tokio::io::duplex(4096);
        let mut server = Transport::new(Box::new(server), None);
        let wire = Packet::new(b"split".to_vec()).unwrap().to_bytes();

        client.write_all(&wire[..6]).await.unwrap();
        let first = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            server.recv_payload(),
        )
        .await;
        assert!(first.is_err());

        client.write_all(&wire[6..]).await.unwrap();
        let payload = server.recv_payload().await.unwrap().unwrap();
        assert_eq!(&payload[..], b"split");
    }

    #[tokio::test]
    async fn test_raw_stream_before_packets() {
        let (server, mut client) = tokio::io::duplex(4096);
        let mut server = Transport::new(Box::new(server), None);

        client.write_all(b"hi").await.unwrap();
        let mut buf = [0u8; 2];
        server.stream_mut().read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
    }
}
