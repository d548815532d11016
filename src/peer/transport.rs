use std::net::SocketAddr;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use super::error::PeerError;
use super::message::{Handshake, Message};
use crate::constants::{CONNECT_TIMEOUT, HANDSHAKE_LEN, INACTIVITY_TIMEOUT, MAX_MESSAGE_LEN};
use crate::utp::UtpStream;

const WRITE_TIMEOUT: Duration = Duration::from_secs(30);

enum Io {
    Tcp(TcpStream),
    Utp(UtpStream),
}

/// The byte stream under a peer connection: TCP or uTP, dispatched once
/// per call.
///
/// Owns the read buffer and the frame boundary; everything handed
/// upward is a whole message. The message decoder never sees a partial
/// frame.
pub struct PeerTransport {
    io: Io,
    read_buf: BytesMut,
}

impl PeerTransport {
    pub fn tcp(stream: TcpStream) -> Self {
        Self {
            io: Io::Tcp(stream),
            read_buf: BytesMut::with_capacity(32 * 1024),
        }
    }

    pub fn utp(stream: UtpStream) -> Self {
        Self {
            io: Io::Utp(stream),
            read_buf: BytesMut::with_capacity(32 * 1024),
        }
    }

    /// Dials a TCP transport.
    pub async fn connect_tcp(addr: SocketAddr) -> Result<Self, PeerError> {
        let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| PeerError::Timeout)??;
        Ok(Self::tcp(stream))
    }

    pub fn peer_addr(&self) -> Result<SocketAddr, PeerError> {
        match &self.io {
            Io::Tcp(stream) => Ok(stream.peer_addr()?),
            Io::Utp(stream) => Ok(stream.peer_addr()),
        }
    }

    /// Round-trip estimate, where the transport keeps one.
    pub fn rtt(&self) -> Option<Duration> {
        match &self.io {
            Io::Tcp(_) => None,
            Io::Utp(stream) => Some(stream.rtt()),
        }
    }

    pub fn bytes_in_flight(&self) -> u32 {
        match &self.io {
            Io::Tcp(_) => 0,
            Io::Utp(stream) => stream.bytes_in_flight(),
        }
    }

    async fn fill(&mut self) -> Result<(), PeerError> {
        let n = match &mut self.io {
            Io::Tcp(stream) => {
                timeout(INACTIVITY_TIMEOUT, stream.read_buf(&mut self.read_buf))
                    .await
                    .map_err(|_| PeerError::Timeout)??
            }
            Io::Utp(stream) => {
                timeout(INACTIVITY_TIMEOUT, stream.read_buf(&mut self.read_buf))
                    .await
                    .map_err(|_| PeerError::Timeout)??
            }
        };
        if n == 0 {
            return Err(PeerError::ConnectionClosed);
        }
        Ok(())
    }

    async fn write_all(&mut self, data: &[u8]) -> Result<(), PeerError> {
        match &mut self.io {
            Io::Tcp(stream) => timeout(WRITE_TIMEOUT, stream.write_all(data))
                .await
                .map_err(|_| PeerError::Timeout)??,
            Io::Utp(stream) => timeout(WRITE_TIMEOUT, stream.write_all(data))
                .await
                .map_err(|_| PeerError::Timeout)??,
        }
        Ok(())
    }

    pub async fn send_handshake(&mut self, handshake: &Handshake) -> Result<(), PeerError> {
        self.write_all(&handshake.encode()).await
    }

    pub async fn receive_handshake(&mut self) -> Result<Handshake, PeerError> {
        while self.read_buf.len() < HANDSHAKE_LEN {
            self.fill().await?;
        }
        let bytes = self.read_buf.split_to(HANDSHAKE_LEN);
        Handshake::decode(&bytes)
    }

    pub async fn send_message(&mut self, message: &Message) -> Result<(), PeerError> {
        self.write_all(&message.encode()).await
    }

    /// Reads one whole frame and decodes it.
    pub async fn receive_message(&mut self) -> Result<Message, PeerError> {
        while self.read_buf.len() < 4 {
            self.fill().await?;
        }

        let length = u32::from_be_bytes([
            self.read_buf[0],
            self.read_buf[1],
            self.read_buf[2],
            self.read_buf[3],
        ]) as usize;

        if length > MAX_MESSAGE_LEN {
            return Err(PeerError::InvalidMessage("frame above size cap"));
        }

        let frame_len = 4 + length;
        while self.read_buf.len() < frame_len {
            self.fill().await?;
        }

        Message::decode(self.read_buf.split_to(frame_len).freeze())
    }

    /// Flushes buffered output and shuts the write half down.
    pub async fn shutdown(&mut self) -> Result<(), PeerError> {
        match &mut self.io {
            Io::Tcp(stream) => stream.shutdown().await?,
            Io::Utp(stream) => stream.shutdown().await?,
        }
        Ok(())
    }
}
