//! Micro Transport Protocol (BEP-29)
//!
//! A reliable, ordered, congestion-controlled byte stream over UDP. One
//! [`UtpSocket`] multiplexes many connections over a single UDP bind,
//! routed by the 16-bit connection id; each connection surfaces as a
//! [`UtpStream`] implementing `AsyncRead`/`AsyncWrite` so the peer layer
//! cannot tell it from TCP.

mod congestion;
mod connection;
mod error;
mod packet;
mod socket;
mod stream;

pub use error::UtpError;
pub use packet::{Header, Packet, PacketType};
pub use socket::UtpSocket;
pub use stream::UtpStream;
