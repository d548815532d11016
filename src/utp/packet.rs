//! The uTP packet format.
//!
//! ```text
//! 0       4       8               16              24              32
//! +-------+-------+---------------+---------------+---------------+
//! | type  | ver   | extension     | connection_id                 |
//! +-------+-------+---------------+---------------+---------------+
//! | timestamp_microseconds                                        |
//! +---------------+---------------+---------------+---------------+
//! | timestamp_difference_microseconds                             |
//! +---------------+---------------+---------------+---------------+
//! | wnd_size                                                      |
//! +---------------+---------------+---------------+---------------+
//! | seq_nr                        | ack_nr                        |
//! +---------------+---------------+---------------+---------------+
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use super::error::UtpError;

/// Protocol version, always 1.
pub const UTP_VERSION: u8 = 1;

/// Header length in bytes.
pub const HEADER_LEN: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Data = 0,
    Fin = 1,
    State = 2,
    Reset = 3,
    Syn = 4,
}

impl TryFrom<u8> for PacketType {
    type Error = UtpError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(PacketType::Data),
            1 => Ok(PacketType::Fin),
            2 => Ok(PacketType::State),
            3 => Ok(PacketType::Reset),
            4 => Ok(PacketType::Syn),
            _ => Err(UtpError::InvalidPacket),
        }
    }
}

/// A decoded uTP header.
#[derive(Debug, Clone, Copy)]
pub struct Header {
    pub packet_type: PacketType,
    /// First extension in the extension list; 0 means none. We never
    /// send extensions and skip them on receive.
    pub extension: u8,
    pub connection_id: u16,
    /// Sender clock at transmit time, microseconds.
    pub timestamp_us: u32,
    /// Sender's latest one-way delay measurement, microseconds.
    pub timestamp_diff_us: u32,
    /// Bytes the sender is willing to receive.
    pub wnd_size: u32,
    pub seq_nr: u16,
    pub ack_nr: u16,
}

impl Header {
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0] = (self.packet_type as u8) << 4 | UTP_VERSION;
        buf[1] = self.extension;
        buf[2..4].copy_from_slice(&self.connection_id.to_be_bytes());
        buf[4..8].copy_from_slice(&self.timestamp_us.to_be_bytes());
        buf[8..12].copy_from_slice(&self.timestamp_diff_us.to_be_bytes());
        buf[12..16].copy_from_slice(&self.wnd_size.to_be_bytes());
        buf[16..18].copy_from_slice(&self.seq_nr.to_be_bytes());
        buf[18..20].copy_from_slice(&self.ack_nr.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, UtpError> {
        if buf.len() < HEADER_LEN || buf[0] & 0x0f != UTP_VERSION {
            return Err(UtpError::InvalidPacket);
        }

        Ok(Header {
            packet_type: PacketType::try_from(buf[0] >> 4)?,
            extension: buf[1],
            connection_id: u16::from_be_bytes([buf[2], buf[3]]),
            timestamp_us: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
            timestamp_diff_us: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
            wnd_size: u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]),
            seq_nr: u16::from_be_bytes([buf[16], buf[17]]),
            ack_nr: u16::from_be_bytes([buf[18], buf[19]]),
        })
    }
}

/// A header plus payload; only ST_DATA carries one.
#[derive(Debug, Clone)]
pub struct Packet {
    pub header: Header,
    pub payload: Bytes,
}

impl Packet {
    pub fn new(header: Header, payload: Bytes) -> Self {
        Self { header, payload }
    }

    pub fn control(header: Header) -> Self {
        Self {
            header,
            payload: Bytes::new(),
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        buf.put_slice(&self.header.encode());
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, UtpError> {
        let header = Header::decode(buf)?;
        Ok(Self {
            header,
            payload: Bytes::copy_from_slice(&buf[HEADER_LEN..]),
        })
    }
}

/// Microseconds of the current wall clock, truncated to 32 bits the way
/// the protocol timestamps are.
pub(crate) fn timestamp_micros() -> u32 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let header = Header {
            packet_type: PacketType::Data,
            extension: 0,
            connection_id: 12345,
            timestamp_us: 1_000_000,
            timestamp_diff_us: 500_000,
            wnd_size: 65536,
            seq_nr: 7,
            ack_nr: 3,
        };

        let decoded = Header::decode(&header.encode()).unwrap();
        assert_eq!(decoded.packet_type, PacketType::Data);
        assert_eq!(decoded.connection_id, 12345);
        assert_eq!(decoded.timestamp_us, 1_000_000);
        assert_eq!(decoded.timestamp_diff_us, 500_000);
        assert_eq!(decoded.wnd_size, 65536);
        assert_eq!(decoded.seq_nr, 7);
        assert_eq!(decoded.ack_nr, 3);
    }

    #[test]
    fn type_and_version_packing() {
        let header = Header {
            packet_type: PacketType::Syn,
            extension: 0,
            connection_id: 0,
            timestamp_us: 0,
            timestamp_diff_us: 0,
            wnd_size: 0,
            seq_nr: 1,
            ack_nr: 0,
        };
        assert_eq!(header.encode()[0], 0x41);

        assert!(Header::decode(&[0u8; 19]).is_err());
        let mut bad_version = header.encode();
        bad_version[0] = (PacketType::Syn as u8) << 4 | 2;
        assert!(Header::decode(&bad_version).is_err());
        let mut bad_type = header.encode();
        bad_type[0] = 7 << 4 | UTP_VERSION;
        assert!(Header::decode(&bad_type).is_err());
    }
}
