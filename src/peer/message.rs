use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::error::PeerError;
use super::scheduler::{Block, BlockInfo};
use crate::constants::{HANDSHAKE_LEN, MAX_REQUEST_LEN};

/// The BitTorrent protocol identifier.
pub const PROTOCOL: &[u8] = b"BitTorrent protocol";

/// Message ids of the peer wire protocol.
///
/// Every message except KEEP-ALIVE carries a one-byte id after the
/// four-byte length prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
    /// DHT port announcement (BEP-5).
    Port = 9,
    // Fast extension (BEP-6)
    Suggest = 13,
    HaveAll = 14,
    HaveNone = 15,
    Reject = 16,
    AllowedFast = 17,
    /// Extension protocol (BEP-10).
    Extended = 20,
    // v2 hash transfer (BEP-52)
    HashRequest = 21,
    Hashes = 22,
    HashReject = 23,
}

impl TryFrom<u8> for MessageId {
    type Error = PeerError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use MessageId::*;
        match value {
            0 => Ok(Choke),
            1 => Ok(Unchoke),
            2 => Ok(Interested),
            3 => Ok(NotInterested),
            4 => Ok(Have),
            5 => Ok(Bitfield),
            6 => Ok(Request),
            7 => Ok(Piece),
            8 => Ok(Cancel),
            9 => Ok(Port),
            13 => Ok(Suggest),
            14 => Ok(HaveAll),
            15 => Ok(HaveNone),
            16 => Ok(Reject),
            17 => Ok(AllowedFast),
            20 => Ok(Extended),
            21 => Ok(HashRequest),
            22 => Ok(Hashes),
            23 => Ok(HashReject),
            other => Err(PeerError::InvalidMessageId(other)),
        }
    }
}

/// Reserved-byte capability flags carried in the handshake.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Reserved(pub [u8; 8]);

impl Reserved {
    /// Flags this client sets on outgoing handshakes.
    pub fn ours() -> Self {
        let mut bits = [0u8; 8];
        bits[5] |= 0x10; // extension protocol (BEP-10)
        bits[7] |= 0x04; // fast extension (BEP-6)
        bits[7] |= 0x08; // v2 hash transfer (BEP-52)
        Reserved(bits)
    }

    pub fn extension_protocol(&self) -> bool {
        self.0[5] & 0x10 != 0
    }

    pub fn dht(&self) -> bool {
        self.0[7] & 0x01 != 0
    }

    pub fn fast(&self) -> bool {
        self.0[7] & 0x04 != 0
    }

    pub fn v2(&self) -> bool {
        self.0[7] & 0x08 != 0
    }

    pub fn ltep_reserved(&self) -> bool {
        self.0[7] & 0x80 != 0
    }
}

/// The handshake that opens every peer connection.
///
/// `<pstrlen=19><"BitTorrent protocol"><8 reserved><info_hash><peer_id>`
#[derive(Debug, Clone)]
pub struct Handshake {
    pub reserved: Reserved,
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        Self {
            reserved: Reserved::ours(),
            info_hash,
            peer_id,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HANDSHAKE_LEN);
        buf.put_u8(19);
        buf.put_slice(PROTOCOL);
        buf.put_slice(&self.reserved.0);
        buf.put_slice(&self.info_hash);
        buf.put_slice(&self.peer_id);
        buf.freeze()
    }

    pub fn decode(data: &[u8]) -> Result<Self, PeerError> {
        if data.len() < HANDSHAKE_LEN || data[0] != 19 || &data[1..20] != PROTOCOL {
            return Err(PeerError::InvalidHandshake);
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&data[20..28]);
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&data[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&data[48..68]);

        Ok(Self {
            reserved: Reserved(reserved),
            info_hash,
            peer_id,
        })
    }
}

/// A v2 hash request/reject payload (BEP-52).
///
/// `length` must be a power of two in `[2, 512]` and `index` a multiple
/// of `length`; both are enforced at decode so the engine never sees an
/// unservable request shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashRequest {
    pub pieces_root: [u8; 32],
    pub base_layer: u32,
    pub index: u32,
    pub length: u32,
    pub proof_layers: u32,
}

impl HashRequest {
    pub fn is_valid(&self) -> bool {
        self.length.is_power_of_two()
            && (2..=512).contains(&self.length)
            && self.index % self.length == 0
    }

    fn put(&self, buf: &mut BytesMut) {
        buf.put_slice(&self.pieces_root);
        buf.put_u32(self.base_layer);
        buf.put_u32(self.index);
        buf.put_u32(self.length);
        buf.put_u32(self.proof_layers);
    }

    fn get(data: &mut Bytes) -> Result<Self, PeerError> {
        if data.remaining() < 48 {
            return Err(PeerError::InvalidMessage("hash request too short"));
        }
        let mut pieces_root = [0u8; 32];
        data.copy_to_slice(&mut pieces_root);
        Ok(Self {
            pieces_root,
            base_layer: data.get_u32(),
            index: data.get_u32(),
            length: data.get_u32(),
            proof_layers: data.get_u32(),
        })
    }
}

/// A peer wire message.
///
/// Messages are length-prefixed: a four-byte big-endian length, a
/// one-byte id (absent for KEEP-ALIVE) and the payload. [`Message::decode`]
/// expects a whole frame, prefix included; the transport guarantees that.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    Bitfield(Bytes),
    Request(BlockInfo),
    Piece(Block),
    Cancel(BlockInfo),
    Port(u16),
    Suggest(u32),
    HaveAll,
    HaveNone,
    Reject(BlockInfo),
    AllowedFast(u32),
    Extended { id: u8, payload: Bytes },
    HashRequest(HashRequest),
    Hashes {
        pieces_root: [u8; 32],
        base_layer: u32,
        index: u32,
        /// The requested layer hashes, `length` of them.
        hashes: Vec<[u8; 32]>,
        /// The uncle hashes, one per proof layer.
        proofs: Vec<[u8; 32]>,
    },
    HashReject(HashRequest),
}

impl Message {
    /// Encodes the message, length prefix included.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();

        match self {
            Message::KeepAlive => buf.put_u32(0),
            Message::Choke => put_bare(&mut buf, MessageId::Choke),
            Message::Unchoke => put_bare(&mut buf, MessageId::Unchoke),
            Message::Interested => put_bare(&mut buf, MessageId::Interested),
            Message::NotInterested => put_bare(&mut buf, MessageId::NotInterested),
            Message::HaveAll => put_bare(&mut buf, MessageId::HaveAll),
            Message::HaveNone => put_bare(&mut buf, MessageId::HaveNone),
            Message::Have(piece) => put_piece_index(&mut buf, MessageId::Have, *piece),
            Message::Suggest(piece) => put_piece_index(&mut buf, MessageId::Suggest, *piece),
            Message::AllowedFast(piece) => {
                put_piece_index(&mut buf, MessageId::AllowedFast, *piece)
            }
            Message::Bitfield(bits) => {
                buf.put_u32(1 + bits.len() as u32);
                buf.put_u8(MessageId::Bitfield as u8);
                buf.put_slice(bits);
            }
            Message::Request(info) => put_block_info(&mut buf, MessageId::Request, info),
            Message::Cancel(info) => put_block_info(&mut buf, MessageId::Cancel, info),
            Message::Reject(info) => put_block_info(&mut buf, MessageId::Reject, info),
            Message::Piece(block) => {
                buf.put_u32(9 + block.data.len() as u32);
                buf.put_u8(MessageId::Piece as u8);
                buf.put_u32(block.index);
                buf.put_u32(block.begin);
                buf.put_slice(&block.data);
            }
            Message::Port(port) => {
                buf.put_u32(3);
                buf.put_u8(MessageId::Port as u8);
                buf.put_u16(*port);
            }
            Message::Extended { id, payload } => {
                buf.put_u32(2 + payload.len() as u32);
                buf.put_u8(MessageId::Extended as u8);
                buf.put_u8(*id);
                buf.put_slice(payload);
            }
            Message::HashRequest(req) => {
                buf.put_u32(49);
                buf.put_u8(MessageId::HashRequest as u8);
                req.put(&mut buf);
            }
            Message::HashReject(req) => {
                buf.put_u32(49);
                buf.put_u8(MessageId::HashReject as u8);
                req.put(&mut buf);
            }
            Message::Hashes {
                pieces_root,
                base_layer,
                index,
                hashes,
                proofs,
            } => {
                let payload = 45 + 32 * (hashes.len() + proofs.len());
                buf.put_u32(payload as u32);
                buf.put_u8(MessageId::Hashes as u8);
                buf.put_slice(pieces_root);
                buf.put_u32(*base_layer);
                buf.put_u32(*index);
                buf.put_u32(hashes.len() as u32);
                for hash in hashes {
                    buf.put_slice(hash);
                }
                for proof in proofs {
                    buf.put_slice(proof);
                }
            }
        }

        buf.freeze()
    }

    /// Decodes one whole frame, length prefix included.
    pub fn decode(mut frame: Bytes) -> Result<Self, PeerError> {
        if frame.len() < 4 {
            return Err(PeerError::InvalidMessage("frame shorter than prefix"));
        }

        let length = frame.get_u32() as usize;
        if length == 0 {
            return Ok(Message::KeepAlive);
        }
        if frame.remaining() < length {
            return Err(PeerError::InvalidMessage("frame shorter than its length"));
        }

        let id = MessageId::try_from(frame.get_u8())?;
        let payload_len = length - 1;

        let msg = match id {
            MessageId::Choke => Message::Choke,
            MessageId::Unchoke => Message::Unchoke,
            MessageId::Interested => Message::Interested,
            MessageId::NotInterested => Message::NotInterested,
            MessageId::HaveAll => Message::HaveAll,
            MessageId::HaveNone => Message::HaveNone,
            MessageId::Have => Message::Have(get_piece_index(&mut frame)?),
            MessageId::Suggest => Message::Suggest(get_piece_index(&mut frame)?),
            MessageId::AllowedFast => Message::AllowedFast(get_piece_index(&mut frame)?),
            MessageId::Bitfield => Message::Bitfield(frame.copy_to_bytes(payload_len)),
            MessageId::Request => Message::Request(get_block_info(&mut frame)?),
            MessageId::Cancel => Message::Cancel(get_block_info(&mut frame)?),
            MessageId::Reject => Message::Reject(get_block_info(&mut frame)?),
            MessageId::Piece => {
                if payload_len < 8 {
                    return Err(PeerError::InvalidMessage("piece too short"));
                }
                let index = frame.get_u32();
                let begin = frame.get_u32();
                // the block is exactly what remains of the frame
                let data = frame.copy_to_bytes(payload_len - 8);
                Message::Piece(Block { index, begin, data })
            }
            MessageId::Port => {
                if payload_len < 2 {
                    return Err(PeerError::InvalidMessage("port too short"));
                }
                Message::Port(frame.get_u16())
            }
            MessageId::Extended => {
                if payload_len < 1 {
                    return Err(PeerError::InvalidMessage("extended too short"));
                }
                let id = frame.get_u8();
                let payload = frame.copy_to_bytes(payload_len - 1);
                Message::Extended { id, payload }
            }
            MessageId::HashRequest => {
                let req = HashRequest::get(&mut frame)?;
                if !req.is_valid() {
                    return Err(PeerError::InvalidMessage("hash request constraints"));
                }
                Message::HashRequest(req)
            }
            MessageId::HashReject => Message::HashReject(HashRequest::get(&mut frame)?),
            MessageId::Hashes => {
                if payload_len < 44 {
                    return Err(PeerError::InvalidMessage("hashes too short"));
                }
                let mut pieces_root = [0u8; 32];
                frame.copy_to_slice(&mut pieces_root);
                let base_layer = frame.get_u32();
                let index = frame.get_u32();
                let length = frame.get_u32() as usize;

                let rest = payload_len - 44;
                if rest % 32 != 0 || rest / 32 < length {
                    return Err(PeerError::InvalidMessage("hashes count mismatch"));
                }

                let mut read_hash = |frame: &mut Bytes| {
                    let mut hash = [0u8; 32];
                    frame.copy_to_slice(&mut hash);
                    hash
                };
                let hashes = (0..length).map(|_| read_hash(&mut frame)).collect();
                let proofs = (0..rest / 32 - length)
                    .map(|_| read_hash(&mut frame))
                    .collect();

                Message::Hashes {
                    pieces_root,
                    base_layer,
                    index,
                    hashes,
                    proofs,
                }
            }
        };

        Ok(msg)
    }
}

fn put_bare(buf: &mut BytesMut, id: MessageId) {
    buf.put_u32(1);
    buf.put_u8(id as u8);
}

fn put_piece_index(buf: &mut BytesMut, id: MessageId, piece: u32) {
    buf.put_u32(5);
    buf.put_u8(id as u8);
    buf.put_u32(piece);
}

fn put_block_info(buf: &mut BytesMut, id: MessageId, info: &BlockInfo) {
    buf.put_u32(13);
    buf.put_u8(id as u8);
    buf.put_u32(info.index);
    buf.put_u32(info.begin);
    buf.put_u32(info.len);
}

fn get_piece_index(frame: &mut Bytes) -> Result<u32, PeerError> {
    if frame.remaining() < 4 {
        return Err(PeerError::InvalidMessage("piece index too short"));
    }
    Ok(frame.get_u32())
}

fn get_block_info(frame: &mut Bytes) -> Result<BlockInfo, PeerError> {
    if frame.remaining() < 12 {
        return Err(PeerError::InvalidMessage("block info too short"));
    }
    let info = BlockInfo {
        index: frame.get_u32(),
        begin: frame.get_u32(),
        len: frame.get_u32(),
    };
    if info.len > MAX_REQUEST_LEN {
        return Err(PeerError::InvalidMessage("request length above cap"));
    }
    Ok(info)
}
