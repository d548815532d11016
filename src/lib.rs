//! undertow - a BitTorrent download engine
//!
//! This crate implements the downloading core of a BitTorrent client:
//! metainfo parsing, the peer wire protocol, piece scheduling, v1/v2 piece
//! verification, disk storage, a peer pool and a uTP transport, composed
//! into a [`session::Session`] that embedders drive through events.
//!
//! # Modules
//!
//! - [`bencode`] - BEP-3 bencode encoding/decoding
//! - [`metainfo`] - BEP-3/52 torrent metainfo, merkle trees, info hashes
//! - [`peer`] - BEP-3/6/10/52 peer wire protocol, scheduler, peer pool
//! - [`utp`] - BEP-29 micro transport protocol over UDP
//! - [`storage`] - piece-to-file mapping, async disk I/O, verification
//! - [`session`] - session lifecycle, event bus, discovery boundary
//! - [`bandwidth`] - token-bucket rate limiting hooks

pub mod bandwidth;
pub mod bencode;
pub mod config;
pub mod constants;
pub mod metainfo;
pub mod peer;
pub mod session;
pub mod storage;
pub mod utp;

pub use bandwidth::BandwidthLimiter;
pub use bencode::{decode, encode, BencodeError, Value};
pub use config::EngineConfig;
pub use metainfo::{InfoHash, MerkleTree, MetainfoError, PieceLayerCache, TorrentInfo};
pub use peer::{
    Bitfield, Block, BlockInfo, Handshake, KnownPeer, Message, PeerConnection, PeerError, PeerId,
    PeerPool, PeerState, PieceScheduler,
};
pub use session::{Event, EventBus, Session, SessionError, SessionState, SharedResources};
pub use storage::{FileEntry, HashKind, StorageError, StorageWriter};
pub use utp::{UtpError, UtpSocket, UtpStream};
