//! Peer wire protocol and the download engine built on it
//! (BEP-3, BEP-6, BEP-10, BEP-52)
//!
//! This module carries the per-connection protocol state machine, the
//! piece/block scheduler that feeds it, and the peer pool that decides
//! which connections exist in the first place.

mod bitfield;
mod choking;
mod connection;
mod error;
mod extension;
mod fast;
mod hashes;
mod message;
mod peer_id;
mod pool;
mod scheduler;
mod transport;

pub use bitfield::Bitfield;
pub use choking::{ChokeDecision, Choker, TransferRates};
pub use connection::{ConnectionHandle, PeerCommand, PeerConnection, PeerEvent, PeerState};
pub use error::PeerError;
pub use extension::ExtensionHandshake;
pub use fast::{allowed_fast_set, FastState};
pub use hashes::{verify_hashes, HashRequestLedger, HashServer};
pub use message::{Handshake, HashRequest, Message, MessageId, Reserved};
pub use peer_id::PeerId;
pub use pool::{source, KnownPeer, PeerPool, PeerPoolStatus};
pub use scheduler::{Block, BlockInfo, PieceScheduler, PieceStatus, SchedulerCommand};
pub use transport::PeerTransport;

#[cfg(test)]
mod tests;
