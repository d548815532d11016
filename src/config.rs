//! Engine configuration.

use std::path::PathBuf;

use crate::constants;
use crate::metainfo::DEFAULT_LAYER_CACHE_BYTES;

/// Tuning knobs for a session.
///
/// The engine is a library; whoever embeds it owns config files and CLI
/// flags and hands the result over here. Defaults match the constants the
/// protocol modules use on their own.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Directory the torrent's files are created under.
    pub download_dir: PathBuf,

    /// Port advertised to peers (PORT message, extended handshake `p`).
    pub listen_port: u16,

    /// Cap on the known-peer table; lowest-ranked non-connected peers are
    /// evicted beyond it.
    pub max_peerlist_size: usize,

    /// Cap on simultaneously connected peers.
    pub max_active_connections: usize,

    /// Connection failures before a peer is banned.
    pub max_failcount: u32,

    /// Byte budget of the v2 piece-layer tree cache.
    pub layer_cache_bytes: usize,

    /// Download rate cap in bytes/s; 0 means unlimited.
    pub download_limit: u64,

    /// Upload rate cap in bytes/s; 0 means unlimited.
    pub upload_limit: u64,

    /// Prefer uTP over TCP when dialing peers that support both.
    pub prefer_utp: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from("."),
            listen_port: 6881,
            max_peerlist_size: constants::MAX_PEERLIST_SIZE,
            max_active_connections: constants::MAX_ACTIVE_CONNECTIONS,
            max_failcount: constants::MAX_FAILCOUNT,
            layer_cache_bytes: DEFAULT_LAYER_CACHE_BYTES,
            download_limit: 0,
            upload_limit: 0,
            prefer_utp: false,
        }
    }
}
