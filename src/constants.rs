//! Protocol constants and engine tuning parameters.

use std::time::Duration;

// ============================================================================
// Client identification
// ============================================================================

/// Azureus-style client id prefix for generated peer ids.
pub const CLIENT_PREFIX: &[u8] = b"-UT0001-";

// ============================================================================
// Blocks and pieces
// ============================================================================

/// Transfer block size (16 KiB), the unit of REQUEST/PIECE and of v2
/// merkle leaves.
pub const BLOCK_LEN: u32 = 16384;

/// Requests above this length are refused (BEP-3 convention).
pub const MAX_REQUEST_LEN: u32 = 131072;

// ============================================================================
// Peer wire
// ============================================================================

/// Length of the handshake message in bytes.
pub const HANDSHAKE_LEN: usize = 68;

/// Upper bound on a single framed message (largest legal PIECE plus
/// headroom); anything bigger is a protocol violation.
pub const MAX_MESSAGE_LEN: usize = MAX_REQUEST_LEN as usize + 1024;

/// Send a KEEP-ALIVE after this much outbound silence.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(90);

/// Close the connection after this much inbound silence.
pub const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(120);

/// Timeout for connecting and for the handshake exchange.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Number of pieces offered in an allowed-fast set (BEP-6).
pub const ALLOWED_FAST_SET_SIZE: usize = 10;

// ============================================================================
// Scheduler
// ============================================================================

/// Pipeline depth floor per connection.
pub const MIN_PIPELINE_DEPTH: usize = 4;

/// Pipeline depth ceiling per connection.
pub const MAX_PIPELINE_DEPTH: usize = 64;

/// Floor for the per-block request deadline.
pub const MIN_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Consecutive timeouts that collapse a peer's pipeline to one request.
pub const TIMEOUTS_BEFORE_THROTTLE: u32 = 3;

/// Endgame duplicates a block on at most this many peers.
pub const ENDGAME_MAX_ASSIGNEES: usize = 3;

/// Endgame starts when the remaining block count drops to
/// `max(sum of pipeline depths, ENDGAME_MIN_BLOCKS)`.
pub const ENDGAME_MIN_BLOCKS: usize = 20;

// ============================================================================
// Peer pool
// ============================================================================

/// Cap on the known-peer table.
pub const MAX_PEERLIST_SIZE: usize = 1000;

/// Cap on simultaneously connected peers.
pub const MAX_ACTIVE_CONNECTIONS: usize = 25;

/// Connection failures before a peer is banned.
pub const MAX_FAILCOUNT: u32 = 3;

// ============================================================================
// uTP
// ============================================================================

/// Maximum segment size for uTP payloads.
pub const UTP_MSS: u32 = 1400;

/// Initial congestion window (2 * MSS).
pub const UTP_INIT_CWND: u32 = 2 * UTP_MSS;

/// Congestion window ceiling (1 MiB).
pub const UTP_MAX_CWND: u32 = 1024 * 1024;

/// Base retransmission timeout; doubles per attempt.
pub const UTP_BASE_TIMEOUT: Duration = Duration::from_secs(1);

/// Retransmissions before the connection moves to error state.
pub const UTP_MAX_RETRANSMITS: u32 = 5;

/// Tick driving retransmit sweeps and the pull-based receive path.
pub const UTP_TICK: Duration = Duration::from_millis(100);

// ============================================================================
// Session
// ============================================================================

/// Cadence of `stats.update` events.
pub const STATS_INTERVAL: Duration = Duration::from_secs(1);
