//! The peer pool: every peer we know about, ranked, capped, and driven
//! through its connection lifecycle.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::time::Instant;

use tracing::{debug, trace};

use super::connection::ConnectionHandle;
use super::peer_id::PeerId;

/// Where a peer was learned about; a peer can accumulate several.
pub mod source {
    pub const TRACKER: u8 = 0b0000_0001;
    pub const DHT: u8 = 0b0000_0010;
    pub const PEX: u8 = 0b0000_0100;
    pub const LSD: u8 = 0b0000_1000;
    pub const INCOMING: u8 = 0b0001_0000;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerPoolStatus {
    Discovered,
    Candidate,
    Connecting,
    Connected,
    Disconnected,
    /// Failed too often; never retried.
    Banned,
}

/// One peer the pool knows about. Identity is the endpoint.
#[derive(Debug)]
pub struct KnownPeer {
    pub addr: SocketAddr,
    pub peer_id: Option<PeerId>,
    pub status: PeerPoolStatus,
    pub failcount: u32,
    pub hashfails: u32,
    /// Bytes downloaded from this peer over past connections.
    pub prev_down: u64,
    pub prev_up: u64,
    pub last_connected: Option<Instant>,
    pub seed: bool,
    pub sources: u8,
    /// Live connection handle. During shutdown this stays in place
    /// after the close so the terminal sweep can account for every
    /// connection in one pass.
    pub connection: Option<ConnectionHandle>,
}

impl KnownPeer {
    fn new(addr: SocketAddr, sources: u8) -> Self {
        Self {
            addr,
            peer_id: None,
            status: PeerPoolStatus::Discovered,
            failcount: 0,
            hashfails: 0,
            prev_down: 0,
            prev_up: 0,
            last_connected: None,
            seed: false,
            sources,
            connection: None,
        }
    }

    /// Connection-worthiness. The jitter term is a deterministic hash
    /// of the endpoint, so both ends of a symmetric pair order their
    /// candidates the same way without ties.
    pub fn rank(&self) -> i64 {
        let mut rank = 0i64;
        if self.prev_down > 0 {
            rank += 100;
        }
        if self.seed {
            rank += 50;
        }
        rank -= 20 * self.failcount as i64;
        rank -= 30 * self.hashfails as i64;
        rank + endpoint_jitter(&self.addr)
    }

    pub fn is_connected(&self) -> bool {
        matches!(
            self.status,
            PeerPoolStatus::Connecting | PeerPoolStatus::Connected
        )
    }
}

fn endpoint_jitter(addr: &SocketAddr) -> i64 {
    let mut hasher = DefaultHasher::new();
    addr.hash(&mut hasher);
    (hasher.finish() % 20) as i64
}

/// The set of known peers plus the active-connection budget.
pub struct PeerPool {
    peers: HashMap<SocketAddr, KnownPeer>,
    max_peers: usize,
    max_active: usize,
    max_failcount: u32,
    shutting_down: bool,
}

impl PeerPool {
    pub fn new(max_peers: usize, max_active: usize, max_failcount: u32) -> Self {
        Self {
            peers: HashMap::new(),
            max_peers,
            max_active,
            max_failcount,
            shutting_down: false,
        }
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn get(&self, addr: &SocketAddr) -> Option<&KnownPeer> {
        self.peers.get(addr)
    }

    pub fn active_count(&self) -> usize {
        self.peers.values().filter(|p| p.is_connected()).count()
    }

    pub fn connected_handles(&self) -> Vec<ConnectionHandle> {
        self.peers
            .values()
            .filter_map(|peer| peer.connection.clone())
            .collect()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down
    }

    /// Adds a peer, deduplicating by endpoint.
    ///
    /// A known peer only gains the new source bit. When the table is at
    /// its cap the lowest-ranked non-connected peer makes room, unless
    /// the newcomer ranks no better; then the newcomer is dropped.
    pub fn add_peer(&mut self, addr: SocketAddr, sources: u8) -> bool {
        if let Some(existing) = self.peers.get_mut(&addr) {
            existing.sources |= sources;
            return true;
        }

        let newcomer = KnownPeer::new(addr, sources);

        if self.peers.len() >= self.max_peers {
            let evict = self
                .peers
                .values()
                .filter(|p| !p.is_connected())
                .min_by_key(|p| p.rank())
                .map(|p| (p.addr, p.rank()));

            match evict {
                Some((victim, victim_rank)) if newcomer.rank() > victim_rank => {
                    trace!(%victim, "evicting lowest-ranked peer for newcomer");
                    self.peers.remove(&victim);
                }
                _ => return false,
            }
        }

        self.peers.insert(addr, newcomer);
        true
    }

    /// Adds a discovery batch; returns how many were kept.
    pub fn add_peers(&mut self, addrs: &[SocketAddr], sources: u8) -> usize {
        addrs
            .iter()
            .filter(|addr| self.add_peer(**addr, sources))
            .count()
    }

    /// Fills the connection budget from the best-ranked candidates and
    /// marks them `Connecting`. The caller dials the returned endpoints.
    pub fn connect_candidates(&mut self) -> Vec<SocketAddr> {
        if self.shutting_down {
            return Vec::new();
        }

        let budget = self.max_active.saturating_sub(self.active_count());
        if budget == 0 {
            return Vec::new();
        }

        let mut candidates: Vec<(i64, SocketAddr)> = self
            .peers
            .values()
            .filter(|peer| {
                matches!(
                    peer.status,
                    PeerPoolStatus::Discovered
                        | PeerPoolStatus::Candidate
                        | PeerPoolStatus::Disconnected
                )
            })
            .map(|peer| (peer.rank(), peer.addr))
            .collect();
        candidates.sort_unstable_by(|a, b| b.cmp(a));

        let chosen: Vec<SocketAddr> = candidates
            .into_iter()
            .take(budget)
            .map(|(_, addr)| addr)
            .collect();

        for addr in &chosen {
            if let Some(peer) = self.peers.get_mut(addr) {
                peer.status = PeerPoolStatus::Connecting;
            }
        }

        debug!(count = chosen.len(), "dialing candidates");
        chosen
    }

    /// Records a completed handshake. An unknown endpoint (an incoming
    /// connection) is inserted on the spot, subject to the table cap.
    pub fn mark_connected(
        &mut self,
        addr: SocketAddr,
        peer_id: PeerId,
        handle: ConnectionHandle,
    ) -> bool {
        if !self.peers.contains_key(&addr) && !self.add_peer(addr, source::INCOMING) {
            return false;
        }
        let peer = self.peers.get_mut(&addr).expect("just ensured");
        peer.status = PeerPoolStatus::Connected;
        peer.peer_id = Some(peer_id);
        peer.connection = Some(handle);
        peer.last_connected = Some(Instant::now());
        true
    }

    /// A dial or handshake failed. The third strike bans the peer.
    pub fn mark_connect_failed(&mut self, addr: SocketAddr) {
        if let Some(peer) = self.peers.get_mut(&addr) {
            peer.failcount += 1;
            peer.status = if peer.failcount >= self.max_failcount {
                debug!(%addr, failcount = peer.failcount, "banning peer");
                PeerPoolStatus::Banned
            } else {
                PeerPoolStatus::Disconnected
            };
            peer.connection = None;
        }
    }

    /// An established connection ended.
    ///
    /// Outside shutdown the handle is dropped here and the slot is
    /// refilled by the next `connect_candidates` call. During shutdown
    /// the handle is left in place: the terminal [`Self::sweep`] clears
    /// every one of them in a single pass, and nothing else may.
    pub fn mark_disconnected(&mut self, addr: SocketAddr, downloaded: u64, uploaded: u64) {
        if let Some(peer) = self.peers.get_mut(&addr) {
            peer.status = PeerPoolStatus::Disconnected;
            peer.prev_down += downloaded;
            peer.prev_up += uploaded;
            if !self.shutting_down {
                peer.connection = None;
            }
        }
    }

    /// Debits a peer whose data failed verification.
    pub fn mark_hash_failure(&mut self, addr: SocketAddr) {
        if let Some(peer) = self.peers.get_mut(&addr) {
            peer.hashfails += 1;
        }
    }

    pub fn mark_seed(&mut self, addr: SocketAddr) {
        if let Some(peer) = self.peers.get_mut(&addr) {
            peer.seed = true;
        }
    }

    /// Starts shutdown: no more dials, and disconnects stop clearing
    /// connection handles. Returns the handles to close gracefully.
    pub fn begin_shutdown(&mut self) -> Vec<ConnectionHandle> {
        self.shutting_down = true;
        self.connected_handles()
    }

    /// The terminal sweep: drops every remaining connection handle and
    /// returns how many there were. Run after the close events have all
    /// arrived; the count is the leak check.
    pub fn sweep(&mut self) -> usize {
        let mut swept = 0;
        for peer in self.peers.values_mut() {
            if peer.connection.take().is_some() {
                swept += 1;
            }
            if peer.is_connected() {
                peer.status = PeerPoolStatus::Disconnected;
            }
        }
        swept
    }
}
