//! Piece and block scheduling: rarest-first selection, request
//! pipelining, timeouts and endgame.
//!
//! The scheduler is the single bookkeeper for which block is requested
//! where. Outside endgame a block is in flight on at most one
//! connection; in endgame a block may be duplicated on up to three, and
//! the first PIECE to land cancels the rest.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::debug;

use super::bitfield::Bitfield;
use crate::constants::{
    BLOCK_LEN, ENDGAME_MAX_ASSIGNEES, ENDGAME_MIN_BLOCKS, MAX_PIPELINE_DEPTH, MIN_PIPELINE_DEPTH,
    MIN_REQUEST_TIMEOUT, TIMEOUTS_BEFORE_THROTTLE,
};

/// Identifies one block: piece index, byte offset, length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockInfo {
    pub index: u32,
    pub begin: u32,
    pub len: u32,
}

/// Block payload as it travels between wire and storage.
///
/// `data` is a cheap handle into the receive buffer; the scheduler
/// copies it into the piece assembly buffer and drops the handle, at
/// which point the frame's memory goes with it.
#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub index: u32,
    pub begin: u32,
    pub data: Bytes,
}

impl Block {
    pub fn info(&self) -> BlockInfo {
        BlockInfo {
            index: self.index,
            begin: self.begin,
            len: self.data.len() as u32,
        }
    }
}

/// Lifecycle of a piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceStatus {
    Missing,
    /// At least one block is in flight.
    Requested,
    /// All blocks received, awaiting verification.
    Downloaded,
    Verified,
    Written,
    Failed,
}

/// An instruction the scheduler hands back to the engine.
#[derive(Debug, PartialEq)]
pub enum SchedulerCommand {
    /// Send CANCEL for this block on this connection.
    Cancel(SocketAddr, BlockInfo),
}

#[derive(Debug, Default)]
struct BlockSlot {
    received: bool,
    /// (connection, request time, deadline); more than one entry only
    /// in endgame.
    assignees: Vec<(SocketAddr, Instant, Instant)>,
}

#[derive(Debug)]
struct PieceEntry {
    status: PieceStatus,
    blocks: Vec<BlockSlot>,
    /// Assembly buffer, piece-sized, allocated when the first block
    /// arrives and discarded on verify failure.
    buffer: Vec<u8>,
    received: u32,
}

#[derive(Debug)]
struct PeerView {
    bitfield: Bitfield,
    peer_choking: bool,
    am_interested: bool,
    allowed_fast: HashSet<u32>,
    outstanding: usize,
    pipeline: usize,
    consecutive_timeouts: u32,
    /// Bytes/s over recent blocks, exponentially smoothed.
    download_rate: f64,
    /// Request-to-block round trip, exponentially smoothed.
    rtt: Duration,
}

impl PeerView {
    fn new(piece_count: usize) -> Self {
        Self {
            bitfield: Bitfield::empty(piece_count),
            peer_choking: true,
            am_interested: false,
            allowed_fast: HashSet::new(),
            outstanding: 0,
            pipeline: MIN_PIPELINE_DEPTH,
            consecutive_timeouts: 0,
            download_rate: 0.0,
            rtt: Duration::from_millis(500),
        }
    }

    /// `clamp(download_rate * rtt / 16 KiB, 4, 64)`, floored to one
    /// after repeated timeouts.
    fn update_pipeline(&mut self) {
        if self.consecutive_timeouts >= TIMEOUTS_BEFORE_THROTTLE {
            self.pipeline = 1;
            return;
        }
        let depth = (self.download_rate * self.rtt.as_secs_f64() / BLOCK_LEN as f64) as usize;
        self.pipeline = depth.clamp(MIN_PIPELINE_DEPTH, MAX_PIPELINE_DEPTH);
    }

    fn deadline(&self, now: Instant) -> Instant {
        now + (self.rtt * 2).max(MIN_REQUEST_TIMEOUT)
    }
}

/// The piece/block scheduler.
pub struct PieceScheduler {
    piece_sizes: Vec<u32>,
    our_bitfield: Bitfield,
    /// Pieces with any interesting state; completed pieces leave the map.
    pieces: HashMap<u32, PieceEntry>,
    availability: Vec<u32>,
    peers: HashMap<SocketAddr, PeerView>,
    endgame: bool,
    blocks_remaining: usize,
}

impl PieceScheduler {
    /// Builds a scheduler over the torrent's piece sizes (the last
    /// piece of a file may be short).
    pub fn new(piece_sizes: Vec<u32>) -> Self {
        let piece_count = piece_sizes.len();
        let blocks_remaining = piece_sizes
            .iter()
            .map(|&size| size.div_ceil(BLOCK_LEN) as usize)
            .sum();

        Self {
            piece_sizes,
            our_bitfield: Bitfield::empty(piece_count),
            pieces: HashMap::new(),
            availability: vec![0; piece_count],
            peers: HashMap::new(),
            endgame: false,
            blocks_remaining,
        }
    }

    pub fn piece_count(&self) -> usize {
        self.piece_sizes.len()
    }

    pub fn our_bitfield(&self) -> &Bitfield {
        &self.our_bitfield
    }

    pub fn is_complete(&self) -> bool {
        self.our_bitfield.is_complete()
    }

    pub fn in_endgame(&self) -> bool {
        self.endgame
    }

    pub fn completed_count(&self) -> usize {
        self.our_bitfield.count()
    }

    /// Marks pieces already on disk (verified at startup) as ours.
    pub fn assume_piece(&mut self, index: u32) {
        if !self.our_bitfield.has(index as usize) {
            self.our_bitfield.set(index as usize);
            self.blocks_remaining = self
                .blocks_remaining
                .saturating_sub(self.block_count(index));
        }
    }

    // ------------------------------------------------------------------
    // peer view maintenance
    // ------------------------------------------------------------------

    pub fn peer_connected(&mut self, addr: SocketAddr) {
        self.peers
            .insert(addr, PeerView::new(self.piece_sizes.len()));
    }

    /// Removes the peer and returns its in-flight blocks to the pool.
    pub fn peer_disconnected(&mut self, addr: SocketAddr) {
        if let Some(view) = self.peers.remove(&addr) {
            self.drop_availability(&view.bitfield);
        }

        for entry in self.pieces.values_mut() {
            for slot in &mut entry.blocks {
                slot.assignees.retain(|(who, _, _)| *who != addr);
            }
        }
        self.refresh_piece_statuses();
    }

    pub fn peer_bitfield(&mut self, addr: SocketAddr, bitfield: Bitfield) {
        for piece in 0..bitfield.len() {
            if bitfield.has(piece) {
                self.availability[piece] += 1;
            }
        }
        if let Some(view) = self.peers.get_mut(&addr) {
            view.bitfield = bitfield;
        }
    }

    pub fn peer_have(&mut self, addr: SocketAddr, piece: u32) {
        if let Some(view) = self.peers.get_mut(&addr) {
            // some clients repeat HAVE for pieces already in the
            // bitfield; count each piece once
            if !view.bitfield.has(piece as usize) {
                view.bitfield.set(piece as usize);
                if let Some(slot) = self.availability.get_mut(piece as usize) {
                    *slot += 1;
                }
            }
        }
    }

    pub fn peer_choked(&mut self, addr: SocketAddr) {
        if let Some(view) = self.peers.get_mut(&addr) {
            view.peer_choking = true;
        }
    }

    pub fn peer_unchoked(&mut self, addr: SocketAddr) {
        if let Some(view) = self.peers.get_mut(&addr) {
            view.peer_choking = false;
        }
    }

    pub fn set_interested(&mut self, addr: SocketAddr, interested: bool) {
        if let Some(view) = self.peers.get_mut(&addr) {
            view.am_interested = interested;
        }
    }

    pub fn allow_fast(&mut self, addr: SocketAddr, piece: u32) {
        if let Some(view) = self.peers.get_mut(&addr) {
            view.allowed_fast.insert(piece);
        }
    }

    /// Whether this peer has a piece we still need.
    pub fn peer_is_interesting(&self, addr: SocketAddr) -> bool {
        let Some(view) = self.peers.get(&addr) else {
            return false;
        };
        view.bitfield.newer_than(&self.our_bitfield).next().is_some()
    }

    // ------------------------------------------------------------------
    // request issuing
    // ------------------------------------------------------------------

    /// Picks the next batch of requests for one connection, filling its
    /// pipeline. Rarest-first; partially downloaded pieces win ties,
    /// then the lower index.
    pub fn next_requests(&mut self, addr: SocketAddr, now: Instant) -> Vec<BlockInfo> {
        self.maybe_enter_endgame();

        let Some(view) = self.peers.get(&addr) else {
            return Vec::new();
        };
        if !view.am_interested {
            return Vec::new();
        }

        let budget = view.pipeline.saturating_sub(view.outstanding);
        let mut requests = Vec::with_capacity(budget);

        for _ in 0..budget {
            let Some(info) = self.pick_block(addr) else {
                break;
            };
            self.assign(addr, info, now);
            requests.push(info);
        }

        if !requests.is_empty() {
            if let Some(view) = self.peers.get_mut(&addr) {
                view.outstanding += requests.len();
            }
        }

        requests
    }

    /// One block for this peer, or `None` when nothing is eligible.
    fn pick_block(&self, addr: SocketAddr) -> Option<BlockInfo> {
        let view = self.peers.get(&addr)?;

        let mut best: Option<(u32, bool, u32)> = None; // (avail, !partial, index)
        for piece in 0..self.piece_sizes.len() as u32 {
            if self.our_bitfield.has(piece as usize) || !view.bitfield.has(piece as usize) {
                continue;
            }
            // choked peers may still serve their allowed-fast pieces
            if view.peer_choking && !view.allowed_fast.contains(&piece) {
                continue;
            }
            if self.pickable_block(piece, addr).is_none() {
                continue;
            }

            let partial = self
                .pieces
                .get(&piece)
                .is_some_and(|entry| entry.received > 0);
            let key = (self.availability[piece as usize], !partial, piece);
            if best.is_none_or(|b| key < b) {
                best = Some(key);
            }
        }

        let (_, _, piece) = best?;
        self.pickable_block(piece, addr)
    }

    /// First requestable block of a piece for this peer, if any.
    fn pickable_block(&self, piece: u32, addr: SocketAddr) -> Option<BlockInfo> {
        let block_count = self.block_count(piece);
        let entry = self.pieces.get(&piece);

        for block in 0..block_count {
            let slot = entry.and_then(|e| e.blocks.get(block));
            let (received, assignees) = match slot {
                Some(slot) => (slot.received, slot.assignees.as_slice()),
                None => (false, &[][..]),
            };
            if received {
                continue;
            }

            let limit = if self.endgame {
                ENDGAME_MAX_ASSIGNEES
            } else {
                1
            };
            if assignees.len() >= limit {
                continue;
            }
            if assignees.iter().any(|(who, _, _)| *who == addr) {
                continue;
            }

            return Some(self.block_info(piece, block as u32));
        }

        None
    }

    fn assign(&mut self, addr: SocketAddr, info: BlockInfo, now: Instant) {
        let deadline = self
            .peers
            .get(&addr)
            .map(|view| view.deadline(now))
            .unwrap_or(now + MIN_REQUEST_TIMEOUT);
        let endgame = self.endgame;

        let entry = self.entry_mut(info.index);
        let slot = &mut entry.blocks[(info.begin / BLOCK_LEN) as usize];
        debug_assert!(slot.assignees.is_empty() || endgame);
        slot.assignees.push((addr, now, deadline));

        if entry.status == PieceStatus::Missing || entry.status == PieceStatus::Failed {
            entry.status = PieceStatus::Requested;
        }
    }

    // ------------------------------------------------------------------
    // arrivals
    // ------------------------------------------------------------------

    /// Records an arrived block.
    ///
    /// The payload is copied into the piece's assembly buffer here; the
    /// wire buffer handle dies with the message. Returns CANCELs for
    /// duplicate endgame assignments, and the assembled piece when this
    /// block completed it.
    pub fn on_block(
        &mut self,
        addr: SocketAddr,
        block: &Block,
        now: Instant,
    ) -> (Vec<SchedulerCommand>, Option<(u32, Bytes)>) {
        let piece = block.index;
        let Some(size) = self.piece_sizes.get(piece as usize).copied() else {
            return (Vec::new(), None);
        };
        if self.our_bitfield.has(piece as usize) {
            // duplicate of a finished piece, nothing to do
            return (Vec::new(), None);
        }
        if block.data.is_empty()
            || block.begin % BLOCK_LEN != 0
            || block.begin as u64 + block.data.len() as u64 > size as u64
        {
            return (Vec::new(), None);
        }

        let block_index = (block.begin / BLOCK_LEN) as usize;
        let mut cancels = Vec::new();

        let entry = self.pieces.entry(piece).or_insert_with(|| PieceEntry {
            status: PieceStatus::Missing,
            blocks: (0..size.div_ceil(BLOCK_LEN))
                .map(|_| BlockSlot::default())
                .collect(),
            buffer: Vec::new(),
            received: 0,
        });
        if entry.buffer.is_empty() {
            entry.buffer = vec![0; size as usize];
        }

        let slot = &mut entry.blocks[block_index];
        let our_request = slot
            .assignees
            .iter()
            .find(|(who, _, _)| *who == addr)
            .copied();

        if slot.received {
            return (Vec::new(), None);
        }
        slot.received = true;
        entry.received += 1;

        // first arrival wins; everyone else gets a CANCEL
        for (other, _, _) in slot.assignees.drain(..) {
            if other != addr {
                cancels.push(SchedulerCommand::Cancel(other, block.info()));
            }
        }

        entry.buffer[block.begin as usize..block.begin as usize + block.data.len()]
            .copy_from_slice(&block.data);

        let completed = entry.received as usize == entry.blocks.len();
        if completed {
            entry.status = PieceStatus::Downloaded;
        }

        let assembled = completed.then(|| (piece, Bytes::from(std::mem::take(&mut entry.buffer))));

        self.blocks_remaining = self.blocks_remaining.saturating_sub(1);

        // losers of an endgame race get their pipeline slot back
        for command in &cancels {
            let SchedulerCommand::Cancel(other, _) = command;
            if let Some(view) = self.peers.get_mut(other) {
                view.outstanding = view.outstanding.saturating_sub(1);
            }
        }

        if let Some(view) = self.peers.get_mut(&addr) {
            view.outstanding = view.outstanding.saturating_sub(1);
            view.consecutive_timeouts = 0;

            if let Some((_, requested_at, _)) = our_request {
                let sample = now.duration_since(requested_at);
                view.rtt = (view.rtt * 7 + sample) / 8;
                let secs = sample.as_secs_f64().max(0.001);
                let instant_rate = block.data.len() as f64 / secs;
                view.download_rate = view.download_rate * 0.7 + instant_rate * 0.3;
            }
            view.update_pipeline();
        }

        self.maybe_enter_endgame();

        (cancels, assembled)
    }

    /// Withdraws blocks whose deadline has passed.
    ///
    /// Each expired assignment yields a CANCEL for the slow peer, and
    /// the block returns to the pickable pool. Three consecutive
    /// timeouts drop that peer's pipeline to one.
    pub fn sweep_timeouts(&mut self, now: Instant) -> Vec<SchedulerCommand> {
        let mut cancels = Vec::new();
        let mut timed_out_peers: Vec<SocketAddr> = Vec::new();

        for (&piece, entry) in self.pieces.iter_mut() {
            for (block_index, slot) in entry.blocks.iter_mut().enumerate() {
                if slot.received {
                    continue;
                }
                let sizes = &self.piece_sizes;
                slot.assignees.retain(|&(who, _, deadline)| {
                    if deadline > now {
                        return true;
                    }
                    let info = block_info_for(sizes, piece, block_index as u32);
                    cancels.push(SchedulerCommand::Cancel(who, info));
                    timed_out_peers.push(who);
                    false
                });
            }
        }

        for addr in timed_out_peers {
            if let Some(view) = self.peers.get_mut(&addr) {
                view.outstanding = view.outstanding.saturating_sub(1);
                view.consecutive_timeouts += 1;
                view.update_pipeline();
            }
        }

        self.refresh_piece_statuses();
        cancels
    }

    /// A REJECT or failed send returns the block immediately.
    pub fn release_block(&mut self, addr: SocketAddr, info: BlockInfo) {
        if let Some(slot) = self
            .pieces
            .get_mut(&info.index)
            .and_then(|entry| entry.blocks.get_mut((info.begin / BLOCK_LEN) as usize))
        {
            slot.assignees.retain(|(who, _, _)| *who != addr);
        }
        if let Some(view) = self.peers.get_mut(&addr) {
            view.outstanding = view.outstanding.saturating_sub(1);
        }
        self.refresh_piece_statuses();
    }

    // ------------------------------------------------------------------
    // verification outcomes
    // ------------------------------------------------------------------

    /// Hash check passed; the piece may be written.
    pub fn mark_verified(&mut self, piece: u32) {
        if let Some(entry) = self.pieces.get_mut(&piece) {
            entry.status = PieceStatus::Verified;
        }
    }

    /// The piece is on disk; it leaves the active set for good.
    pub fn mark_written(&mut self, piece: u32) {
        self.our_bitfield.set(piece as usize);
        self.pieces.remove(&piece);
    }

    /// Hash check failed; the piece resets to missing and its buffer is
    /// gone.
    pub fn mark_failed(&mut self, piece: u32) {
        debug!(piece, "piece failed verification, resetting");
        if let Some(entry) = self.pieces.get_mut(&piece) {
            self.blocks_remaining += entry.received as usize;
            entry.status = PieceStatus::Missing;
            entry.buffer = Vec::new();
            entry.received = 0;
            for slot in &mut entry.blocks {
                slot.received = false;
                slot.assignees.clear();
            }
        }
    }

    pub fn piece_status(&self, piece: u32) -> PieceStatus {
        if self.our_bitfield.has(piece as usize) {
            return PieceStatus::Written;
        }
        self.pieces
            .get(&piece)
            .map(|entry| entry.status)
            .unwrap_or(PieceStatus::Missing)
    }

    // ------------------------------------------------------------------
    // internals
    // ------------------------------------------------------------------

    fn maybe_enter_endgame(&mut self) {
        if self.endgame || self.blocks_remaining == 0 {
            return;
        }
        let pipeline_sum: usize = self.peers.values().map(|view| view.pipeline).sum();
        if self.blocks_remaining <= pipeline_sum.max(ENDGAME_MIN_BLOCKS) {
            debug!(
                blocks_remaining = self.blocks_remaining,
                "entering endgame"
            );
            self.endgame = true;
        }
    }

    /// Pieces whose last assignment vanished drop back to missing.
    fn refresh_piece_statuses(&mut self) {
        for entry in self.pieces.values_mut() {
            if entry.status == PieceStatus::Requested
                && entry.received == 0
                && entry.blocks.iter().all(|slot| slot.assignees.is_empty())
            {
                entry.status = PieceStatus::Missing;
            }
        }
    }

    fn drop_availability(&mut self, bitfield: &Bitfield) {
        for piece in 0..bitfield.len() {
            if bitfield.has(piece) {
                self.availability[piece] = self.availability[piece].saturating_sub(1);
            }
        }
    }

    fn entry_mut(&mut self, piece: u32) -> &mut PieceEntry {
        let size = self.piece_sizes[piece as usize];
        self.pieces.entry(piece).or_insert_with(|| PieceEntry {
            status: PieceStatus::Missing,
            blocks: (0..size.div_ceil(BLOCK_LEN))
                .map(|_| BlockSlot::default())
                .collect(),
            buffer: Vec::new(),
            received: 0,
        })
    }

    fn block_count(&self, piece: u32) -> usize {
        self.piece_sizes
            .get(piece as usize)
            .map(|&size| size.div_ceil(BLOCK_LEN) as usize)
            .unwrap_or(0)
    }

    fn block_info(&self, piece: u32, block: u32) -> BlockInfo {
        block_info_for(&self.piece_sizes, piece, block)
    }

    /// Blocks not yet received across the whole torrent.
    pub fn blocks_remaining(&self) -> usize {
        self.blocks_remaining
    }

    /// Outstanding request count for one connection, as the scheduler
    /// sees it.
    pub fn outstanding(&self, addr: SocketAddr) -> usize {
        self.peers.get(&addr).map(|view| view.outstanding).unwrap_or(0)
    }
}

fn block_info_for(piece_sizes: &[u32], piece: u32, block: u32) -> BlockInfo {
    let size = piece_sizes[piece as usize];
    let begin = block * BLOCK_LEN;
    BlockInfo {
        index: piece,
        begin,
        len: BLOCK_LEN.min(size - begin),
    }
}
