use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use rand::Rng as _;

const UNCHOKE_INTERVAL: Duration = Duration::from_secs(10);
const OPTIMISTIC_INTERVAL: Duration = Duration::from_secs(30);
const UPLOAD_SLOTS: usize = 4;

/// Recent transfer rates for one peer, fed in by the engine.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransferRates {
    pub download: f64,
    pub upload: f64,
    pub peer_interested: bool,
    pub am_choking: bool,
}

/// A choke flip the engine should apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChokeDecision {
    pub addr: SocketAddr,
    pub unchoke: bool,
}

/// The unchoke policy: reciprocate with the three best transfer
/// partners, plus one rotating optimistic slot so new peers get a
/// chance to prove themselves.
pub struct Choker {
    peers: HashMap<SocketAddr, TransferRates>,
    last_round: Instant,
    last_optimistic: Instant,
    optimistic: Option<SocketAddr>,
}

impl Choker {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            peers: HashMap::new(),
            // backdate so the first round runs immediately
            last_round: now.checked_sub(UNCHOKE_INTERVAL).unwrap_or(now),
            last_optimistic: now.checked_sub(OPTIMISTIC_INTERVAL).unwrap_or(now),
            optimistic: None,
        }
    }

    pub fn update(&mut self, addr: SocketAddr, rates: TransferRates) {
        self.peers.insert(addr, rates);
    }

    pub fn remove(&mut self, addr: &SocketAddr) {
        self.peers.remove(addr);
        if self.optimistic.as_ref() == Some(addr) {
            self.optimistic = None;
        }
    }

    /// Runs one choking round if due. While downloading, the best
    /// downloaders get the slots; while seeding, the best uploaders.
    pub fn decide(&mut self, seeding: bool) -> Vec<ChokeDecision> {
        let now = Instant::now();
        if now.duration_since(self.last_round) < UNCHOKE_INTERVAL {
            return Vec::new();
        }
        self.last_round = now;

        let mut interested: Vec<(&SocketAddr, &TransferRates)> = self
            .peers
            .iter()
            .filter(|(_, rates)| rates.peer_interested)
            .collect();

        interested.sort_by(|(_, a), (_, b)| {
            let (ka, kb) = if seeding {
                (a.upload, b.upload)
            } else {
                (a.download, b.download)
            };
            kb.partial_cmp(&ka).unwrap_or(std::cmp::Ordering::Equal)
        });

        let mut unchoked: Vec<SocketAddr> = interested
            .iter()
            .take(UPLOAD_SLOTS - 1)
            .map(|(addr, _)| **addr)
            .collect();

        if now.duration_since(self.last_optimistic) >= OPTIMISTIC_INTERVAL {
            self.last_optimistic = now;

            let rest: Vec<SocketAddr> = self
                .peers
                .iter()
                .filter(|(addr, rates)| rates.peer_interested && !unchoked.contains(addr))
                .map(|(addr, _)| *addr)
                .collect();

            if !rest.is_empty() {
                let pick = rand::rng().random_range(0..rest.len());
                self.optimistic = Some(rest[pick]);
            }
        }

        if let Some(optimistic) = self.optimistic {
            if !unchoked.contains(&optimistic) && unchoked.len() < UPLOAD_SLOTS {
                unchoked.push(optimistic);
            }
        }

        self.peers
            .iter()
            .filter_map(|(addr, rates)| {
                let should_unchoke = unchoked.contains(addr);
                let currently_unchoked = !rates.am_choking;
                (should_unchoke != currently_unchoked).then_some(ChokeDecision {
                    addr: *addr,
                    unchoke: should_unchoke,
                })
            })
            .collect()
    }
}

impl Default for Choker {
    fn default() -> Self {
        Self::new()
    }
}
