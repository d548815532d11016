use std::collections::HashMap;
use std::net::SocketAddr;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::metainfo::InfoHash;
use crate::peer::PeerId;

use super::engine::SessionState;

/// Everything a session publishes.
///
/// Payload shapes are stable; UIs are the only consumers of the error
/// messages.
#[derive(Debug, Clone)]
pub enum Event {
    SessionStarted {
        info_hash: InfoHash,
        state: SessionState,
    },
    SessionPaused {
        info_hash: InfoHash,
        state: SessionState,
    },
    SessionResumed {
        info_hash: InfoHash,
        state: SessionState,
    },
    SessionCompleted {
        info_hash: InfoHash,
        state: SessionState,
    },
    SessionStopped {
        info_hash: InfoHash,
        state: SessionState,
    },
    SessionError {
        info_hash: InfoHash,
        state: SessionState,
        message: String,
    },
    PieceCompleted {
        index: u32,
        size: u32,
        completed_count: u32,
        total_count: u32,
    },
    PieceHashFailed {
        index: u32,
    },
    PeerConnected {
        addr: SocketAddr,
        peer_id: Option<PeerId>,
    },
    PeerDisconnected {
        addr: SocketAddr,
    },
    TrackerSuccess {
        url: String,
        peer_count: usize,
    },
    TrackerFailed {
        url: String,
        error: String,
    },
    StatsUpdate {
        downloaded: u64,
        uploaded: u64,
        download_rate: u64,
        upload_rate: u64,
        peers: usize,
        progress: f64,
    },
}

impl Event {
    /// The event's name on the bus.
    pub fn name(&self) -> &'static str {
        match self {
            Event::SessionStarted { .. } => "session.started",
            Event::SessionPaused { .. } => "session.paused",
            Event::SessionResumed { .. } => "session.resumed",
            Event::SessionCompleted { .. } => "session.completed",
            Event::SessionStopped { .. } => "session.stopped",
            Event::SessionError { .. } => "session.error",
            Event::PieceCompleted { .. } => "piece.completed",
            Event::PieceHashFailed { .. } => "piece.hash_failed",
            Event::PeerConnected { .. } => "peer.connected",
            Event::PeerDisconnected { .. } => "peer.disconnected",
            Event::TrackerSuccess { .. } => "tracker.success",
            Event::TrackerFailed { .. } => "tracker.failed",
            Event::StatsUpdate { .. } => "stats.update",
        }
    }
}

#[derive(Default)]
struct Subscribers {
    /// Name-filtered subscribers, in subscription order.
    by_name: HashMap<&'static str, Vec<mpsc::UnboundedSender<Event>>>,
    /// Subscribers to everything.
    all: Vec<mpsc::UnboundedSender<Event>>,
}

/// Per-session publish/subscribe bus.
///
/// Publishing enqueues; subscribers see events when their own task next
/// polls, never re-entrantly from inside `publish`. Events published in
/// order arrive in order at each subscriber. A multi-session embedder
/// fans out by subscribing to each session's bus; there is no global
/// bus.
#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<Subscribers>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes to one event name, e.g. `"piece.completed"`.
    pub fn subscribe(&self, name: &'static str) -> mpsc::UnboundedReceiver<Event> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().by_name.entry(name).or_default().push(tx);
        rx
    }

    /// Subscribes to every event.
    pub fn subscribe_all(&self) -> mpsc::UnboundedReceiver<Event> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().all.push(tx);
        rx
    }

    /// Publishes an event to matching subscribers. Dead receivers are
    /// pruned on the way through.
    pub fn publish(&self, event: Event) {
        let mut subscribers = self.subscribers.lock();

        subscribers.all.retain(|tx| tx.send(event.clone()).is_ok());

        if let Some(list) = subscribers.by_name.get_mut(event.name()) {
            list.retain(|tx| tx.send(event.clone()).is_ok());
        }
    }
}
