use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, trace, warn};

use super::bus::{Event, EventBus};
use super::discovery::SharedResources;
use super::error::SessionError;
use crate::config::EngineConfig;
use crate::constants::STATS_INTERVAL;
use crate::metainfo::{select_layer, InfoHash, MerkleTree, TorrentInfo};
use crate::peer::{
    allowed_fast_set, source, Bitfield, Block, ChokeDecision, Choker, ConnectionHandle,
    ExtensionHandshake, HashServer, Message, PeerCommand, PeerConnection, PeerEvent, PeerId,
    PeerPool, PeerTransport, PieceScheduler, SchedulerCommand, TransferRates,
};
use crate::storage::{StorageError, StorageWriter, VerifyOutcome};
use crate::utp::UtpSocket;

/// Session lifecycle.
///
/// `Stopped → Downloading → {Paused ⇄ Downloading, Seeding} → Stopped`.
/// Pausing inhibits new requests but keeps connections; seeding starts
/// the moment every piece is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Stopped,
    Downloading,
    Paused,
    Seeding,
}

enum SessionCommand {
    AddPeers(Vec<SocketAddr>, u8),
    AddIncoming(PeerTransport),
    Pause,
    Resume,
    TrackerResult {
        url: String,
        result: Result<usize, String>,
    },
    Stop(oneshot::Sender<()>),
}

enum DiskEvent {
    PieceResult {
        piece: u32,
        size: u32,
        from: SocketAddr,
        result: Result<VerifyOutcome, StorageError>,
    },
    BlockRead {
        addr: SocketAddr,
        block: Option<Block>,
    },
}

/// One torrent being downloaded or seeded.
///
/// The session is a cloneable handle; the engine itself runs as a task
/// that owns the pool, scheduler and storage writer. All engine state
/// lives on that one task, I/O completions arrive as messages, and
/// heavy hashing is pushed to the blocking pool.
#[derive(Clone)]
pub struct Session {
    info_hash: InfoHash,
    commands: mpsc::Sender<SessionCommand>,
    events: Arc<EventBus>,
    state: watch::Receiver<SessionState>,
    utp_addr: Option<SocketAddr>,
}

impl Session {
    /// Parses nothing: the torrent comes in already parsed, because a
    /// metainfo failure must abort before anything is allocated.
    /// Existing files are scanned so a complete copy seeds right away.
    pub async fn start(
        torrent: TorrentInfo,
        config: EngineConfig,
        shared: Arc<SharedResources>,
    ) -> Result<Self, SessionError> {
        let info_hash = torrent.info_hash();
        let events = Arc::new(EventBus::new());

        let writer = Arc::new(StorageWriter::new(
            config.download_dir.clone(),
            &torrent,
            &shared.layer_cache,
        )?);

        let piece_sizes: Vec<u32> = (0..torrent.piece_count())
            .map(|piece| torrent.piece_size(piece) as u32)
            .collect();
        let mut scheduler = PieceScheduler::new(piece_sizes);

        for piece in writer.scan_existing().await {
            scheduler.assume_piece(piece);
        }

        let pool = PeerPool::new(
            config.max_peerlist_size,
            config.max_active_connections,
            config.max_failcount,
        );

        let hash_server = build_hash_server(&torrent, &shared);

        let utp = if config.prefer_utp {
            let bind: SocketAddr = if config.listen_port == 0 {
                "0.0.0.0:0".parse().expect("static addr")
            } else {
                format!("0.0.0.0:{}", config.listen_port)
                    .parse()
                    .expect("static addr")
            };
            Some(Arc::new(UtpSocket::bind(bind).await.map_err(
                |err| SessionError::Io(std::io::Error::other(err)),
            )?))
        } else {
            None
        };

        let (commands_tx, commands_rx) = mpsc::channel(64);
        let (peer_events_tx, peer_events_rx) = mpsc::channel(256);
        let (disk_tx, disk_rx) = mpsc::channel(64);
        let (state_tx, state_rx) = watch::channel(SessionState::Downloading);

        // incoming uTP connections feed the same path as TCP accepts
        let utp_addr = match &utp {
            Some(socket) => {
                let local = socket
                    .local_addr()
                    .map_err(|err| SessionError::Io(std::io::Error::other(err)))?;
                let socket = socket.clone();
                let accepts = commands_tx.clone();
                tokio::spawn(async move {
                    while let Ok(stream) = socket.accept().await {
                        let incoming = SessionCommand::AddIncoming(PeerTransport::utp(stream));
                        if accepts.send(incoming).await.is_err() {
                            break;
                        }
                    }
                });
                Some(local)
            }
            None => None,
        };

        let initial_state = if scheduler.is_complete() {
            SessionState::Seeding
        } else {
            SessionState::Downloading
        };
        let _ = state_tx.send(initial_state);

        let engine = Engine {
            info_hash,
            wire_hash: info_hash.wire(),
            our_id: PeerId::generate(),
            config,
            state: initial_state,
            state_tx,
            events: events.clone(),
            pool,
            scheduler,
            writer,
            choker: Choker::new(),
            hash_server,
            utp,
            _shared: shared,
            peer_events: peer_events_rx,
            peer_events_tx,
            disk_events: disk_rx,
            disk_tx,
            commands: commands_rx,
            pending_commands: HashMap::new(),
            established: HashSet::new(),
            traffic: HashMap::new(),
            live_tasks: 0,
            total_downloaded: 0,
            total_uploaded: 0,
            last_downloaded: 0,
            last_uploaded: 0,
            stop_ack: None,
            fatal: None,
        };

        events.publish(Event::SessionStarted {
            info_hash,
            state: initial_state,
        });
        info!(%info_hash, ?initial_state, "session started");

        tokio::spawn(engine.run());

        Ok(Self {
            info_hash,
            commands: commands_tx,
            events,
            state: state_rx,
            utp_addr,
        })
    }

    pub fn info_hash(&self) -> InfoHash {
        self.info_hash
    }

    /// The uTP listen address, when the session dialed out over uTP.
    pub fn utp_listen_addr(&self) -> Option<SocketAddr> {
        self.utp_addr
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// The session's event bus.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Feeds a discovery batch (tracker, DHT, PEX, ...) into the pool.
    pub async fn add_peers(&self, peers: Vec<SocketAddr>) -> Result<(), SessionError> {
        self.commands
            .send(SessionCommand::AddPeers(peers, source::TRACKER))
            .await
            .map_err(|_| SessionError::Stopped)
    }

    /// Hands an accepted TCP connection to the engine.
    pub async fn add_incoming(&self, stream: TcpStream) -> Result<(), SessionError> {
        self.commands
            .send(SessionCommand::AddIncoming(PeerTransport::tcp(stream)))
            .await
            .map_err(|_| SessionError::Stopped)
    }

    /// Publishes a collaborator's announce outcome on the bus.
    pub async fn report_tracker(
        &self,
        url: String,
        result: Result<usize, String>,
    ) -> Result<(), SessionError> {
        self.commands
            .send(SessionCommand::TrackerResult { url, result })
            .await
            .map_err(|_| SessionError::Stopped)
    }

    pub async fn pause(&self) -> Result<(), SessionError> {
        self.commands
            .send(SessionCommand::Pause)
            .await
            .map_err(|_| SessionError::Stopped)
    }

    pub async fn resume(&self) -> Result<(), SessionError> {
        self.commands
            .send(SessionCommand::Resume)
            .await
            .map_err(|_| SessionError::Stopped)
    }

    /// Stops the session: drains connections in order and resolves once
    /// every connection has been accounted for.
    pub async fn stop(&self) -> Result<(), SessionError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.commands
            .send(SessionCommand::Stop(ack_tx))
            .await
            .map_err(|_| SessionError::Stopped)?;
        ack_rx.await.map_err(|_| SessionError::Stopped)
    }
}

#[derive(Debug, Default)]
struct Traffic {
    downloaded: u64,
    uploaded: u64,
    last_downloaded: u64,
    last_uploaded: u64,
    peer_interested: bool,
    am_choking: bool,
    am_interested: bool,
}

struct Engine {
    info_hash: InfoHash,
    wire_hash: [u8; 20],
    our_id: PeerId,
    config: EngineConfig,
    state: SessionState,
    state_tx: watch::Sender<SessionState>,
    events: Arc<EventBus>,

    pool: PeerPool,
    scheduler: PieceScheduler,
    writer: Arc<StorageWriter>,
    choker: Choker,
    hash_server: Option<HashServer>,
    utp: Option<Arc<UtpSocket>>,
    _shared: Arc<SharedResources>,

    peer_events: mpsc::Receiver<PeerEvent>,
    peer_events_tx: mpsc::Sender<PeerEvent>,
    disk_events: mpsc::Receiver<DiskEvent>,
    disk_tx: mpsc::Sender<DiskEvent>,
    commands: mpsc::Receiver<SessionCommand>,

    /// Command channels for tasks that have not reached `Ready` yet.
    pending_commands: HashMap<SocketAddr, mpsc::Sender<PeerCommand>>,
    established: HashSet<SocketAddr>,
    traffic: HashMap<SocketAddr, Traffic>,
    /// Peer tasks spawned and not yet closed; zero means drained.
    live_tasks: usize,

    total_downloaded: u64,
    total_uploaded: u64,
    last_downloaded: u64,
    last_uploaded: u64,

    stop_ack: Option<oneshot::Sender<()>>,
    fatal: Option<String>,
}

enum Step {
    Peer(Option<PeerEvent>),
    Disk(Option<DiskEvent>),
    Command(Option<SessionCommand>),
    Tick,
    Stats,
}

impl Engine {
    async fn run(mut self) {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        // stats are coalesced: a late tick publishes once, not thrice
        let mut stats = tokio::time::interval(STATS_INTERVAL);
        stats.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let mut commands_open = true;

        loop {
            let step = tokio::select! {
                event = self.peer_events.recv() => Step::Peer(event),
                event = self.disk_events.recv() => Step::Disk(event),
                command = self.commands.recv(), if commands_open => Step::Command(command),
                _ = ticker.tick() => Step::Tick,
                _ = stats.tick() => Step::Stats,
            };

            match step {
                Step::Peer(Some(event)) => self.on_peer_event(event).await,
                Step::Disk(Some(event)) => self.on_disk_event(event).await,
                Step::Command(Some(command)) => self.on_command(command).await,
                Step::Command(None) => {
                    // every session handle is gone; drain and exit
                    commands_open = false;
                    self.begin_shutdown().await;
                }
                Step::Tick => self.on_tick().await,
                Step::Stats => self.publish_stats(),
                Step::Peer(None) | Step::Disk(None) => {}
            }

            if self.pool.is_shutting_down() && self.live_tasks == 0 {
                self.finish_shutdown();
                break;
            }
        }
    }

    // ------------------------------------------------------------------
    // commands
    // ------------------------------------------------------------------

    async fn on_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::AddPeers(peers, sources) => {
                let kept = self.pool.add_peers(&peers, sources);
                trace!(offered = peers.len(), kept, "discovery batch");
                if self.state == SessionState::Downloading {
                    self.dial_candidates();
                }
            }
            SessionCommand::AddIncoming(transport) => {
                self.accept_incoming(transport);
            }
            SessionCommand::Pause => {
                if self.state == SessionState::Downloading {
                    self.set_state(SessionState::Paused);
                    self.events.publish(Event::SessionPaused {
                        info_hash: self.info_hash,
                        state: self.state,
                    });
                }
            }
            SessionCommand::Resume => {
                if self.state == SessionState::Paused {
                    let next = if self.scheduler.is_complete() {
                        SessionState::Seeding
                    } else {
                        SessionState::Downloading
                    };
                    self.set_state(next);
                    self.events.publish(Event::SessionResumed {
                        info_hash: self.info_hash,
                        state: self.state,
                    });
                }
            }
            SessionCommand::TrackerResult { url, result } => {
                let event = match result {
                    Ok(peer_count) => Event::TrackerSuccess { url, peer_count },
                    Err(error) => Event::TrackerFailed { url, error },
                };
                self.events.publish(event);
            }
            SessionCommand::Stop(ack) => {
                self.stop_ack = Some(ack);
                self.begin_shutdown().await;
            }
        }
    }

    // ------------------------------------------------------------------
    // connection lifecycle
    // ------------------------------------------------------------------

    fn dial_candidates(&mut self) {
        for addr in self.pool.connect_candidates() {
            self.spawn_outbound(addr);
        }
    }

    fn spawn_outbound(&mut self, addr: SocketAddr) {
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        self.pending_commands.insert(addr, cmd_tx);
        self.live_tasks += 1;

        let events = self.peer_events_tx.clone();
        let wire_hash = self.wire_hash;
        let our_id = self.our_id;
        let num_pieces = self.scheduler.piece_count();
        let utp = self.utp.clone();

        tokio::spawn(async move {
            let connected = async {
                let transport = match &utp {
                    Some(socket) => PeerTransport::utp(socket.connect(addr).await?),
                    None => PeerTransport::connect_tcp(addr).await?,
                };
                PeerConnection::outbound(transport, wire_hash, our_id, num_pieces).await
            }
            .await;

            match connected {
                Ok(connection) => connection.run(cmd_rx, events).await,
                Err(error) => {
                    let _ = events
                        .send(PeerEvent::Closed {
                            addr,
                            error: Some(error),
                        })
                        .await;
                }
            }
        });
    }

    fn accept_incoming(&mut self, transport: PeerTransport) {
        if self.pool.is_shutting_down() {
            return;
        }
        let Ok(addr) = transport.peer_addr() else {
            return;
        };
        if self.pool.active_count() >= self.config.max_active_connections {
            trace!(%addr, "connection budget full, dropping incoming peer");
            return;
        }

        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        self.pending_commands.insert(addr, cmd_tx);
        self.live_tasks += 1;

        let events = self.peer_events_tx.clone();
        let wire_hash = self.wire_hash;
        let our_id = self.our_id;
        let num_pieces = self.scheduler.piece_count();

        tokio::spawn(async move {
            match PeerConnection::inbound(transport, wire_hash, our_id, num_pieces).await {
                Ok(connection) => connection.run(cmd_rx, events).await,
                Err(error) => {
                    let _ = events
                        .send(PeerEvent::Closed {
                            addr,
                            error: Some(error),
                        })
                        .await;
                }
            }
        });
    }

    async fn on_peer_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::Ready {
                addr,
                peer_id,
                reserved,
            } => {
                let Some(commands) = self.pending_commands.remove(&addr) else {
                    return;
                };
                let handle = ConnectionHandle {
                    addr,
                    peer_id,
                    reserved,
                    commands,
                };

                if self.pool.is_shutting_down() {
                    let _ = handle.commands.send(PeerCommand::GracefulClose).await;
                    return;
                }
                if !self.pool.mark_connected(addr, peer_id, handle.clone()) {
                    // table full even after eviction: benign, just drop
                    let _ = handle.commands.send(PeerCommand::GracefulClose).await;
                    return;
                }

                self.established.insert(addr);
                self.scheduler.peer_connected(addr);
                self.traffic.insert(
                    addr,
                    Traffic {
                        am_choking: true,
                        ..Traffic::default()
                    },
                );

                self.greet(&handle).await;
                self.events.publish(Event::PeerConnected {
                    addr,
                    peer_id: Some(peer_id),
                });
            }
            PeerEvent::Message { addr, message } => {
                self.on_message(addr, message).await;
            }
            PeerEvent::Closed { addr, error } => {
                self.live_tasks = self.live_tasks.saturating_sub(1);
                self.pending_commands.remove(&addr);

                if self.established.remove(&addr) {
                    let traffic = self.traffic.remove(&addr).unwrap_or_default();
                    self.pool
                        .mark_disconnected(addr, traffic.downloaded, traffic.uploaded);
                    self.scheduler.peer_disconnected(addr);
                    self.choker.remove(&addr);
                    self.events.publish(Event::PeerDisconnected { addr });
                    if let Some(error) = &error {
                        debug!(%addr, %error, "peer connection lost");
                    }
                } else if error.is_some() {
                    self.pool.mark_connect_failed(addr);
                }

                // a freshly freed slot is refilled immediately
                if !self.pool.is_shutting_down() && self.state == SessionState::Downloading {
                    self.dial_candidates();
                }
            }
        }
    }

    /// First words after the handshake: bitfield (or HAVE_NONE), the
    /// extended handshake, and the peer's allowed-fast set.
    async fn greet(&mut self, handle: &ConnectionHandle) {
        let bitfield = self.scheduler.our_bitfield();

        if handle.reserved.fast() && bitfield.is_empty() {
            let _ = handle.commands.send(PeerCommand::Send(Message::HaveNone)).await;
        } else if handle.reserved.fast() && bitfield.is_complete() {
            let _ = handle.commands.send(PeerCommand::Send(Message::HaveAll)).await;
        } else if !bitfield.is_empty() {
            let _ = handle
                .commands
                .send(PeerCommand::Send(Message::Bitfield(bitfield.to_bytes())))
                .await;
        }

        if handle.reserved.extension_protocol() {
            let ours = ExtensionHandshake::ours(self.config.listen_port, 250);
            let _ = handle
                .commands
                .send(PeerCommand::Send(Message::Extended {
                    id: 0,
                    payload: ours.encode(),
                }))
                .await;
        }

        if handle.reserved.fast() {
            let offered = allowed_fast_set(
                &self.wire_hash,
                handle.addr.ip(),
                self.scheduler.piece_count() as u32,
            );
            for piece in offered {
                let _ = handle
                    .commands
                    .send(PeerCommand::Send(Message::AllowedFast(piece)))
                    .await;
            }
        }
    }

    // ------------------------------------------------------------------
    // inbound messages
    // ------------------------------------------------------------------

    async fn on_message(&mut self, addr: SocketAddr, message: Message) {
        match message {
            Message::Bitfield(bits) => {
                let piece_count = self.scheduler.piece_count();
                if let Ok(bitfield) = Bitfield::from_wire(&bits, piece_count) {
                    if bitfield.is_complete() {
                        self.pool.mark_seed(addr);
                    }
                    self.scheduler.peer_bitfield(addr, bitfield);
                    self.update_interest(addr).await;
                }
            }
            Message::HaveAll => {
                self.pool.mark_seed(addr);
                self.scheduler
                    .peer_bitfield(addr, Bitfield::full(self.scheduler.piece_count()));
                self.update_interest(addr).await;
            }
            Message::HaveNone => {
                self.scheduler
                    .peer_bitfield(addr, Bitfield::empty(self.scheduler.piece_count()));
            }
            Message::Have(piece) => {
                self.scheduler.peer_have(addr, piece);
                self.update_interest(addr).await;
            }
            Message::Unchoke => {
                self.scheduler.peer_unchoked(addr);
                self.fill_requests(addr).await;
            }
            Message::Choke => {
                self.scheduler.peer_choked(addr);
            }
            Message::Interested => {
                if let Some(traffic) = self.traffic.get_mut(&addr) {
                    traffic.peer_interested = true;
                }
            }
            Message::NotInterested => {
                if let Some(traffic) = self.traffic.get_mut(&addr) {
                    traffic.peer_interested = false;
                }
            }
            Message::Piece(block) => {
                self.on_block(addr, block).await;
            }
            Message::Request(info) => {
                if self.state == SessionState::Paused {
                    return;
                }
                let writer = self.writer.clone();
                let disk = self.disk_tx.clone();
                tokio::spawn(async move {
                    let block = writer
                        .read_block(info.index, info.begin, info.len)
                        .await
                        .ok()
                        .map(|data| Block {
                            index: info.index,
                            begin: info.begin,
                            data,
                        });
                    let _ = disk.send(DiskEvent::BlockRead { addr, block }).await;
                });
            }
            Message::Cancel(_) => {
                // the connection already pruned its incoming ledger;
                // an unread block simply never gets served
            }
            Message::AllowedFast(piece) => {
                // allowed-fast pieces are requestable before the unchoke
                self.scheduler.allow_fast(addr, piece);
                self.fill_requests(addr).await;
            }
            Message::Reject(info) => {
                self.scheduler.release_block(addr, info);
            }
            Message::Suggest(_) | Message::KeepAlive | Message::Port(_) => {}
            Message::Extended { .. } => {
                // extension payloads beyond the handshake (PEX and kin)
                // belong to collaborators outside the engine
            }
            Message::HashRequest(request) => {
                let reply = self
                    .hash_server
                    .as_ref()
                    .and_then(|server| server.respond(&request));
                let message = match reply {
                    Some((hashes, proofs)) => Message::Hashes {
                        pieces_root: request.pieces_root,
                        base_layer: request.base_layer,
                        index: request.index,
                        hashes,
                        proofs,
                    },
                    None => Message::HashReject(request),
                };
                self.send_to(addr, PeerCommand::Send(message)).await;
            }
            Message::Hashes { .. } | Message::HashReject(_) => {
                // we never request hashes: the metadata came in whole
            }
        }
    }

    async fn on_block(&mut self, addr: SocketAddr, block: Block) {
        if self.state == SessionState::Paused {
            return;
        }

        let len = block.data.len() as u64;
        self.total_downloaded += len;
        if let Some(traffic) = self.traffic.get_mut(&addr) {
            traffic.downloaded += len;
        }

        let (cancels, completed) = self.scheduler.on_block(addr, &block, Instant::now());
        for command in cancels {
            let SchedulerCommand::Cancel(other, info) = command;
            self.send_to(other, PeerCommand::Cancel(info)).await;
        }

        if let Some((piece, data)) = completed {
            let size = data.len() as u32;
            let writer = self.writer.clone();
            let disk = self.disk_tx.clone();
            tokio::spawn(async move {
                let result = writer.verify_and_write(piece, data).await;
                let _ = disk
                    .send(DiskEvent::PieceResult {
                        piece,
                        size,
                        from: addr,
                        result,
                    })
                    .await;
            });
        }

        self.fill_requests(addr).await;
    }

    async fn on_disk_event(&mut self, event: DiskEvent) {
        match event {
            DiskEvent::PieceResult {
                piece,
                size,
                from,
                result,
            } => match result {
                Ok(VerifyOutcome::Written) => {
                    self.scheduler.mark_verified(piece);
                    self.scheduler.mark_written(piece);

                    self.events.publish(Event::PieceCompleted {
                        index: piece,
                        size,
                        completed_count: self.scheduler.completed_count() as u32,
                        total_count: self.scheduler.piece_count() as u32,
                    });

                    for handle in self.pool.connected_handles() {
                        let _ = handle.commands.send(PeerCommand::Have(piece)).await;
                    }

                    if self.scheduler.is_complete() && self.state == SessionState::Downloading {
                        info!(info_hash = %self.info_hash, "download complete, seeding");
                        self.set_state(SessionState::Seeding);
                        self.events.publish(Event::SessionCompleted {
                            info_hash: self.info_hash,
                            state: self.state,
                        });
                    }
                }
                Ok(VerifyOutcome::Duplicate) => {
                    self.scheduler.mark_written(piece);
                }
                Ok(VerifyOutcome::HashMismatch) => {
                    self.scheduler.mark_failed(piece);
                    self.pool.mark_hash_failure(from);
                    self.events.publish(Event::PieceHashFailed { index: piece });
                }
                Err(error) => {
                    // hybrid disagreement and write failures stop the
                    // session; a stable short message reaches the UI
                    warn!(piece, %error, "fatal storage error");
                    self.fatal = Some(error.to_string());
                    self.events.publish(Event::SessionError {
                        info_hash: self.info_hash,
                        state: SessionState::Stopped,
                        message: error.to_string(),
                    });
                    self.begin_shutdown().await;
                }
            },
            DiskEvent::BlockRead { addr, block } => {
                if let Some(block) = block {
                    let len = block.data.len() as u64;
                    self.total_uploaded += len;
                    if let Some(traffic) = self.traffic.get_mut(&addr) {
                        traffic.uploaded += len;
                    }
                    self.send_to(addr, PeerCommand::ServeBlock(block)).await;
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // periodic work
    // ------------------------------------------------------------------

    async fn on_tick(&mut self) {
        if self.pool.is_shutting_down() {
            return;
        }

        if self.state == SessionState::Downloading {
            self.dial_candidates();

            let cancels = self.scheduler.sweep_timeouts(Instant::now());
            for command in cancels {
                let SchedulerCommand::Cancel(addr, info) = command;
                self.send_to(addr, PeerCommand::Cancel(info)).await;
            }

            for handle in self.pool.connected_handles() {
                self.fill_requests(handle.addr).await;
            }
        }

        if self.state != SessionState::Paused {
            let seeding = self.state == SessionState::Seeding;
            let decisions: Vec<ChokeDecision> = self.choker.decide(seeding);
            for decision in decisions {
                let command = if decision.unchoke {
                    PeerCommand::Unchoke
                } else {
                    PeerCommand::Choke
                };
                if let Some(traffic) = self.traffic.get_mut(&decision.addr) {
                    traffic.am_choking = !decision.unchoke;
                }
                self.send_to(decision.addr, command).await;
            }
        }
    }

    async fn update_interest(&mut self, addr: SocketAddr) {
        if self.state != SessionState::Downloading {
            return;
        }
        let interesting = self.scheduler.peer_is_interesting(addr);
        let currently = self
            .traffic
            .get(&addr)
            .map(|traffic| traffic.am_interested)
            .unwrap_or(false);

        if interesting == currently {
            return;
        }
        if let Some(traffic) = self.traffic.get_mut(&addr) {
            traffic.am_interested = interesting;
        }
        self.scheduler.set_interested(addr, interesting);

        let command = if interesting {
            PeerCommand::Interested
        } else {
            PeerCommand::NotInterested
        };
        self.send_to(addr, command).await;

        if interesting {
            self.fill_requests(addr).await;
        }
    }

    async fn fill_requests(&mut self, addr: SocketAddr) {
        if self.state != SessionState::Downloading {
            return;
        }
        for info in self.scheduler.next_requests(addr, Instant::now()) {
            self.send_to(addr, PeerCommand::Request(info)).await;
        }
    }

    fn publish_stats(&mut self) {
        if self.pool.is_shutting_down() {
            return;
        }

        let download_rate = self.total_downloaded - self.last_downloaded;
        let upload_rate = self.total_uploaded - self.last_uploaded;
        self.last_downloaded = self.total_downloaded;
        self.last_uploaded = self.total_uploaded;

        for (addr, traffic) in self.traffic.iter_mut() {
            let rates = TransferRates {
                download: (traffic.downloaded - traffic.last_downloaded) as f64,
                upload: (traffic.uploaded - traffic.last_uploaded) as f64,
                peer_interested: traffic.peer_interested,
                am_choking: traffic.am_choking,
            };
            traffic.last_downloaded = traffic.downloaded;
            traffic.last_uploaded = traffic.uploaded;
            self.choker.update(*addr, rates);
        }

        let total = self.scheduler.piece_count() as f64;
        let progress = if total > 0.0 {
            self.scheduler.completed_count() as f64 / total
        } else {
            1.0
        };

        self.events.publish(Event::StatsUpdate {
            downloaded: self.total_downloaded,
            uploaded: self.total_uploaded,
            download_rate,
            upload_rate,
            peers: self.pool.active_count(),
            progress,
        });
    }

    // ------------------------------------------------------------------
    // shutdown
    // ------------------------------------------------------------------

    /// Starts the drain: timers go quiet, every connection gets a
    /// graceful close, and the loop runs on until the close events have
    /// all come back.
    async fn begin_shutdown(&mut self) {
        if self.pool.is_shutting_down() {
            return;
        }
        debug!(info_hash = %self.info_hash, "session drain started");

        for handle in self.pool.begin_shutdown() {
            let _ = handle.commands.send(PeerCommand::GracefulClose).await;
        }
        // dial tasks still in their handshake resolve through the same
        // Closed events as established connections
        for commands in self.pending_commands.values() {
            let _ = commands.send(PeerCommand::GracefulClose).await;
        }
    }

    /// The terminal sweep, once nothing is in flight: free the pool's
    /// connection handles in one pass, then storage and scheduler go
    /// with the engine.
    fn finish_shutdown(&mut self) {
        let swept = self.pool.sweep();
        trace!(swept, "terminal sweep of connection handles");

        self.set_state(SessionState::Stopped);
        if self.fatal.is_none() {
            self.events.publish(Event::SessionStopped {
                info_hash: self.info_hash,
                state: SessionState::Stopped,
            });
        }
        if let Some(ack) = self.stop_ack.take() {
            let _ = ack.send(());
        }
        info!(info_hash = %self.info_hash, "session stopped");
    }

    // ------------------------------------------------------------------
    // plumbing
    // ------------------------------------------------------------------

    fn set_state(&mut self, state: SessionState) {
        self.state = state;
        let _ = self.state_tx.send(state);
    }

    async fn send_to(&self, addr: SocketAddr, command: PeerCommand) {
        if let Some(peer) = self.pool.get(&addr) {
            if let Some(handle) = &peer.connection {
                let _ = handle.commands.send(command).await;
            }
        }
    }
}

/// Registers every file's piece-layer tree so HASH_REQUESTs can be
/// served. v1-only torrents have nothing to serve.
fn build_hash_server(torrent: &TorrentInfo, shared: &SharedResources) -> Option<HashServer> {
    let layers = torrent.piece_layers.as_ref()?;
    let server = HashServer::new(select_layer(torrent.piece_length));

    for file in &torrent.files {
        let Some(pieces_root) = file.pieces_root else {
            continue;
        };
        match layers.get(&file.path) {
            Some(layer) => {
                if let Ok(tree) = shared.layer_cache.get_or_build(
                    &file.path,
                    layer,
                    torrent.piece_length,
                    &pieces_root,
                ) {
                    server.register(pieces_root, tree);
                }
            }
            None => {
                // single-piece file: the root is its own piece layer
                let tree = MerkleTree::from_piece_layer(vec![pieces_root], torrent.piece_length);
                server.register(pieces_root, Arc::new(tree));
            }
        }
    }

    Some(server)
}
