use std::net::SocketAddr;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, trace};

use super::bitfield::Bitfield;
use super::error::PeerError;
use super::extension::ExtensionHandshake;
use super::fast::FastState;
use super::message::{Handshake, Message, Reserved};
use super::peer_id::PeerId;
use super::scheduler::{Block, BlockInfo};
use super::transport::PeerTransport;
use crate::constants::{CONNECT_TIMEOUT, KEEPALIVE_INTERVAL};

/// Connection lifecycle.
///
/// ```text
/// Connecting ──transport open──▶ Handshaking ──handshakes ok──▶ Ready
///      │                             │                            │
///      └───timeout/refused──▶ Closed ◀──────any error/close───────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Connecting,
    Handshaking,
    Ready,
    Closed,
}

/// Commands the engine sends into a running peer task.
#[derive(Debug)]
pub enum PeerCommand {
    /// Queue a REQUEST and track it as outstanding.
    Request(BlockInfo),
    /// Withdraw an outstanding REQUEST with a CANCEL.
    Cancel(BlockInfo),
    Have(u32),
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    /// Answer a peer's REQUEST with data read from storage.
    ServeBlock(Block),
    /// Reject a peer's REQUEST (fast extension).
    RejectBlock(BlockInfo),
    /// Any other protocol message, sent as-is.
    Send(Message),
    /// Drain and close; the task exits with a `Closed` event.
    GracefulClose,
}

/// What a peer task reports back to the engine.
#[derive(Debug)]
pub enum PeerEvent {
    /// Handshakes completed; the connection is in `Ready`.
    Ready {
        addr: SocketAddr,
        peer_id: PeerId,
        reserved: Reserved,
    },
    /// An inbound message that passed protocol checks.
    Message { addr: SocketAddr, message: Message },
    /// The connection ended; `error` is `None` for a graceful close.
    Closed {
        addr: SocketAddr,
        error: Option<PeerError>,
    },
}

/// The engine's handle to a running peer task.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub addr: SocketAddr,
    pub peer_id: PeerId,
    pub reserved: Reserved,
    pub commands: mpsc::Sender<PeerCommand>,
}

/// One peer connection: transport, protocol state and legality rules.
///
/// The four BEP-3 booleans change only here, in response to sent and
/// received messages. A connection starts choked on both sides and not
/// interested on either.
pub struct PeerConnection {
    pub addr: SocketAddr,
    pub peer_id: Option<PeerId>,
    pub state: PeerState,
    pub peer_reserved: Reserved,

    pub am_choking: bool,
    pub am_interested: bool,
    pub peer_choking: bool,
    pub peer_interested: bool,

    /// The peer's announced pieces; `None` until a BITFIELD, HAVE_ALL,
    /// HAVE_NONE or first HAVE arrives.
    pub peer_bitfield: Option<Bitfield>,
    pub fast: FastState,
    pub extensions: Option<ExtensionHandshake>,

    /// Our REQUESTs the peer has not answered, oldest first.
    pub outstanding: Vec<BlockInfo>,
    /// The peer's REQUESTs we have not served yet.
    pub incoming_requests: Vec<BlockInfo>,

    pub bytes_downloaded: u64,
    pub bytes_uploaded: u64,

    transport: Option<PeerTransport>,
    num_pieces: usize,
    last_outbound: Instant,
    /// BITFIELD is legal only as the first message after the handshake.
    first_message_done: bool,
    is_closed: bool,
}

impl PeerConnection {
    /// Performs the outbound handshake over an open transport.
    pub async fn outbound(
        mut transport: PeerTransport,
        info_hash: [u8; 20],
        our_id: PeerId,
        num_pieces: usize,
    ) -> Result<Self, PeerError> {
        let addr = transport.peer_addr()?;

        let ours = Handshake::new(info_hash, *our_id.as_bytes());
        transport.send_handshake(&ours).await?;

        let theirs = timeout(CONNECT_TIMEOUT, transport.receive_handshake())
            .await
            .map_err(|_| PeerError::Timeout)??;
        if theirs.info_hash != info_hash {
            return Err(PeerError::InfoHashMismatch);
        }

        Ok(Self::ready(transport, addr, &theirs, num_pieces))
    }

    /// Answers an inbound handshake.
    pub async fn inbound(
        mut transport: PeerTransport,
        info_hash: [u8; 20],
        our_id: PeerId,
        num_pieces: usize,
    ) -> Result<Self, PeerError> {
        let addr = transport.peer_addr()?;

        let theirs = timeout(CONNECT_TIMEOUT, transport.receive_handshake())
            .await
            .map_err(|_| PeerError::Timeout)??;
        if theirs.info_hash != info_hash {
            return Err(PeerError::InfoHashMismatch);
        }

        let ours = Handshake::new(info_hash, *our_id.as_bytes());
        transport.send_handshake(&ours).await?;

        Ok(Self::ready(transport, addr, &theirs, num_pieces))
    }

    fn ready(
        transport: PeerTransport,
        addr: SocketAddr,
        theirs: &Handshake,
        num_pieces: usize,
    ) -> Self {
        debug!(%addr, peer_id = ?PeerId(theirs.peer_id), "peer handshake complete");
        Self {
            addr,
            peer_id: Some(PeerId(theirs.peer_id)),
            state: PeerState::Ready,
            peer_reserved: theirs.reserved,
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            peer_bitfield: None,
            fast: FastState::default(),
            extensions: None,
            outstanding: Vec::new(),
            incoming_requests: Vec::new(),
            bytes_downloaded: 0,
            bytes_uploaded: 0,
            transport: Some(transport),
            num_pieces,
            last_outbound: Instant::now(),
            first_message_done: false,
            is_closed: false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.is_closed
    }

    /// Sends a message, updating the state the message implies.
    /// Silently does nothing on a closed connection.
    pub async fn send(&mut self, message: Message) -> Result<(), PeerError> {
        if self.is_closed {
            return Ok(());
        }

        match &message {
            Message::Choke => self.am_choking = true,
            Message::Unchoke => self.am_choking = false,
            Message::Interested => self.am_interested = true,
            Message::NotInterested => self.am_interested = false,
            Message::Request(info) => self.outstanding.push(*info),
            Message::Cancel(info) => self.outstanding.retain(|o| o != info),
            Message::Piece(block) => {
                self.bytes_uploaded += block.data.len() as u64;
                let served = BlockInfo {
                    index: block.index,
                    begin: block.begin,
                    len: block.data.len() as u32,
                };
                self.incoming_requests.retain(|r| *r != served);
            }
            Message::Reject(info) => self.incoming_requests.retain(|r| r != info),
            Message::AllowedFast(piece) => self.fast.allow_outgoing(*piece),
            _ => {}
        }

        let transport = self
            .transport
            .as_mut()
            .ok_or(PeerError::ConnectionClosed)?;
        transport.send_message(&message).await?;
        self.last_outbound = Instant::now();
        Ok(())
    }

    /// Receives the next actionable message.
    ///
    /// Protocol rules are enforced here: BITFIELD only first, fast
    /// messages only when negotiated, HAVE in range. A REQUEST that
    /// arrives while we choke the peer is dropped without surfacing.
    pub async fn receive(&mut self) -> Result<Message, PeerError> {
        loop {
            let transport = self
                .transport
                .as_mut()
                .ok_or(PeerError::ConnectionClosed)?;
            let message = transport.receive_message().await?;
            if let Some(message) = self.process_inbound(message)? {
                return Ok(message);
            }
        }
    }

    /// The state and legality layer under [`Self::receive`]. Returns
    /// `Ok(None)` for messages absorbed here (keep-alives, requests
    /// dropped while choking).
    fn process_inbound(&mut self, message: Message) -> Result<Option<Message>, PeerError> {
        let first = !self.first_message_done;
        if !matches!(message, Message::KeepAlive) {
            self.first_message_done = true;
        }

        match &message {
            Message::KeepAlive => return Ok(None),
            Message::Bitfield(bits) => {
                if !first {
                    return Err(PeerError::Protocol("bitfield after first message"));
                }
                self.peer_bitfield = Some(Bitfield::from_wire(bits, self.num_pieces)?);
            }
            Message::HaveAll => {
                self.require_fast()?;
                if !first {
                    return Err(PeerError::Protocol("have-all after first message"));
                }
                self.peer_bitfield = Some(Bitfield::full(self.num_pieces));
            }
            Message::HaveNone => {
                self.require_fast()?;
                if !first {
                    return Err(PeerError::Protocol("have-none after first message"));
                }
                self.peer_bitfield = Some(Bitfield::empty(self.num_pieces));
            }
            Message::Have(piece) => {
                if *piece as usize >= self.num_pieces {
                    return Err(PeerError::Protocol("have out of range"));
                }
                self.peer_bitfield
                    .get_or_insert_with(|| Bitfield::empty(self.num_pieces))
                    .set(*piece as usize);
            }
            Message::Choke => {
                self.peer_choking = true;
            }
            Message::Unchoke => {
                self.peer_choking = false;
            }
            Message::Interested => {
                self.peer_interested = true;
            }
            Message::NotInterested => {
                self.peer_interested = false;
            }
            Message::Request(info) => {
                if info.len > crate::constants::MAX_REQUEST_LEN {
                    return Err(PeerError::Protocol("request too large"));
                }
                if self.am_choking && !self.fast.servable_while_choking(info.index) {
                    trace!(addr = %self.addr, "dropping request from choked peer");
                    return Ok(None);
                }
                self.incoming_requests.push(*info);
            }
            Message::Cancel(info) => {
                self.incoming_requests.retain(|r| r != info);
            }
            Message::Piece(block) => {
                self.bytes_downloaded += block.data.len() as u64;
                let answered = BlockInfo {
                    index: block.index,
                    begin: block.begin,
                    len: block.data.len() as u32,
                };
                self.outstanding.retain(|o| *o != answered);
            }
            Message::Suggest(piece) => {
                self.require_fast()?;
                self.fast.suggest(*piece);
            }
            Message::Reject(info) => {
                self.require_fast()?;
                self.outstanding.retain(|o| o != info);
            }
            Message::AllowedFast(piece) => {
                self.require_fast()?;
                self.fast.allow_incoming(*piece);
            }
            Message::Extended { id: 0, payload } => {
                self.extensions = Some(ExtensionHandshake::decode(payload)?);
            }
            Message::Extended { .. } => {}
            Message::Port(_) => {}
            Message::HashRequest(_) | Message::Hashes { .. } | Message::HashReject(_) => {
                if !self.peer_reserved.v2() {
                    return Err(PeerError::Protocol("hash message without v2"));
                }
            }
        }

        Ok(Some(message))
    }

    fn require_fast(&self) -> Result<(), PeerError> {
        if self.peer_reserved.fast() {
            Ok(())
        } else {
            Err(PeerError::Protocol("fast extension not negotiated"))
        }
    }

    /// Sends a KEEP-ALIVE if the outbound side has been idle long
    /// enough. The inbound silence limit lives in the transport's read
    /// timeout.
    pub async fn keepalive(&mut self) -> Result<(), PeerError> {
        if self.last_outbound.elapsed() >= KEEPALIVE_INTERVAL {
            self.send(Message::KeepAlive).await?;
        }
        Ok(())
    }

    /// Drains outbound state and closes the transport politely, then
    /// runs the one-shot close.
    pub async fn graceful_close(&mut self) {
        if self.is_closed {
            return;
        }
        if let Some(transport) = self.transport.as_mut() {
            let _ = transport.shutdown().await;
        }
        self.close();
    }

    /// One-shot teardown: releases per-connection state and the
    /// transport. Gated by `is_closed`, which never goes back to false.
    pub fn close(&mut self) {
        if self.is_closed {
            return;
        }
        self.is_closed = true;
        self.state = PeerState::Closed;
        self.outstanding.clear();
        self.incoming_requests.clear();
        self.fast = FastState::default();
        self.transport = None;
    }

    /// Runs the connection as a task: commands in, events out.
    ///
    /// The transport is polled alongside the command channel; whichever
    /// wakes first is handled with the other future dropped, so the
    /// loop never holds a half-read frame across a command (the frame
    /// boundary lives in the transport's buffer).
    pub async fn run(
        mut self,
        mut commands: mpsc::Receiver<PeerCommand>,
        events: mpsc::Sender<PeerEvent>,
    ) {
        enum Step {
            Inbound(Result<Message, PeerError>),
            Command(Option<PeerCommand>),
            Tick,
        }

        let addr = self.addr;
        let _ = events
            .send(PeerEvent::Ready {
                addr,
                peer_id: self.peer_id.expect("set in handshake"),
                reserved: self.peer_reserved,
            })
            .await;

        let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL / 3);
        keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let exit_error = loop {
            let transport = match self.transport.as_mut() {
                Some(transport) => transport,
                None => break None,
            };

            let step = tokio::select! {
                message = transport.receive_message() => Step::Inbound(message),
                command = commands.recv() => Step::Command(command),
                _ = keepalive.tick() => Step::Tick,
            };

            match step {
                Step::Inbound(Ok(message)) => match self.process_inbound(message) {
                    Ok(Some(message)) => {
                        if events
                            .send(PeerEvent::Message { addr, message })
                            .await
                            .is_err()
                        {
                            break None;
                        }
                    }
                    Ok(None) => {}
                    Err(err) => break Some(err),
                },
                Step::Inbound(Err(err)) => break Some(err),
                Step::Command(None) | Step::Command(Some(PeerCommand::GracefulClose)) => {
                    self.graceful_close().await;
                    break None;
                }
                Step::Command(Some(command)) => {
                    if let Err(err) = self.apply(command).await {
                        break Some(err);
                    }
                }
                Step::Tick => {
                    if let Err(err) = self.keepalive().await {
                        break Some(err);
                    }
                }
            }
        };

        if !self.is_closed {
            self.close();
        }
        let _ = events.send(PeerEvent::Closed {
            addr,
            error: exit_error,
        })
        .await;
    }

    async fn apply(&mut self, command: PeerCommand) -> Result<(), PeerError> {
        match command {
            PeerCommand::Request(info) => self.send(Message::Request(info)).await,
            PeerCommand::Cancel(info) => self.send(Message::Cancel(info)).await,
            PeerCommand::Have(piece) => self.send(Message::Have(piece)).await,
            PeerCommand::Choke => self.send(Message::Choke).await,
            PeerCommand::Unchoke => self.send(Message::Unchoke).await,
            PeerCommand::Interested => self.send(Message::Interested).await,
            PeerCommand::NotInterested => self.send(Message::NotInterested).await,
            PeerCommand::ServeBlock(block) => self.send(Message::Piece(block)).await,
            PeerCommand::RejectBlock(info) => {
                if self.peer_reserved.fast() {
                    self.send(Message::Reject(info)).await
                } else {
                    Ok(())
                }
            }
            PeerCommand::Send(message) => self.send(message).await,
            PeerCommand::GracefulClose => unreachable!("handled in run"),
        }
    }
}
