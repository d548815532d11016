//! The per-connection uTP state machine.
//!
//! This type is pure protocol state: packets in, packets out, no sockets.
//! The [`super::socket::UtpSocket`] driver feeds it received datagrams,
//! drains its transmit queue, and ticks it for retransmissions. Keeping
//! I/O out makes loss and timeout behavior testable in isolation.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::task::Waker;
use std::time::Instant;

use bytes::{Buf, Bytes, BytesMut};

use super::congestion::Congestion;
use super::error::UtpError;
use super::packet::{timestamp_micros, Header, Packet, PacketType};
use crate::constants::{UTP_MAX_RETRANSMITS, UTP_MSS};

/// Bytes of receive buffer we advertise to the remote.
const RECV_WINDOW: u32 = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectionState {
    /// Created but no SYN sent yet.
    None,
    SynSent,
    Connected,
    FinSent,
    Closed,
    /// A terminal fault: reset, or the retransmit limit.
    ErrorWait,
}

/// `a <= b` in sequence-number space.
fn seq_le(a: u16, b: u16) -> bool {
    b.wrapping_sub(a) < 0x8000
}

#[derive(Debug)]
struct Inflight {
    packet: Packet,
    num_transmissions: u32,
    sent_at: Instant,
}

pub(crate) struct Connection {
    pub state: ConnectionState,
    pub remote: SocketAddr,
    /// Id stamped on packets we send.
    pub conn_id_send: u16,
    /// Id the remote stamps on packets to us; the socket routes by it.
    pub conn_id_recv: u16,
    /// True once the socket's connection table holds this connection.
    /// The socket is then the one that removes it; an unregistered
    /// connection just dies with its handle.
    pub registered_with_socket: bool,

    /// Next sequence number to assign.
    seq_nr: u16,
    /// Last in-order sequence number received.
    ack_nr: u16,

    congestion: Congestion,
    /// Sent but unacked, oldest first.
    inflight: VecDeque<Inflight>,
    bytes_in_flight: u32,
    remote_wnd: u32,

    /// Data packets awaiting their first transmission (window-gated).
    pending: VecDeque<Packet>,
    /// Control packets and retransmissions (not window-gated).
    urgent: VecDeque<Packet>,

    /// In-order received bytes not yet read by the stream.
    recv_buf: BytesMut,

    /// Last timestamp seen from the remote, for the diff field.
    last_remote_timestamp: u32,

    error: Option<UtpErrorKind>,
    fin_queued: bool,

    /// Highest transmission count any packet has reached; visible for
    /// diagnostics and tests.
    max_transmissions: u32,

    read_waker: Option<Waker>,
    write_waker: Option<Waker>,
    connect_waker: Option<Waker>,
}

/// Cloneable error cause kept inside the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UtpErrorKind {
    Reset,
    RetransmitLimit,
}

impl From<UtpErrorKind> for UtpError {
    fn from(kind: UtpErrorKind) -> Self {
        match kind {
            UtpErrorKind::Reset => UtpError::Reset,
            UtpErrorKind::RetransmitLimit => UtpError::RetransmitLimit,
        }
    }
}

impl Connection {
    fn new(remote: SocketAddr, conn_id_send: u16, conn_id_recv: u16) -> Self {
        Self {
            state: ConnectionState::None,
            remote,
            conn_id_send,
            conn_id_recv,
            registered_with_socket: false,
            seq_nr: 1,
            ack_nr: 0,
            congestion: Congestion::new(),
            inflight: VecDeque::new(),
            bytes_in_flight: 0,
            remote_wnd: RECV_WINDOW,
            pending: VecDeque::new(),
            urgent: VecDeque::new(),
            recv_buf: BytesMut::new(),
            last_remote_timestamp: 0,
            error: None,
            fin_queued: false,
            max_transmissions: 1,
            read_waker: None,
            write_waker: None,
            connect_waker: None,
        }
    }

    /// Starts an outgoing connection: the initiator picks an even recv
    /// id, sends on recv+1 (odd), and transmits ST_SYN carrying the
    /// recv id.
    pub fn initiate(remote: SocketAddr, conn_id_recv: u16, now: Instant) -> Self {
        debug_assert_eq!(conn_id_recv & 1, 0);
        let mut conn = Self::new(remote, conn_id_recv.wrapping_add(1), conn_id_recv);

        let mut header = conn.header(PacketType::Syn);
        // the SYN is the one packet stamped with the recv id
        header.connection_id = conn.conn_id_recv;
        header.seq_nr = conn.take_seq();

        conn.state = ConnectionState::SynSent;
        conn.track(Packet::control(header), now);
        conn
    }

    /// Accepts an incoming SYN: ids reverse, the SYN's sequence number
    /// becomes our ack baseline, and an ST_STATE goes straight out.
    pub fn accept(remote: SocketAddr, syn: &Header) -> Self {
        let mut conn = Self::new(remote, syn.connection_id, syn.connection_id.wrapping_add(1));
        conn.seq_nr = rand::random::<u16>() | 1;
        conn.ack_nr = syn.seq_nr;
        conn.last_remote_timestamp = syn.timestamp_us;
        conn.state = ConnectionState::Connected;

        let header = conn.header(PacketType::State);
        conn.urgent.push_back(Packet::control(header));
        conn
    }

    fn take_seq(&mut self) -> u16 {
        let seq = self.seq_nr;
        self.seq_nr = self.seq_nr.wrapping_add(1);
        seq
    }

    fn header(&self, packet_type: PacketType) -> Header {
        let now = timestamp_micros();
        Header {
            packet_type,
            extension: 0,
            connection_id: self.conn_id_send,
            timestamp_us: now,
            timestamp_diff_us: now.wrapping_sub(self.last_remote_timestamp),
            wnd_size: RECV_WINDOW.saturating_sub(self.recv_buf.len() as u32),
            seq_nr: self.seq_nr,
            ack_nr: self.ack_nr,
        }
    }

    /// Queues a packet for first transmission and remembers it for
    /// retransmits.
    fn track(&mut self, packet: Packet, now: Instant) {
        self.bytes_in_flight += packet.payload.len() as u32;
        self.inflight.push_back(Inflight {
            packet: packet.clone(),
            num_transmissions: 1,
            sent_at: now,
        });
        self.urgent.push_back(packet);
    }

    pub fn is_open(&self) -> bool {
        matches!(
            self.state,
            ConnectionState::SynSent | ConnectionState::Connected | ConnectionState::FinSent
        )
    }

    pub fn terminal_error(&self) -> Option<UtpError> {
        self.error.map(UtpError::from)
    }

    pub fn max_transmissions(&self) -> u32 {
        self.max_transmissions
    }

    pub fn rtt(&self) -> std::time::Duration {
        self.congestion.rtt()
    }

    /// Feeds one received datagram into the state machine.
    pub fn on_packet(&mut self, packet: &Packet, now: Instant) {
        let header = &packet.header;
        self.remote_wnd = header.wnd_size;
        self.last_remote_timestamp = header.timestamp_us;

        match header.packet_type {
            PacketType::State => {
                if self.state == ConnectionState::SynSent {
                    self.state = ConnectionState::Connected;
                    // the remote's first data packet will carry this +1
                    self.ack_nr = header.seq_nr.wrapping_sub(1);
                    self.wake_connect();
                    self.wake_write();
                }
                self.process_ack(header, now);

                if self.state == ConnectionState::FinSent && self.inflight.is_empty() {
                    self.state = ConnectionState::Closed;
                    self.wake_all();
                }
            }
            PacketType::Data => {
                self.process_ack(header, now);

                if header.seq_nr == self.ack_nr.wrapping_add(1) {
                    self.ack_nr = header.seq_nr;
                    self.recv_buf.extend_from_slice(&packet.payload);
                    self.wake_read();
                }
                // out-of-order data is dropped; the sender retransmits

                let ack = self.header(PacketType::State);
                self.urgent.push_back(Packet::control(ack));
            }
            PacketType::Syn => {
                // duplicate SYN, our ST_STATE was lost
                let ack = self.header(PacketType::State);
                self.urgent.push_back(Packet::control(ack));
            }
            PacketType::Fin => {
                self.ack_nr = header.seq_nr;
                let ack = self.header(PacketType::State);
                self.urgent.push_back(Packet::control(ack));
                self.state = ConnectionState::Closed;
                self.wake_all();
            }
            PacketType::Reset => {
                self.fail(UtpErrorKind::Reset);
            }
        }
    }

    fn process_ack(&mut self, header: &Header, now: Instant) {
        let mut bytes_acked = 0u32;

        while let Some(front) = self.inflight.front() {
            if !seq_le(front.packet.header.seq_nr, header.ack_nr) {
                break;
            }
            let acked = self.inflight.pop_front().expect("front exists");
            bytes_acked += acked.packet.payload.len() as u32;
            self.bytes_in_flight = self
                .bytes_in_flight
                .saturating_sub(acked.packet.payload.len() as u32);

            // only first transmissions give a clean RTT sample
            if acked.num_transmissions == 1 {
                self.congestion.on_rtt_sample(now.duration_since(acked.sent_at));
            }
        }

        if bytes_acked > 0 {
            self.congestion.on_ack(bytes_acked);
            self.wake_write();
        }
    }

    fn fail(&mut self, kind: UtpErrorKind) {
        self.state = ConnectionState::ErrorWait;
        self.error = Some(kind);
        self.pending.clear();
        self.urgent.clear();
        self.wake_all();
    }

    /// Sweeps for retransmission timeouts. Five unanswered transmissions
    /// of the same packet end the connection.
    pub fn on_tick(&mut self, now: Instant) {
        if !self.is_open() {
            return;
        }

        let mut timed_out = false;
        let mut dead = false;

        for entry in &mut self.inflight {
            let timeout = Congestion::retransmit_timeout(entry.num_transmissions);
            if now.duration_since(entry.sent_at) < timeout {
                continue;
            }

            if entry.num_transmissions >= UTP_MAX_RETRANSMITS {
                dead = true;
                break;
            }

            entry.num_transmissions += 1;
            entry.sent_at = now;
            self.max_transmissions = self.max_transmissions.max(entry.num_transmissions);

            let mut packet = entry.packet.clone();
            packet.header.timestamp_us = timestamp_micros();
            packet.header.ack_nr = self.ack_nr;
            self.urgent.push_back(packet);
            timed_out = true;
        }

        if dead {
            self.fail(UtpErrorKind::RetransmitLimit);
        } else if timed_out {
            self.congestion.on_timeout();
        }
    }

    /// True when the send path can take more payload.
    pub fn writable(&self) -> bool {
        self.state == ConnectionState::Connected
            && self.pending.is_empty()
            && self
                .congestion
                .send_budget(self.bytes_in_flight, self.remote_wnd)
                > 0
    }

    /// Chunks `data` into ST_DATA packets. The caller checks
    /// [`Self::writable`] first; everything offered is accepted.
    pub fn enqueue_data(&mut self, data: &[u8]) {
        for chunk in data.chunks(UTP_MSS as usize) {
            let mut header = self.header(PacketType::Data);
            header.seq_nr = self.take_seq();
            self.pending
                .push_back(Packet::new(header, Bytes::copy_from_slice(chunk)));
        }
    }

    /// Queues a FIN once all enqueued data has a sequence number.
    pub fn close(&mut self, now: Instant) {
        if self.fin_queued || !self.is_open() {
            return;
        }
        self.fin_queued = true;

        let mut header = self.header(PacketType::Fin);
        header.seq_nr = self.take_seq();
        self.state = ConnectionState::FinSent;
        self.track(Packet::control(header), now);
    }

    /// Drops the connection without a FIN exchange (connect timeout,
    /// endpoint shutdown).
    pub fn abandon(&mut self) {
        self.state = ConnectionState::Closed;
        self.pending.clear();
        self.urgent.clear();
        self.wake_all();
    }

    /// Next packet to put on the wire, if any; data respects the
    /// congestion and remote windows, control and retransmits do not.
    pub fn poll_transmit(&mut self, now: Instant) -> Option<Packet> {
        if let Some(packet) = self.urgent.pop_front() {
            return Some(packet);
        }

        let budget = self
            .congestion
            .send_budget(self.bytes_in_flight, self.remote_wnd);
        let fits = self
            .pending
            .front()
            .is_some_and(|p| p.payload.len() as u32 <= budget);

        if fits {
            let packet = self.pending.pop_front().expect("front exists");
            self.bytes_in_flight += packet.payload.len() as u32;
            self.inflight.push_back(Inflight {
                packet: packet.clone(),
                num_transmissions: 1,
                sent_at: now,
            });
            if self.pending.is_empty() {
                self.wake_write();
            }
            return Some(packet);
        }

        None
    }

    /// Moves received bytes into `buf`, returning the count.
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        let n = self.recv_buf.len().min(buf.len());
        buf[..n].copy_from_slice(&self.recv_buf[..n]);
        self.recv_buf.advance(n);
        n
    }

    pub fn has_data(&self) -> bool {
        !self.recv_buf.is_empty()
    }

    pub fn bytes_in_flight(&self) -> u32 {
        self.bytes_in_flight
    }

    pub fn set_read_waker(&mut self, waker: Waker) {
        self.read_waker = Some(waker);
    }

    pub fn set_write_waker(&mut self, waker: Waker) {
        self.write_waker = Some(waker);
    }

    pub fn set_connect_waker(&mut self, waker: Waker) {
        self.connect_waker = Some(waker);
    }

    fn wake_read(&mut self) {
        if let Some(waker) = self.read_waker.take() {
            waker.wake();
        }
    }

    fn wake_write(&mut self) {
        if let Some(waker) = self.write_waker.take() {
            waker.wake();
        }
    }

    fn wake_connect(&mut self) {
        if let Some(waker) = self.connect_waker.take() {
            waker.wake();
        }
    }

    fn wake_all(&mut self) {
        self.wake_read();
        self.wake_write();
        self.wake_connect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    fn drain(conn: &mut Connection, now: Instant) -> Vec<Packet> {
        let mut out = Vec::new();
        while let Some(packet) = conn.poll_transmit(now) {
            out.push(packet);
        }
        out
    }

    /// Runs the three-way exchange and returns both connected ends.
    fn handshake(now: Instant) -> (Connection, Connection) {
        let mut initiator = Connection::initiate(addr(1), 0x1000, now);
        assert_eq!(initiator.state, ConnectionState::SynSent);

        let syn = drain(&mut initiator, now).remove(0);
        assert_eq!(syn.header.packet_type, PacketType::Syn);
        assert_eq!(syn.header.connection_id & 1, 0);

        let mut acceptor = Connection::accept(addr(2), &syn.header);
        assert_eq!(acceptor.conn_id_send, initiator.conn_id_recv);
        assert_eq!(acceptor.conn_id_recv, initiator.conn_id_send);

        let state = drain(&mut acceptor, now).remove(0);
        initiator.on_packet(&state, now);
        assert_eq!(initiator.state, ConnectionState::Connected);
        assert_eq!(acceptor.state, ConnectionState::Connected);

        (initiator, acceptor)
    }

    #[test]
    fn three_way_handshake() {
        let now = Instant::now();
        let (initiator, _acceptor) = handshake(now);
        // zero loss leaves the window at its initial two segments or more
        assert!(initiator.congestion.cwnd() >= 2 * UTP_MSS);
    }

    #[test]
    fn in_order_delivery_and_ack() {
        let now = Instant::now();
        let (mut a, mut b) = handshake(now);

        a.enqueue_data(b"hello ");
        a.enqueue_data(b"world");
        for packet in drain(&mut a, now) {
            b.on_packet(&packet, now);
        }

        let mut buf = [0u8; 64];
        let n = b.read(&mut buf);
        assert_eq!(&buf[..n], b"hello world");

        // acks flow back and clear the in-flight ledger
        for packet in drain(&mut b, now) {
            a.on_packet(&packet, now);
        }
        assert_eq!(a.bytes_in_flight(), 0);
    }

    #[test]
    fn out_of_order_data_is_dropped() {
        let now = Instant::now();
        let (mut a, mut b) = handshake(now);

        a.enqueue_data(&[1; 10]);
        a.enqueue_data(&[2; 10]);
        let packets = drain(&mut a, now);

        // deliver only the second packet; receiver must hold position
        b.on_packet(&packets[1], now);
        assert!(!b.has_data());

        // the first then arrives and delivers; the second stays dropped
        // until the sender retransmits it
        b.on_packet(&packets[0], now);
        let mut buf = [0u8; 64];
        assert_eq!(b.read(&mut buf), 10);
        assert_eq!(buf[0], 1);
    }

    #[test]
    fn lossy_transfer_retransmits_and_completes() {
        let mut now = Instant::now();
        let (mut a, mut b) = handshake(now);

        // fixed drop pattern standing in for 20% random loss
        let drops = [false, true, false, false, true, false, false, false, false, false];
        let mut sent = Vec::new();
        for i in 0..10u8 {
            a.enqueue_data(&[i; 100]);
            sent.extend_from_slice(&[i; 100]);
        }

        let mut received = Vec::new();
        let mut drop_iter = drops.iter().cycle();
        for _round in 0..40 {
            for packet in drain(&mut a, now) {
                if packet.header.packet_type == PacketType::Data
                    && *drop_iter.next().expect("cycle")
                {
                    continue; // lost
                }
                b.on_packet(&packet, now);
            }
            for packet in drain(&mut b, now) {
                a.on_packet(&packet, now);
            }

            let mut buf = [0u8; 4096];
            let n = b.read(&mut buf);
            received.extend_from_slice(&buf[..n]);
            if received.len() == sent.len() {
                break;
            }

            // advance past the retransmit timeout
            now += Duration::from_secs(2);
            a.on_tick(now);
        }

        assert_eq!(received, sent);
        assert_eq!(a.state, ConnectionState::Connected);
        assert_eq!(b.state, ConnectionState::Connected);
        assert!(a.max_transmissions() >= 2);
    }

    #[test]
    fn total_loss_reaches_error_wait_within_five_retries() {
        let mut now = Instant::now();
        let (mut a, _b) = handshake(now);

        a.enqueue_data(&[0; 100]);
        let _lost = drain(&mut a, now);

        for _ in 0..6 {
            now += Duration::from_secs(20);
            a.on_tick(now);
            drain(&mut a, now);
        }

        assert_eq!(a.state, ConnectionState::ErrorWait);
        assert!(matches!(
            a.terminal_error(),
            Some(UtpError::RetransmitLimit)
        ));
    }

    #[test]
    fn fin_closes_both_sides() {
        let now = Instant::now();
        let (mut a, mut b) = handshake(now);

        a.close(now);
        assert_eq!(a.state, ConnectionState::FinSent);

        for packet in drain(&mut a, now) {
            b.on_packet(&packet, now);
        }
        assert_eq!(b.state, ConnectionState::Closed);

        for packet in drain(&mut b, now) {
            a.on_packet(&packet, now);
        }
        assert_eq!(a.state, ConnectionState::Closed);
    }

    #[test]
    fn reset_faults_the_connection() {
        let now = Instant::now();
        let (mut a, b) = handshake(now);

        let mut header = b.header(PacketType::Reset);
        header.connection_id = a.conn_id_recv;
        a.on_packet(&Packet::control(header), now);

        assert_eq!(a.state, ConnectionState::ErrorWait);
        assert!(matches!(a.terminal_error(), Some(UtpError::Reset)));
    }
}
