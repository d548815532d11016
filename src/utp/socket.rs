use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, trace};

use super::connection::{Connection, ConnectionState};
use super::error::UtpError;
use super::packet::{Packet, PacketType};
use super::stream::UtpStream;
use crate::constants::{CONNECT_TIMEOUT, UTP_TICK};

const ACCEPT_BACKLOG: usize = 32;

/// A uTP endpoint: one UDP socket serving many connections.
///
/// Incoming datagrams are routed to connections by the 16-bit connection
/// id. A background driver task owns the receive loop, the retransmit
/// tick and the transmit flush; connections themselves are pure state
/// machines.
pub struct UtpSocket {
    inner: Arc<SocketInner>,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<Arc<Mutex<Connection>>>>,
    driver: tokio::task::JoinHandle<()>,
}

pub(crate) struct SocketInner {
    pub(crate) udp: UdpSocket,
    /// Registered connections keyed by their receive id. Entries are
    /// removed only here, by the driver, once a connection leaves its
    /// open states; streams keep their own handle to the state machine.
    connections: Mutex<HashMap<u16, Arc<Mutex<Connection>>>>,
    /// Wakes the driver to flush freshly queued packets.
    pub(crate) kick: Notify,
    accept_tx: mpsc::Sender<Arc<Mutex<Connection>>>,
}

impl UtpSocket {
    /// Binds a uTP endpoint and starts its driver task.
    pub async fn bind(addr: SocketAddr) -> Result<Self, UtpError> {
        let udp = UdpSocket::bind(addr).await?;
        let (accept_tx, accept_rx) = mpsc::channel(ACCEPT_BACKLOG);

        let inner = Arc::new(SocketInner {
            udp,
            connections: Mutex::new(HashMap::new()),
            kick: Notify::new(),
            accept_tx,
        });

        let driver = tokio::spawn(drive(inner.clone()));

        Ok(Self {
            inner,
            accept_rx: tokio::sync::Mutex::new(accept_rx),
            driver,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, UtpError> {
        Ok(self.inner.udp.local_addr()?)
    }

    /// Opens a connection to `remote`: sends the SYN and waits for the
    /// ACK, failing after the connect timeout or the retransmit limit.
    pub async fn connect(&self, remote: SocketAddr) -> Result<UtpStream, UtpError> {
        let conn = {
            let mut table = self.inner.connections.lock();

            // even receive id, fresh pair on collision
            let mut recv_id = rand::random::<u16>() & !1;
            let mut tries = 0;
            while table.contains_key(&recv_id) || table.contains_key(&recv_id.wrapping_add(1)) {
                recv_id = recv_id.wrapping_add(2);
                tries += 1;
                if tries > u16::MAX / 2 {
                    return Err(UtpError::IdExhausted);
                }
            }

            let mut conn = Connection::initiate(remote, recv_id, Instant::now());
            conn.registered_with_socket = true;
            let conn = Arc::new(Mutex::new(conn));
            table.insert(recv_id, conn.clone());
            conn
        };

        self.inner.kick.notify_one();

        let connected = ConnectFuture { conn: conn.clone() };
        match tokio::time::timeout(CONNECT_TIMEOUT, connected).await {
            Ok(Ok(())) => Ok(UtpStream::new(conn, self.inner.clone())),
            Ok(Err(err)) => Err(err),
            Err(_) => {
                conn.lock().abandon();
                Err(UtpError::ConnectTimeout)
            }
        }
    }

    /// Waits for the next incoming connection.
    pub async fn accept(&self) -> Result<UtpStream, UtpError> {
        let conn = self
            .accept_rx
            .lock()
            .await
            .recv()
            .await
            .ok_or(UtpError::Closed)?;
        Ok(UtpStream::new(conn, self.inner.clone()))
    }
}

impl Drop for UtpSocket {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

struct ConnectFuture {
    conn: Arc<Mutex<Connection>>,
}

impl std::future::Future for ConnectFuture {
    type Output = Result<(), UtpError>;

    fn poll(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Self::Output> {
        let mut conn = self.conn.lock();
        match conn.state {
            ConnectionState::Connected => std::task::Poll::Ready(Ok(())),
            ConnectionState::ErrorWait | ConnectionState::Closed => std::task::Poll::Ready(Err(
                conn.terminal_error().unwrap_or(UtpError::Closed),
            )),
            _ => {
                conn.set_connect_waker(cx.waker().clone());
                std::task::Poll::Pending
            }
        }
    }
}

async fn drive(inner: Arc<SocketInner>) {
    let mut buf = vec![0u8; 65536];
    let mut tick = tokio::time::interval(UTP_TICK);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            received = inner.udp.recv_from(&mut buf) => {
                if let Ok((n, from)) = received {
                    inner.handle_datagram(&buf[..n], from);
                }
            }
            _ = tick.tick() => {
                inner.on_tick();
            }
            _ = inner.kick.notified() => {}
        }

        inner.flush().await;
    }
}

impl SocketInner {
    fn handle_datagram(&self, datagram: &[u8], from: SocketAddr) {
        let Ok(packet) = Packet::decode(datagram) else {
            trace!(%from, "dropping malformed utp datagram");
            return;
        };

        if packet.header.packet_type == PacketType::Syn {
            self.handle_syn(&packet, from);
            return;
        }

        let conn = self
            .connections
            .lock()
            .get(&packet.header.connection_id)
            .cloned();

        match conn {
            Some(conn) => conn.lock().on_packet(&packet, Instant::now()),
            None => trace!(
                %from,
                id = packet.header.connection_id,
                "utp packet for unknown connection"
            ),
        }
    }

    fn handle_syn(&self, packet: &Packet, from: SocketAddr) {
        let recv_id = packet.header.connection_id.wrapping_add(1);
        let mut table = self.connections.lock();

        // duplicate SYN for a live connection: our ACK was lost
        if let Some(existing) = table.get(&recv_id).cloned() {
            drop(table);
            existing.lock().on_packet(packet, Instant::now());
            return;
        }

        let mut conn = Connection::accept(from, &packet.header);
        conn.registered_with_socket = true;
        let conn = Arc::new(Mutex::new(conn));

        // a full backlog drops the SYN; the peer will retry
        if self.accept_tx.try_send(conn.clone()).is_ok() {
            debug!(%from, id = recv_id, "accepted utp connection");
            table.insert(recv_id, conn);
        }
    }

    fn on_tick(&self) {
        let connections: Vec<_> = self.connections.lock().values().cloned().collect();
        let now = Instant::now();

        for conn in connections {
            conn.lock().on_tick(now);
        }

        // the socket alone frees registered connections
        self.connections.lock().retain(|id, conn| {
            let conn = conn.lock();
            if conn.is_open() {
                return true;
            }
            debug!(
                id,
                max_transmissions = conn.max_transmissions(),
                "releasing utp connection"
            );
            false
        });
    }

    /// Drains every connection's transmit queue onto the wire. Packets
    /// are collected under the lock and sent outside it.
    pub(crate) async fn flush(&self) {
        let connections: Vec<_> = self.connections.lock().values().cloned().collect();
        let now = Instant::now();

        let mut outgoing: Vec<(Packet, SocketAddr)> = Vec::new();
        for conn in connections {
            let mut conn = conn.lock();
            let remote = conn.remote;
            while let Some(packet) = conn.poll_transmit(now) {
                outgoing.push((packet, remote));
            }
        }

        for (packet, remote) in outgoing {
            let _ = self.udp.send_to(&packet.encode(), remote).await;
        }
    }
}
