use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use super::connection::{Connection, ConnectionState};
use super::socket::SocketInner;

/// A connected uTP byte stream.
///
/// Implements `AsyncRead`/`AsyncWrite`, so the peer layer drives it
/// exactly like a `TcpStream`. Reads pull from the connection's in-order
/// receive buffer; writes enqueue ST_DATA packets that the socket driver
/// flushes under congestion control. Dropping the stream queues a FIN.
pub struct UtpStream {
    conn: Arc<Mutex<Connection>>,
    socket: Arc<SocketInner>,
}

impl UtpStream {
    pub(crate) fn new(conn: Arc<Mutex<Connection>>, socket: Arc<SocketInner>) -> Self {
        Self { conn, socket }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.conn.lock().remote
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.udp.local_addr()
    }

    /// Bytes sent but not yet acknowledged.
    pub fn bytes_in_flight(&self) -> u32 {
        self.conn.lock().bytes_in_flight()
    }

    /// The connection's smoothed round-trip estimate.
    pub fn rtt(&self) -> std::time::Duration {
        self.conn.lock().rtt()
    }
}

impl AsyncRead for UtpStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let mut conn = self.conn.lock();

        if conn.has_data() {
            let unfilled = buf.initialize_unfilled();
            let n = conn.read(unfilled);
            buf.advance(n);
            return Poll::Ready(Ok(()));
        }

        if let Some(err) = conn.terminal_error() {
            return Poll::Ready(Err(io::Error::new(io::ErrorKind::ConnectionReset, err)));
        }
        if conn.state == ConnectionState::Closed {
            // clean FIN: EOF
            return Poll::Ready(Ok(()));
        }

        conn.set_read_waker(cx.waker().clone());
        Poll::Pending
    }
}

impl AsyncWrite for UtpStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let mut conn = self.conn.lock();

        if let Some(err) = conn.terminal_error() {
            return Poll::Ready(Err(io::Error::new(io::ErrorKind::ConnectionReset, err)));
        }
        if matches!(
            conn.state,
            ConnectionState::Closed | ConnectionState::FinSent
        ) {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }

        if !conn.writable() {
            conn.set_write_waker(cx.waker().clone());
            return Poll::Pending;
        }

        conn.enqueue_data(buf);
        drop(conn);
        self.socket.kick.notify_one();
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // the driver flushes continuously; nothing buffered here
        self.socket.kick.notify_one();
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.conn.lock().close(Instant::now());
        self.socket.kick.notify_one();
        Poll::Ready(Ok(()))
    }
}

impl Drop for UtpStream {
    fn drop(&mut self) {
        self.conn.lock().close(Instant::now());
        self.socket.kick.notify_one();
    }
}
