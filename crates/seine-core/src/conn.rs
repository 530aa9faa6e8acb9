//! Framed connection: a byte-stream endpoint with per-direction deadlines
//! and cumulative byte counters.
//!
//! [`Conn`] owns the stream and splits it once into a [`ConnReader`] /
//! [`ConnWriter`] pair for the session's reader and writer tasks. Deadlines
//! are applied per I/O call: each read (or write) arms a fresh timer when it
//! starts and disarms it when it completes, so an idle connection surfaces
//! as [`io::ErrorKind::TimedOut`] without poisoning the stream.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf, ReadHalf, WriteHalf};
use tokio::time::Sleep;

/// The transport-side contract: any full-duplex byte stream.
///
/// Implemented by the TCP transport crate for `tokio::net::TcpStream` and by
/// the testkit for in-memory duplex pipes. Address accessors default to
/// `None` for transports without a meaningful socket address.
pub trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {
    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }
}

#[derive(Debug, Default)]
struct Timeouts {
    read_nanos: AtomicU64,
    write_nanos: AtomicU64,
}

#[derive(Debug, Default)]
struct Counters {
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
}

type Halves = (
    ReadHalf<Box<dyn ByteStream>>,
    WriteHalf<Box<dyn ByteStream>>,
);

/// A byte stream wrapped with deadlines and byte accounting.
pub struct Conn {
    peer: Option<SocketAddr>,
    local: Option<SocketAddr>,
    timeouts: Arc<Timeouts>,
    counters: Arc<Counters>,
    halves: Mutex<Option<Halves>>,
}

impl Conn {
    /// Wrap a stream, seeding the deadlines from `read_timeout` /
    /// `write_timeout` (zero disables the corresponding deadline).
    pub fn new(stream: Box<dyn ByteStream>, read_timeout: Duration, write_timeout: Duration) -> Self {
        let peer = stream.peer_addr();
        let local = stream.local_addr();
        let (read_half, write_half) = tokio::io::split(stream);

        let conn = Self {
            peer,
            local,
            timeouts: Arc::new(Timeouts::default()),
            counters: Arc::new(Counters::default()),
            halves: Mutex::new(Some((read_half, write_half))),
        };
        conn.set_read_timeout(read_timeout);
        conn.set_write_timeout(write_timeout);
        conn
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local
    }

    /// Set both directions at once.
    pub fn set_timeout(&self, d: Duration) {
        self.set_read_timeout(d);
        self.set_write_timeout(d);
    }

    /// Zero clears the read deadline.
    pub fn set_read_timeout(&self, d: Duration) {
        self.timeouts
            .read_nanos
            .store(d.as_nanos() as u64, Ordering::Relaxed);
    }

    /// Zero clears the write deadline.
    pub fn set_write_timeout(&self, d: Duration) {
        self.timeouts
            .write_nanos
            .store(d.as_nanos() as u64, Ordering::Relaxed);
    }

    /// Cumulative bytes observed inbound.
    pub fn bytes_read(&self) -> u64 {
        self.counters.bytes_in.load(Ordering::Relaxed)
    }

    /// Cumulative bytes observed outbound.
    pub fn bytes_written(&self) -> u64 {
        self.counters.bytes_out.load(Ordering::Relaxed)
    }

    /// Take the two halves. Yields `None` after the first call.
    pub(crate) fn split(&self) -> Option<(ConnReader, ConnWriter)> {
        let (read_half, write_half) = self.halves.lock().take()?;
        Some((
            ConnReader {
                inner: read_half,
                timeouts: self.timeouts.clone(),
                counters: self.counters.clone(),
                deadline: None,
            },
            ConnWriter {
                inner: write_half,
                timeouts: self.timeouts.clone(),
                counters: self.counters.clone(),
                deadline: None,
            },
        ))
    }

    /// Drop the halves if they were never handed out, closing the stream.
    pub(crate) fn discard(&self) {
        self.halves.lock().take();
    }
}

/// Read half handed to the session reader. Implements [`AsyncRead`] with the
/// connection's read deadline armed per call, so codecs can use the usual
/// `AsyncReadExt` helpers.
pub struct ConnReader {
    inner: ReadHalf<Box<dyn ByteStream>>,
    timeouts: Arc<Timeouts>,
    counters: Arc<Counters>,
    deadline: Option<Pin<Box<Sleep>>>,
}

impl AsyncRead for ConnReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        let nanos = this.timeouts.read_nanos.load(Ordering::Relaxed);
        if nanos > 0 {
            let deadline = this
                .deadline
                .get_or_insert_with(|| Box::pin(tokio::time::sleep(Duration::from_nanos(nanos))));
            if deadline.as_mut().poll(cx).is_ready() {
                this.deadline = None;
                return Poll::Ready(Err(io::ErrorKind::TimedOut.into()));
            }
        } else {
            this.deadline = None;
        }

        let before = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                this.deadline = None;
                let n = (buf.filled().len() - before) as u64;
                this.counters.bytes_in.fetch_add(n, Ordering::Relaxed);
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(e)) => {
                this.deadline = None;
                Poll::Ready(Err(e))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Write half handed to the session writer; deadline and accounting mirror
/// [`ConnReader`].
pub struct ConnWriter {
    inner: WriteHalf<Box<dyn ByteStream>>,
    timeouts: Arc<Timeouts>,
    counters: Arc<Counters>,
    deadline: Option<Pin<Box<Sleep>>>,
}

impl AsyncWrite for ConnWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        let nanos = this.timeouts.write_nanos.load(Ordering::Relaxed);
        if nanos > 0 {
            let deadline = this
                .deadline
                .get_or_insert_with(|| Box::pin(tokio::time::sleep(Duration::from_nanos(nanos))));
            if deadline.as_mut().poll(cx).is_ready() {
                this.deadline = None;
                return Poll::Ready(Err(io::ErrorKind::TimedOut.into()));
            }
        } else {
            this.deadline = None;
        }

        match Pin::new(&mut this.inner).poll_write(cx, buf) {
            Poll::Ready(Ok(n)) => {
                this.deadline = None;
                this.counters.bytes_out.fetch_add(n as u64, Ordering::Relaxed);
                Poll::Ready(Ok(n))
            }
            Poll::Ready(Err(e)) => {
                this.deadline = None;
                Poll::Ready(Err(e))
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn counts_bytes_in_both_directions() {
        let (a, b) = test_stream::pair();
        let conn = Conn::new(a, Duration::ZERO, Duration::ZERO);
        let (mut reader, mut writer) = conn.split().expect("first split");

        let peer = Conn::new(b, Duration::ZERO, Duration::ZERO);
        let (mut peer_reader, mut peer_writer) = peer.split().unwrap();

        writer.write_all(b"hello").await.unwrap();
        writer.flush().await.unwrap();
        let mut buf = [0u8; 5];
        peer_reader.read_exact(&mut buf).await.unwrap();

        peer_writer.write_all(b"worlds!").await.unwrap();
        let mut buf = [0u8; 7];
        reader.read_exact(&mut buf).await.unwrap();

        assert_eq!(conn.bytes_written(), 5);
        assert_eq!(conn.bytes_read(), 7);
        assert_eq!(peer.bytes_read(), 5);
        assert_eq!(peer.bytes_written(), 7);
    }

    #[tokio::test]
    async fn read_deadline_surfaces_as_timed_out() {
        let (a, _b) = test_stream::pair();
        let conn = Conn::new(a, Duration::from_millis(20), Duration::ZERO);
        let (mut reader, _writer) = conn.split().unwrap();

        let mut buf = [0u8; 1];
        let err = reader.read_exact(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn deadline_rearms_after_expiry() {
        let (a, b) = test_stream::pair();
        let conn = Conn::new(a, Duration::from_millis(20), Duration::ZERO);
        let (mut reader, _writer) = conn.split().unwrap();

        let mut buf = [0u8; 2];
        assert_eq!(
            reader.read_exact(&mut buf).await.unwrap_err().kind(),
            io::ErrorKind::TimedOut
        );

        // The next read starts a fresh deadline and completes normally.
        let peer = Conn::new(b, Duration::ZERO, Duration::ZERO);
        let (_pr, mut pw) = peer.split().unwrap();
        pw.write_all(b"ok").await.unwrap();
        reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ok");
    }

    #[tokio::test]
    async fn zero_timeout_never_expires() {
        let (a, b) = test_stream::pair();
        let conn = Conn::new(a, Duration::ZERO, Duration::ZERO);
        let (mut reader, _w) = conn.split().unwrap();

        let peer = Conn::new(b, Duration::ZERO, Duration::ZERO);
        let (_pr, mut pw) = peer.split().unwrap();

        let read = tokio::spawn(async move {
            let mut buf = [0u8; 1];
            reader.read_exact(&mut buf).await.map(|_| buf[0])
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        pw.write_all(&[42]).await.unwrap();
        assert_eq!(read.await.unwrap().unwrap(), 42);
    }

    #[tokio::test]
    async fn split_is_one_shot() {
        let (a, _b) = test_stream::pair();
        let conn = Conn::new(a, Duration::ZERO, Duration::ZERO);
        assert!(conn.split().is_some());
        assert!(conn.split().is_none());
    }
}
