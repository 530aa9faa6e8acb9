//! seine-tcp: TCP transport for seine.
//!
//! Provides the TCP sides of the transport contracts: a [`DialFn`] built on
//! `tokio::net::TcpStream` for clients, and a [`TcpAcceptor`] implementing
//! [`Listener`] for servers.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};

use seine_core::{
    ByteStream, Client, ClientConfig, DialFn, DialFuture, Error, IoConfig, Listener, Server,
};

/// Default dial deadline for [`TcpClientConfig`].
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(30);

/// A TCP stream as a seine [`ByteStream`].
pub struct TcpConn(pub TcpStream);

impl AsyncRead for TcpConn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().0).poll_read(cx, buf)
    }
}

impl AsyncWrite for TcpConn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().0).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().0).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().0).poll_shutdown(cx)
    }
}

impl ByteStream for TcpConn {
    fn peer_addr(&self) -> Option<SocketAddr> {
        self.0.peer_addr().ok()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.0.local_addr().ok()
    }
}

/// Build a TCP [`DialFn`]. A zero `dial_timeout` dials without a deadline.
pub fn dialer(dial_timeout: Duration) -> DialFn {
    Arc::new(move |addr: String| -> DialFuture {
        Box::pin(async move {
            let stream = if dial_timeout.is_zero() {
                TcpStream::connect(&addr).await?
            } else {
                tokio::time::timeout(dial_timeout, TcpStream::connect(&addr))
                    .await
                    .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "dial timed out"))??
            };
            stream.set_nodelay(true)?;
            Ok(Box::new(TcpConn(stream)) as Box<dyn ByteStream>)
        })
    })
}

/// TCP client configuration: session tuning plus the dial deadline.
#[derive(Debug, Clone)]
pub struct TcpClientConfig {
    pub io: IoConfig,
    pub dial_timeout: Duration,
    pub auto_reconnect: bool,
}

impl Default for TcpClientConfig {
    fn default() -> Self {
        Self {
            io: IoConfig::default(),
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            auto_reconnect: false,
        }
    }
}

/// Build a [`Client`] that dials over TCP.
pub fn client(config: &TcpClientConfig) -> Client {
    Client::new(
        dialer(config.dial_timeout),
        ClientConfig {
            io: config.io.clone(),
            auto_reconnect: config.auto_reconnect,
        },
    )
}

/// A bound TCP listener implementing [`Listener`].
pub struct TcpAcceptor(TcpListener);

impl TcpAcceptor {
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.0.local_addr().ok()
    }

    pub fn into_inner(self) -> TcpListener {
        self.0
    }
}

#[async_trait]
impl Listener for TcpAcceptor {
    async fn accept(&mut self) -> io::Result<Box<dyn ByteStream>> {
        let (stream, _peer) = self.0.accept().await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(TcpConn(stream)))
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.0.local_addr().ok()
    }
}

/// Bind a TCP listener for [`Server::serve`].
pub async fn bind(addr: &str) -> io::Result<TcpAcceptor> {
    let listener = TcpListener::bind(addr).await?;
    tracing::debug!(addr = ?listener.local_addr().ok(), "tcp listener bound");
    Ok(TcpAcceptor(listener))
}

/// Bind `addr` and run the server's accept loop on it.
pub async fn listen_and_serve(server: &Server, addr: &str) -> Result<(), Error> {
    let acceptor = bind(addr).await.map_err(Error::from)?;
    server.serve(acceptor).await
}
