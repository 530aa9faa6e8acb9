//! Error types shared across the library.

use std::fmt;
use std::io;
use std::sync::Arc;

/// Errors produced by sessions, engines and pools.
///
/// The enum is `Clone` so that one terminal session error can be fanned out
/// to every pending call waiting on that session; transport errors are held
/// behind an `Arc` for that reason.
#[derive(Debug, Clone)]
pub enum Error {
    /// The client engine has been closed.
    ClientClosed,
    /// The client engine has no live session and will not reconnect on its
    /// own (auto-reconnect disabled, or a disconnect was forced).
    Disconnected,
    /// The session has been closed.
    SessionClosed,
    /// The peer shut its side of the connection down cleanly.
    PeerClosed,
    /// A blocking operation ran out of time.
    Timeout,
    /// The client pool has been closed.
    PoolClosed,
    /// The server engine was shut down while accepting.
    ServerClosed,
    /// Transport-level I/O failure.
    Io(Arc<io::Error>),
    /// The codec failed to frame or parse a message.
    Codec(String),
    /// A session task crashed; carries the panic payload.
    Internal(String),
    /// Application-defined failure raised by a handler hook.
    App(Arc<dyn std::error::Error + Send + Sync>),
}

impl Error {
    /// Wrap an application error so a handler hook can surface it.
    pub fn app<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::App(Arc::new(err))
    }

    /// True for deadline-class errors: either [`Error::Timeout`] or an I/O
    /// error whose kind marks an expired deadline. The session reader treats
    /// these as an idle signal rather than a terminal failure.
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Timeout => true,
            Self::Io(e) => matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock),
            _ => false,
        }
    }

    /// True when the error means the peer went away cleanly.
    pub fn is_peer_closed(&self) -> bool {
        matches!(self, Self::PeerClosed)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ClientClosed => write!(f, "client closed"),
            Self::Disconnected => write!(f, "client disconnected"),
            Self::SessionClosed => write!(f, "session closed"),
            Self::PeerClosed => write!(f, "peer closed"),
            Self::Timeout => write!(f, "timeout"),
            Self::PoolClosed => write!(f, "client pool closed"),
            Self::ServerClosed => write!(f, "server closed"),
            Self::Io(e) => write!(f, "i/o error: {e}"),
            Self::Codec(msg) => write!(f, "codec error: {msg}"),
            Self::Internal(msg) => write!(f, "internal error: {msg}"),
            Self::App(e) => write!(f, "application error: {e}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e.as_ref()),
            Self::App(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Io(Arc::new(e))
    }
}
