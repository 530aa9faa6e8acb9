//! seine: connection-oriented, message-framed networking with symmetric
//! client and server engines.
//!
//! You bring two things:
//!
//! - a [`Codec`] that frames bytes into messages and back;
//! - a [`Handler`] invoked on lifecycle and message events.
//!
//! The library runs each connection as a [`Session`]: a three-task pipeline
//! (read → decode → deliver; enqueue → encode → write) with idle detection,
//! panic containment and exactly-once disconnect notification. On top of
//! that sit a [`Client`] with an RPC-style [`Client::call`] overlay, a
//! bounded [`Pool`] of clients, and a [`Server`] whose accept loop rides out
//! transient errors with exponential backoff.
//!
//! # Quick start (TCP echo client)
//!
//! ```ignore
//! use seine::prelude::*;
//!
//! let config = seine::tcp::TcpClientConfig::default();
//! let client = seine::tcp::client(&config);
//! client.set_codec(Arc::new(MyLineCodec));
//! client.set_handler(Arc::new(MyHandler));
//! client.dial("127.0.0.1:8888").await?;
//! client.send(Box::new(MyMsg::from("hello"))).await?;
//! ```
//!
//! Servers mirror the shape:
//!
//! ```ignore
//! let server = Server::new(ServerConfig::default());
//! server.set_codec(Arc::new(MyLineCodec));
//! server.set_handler(Arc::new(MyHandler));
//! seine::tcp::listen_and_serve(&server, "127.0.0.1:8888").await?;
//! ```

pub use seine_core::{
    AttrKey, ByteStream, Client, ClientConfig, ClientFactory, Codec, Conn, ConnReader, ConnWriter,
    DialFn, DialFuture, Error, Handler, IoConfig, LimitListener, Listener, Message, Pool,
    PoolConfig, PooledClient, Request, Server, ServerConfig, Session, DEFAULT_QUEUE_SIZE,
};

/// TCP transport (enabled by the `tcp` feature).
#[cfg(feature = "tcp")]
pub mod tcp {
    pub use seine_tcp::{
        bind, client, dialer, listen_and_serve, TcpAcceptor, TcpClientConfig, TcpConn,
        DEFAULT_DIAL_TIMEOUT,
    };
}

/// Convenient imports for applications.
pub mod prelude {
    pub use crate::{
        Client, ClientConfig, Codec, Error, Handler, IoConfig, Message, Pool, PoolConfig, Request,
        Server, ServerConfig, Session,
    };
}
