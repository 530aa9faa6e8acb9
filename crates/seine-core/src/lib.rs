//! seine-core: session engine, client/server engines and client pool for
//! connection-oriented, message-framed networking.
//!
//! This crate defines:
//! - The user contracts ([`Codec`], [`Handler`], [`Message`], [`Request`])
//! - The framed connection ([`Conn`], [`ConnReader`], [`ConnWriter`],
//!   [`ByteStream`])
//! - The session engine ([`Session`])
//! - The client engine and its correlation table ([`Client`])
//! - The client pool ([`Pool`], [`PooledClient`], [`ClientFactory`])
//! - The server engine ([`Server`], [`Listener`], [`LimitListener`])
//! - Configuration ([`IoConfig`], [`ClientConfig`], [`ServerConfig`],
//!   [`PoolConfig`]) and the shared [`Error`] type
//!
//! Transports live in their own crates; anything implementing [`ByteStream`]
//! plugs in.

mod attrs;
mod client;
mod codec;
mod config;
mod conn;
mod error;
mod handler;
mod message;
mod pool;
mod server;
mod session;

pub use attrs::AttrKey;
pub use client::{Client, DialFn, DialFuture};
pub use codec::Codec;
pub use config::{ClientConfig, IoConfig, PoolConfig, ServerConfig, DEFAULT_QUEUE_SIZE};
pub use conn::{ByteStream, Conn, ConnReader, ConnWriter};
pub use error::Error;
pub use handler::Handler;
pub use message::{Message, Request};
pub use pool::{ClientFactory, Pool, PooledClient};
pub use server::{LimitListener, Listener, Server};
pub use session::Session;
