//! Line-based echo server.
//!
//! Run with: `cargo run --example echo_server -p seine`
//! Then connect with the echo_client example (or `nc 127.0.0.1 8888`).

use std::sync::Arc;

use async_trait::async_trait;
use seine::prelude::*;
use seine_testkit::{LineCodec, TextMsg};

struct EchoHandler;

#[async_trait]
impl Handler for EchoHandler {
    async fn on_connected(&self, session: &Arc<Session>) -> Result<(), Error> {
        tracing::info!(peer = ?session.peer_addr(), "session connected");
        Ok(())
    }

    async fn on_disconnected(&self, session: &Arc<Session>) {
        tracing::info!(peer = ?session.peer_addr(), stats = %session, "session disconnected");
    }

    async fn on_error(&self, _session: &Arc<Session>, err: &Error) {
        tracing::warn!(err = %err, "session error");
    }

    async fn on_message(
        &self,
        session: &Arc<Session>,
        msg: Box<dyn Message>,
    ) -> Result<(), Error> {
        let text = msg
            .downcast_ref::<TextMsg>()
            .ok_or_else(|| Error::Codec("expected a text line".into()))?;
        tracing::info!(line = %text.0, "recv");
        session.send(TextMsg::new(text.0.clone())).await
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().init();

    let server = Server::new(ServerConfig::default());
    server.set_codec(Arc::new(LineCodec));
    server.set_handler(Arc::new(EchoHandler));

    let addr = "127.0.0.1:8888";
    tracing::info!(addr, "echo server listening");
    seine::tcp::listen_and_serve(&server, addr).await?;
    Ok(())
}
