//! Line-based echo client for the echo_server example.
//!
//! Run with: `cargo run --example echo_client -p seine`

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use seine::prelude::*;
use seine::tcp::TcpClientConfig;
use seine_testkit::{LineCodec, TextMsg};

struct PrintHandler;

#[async_trait]
impl Handler for PrintHandler {
    async fn on_message(
        &self,
        _session: &Arc<Session>,
        msg: Box<dyn Message>,
    ) -> Result<(), Error> {
        if let Some(text) = msg.downcast_ref::<TextMsg>() {
            println!("echoed: {}", text.0);
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().init();

    let client = seine::tcp::client(&TcpClientConfig::default());
    client.set_codec(Arc::new(LineCodec));
    client.set_handler(Arc::new(PrintHandler));
    client.dial("127.0.0.1:8888").await?;

    for i in 0..5 {
        client.send(TextMsg::new(format!("hello {i}"))).await?;
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    client.close();
    Ok(())
}
