//! seine-testkit: shared pieces for exercising seine engines.
//!
//! Provides a newline-framed text codec, a request/response codec over the
//! same framing, counting handlers, in-memory duplex transports, a loopback
//! dialer that spins up a peer session per dial, and a scripted listener for
//! injecting accept failures.
//!
//! Everything here goes through the public engine surface only, so the same
//! pieces work for unit tests and integration suites.

use std::any::Any;
use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio_util::sync::CancellationToken;

use seine_core::{
    AttrKey, ByteStream, Client, ClientConfig, ClientFactory, Codec, ConnReader, DialFn,
    DialFuture, Error, Handler, IoConfig, Listener, Message, Request, Session,
};

/// Install a test subscriber once; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_test_writer()
        .try_init();
}

// ============================================================================
// In-memory transport
// ============================================================================

/// An in-memory duplex pipe as a [`ByteStream`]; no socket addresses.
pub struct MemConn(pub tokio::io::DuplexStream);

impl AsyncRead for MemConn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().0).poll_read(cx, buf)
    }
}

impl AsyncWrite for MemConn {
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

impl ByteStream for MemConn {}

/// A connected pair of in-memory byte streams.
pub fn duplex_pair() -> (Box<dyn ByteStream>, Box<dyn ByteStream>) {
    let (a, b) = tokio::io::duplex(64 * 1024);
    (Box::new(MemConn(a)), Box::new(MemConn(b)))
}

// ============================================================================
// Line codec
// ============================================================================

/// A newline-delimited UTF-8 text message.
pub struct TextMsg(pub String);

impl TextMsg {
    pub fn new(text: impl Into<String>) -> Box<dyn Message> {
        Box::new(Self(text.into()))
    }
}

impl Message for TextMsg {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

static LINE_BUF: AttrKey<BytesMut> = AttrKey::new("testkit.line_buf");

/// Newline framing: each message is one `\n`-terminated line. Partial lines
/// accumulate in the session attribute bag between decode calls.
pub struct LineCodec;

#[async_trait]
impl Codec for LineCodec {
    async fn decode(
        &self,
        session: &Session,
        reader: &mut ConnReader,
    ) -> Result<Option<Box<dyn Message>>, Error> {
        let line = read_line(session, reader, &LINE_BUF).await?;
        Ok(Some(Box::new(TextMsg(line))))
    }

    async fn encode(&self, _session: &Session, msg: Box<dyn Message>) -> Result<Bytes, Error> {
        let text = msg
            .downcast_ref::<TextMsg>()
            .ok_or_else(|| Error::Codec("line codec encodes TextMsg only".into()))?;
        Ok(frame_line(&text.0))
    }
}

fn frame_line(text: &str) -> Bytes {
    let mut out = BytesMut::with_capacity(text.len() + 1);
    out.extend_from_slice(text.as_bytes());
    out.extend_from_slice(b"\n");
    out.freeze()
}

/// Pull one complete line out of the session's scratch buffer, reading more
/// bytes as needed. Deadline errors pass straight through for the session's
/// idle handling.
async fn read_line(
    session: &Session,
    reader: &mut ConnReader,
    key: &AttrKey<BytesMut>,
) -> Result<String, Error> {
    loop {
        if let Some(line) = session.with_attr(key, BytesMut::new, split_line) {
            return Ok(line);
        }
        let mut chunk = [0u8; 4096];
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            let leftover = session.with_attr(key, BytesMut::new, |b| b.len());
            return if leftover == 0 {
                Err(Error::PeerClosed)
            } else {
                Err(Error::Codec("stream ended inside a frame".into()))
            };
        }
        session.with_attr(key, BytesMut::new, |b| b.extend_from_slice(&chunk[..n]));
    }
}

fn split_line(buf: &mut BytesMut) -> Option<String> {
    let pos = buf.iter().position(|&b| b == b'\n')?;
    let line = buf.split_to(pos + 1);
    Some(String::from_utf8_lossy(&line[..pos]).into_owned())
}

// ============================================================================
// Call codec (request/response over line framing)
// ============================================================================

/// A correlated message: `Q <id> <body>` on the wire for requests,
/// `R <id> <body>` for responses.
pub struct CallMsg {
    pub id: u64,
    pub reply: bool,
    pub body: String,
}

impl CallMsg {
    pub fn request(id: u64, body: impl Into<String>) -> Box<dyn Request> {
        Box::new(Self {
            id,
            reply: false,
            body: body.into(),
        })
    }

    pub fn response(id: u64, body: impl Into<String>) -> Box<dyn Message> {
        Box::new(Self {
            id,
            reply: true,
            body: body.into(),
        })
    }
}

impl Message for CallMsg {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn response_id(&self) -> Option<u64> {
        self.reply.then_some(self.id)
    }
}

impl Request for CallMsg {
    fn id(&self) -> u64 {
        self.id
    }
}

static CALL_BUF: AttrKey<BytesMut> = AttrKey::new("testkit.call_buf");

/// Line framing for [`CallMsg`].
pub struct CallCodec;

#[async_trait]
impl Codec for CallCodec {
    async fn decode(
        &self,
        session: &Session,
        reader: &mut ConnReader,
    ) -> Result<Option<Box<dyn Message>>, Error> {
        let line = read_line(session, reader, &CALL_BUF).await?;
        let mut parts = line.splitn(3, ' ');
        let kind = parts.next().unwrap_or_default();
        let id = parts
            .next()
            .and_then(|s| s.parse::<u64>().ok())
            .ok_or_else(|| Error::Codec(format!("bad call frame: {line:?}")))?;
        let body = parts.next().unwrap_or_default().to_string();
        let reply = match kind {
            "Q" => false,
            "R" => true,
            _ => return Err(Error::Codec(format!("bad call frame kind: {line:?}"))),
        };
        Ok(Some(Box::new(CallMsg { id, reply, body })))
    }

    async fn encode(&self, _session: &Session, msg: Box<dyn Message>) -> Result<Bytes, Error> {
        let call = msg
            .downcast_ref::<CallMsg>()
            .ok_or_else(|| Error::Codec("call codec encodes CallMsg only".into()))?;
        let kind = if call.reply { "R" } else { "Q" };
        Ok(frame_line(&format!("{} {} {}", kind, call.id, call.body)))
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// Counts every hook invocation; optionally echoes text messages back.
#[derive(Default)]
pub struct CountingHandler {
    pub connected: AtomicUsize,
    pub disconnected: AtomicUsize,
    pub idle: AtomicUsize,
    pub errors: Mutex<Vec<Error>>,
    pub messages: Mutex<Vec<String>>,
    pub echo: bool,
}

impl CountingHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A handler that echoes every [`TextMsg`] back to its session.
    pub fn echoing() -> Arc<Self> {
        Arc::new(Self {
            echo: true,
            ..Self::default()
        })
    }

    pub fn message_count(&self) -> usize {
        self.messages.lock().len()
    }
}

#[async_trait]
impl Handler for CountingHandler {
    async fn on_connected(&self, _session: &Arc<Session>) -> Result<(), Error> {
        self.connected.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn on_disconnected(&self, _session: &Arc<Session>) {
        self.disconnected.fetch_add(1, Ordering::SeqCst);
    }

    async fn on_idle(&self, _session: &Arc<Session>) -> Result<(), Error> {
        self.idle.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn on_error(&self, _session: &Arc<Session>, err: &Error) {
        self.errors.lock().push(err.clone());
    }

    async fn on_message(&self, session: &Arc<Session>, msg: Box<dyn Message>) -> Result<(), Error> {
        if let Some(text) = msg.downcast_ref::<TextMsg>() {
            self.messages.lock().push(text.0.clone());
            if self.echo {
                session.send(TextMsg::new(text.0.clone())).await?;
            }
        } else if let Some(call) = msg.downcast_ref::<CallMsg>() {
            self.messages.lock().push(call.body.clone());
        }
        Ok(())
    }
}

/// Server-side call handler: answers each request by echoing its body in a
/// response with the same id. Flip `mute` to simulate a silent peer, or set
/// `delay_ms` to answer late.
#[derive(Default)]
pub struct CallResponder {
    pub mute: AtomicBool,
    pub delay_ms: AtomicU64,
    pub served: AtomicUsize,
}

impl CallResponder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn silent() -> Arc<Self> {
        Arc::new(Self {
            mute: AtomicBool::new(true),
            ..Self::default()
        })
    }

    pub fn delayed(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay_ms: AtomicU64::new(delay.as_millis() as u64),
            ..Self::default()
        })
    }
}

#[async_trait]
impl Handler for CallResponder {
    async fn on_message(&self, session: &Arc<Session>, msg: Box<dyn Message>) -> Result<(), Error> {
        let Some(call) = msg.downcast_ref::<CallMsg>() else {
            return Ok(());
        };
        if call.reply || self.mute.load(Ordering::SeqCst) {
            return Ok(());
        }
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.served.fetch_add(1, Ordering::SeqCst);
        session
            .send(CallMsg::response(call.id, call.body.clone()))
            .await
    }
}

// ============================================================================
// Loopback dialer and pool factory
// ============================================================================

/// A [`DialFn`] that builds an in-memory pipe per dial and opens a peer
/// session (with the given codec/handler) on the far end.
pub fn loopback_dialer(
    codec: Arc<dyn Codec>,
    handler: Arc<dyn Handler>,
    io: IoConfig,
) -> DialFn {
    let session_ids = Arc::new(AtomicU64::new(0));
    Arc::new(move |_addr: String| -> DialFuture {
        let codec = codec.clone();
        let handler = handler.clone();
        let io = io.clone();
        let session_ids = session_ids.clone();
        Box::pin(async move {
            let (client_end, server_end) = duplex_pair();
            let id = session_ids.fetch_add(1, Ordering::Relaxed) + 1;
            let peer = Session::new(
                id,
                server_end,
                codec,
                handler,
                io,
                &CancellationToken::new(),
                None,
            );
            tokio::spawn(async move {
                let _ = peer.open().await;
            });
            Ok(client_end)
        })
    })
}

/// Pool factory producing clients already dialed over a loopback pipe.
pub struct LoopbackFactory {
    dialer: DialFn,
    codec: Arc<dyn Codec>,
    client_config: ClientConfig,
    /// Handler shared by every peer session; lets tests observe traffic.
    pub peer_handler: Arc<CountingHandler>,
    pub built: AtomicUsize,
}

impl LoopbackFactory {
    /// Clients speak [`LineCodec`] to an echoing peer.
    pub fn echo() -> Arc<Self> {
        let peer_handler = CountingHandler::echoing();
        Arc::new(Self {
            dialer: loopback_dialer(
                Arc::new(LineCodec),
                peer_handler.clone(),
                IoConfig::default(),
            ),
            codec: Arc::new(LineCodec),
            client_config: ClientConfig::default(),
            peer_handler,
            built: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl ClientFactory for LoopbackFactory {
    async fn new_client(&self) -> Result<Client, Error> {
        self.built.fetch_add(1, Ordering::SeqCst);
        let client = Client::new(self.dialer.clone(), self.client_config.clone());
        client.set_codec(self.codec.clone());
        client.dial("loopback").await?;
        Ok(client)
    }
}

// ============================================================================
// Scripted listener
// ============================================================================

/// One canned accept outcome.
pub enum ScriptedAccept {
    Error(io::ErrorKind),
    Stream(Box<dyn ByteStream>),
}

/// Replays a fixed sequence of accept outcomes, then blocks forever. Used to
/// drive the accept loop's backoff and error paths deterministically.
pub struct ScriptedListener {
    steps: VecDeque<ScriptedAccept>,
}

impl ScriptedListener {
    pub fn new(steps: Vec<ScriptedAccept>) -> Self {
        Self {
            steps: steps.into(),
        }
    }
}

#[async_trait]
impl Listener for ScriptedListener {
    async fn accept(&mut self) -> io::Result<Box<dyn ByteStream>> {
        match self.steps.pop_front() {
            Some(ScriptedAccept::Error(kind)) => Err(kind.into()),
            Some(ScriptedAccept::Stream(stream)) => Ok(stream),
            None => std::future::pending().await,
        }
    }
}

// ============================================================================
// Timing helper
// ============================================================================

/// Poll `cond` until it holds, panicking after five seconds.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        if tokio::time::Instant::now() >= deadline {
            panic!("condition not reached within 5s");
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}
