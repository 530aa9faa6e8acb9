//! The codec contract: user-defined framing between bytes and messages.

use async_trait::async_trait;
use bytes::Bytes;

use crate::conn::ConnReader;
use crate::error::Error;
use crate::message::Message;
use crate::session::Session;

/// Frames bytes into messages and back. One codec instance is shared by
/// every session of an engine; per-session decode state (an accumulation
/// buffer, a partial header) belongs in the session attribute bag under a
/// codec-owned [`AttrKey`].
///
/// [`AttrKey`]: crate::AttrKey
#[async_trait]
pub trait Codec: Send + Sync + 'static {
    /// Consume bytes from `reader` until one complete message is framed.
    ///
    /// Returning `Ok(None)` means "need more bytes"; the session reader
    /// loops without side effect. Deadline-class errors (see
    /// [`Error::is_timeout`]) must be passed through undisturbed so the
    /// reader can interpret them as idle, and a clean end of stream is
    /// reported as [`Error::PeerClosed`]. Any other error tears the session
    /// down.
    async fn decode(
        &self,
        session: &Session,
        reader: &mut ConnReader,
    ) -> Result<Option<Box<dyn Message>>, Error>;

    /// Serialize one message. Errors terminate the writer task.
    async fn encode(&self, session: &Session, msg: Box<dyn Message>) -> Result<Bytes, Error>;
}
