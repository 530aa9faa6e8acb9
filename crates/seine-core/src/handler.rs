//! The event handler contract.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Error;
use crate::message::Message;
use crate::session::Session;

/// Lifecycle and message hooks invoked by a session. All hooks may be slow;
/// a stalled `on_message` only backs up the inbound queue, it never stalls
/// the decoder's idle detection.
///
/// Every hook except `on_message` has a no-op default, so handlers implement
/// only what they care about.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Fired once the session's tasks are running. Returning an error closes
    /// the session immediately.
    async fn on_connected(&self, _session: &Arc<Session>) -> Result<(), Error> {
        Ok(())
    }

    /// Fired exactly once per session, after all three tasks have exited and
    /// both queues are closed.
    async fn on_disconnected(&self, _session: &Arc<Session>) {}

    /// Fired by the reader when a read deadline expires with no message
    /// framed. Returning an error terminates the reader (and the session).
    async fn on_idle(&self, _session: &Arc<Session>) -> Result<(), Error> {
        Ok(())
    }

    /// Fired at most once per terminal session error, including panics
    /// converted to [`Error::Internal`].
    async fn on_error(&self, _session: &Arc<Session>, _err: &Error) {}

    /// Fired for each inbound message, in decode order. Returning an error
    /// terminates the delivery task (and the session).
    async fn on_message(
        &self,
        session: &Arc<Session>,
        msg: Box<dyn Message>,
    ) -> Result<(), Error>;
}
