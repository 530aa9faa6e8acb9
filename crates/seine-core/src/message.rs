//! Message contracts.
//!
//! A message is whatever the codec produces and consumes; the engine never
//! looks inside one except to ask for correlation ids.

use std::any::Any;
use std::fmt;

/// An opaque unit of traffic. Produced by [`Codec::decode`], consumed by
/// [`Codec::encode`], delivered to [`Handler::on_message`].
///
/// A message type that answers outstanding requests reports the request id it
/// settles through [`Message::response_id`]; everything else keeps the
/// default and is forwarded to the user handler untouched.
///
/// [`Codec::decode`]: crate::Codec::decode
/// [`Codec::encode`]: crate::Codec::encode
/// [`Handler::on_message`]: crate::Handler::on_message
pub trait Message: Send + Any {
    /// Upcast so handlers can downcast to the concrete message type.
    fn as_any(&self) -> &dyn Any;

    /// The id of the request this message answers, if it answers one.
    fn response_id(&self) -> Option<u64> {
        None
    }
}

impl dyn Message {
    /// Downcast a received message to its concrete type.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }
}

impl fmt::Debug for dyn Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("dyn Message").finish_non_exhaustive()
    }
}

/// A message that expects a reply, keyed by a caller-chosen id.
///
/// Ids need to be unique only within one client's outstanding set; the
/// correlation table lives per engine, not per process.
pub trait Request: Message {
    /// Correlation id the peer must echo in its response.
    fn id(&self) -> u64;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Ping(&'static str);

    impl Message for Ping {
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[test]
    fn downcast_round_trip() {
        let msg: Box<dyn Message> = Box::new(Ping("hello"));
        assert_eq!(msg.downcast_ref::<Ping>().unwrap().0, "hello");
        assert!(msg.downcast_ref::<String>().is_none());
        assert_eq!(msg.response_id(), None);
    }
}
