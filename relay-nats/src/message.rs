//! Delivered messages.

use bytes::Bytes;

/// Subscription identifier, unique per client.
pub type Sid = u64;

/// Status code servers put in a header-only reply when nobody is subscribed.
pub const NO_RESPONDERS_STATUS: u16 = 503;

/// A message delivered to a subscription or a request.
///
/// # Examples
///
/// ```
/// use relay_nats::message::Message;
/// use bytes::Bytes;
///
/// let msg = Message::new("orders.created", 7, Bytes::from_static(b"{\"id\":1}"));
/// assert_eq!(msg.subject, "orders.created");
/// assert!(msg.reply.is_none());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Subject the message was published to.
    pub subject: String,
    /// Subscription that matched it.
    pub sid: Sid,
    /// Reply-to subject, if the publisher expects an answer.
    pub reply: Option<String>,
    /// Raw payload.
    pub payload: Bytes,
    /// Raw header block (HMSG only), including the `NATS/1.0` status line.
    pub headers: Option<Bytes>,
    /// Status code from the header status line, if any.
    pub status: Option<u16>,
    /// Payload decoded as UTF-8 when `utf8_convert` is enabled.
    pub text: Option<String>,
}

impl Message {
    /// Create a plain message.
    pub fn new(subject: impl Into<String>, sid: Sid, payload: Bytes) -> Self {
        Self {
            subject: subject.into(),
            sid,
            reply: None,
            payload,
            headers: None,
            status: None,
            text: None,
        }
    }

    /// Set the reply-to subject.
    #[must_use]
    pub fn with_reply(mut self, reply: impl Into<String>) -> Self {
        self.reply = Some(reply.into());
        self
    }

    /// Whether this is the server's "no responders" notification.
    pub fn is_no_responders(&self) -> bool {
        self.status == Some(NO_RESPONDERS_STATUS) && self.payload.is_empty()
    }

    /// Fill [`Message::text`] from the payload.
    pub(crate) fn convert_utf8(&mut self) {
        self.text = Some(String::from_utf8_lossy(&self.payload).into_owned());
    }
}
