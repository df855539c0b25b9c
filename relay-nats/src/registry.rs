//! Subscription registry.
//!
//! Sole owner of every live subscription. The engine routes each inbound
//! `MSG` here by sid; after a reconnect the registry re-emits its SUBs (and
//! remaining auto-unsubscribe bounds) so the server state matches ours.

use std::collections::BTreeMap;
use std::fmt;

use bytes::BytesMut;
use tracing::{debug, trace};

use crate::codec::ClientOp;
use crate::message::{Message, Sid};

/// Where a subscription's messages go.
pub enum Sink {
    /// Handed to a [`Subscriber`](crate::client::Subscriber).
    Channel(flume::Sender<Message>),
    /// Invoked on the engine task, one message at a time.
    Callback(Box<dyn FnMut(Message) + Send>),
    /// Routed to the request correlator.
    Request,
}

impl fmt::Debug for Sink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Channel(_) => f.write_str("Channel"),
            Self::Callback(_) => f.write_str("Callback"),
            Self::Request => f.write_str("Request"),
        }
    }
}

/// One registered subscription.
#[derive(Debug)]
pub struct Subscription {
    subject: String,
    queue_group: Option<String>,
    sink: Sink,
    max_messages: Option<u64>,
    received: u64,
}

impl Subscription {
    pub fn new(subject: impl Into<String>, queue_group: Option<String>, sink: Sink) -> Self {
        Self {
            subject: subject.into(),
            queue_group,
            sink,
            max_messages: None,
            received: 0,
        }
    }

    #[must_use]
    pub fn with_max_messages(mut self, max: Option<u64>) -> Self {
        self.max_messages = max;
        self
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn queue_group(&self) -> Option<&str> {
        self.queue_group.as_deref()
    }

    pub const fn max_messages(&self) -> Option<u64> {
        self.max_messages
    }

    pub const fn received(&self) -> u64 {
        self.received
    }

    fn is_exhausted(&self) -> bool {
        self.max_messages.is_some_and(|max| self.received >= max)
    }
}

/// Outcome of routing one message.
#[derive(Debug, PartialEq, Eq)]
pub enum Dispatch {
    /// Delivered to a channel or callback.
    Delivered,
    /// Belongs to a pending request.
    Request(Message),
    /// No subscription with that sid (already unsubscribed).
    Dropped,
    /// The subscriber handle was dropped; the subscription has been removed
    /// and the server should be told.
    ReceiverGone(Sid),
}

/// Subject → subscription bookkeeping, keyed by sid.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    subs: BTreeMap<Sid, Subscription>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscription under `sid`.
    pub fn insert(&mut self, sid: Sid, sub: Subscription) {
        trace!("[REGISTRY] Insert sid={} subject={}", sid, sub.subject);
        self.subs.insert(sid, sub);
    }

    /// Drop a subscription. Returns it if it existed.
    pub fn remove(&mut self, sid: Sid) -> Option<Subscription> {
        self.subs.remove(&sid)
    }

    /// Bound a subscription to `max` total messages.
    ///
    /// Returns `false` (and removes the entry) when that bound is already
    /// met, or when the sid is unknown.
    pub fn limit(&mut self, sid: Sid, max: u64) -> bool {
        let Some(sub) = self.subs.get_mut(&sid) else {
            return false;
        };
        sub.max_messages = Some(max);
        if sub.is_exhausted() {
            self.subs.remove(&sid);
            return false;
        }
        true
    }

    pub fn get(&self, sid: Sid) -> Option<&Subscription> {
        self.subs.get(&sid)
    }

    pub fn contains(&self, sid: Sid) -> bool {
        self.subs.contains_key(&sid)
    }

    pub fn len(&self) -> usize {
        self.subs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subs.is_empty()
    }

    /// Route an inbound message to its subscription.
    ///
    /// Reaching `max_messages` removes the subscription; later messages for
    /// the same sid are dropped.
    pub fn dispatch(&mut self, msg: Message) -> Dispatch {
        let sid = msg.sid;
        let Some(sub) = self.subs.get_mut(&sid) else {
            trace!("[REGISTRY] Dropping message for unknown sid={}", sid);
            return Dispatch::Dropped;
        };

        sub.received += 1;
        let exhausted = sub.is_exhausted();

        let outcome = match &mut sub.sink {
            Sink::Channel(tx) => match tx.send(msg) {
                Ok(()) => Dispatch::Delivered,
                Err(_) => {
                    debug!("[REGISTRY] Subscriber for sid={} dropped", sid);
                    self.subs.remove(&sid);
                    return Dispatch::ReceiverGone(sid);
                }
            },
            Sink::Callback(callback) => {
                callback(msg);
                Dispatch::Delivered
            }
            Sink::Request => Dispatch::Request(msg),
        };

        if exhausted {
            trace!("[REGISTRY] sid={} reached its message limit", sid);
            self.subs.remove(&sid);
        }
        outcome
    }

    /// Append SUB (and UNSUB for bounded subscriptions) for every entry.
    ///
    /// Sids are replayed in ascending order, so the server sees them in the
    /// order they were created.
    pub fn replay_all(&self, dst: &mut BytesMut) {
        for (sid, sub) in &self.subs {
            // Encoding SUB/UNSUB never fails; only CONNECT serializes JSON.
            let _ = ClientOp::Sub {
                subject: &sub.subject,
                queue_group: sub.queue_group.as_deref(),
                sid: *sid,
            }
            .encode(dst);
            if let Some(max) = sub.max_messages {
                let _ = ClientOp::Unsub {
                    sid: *sid,
                    max: Some(max - sub.received),
                }
                .encode(dst);
            }
        }
        debug!("[REGISTRY] Replayed {} subscription(s)", self.subs.len());
    }

    /// Remove everything. Channel subscribers observe end-of-stream.
    pub fn close_all(&mut self) {
        self.subs.clear();
    }
}
