//! Request/reply correlation.
//!
//! Each pending request owns a unique inbox subscription (by sid) and a
//! deadline. A pending entry is resolved exactly once (by its reply, by its
//! deadline or by connection failure) and removed at that moment, so a late
//! reply finds nothing to resolve.

use std::fmt;
use std::time::Instant;

use hashbrown::HashMap;
use tracing::trace;

use relay_core::error::{ClientError, Result};

use crate::message::{Message, Sid};

/// Who gets the outcome of a request.
pub enum Responder {
    /// An awaiting caller.
    Waiter(flume::Sender<Result<Message>>),
    /// A callback invoked once on the engine task.
    Callback(Box<dyn FnOnce(Result<Message>) + Send>),
}

impl Responder {
    pub(crate) fn respond(self, outcome: Result<Message>) {
        match self {
            // The caller may have given up waiting; nothing to do then.
            Self::Waiter(tx) => {
                let _ = tx.send(outcome);
            }
            Self::Callback(callback) => callback(outcome),
        }
    }
}

impl fmt::Debug for Responder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Waiter(_) => f.write_str("Waiter"),
            Self::Callback(_) => f.write_str("Callback"),
        }
    }
}

#[derive(Debug)]
struct Pending {
    inbox: String,
    deadline: Instant,
    responder: Responder,
}

/// Pending requests keyed by their inbox subscription sid.
#[derive(Debug, Default)]
pub struct RequestCorrelator {
    pending: HashMap<Sid, Pending>,
}

impl RequestCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a request published with `reply-to = inbox`.
    pub fn register(&mut self, sid: Sid, inbox: String, deadline: Instant, responder: Responder) {
        trace!("[REQUEST] Pending sid={} inbox={}", sid, inbox);
        self.pending.insert(
            sid,
            Pending {
                inbox,
                deadline,
                responder,
            },
        );
    }

    /// Resolve the request owning `msg.sid` with its reply.
    ///
    /// A "no responders" status reply resolves with
    /// [`ClientError::NoResponders`]. Returns `false` if nothing was pending.
    pub fn resolve(&mut self, msg: Message) -> bool {
        let Some(pending) = self.pending.remove(&msg.sid) else {
            return false;
        };
        trace!("[REQUEST] Reply on {}", pending.inbox);
        let outcome = if msg.is_no_responders() {
            Err(ClientError::NoResponders)
        } else {
            Ok(msg)
        };
        pending.responder.respond(outcome);
        true
    }

    /// Time out every request whose deadline is at or before `now`.
    ///
    /// Returns the sids resolved, so their inbox subscriptions can be dropped.
    pub fn expire(&mut self, now: Instant) -> Vec<Sid> {
        let expired: Vec<Sid> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(sid, _)| *sid)
            .collect();
        for sid in &expired {
            if let Some(pending) = self.pending.remove(sid) {
                trace!("[REQUEST] Timed out on {}", pending.inbox);
                pending.responder.respond(Err(ClientError::Timeout));
            }
        }
        expired
    }

    /// Fail every pending request with `err`.
    pub fn fail_all(&mut self, err: &ClientError) -> Vec<Sid> {
        let sids: Vec<Sid> = self.pending.keys().copied().collect();
        for (_, pending) in self.pending.drain() {
            pending.responder.respond(Err(err.clone()));
        }
        sids
    }

    /// Earliest deadline among pending requests.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|p| p.deadline).min()
    }

    pub fn contains(&self, sid: Sid) -> bool {
        self.pending.contains_key(&sid)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
