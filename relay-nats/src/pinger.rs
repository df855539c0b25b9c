//! Keepalive and stale-connection detection.
//!
//! Every `ping_interval` the engine asks [`Pinger::poll`] what to do. Each
//! keepalive PING bumps an outstanding counter; any PONG clears it. When a
//! tick finds `max_outstanding_pings` still unanswered the connection is
//! stale. With the default threshold of 2 that is two intervals after the
//! first unanswered PING.
//!
//! PONGs answer PINGs in order, so explicit `ping()` waiters sit in the same
//! FIFO as keepalive PINGs and are resolved by their own PONG.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use relay_core::error::{ClientError, Result};
use tracing::trace;

/// Waiter for an explicit round trip.
pub type PongWaiter = flume::Sender<Result<()>>;

/// What the engine should do at a timer tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingAction {
    /// Nothing due yet.
    Idle,
    /// Write a keepalive PING.
    SendPing,
    /// Too many PINGs went unanswered.
    Stale,
}

#[derive(Debug)]
pub struct Pinger {
    interval: Duration,
    max_outstanding: u32,
    outstanding: u32,
    next_tick: Option<Instant>,
    in_flight: VecDeque<Option<PongWaiter>>,
    deferred: Vec<PongWaiter>,
}

impl Pinger {
    pub fn new(interval: Duration, max_outstanding: u32) -> Self {
        Self {
            interval,
            max_outstanding,
            outstanding: 0,
            next_tick: None,
            in_flight: VecDeque::new(),
            deferred: Vec::new(),
        }
    }

    /// Arm the timer for a fresh connection.
    pub fn start(&mut self, now: Instant) {
        self.outstanding = 0;
        self.next_tick = (!self.interval.is_zero()).then(|| now + self.interval);
    }

    /// Disarm the timer.
    pub fn stop(&mut self) {
        self.outstanding = 0;
        self.next_tick = None;
    }

    /// When the engine should next call [`Pinger::poll`].
    pub const fn next_deadline(&self) -> Option<Instant> {
        self.next_tick
    }

    /// Unanswered keepalive PINGs.
    pub const fn outstanding(&self) -> u32 {
        self.outstanding
    }

    pub fn poll(&mut self, now: Instant) -> PingAction {
        match self.next_tick {
            Some(tick) if now >= tick => {}
            _ => return PingAction::Idle,
        }

        if self.outstanding >= self.max_outstanding {
            self.stop();
            return PingAction::Stale;
        }

        self.outstanding += 1;
        self.in_flight.push_back(None);
        self.next_tick = Some(now + self.interval);
        trace!("[PING] Keepalive, outstanding={}", self.outstanding);
        PingAction::SendPing
    }

    /// Record an explicit PING that was just written.
    pub fn track(&mut self, waiter: PongWaiter) {
        self.in_flight.push_back(Some(waiter));
    }

    /// Park a waiter until a connection is available.
    pub fn defer(&mut self, waiter: PongWaiter) {
        self.deferred.push(waiter);
    }

    /// Waiters parked while disconnected.
    pub fn take_deferred(&mut self) -> Vec<PongWaiter> {
        std::mem::take(&mut self.deferred)
    }

    /// A PONG arrived.
    pub fn on_pong(&mut self) {
        self.outstanding = 0;
        if let Some(Some(waiter)) = self.in_flight.pop_front() {
            let _ = waiter.send(Ok(()));
        }
    }

    /// The connection carrying in-flight PINGs is gone.
    pub fn fail_in_flight(&mut self, err: &ClientError) {
        for waiter in self.in_flight.drain(..).flatten() {
            let _ = waiter.send(Err(err.clone()));
        }
    }

    /// Fail every waiter, parked or in flight.
    pub fn fail_waiters(&mut self, err: &ClientError) {
        self.fail_in_flight(err);
        for waiter in self.deferred.drain(..) {
            let _ = waiter.send(Err(err.clone()));
        }
    }
}
