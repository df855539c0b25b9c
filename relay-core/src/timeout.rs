//! Sleeps, timeouts and ticks for the compio runtime.
//!
//! The runtime fires a timer only after every later-expiring timer has
//! expired too, and a cancelled timer keeps its slot until its deadline.
//! One long sleep would hold back every shorter one. Everything here is
//! built from sleeps of at most [`TIMER_GRANULARITY`], so a deadline is
//! missed by at most about one granule no matter what else is pending.
//!
//! Use these instead of `compio::time::{sleep, timeout}` anywhere a
//! duration can exceed the granule.

use std::future::Future;
use std::time::{Duration, Instant};

use futures::future::{select, Either};

use crate::error::{ClientError, Result};

/// Longest single runtime timer this crate ever arms.
pub const TIMER_GRANULARITY: Duration = Duration::from_millis(10);

/// Sleep until `deadline`.
pub async fn sleep_until(deadline: Instant) {
    loop {
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        compio::time::sleep((deadline - now).min(TIMER_GRANULARITY)).await;
    }
}

/// Sleep for `duration`.
///
/// A duration too large to represent as an `Instant` sleeps forever.
pub async fn sleep(duration: Duration) {
    match Instant::now().checked_add(duration) {
        Some(deadline) => sleep_until(deadline).await,
        None => futures::future::pending().await,
    }
}

/// Run `future`, giving up after `duration`.
///
/// # Errors
///
/// [`ClientError::Timeout`] if `duration` elapses first.
pub async fn timeout<F: Future>(duration: Duration, future: F) -> Result<F::Output> {
    let expiry = sleep(duration);
    futures::pin_mut!(future, expiry);
    match select(future, expiry).await {
        Either::Left((output, _)) => Ok(output),
        Either::Right(((), _)) => Err(ClientError::Timeout),
    }
}

/// A tick every [`TIMER_GRANULARITY`] until the receiver is dropped.
///
/// For a task that multiplexes its own deadlines: it checks them on each
/// tick instead of arming a fresh timer per loop iteration. Missed ticks
/// collapse into one.
pub fn ticker() -> flume::Receiver<()> {
    let (tx, rx) = flume::bounded(1);
    compio::runtime::spawn(async move {
        loop {
            compio::time::sleep(TIMER_GRANULARITY).await;
            match tx.try_send(()) {
                Ok(()) | Err(flume::TrySendError::Full(())) => {}
                Err(flume::TrySendError::Disconnected(())) => return,
            }
        }
    })
    .detach();
    rx
}
