//! Countdown / expiry tracking for virtual accounts.
//!
//! The wall-clock expiry is anchored to the runtime's monotonic clock once,
//! when tracking starts. From then on the remaining time is derived from
//! [`tokio::time::Instant`], so the tracker follows paused test clocks too.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::debug;

/// Label shown once the account can no longer be paid.
pub const EXPIRED_LABEL: &str = "Expired";

/// Remaining time for a time-limited resource.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Countdown {
    pub remaining_label: String,
    pub is_expired: bool,
}

impl Countdown {
    pub fn expired() -> Self {
        Self {
            remaining_label: EXPIRED_LABEL.to_string(),
            is_expired: true,
        }
    }

    /// `None` or zero remaining time means expired.
    pub fn from_remaining(remaining: Option<Duration>) -> Self {
        match remaining {
            Some(remaining) if !remaining.is_zero() => Self {
                remaining_label: format_remaining(remaining),
                is_expired: false,
            },
            _ => Self::expired(),
        }
    }

    /// Countdown at wall-clock `now`. A missing expiry fails safe to expired.
    pub fn between(expires_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Self {
        let remaining = expires_at.and_then(|expires_at| (expires_at - now).to_std().ok());
        Self::from_remaining(remaining)
    }
}

/// Render `1h 2m 3s`, dropping zero-valued leading units. Seconds always show.
///
/// Partial seconds round up so a live countdown never reads `0s`.
pub fn format_remaining(remaining: Duration) -> String {
    let mut secs = remaining.as_secs();
    if remaining.subsec_nanos() > 0 {
        secs += 1;
    }

    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

/// Map a wall-clock expiry onto the runtime clock.
pub fn deadline_for(expires_at: Option<DateTime<Utc>>) -> Instant {
    let now = Instant::now();
    match expires_at.map(|expires_at| (expires_at - Utc::now()).to_std()) {
        Some(Ok(remaining)) => now + remaining,
        _ => now,
    }
}

/// Live countdown refreshed on a fixed cadence.
///
/// Owns one background task; dropping the tracker aborts it.
pub struct ExpiryTracker {
    deadline: Instant,
    refresh: Duration,
    rx: watch::Receiver<Countdown>,
    handle: JoinHandle<()>,
}

impl ExpiryTracker {
    /// Start tracking `expires_at`. Must be called inside a Tokio runtime.
    pub fn spawn(expires_at: Option<DateTime<Utc>>, refresh: Duration) -> Self {
        Self::spawn_until(deadline_for(expires_at), refresh)
    }

    /// Start tracking an already-anchored deadline.
    pub fn spawn_until(deadline: Instant, refresh: Duration) -> Self {
        let initial = Countdown::from_remaining(deadline.checked_duration_since(Instant::now()));
        let (tx, rx) = watch::channel(initial);
        let handle = tokio::spawn(refresh_loop(tx, deadline, refresh));

        Self {
            deadline,
            refresh,
            rx,
            handle,
        }
    }

    /// Point the tracker at a different expiry, cancelling the old schedule.
    pub fn retarget(&mut self, expires_at: Option<DateTime<Utc>>) {
        self.handle.abort();
        *self = Self::spawn(expires_at, self.refresh);
    }

    pub fn current(&self) -> Countdown {
        self.rx.borrow().clone()
    }

    pub fn is_expired(&self) -> bool {
        self.rx.borrow().is_expired
    }

    pub fn watch(&self) -> watch::Receiver<Countdown> {
        self.rx.clone()
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Detached expiry signal, usable from another task.
    pub fn signal(&self) -> ExpirySignal {
        ExpirySignal {
            rx: self.rx.clone(),
            deadline: self.deadline,
        }
    }

    /// Resolves once the tracker reports expiry.
    pub async fn expired(&self) {
        self.signal().fired().await
    }

    /// Cancel the refresh schedule.
    pub fn stop(&self) {
        self.handle.abort();
    }
}

impl Drop for ExpiryTracker {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Resolves when the tracker it came from reports expiry.
#[derive(Clone)]
pub struct ExpirySignal {
    rx: watch::Receiver<Countdown>,
    deadline: Instant,
}

impl ExpirySignal {
    /// Whether expiry has already been reached, without waiting.
    pub fn has_fired(&self) -> bool {
        self.rx.borrow().is_expired || Instant::now() >= self.deadline
    }

    pub async fn fired(mut self) {
        loop {
            if self.rx.borrow_and_update().is_expired {
                return;
            }
            if self.rx.changed().await.is_err() {
                // Refresh task is gone; fall back to the raw deadline
                sleep_until(self.deadline).await;
                return;
            }
        }
    }
}

async fn refresh_loop(tx: watch::Sender<Countdown>, deadline: Instant, refresh: Duration) {
    loop {
        let now = Instant::now();
        let countdown = Countdown::from_remaining(deadline.checked_duration_since(now));
        let expired = countdown.is_expired;
        tx.send_replace(countdown);

        if expired {
            debug!("Countdown reached expiry");
            return;
        }

        sleep_until((now + refresh).min(deadline)).await;
    }
}
