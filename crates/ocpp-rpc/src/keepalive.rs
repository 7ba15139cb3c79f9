//! Keepalive ping scheduling.
//!
//! Pure state machine; the peer task drives it from its timer arm and feeds
//! it pong and activity observations.

use std::time::Duration;

use tokio::time::Instant;

/// What the peer must do when the ping timer fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PingAction {
    /// Transmit a ping frame.
    Send,
    /// The previous ping went unanswered; close 1002 "Ping timeout".
    Timeout,
}

pub(crate) struct Keepalive {
    interval: Duration,
    defer_on_activity: bool,
    next_ping_due: Instant,
    pending_pong: bool,
    last_ping_sent: Option<Instant>,
}

impl Keepalive {
    pub(crate) fn new(interval: Duration, defer_on_activity: bool, now: Instant) -> Self {
        Self {
            interval,
            defer_on_activity,
            next_ping_due: now + interval,
            pending_pong: false,
            last_ping_sent: None,
        }
    }

    /// When the timer arm should next wake.
    pub(crate) fn next_due(&self) -> Instant {
        self.next_ping_due
    }

    pub(crate) fn is_due(&self, now: Instant) -> bool {
        now >= self.next_ping_due
    }

    /// The timer fired.
    pub(crate) fn on_fire(&mut self, now: Instant) -> PingAction {
        if self.pending_pong {
            return PingAction::Timeout;
        }
        self.pending_pong = true;
        self.last_ping_sent = Some(now);
        self.next_ping_due = now + self.interval;
        PingAction::Send
    }

    /// A pong arrived; returns the measured round-trip when one is known.
    pub(crate) fn on_pong(&mut self, now: Instant) -> Option<Duration> {
        self.pending_pong = false;
        self.last_ping_sent.map(|sent| now - sent)
    }

    /// Traffic moved on the link; defers the next ping when configured.
    ///
    /// An outstanding pong stays outstanding: deferral must not mask a dead
    /// peer that happens to sit behind a chatty one.
    pub(crate) fn on_activity(&mut self, now: Instant) {
        if self.defer_on_activity {
            self.next_ping_due = now + self.interval;
        }
    }
}
