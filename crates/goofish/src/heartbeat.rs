//! Heartbeat liveness tracking for a `Ready` session.
//!
//! A [`HeartbeatTimer`] is created fresh every time a connection enters
//! `Ready` and dropped when it leaves, so beats that would have fired
//! while connecting or reconnecting simply never exist (no backlog is
//! replayed on the next session).
//!
//! The session is declared dead when the oldest unacknowledged ping is
//! older than the timeout. With the default 15s interval and 30s timeout
//! this tolerates one missed beat.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

/// Bound on remembered in-flight ping ids.
const MAX_PENDING: usize = 8;

/// Ping schedule and acknowledgement bookkeeping.
#[derive(Debug)]
pub struct HeartbeatTimer {
    interval: Duration,
    timeout: Duration,
    next_ping: Instant,
    /// Message ids of pings sent and not yet acknowledged, oldest first.
    pending: VecDeque<(String, Instant)>,
    last_sent: Option<Instant>,
    last_ack: Option<Instant>,
}

impl HeartbeatTimer {
    /// Start a timer whose first ping is due immediately.
    pub fn new(interval: Duration, timeout: Duration, now: Instant) -> Self {
        Self {
            interval,
            timeout,
            next_ping: now,
            pending: VecDeque::new(),
            last_sent: None,
            last_ack: None,
        }
    }

    /// When the next ping should go out.
    pub fn next_ping_at(&self) -> Instant {
        self.next_ping
    }

    /// Instant at which the session is declared dead, if a ping is
    /// outstanding.
    pub fn deadline(&self) -> Option<Instant> {
        self.pending.front().map(|(_, sent)| *sent + self.timeout)
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.deadline().is_some_and(|deadline| now >= deadline)
    }

    /// Record a ping written with message id `mid`.
    pub fn on_ping_sent(&mut self, mid: String, now: Instant) {
        if self.pending.len() >= MAX_PENDING {
            // Keep the oldest entry: it carries the deadline.
            self.pending.remove(1);
        }
        self.pending.push_back((mid, now));
        self.last_sent = Some(now);
        self.next_ping = now + self.interval;
    }

    /// Handle a response frame. Returns `true` when `mid` acknowledges a
    /// ping; any acknowledgement proves liveness, so every outstanding
    /// ping is cleared.
    pub fn on_response(&mut self, mid: &str, now: Instant) -> bool {
        if !self.pending.iter().any(|(pending, _)| pending == mid) {
            return false;
        }
        self.pending.clear();
        self.last_ack = Some(now);
        true
    }

    pub fn last_sent(&self) -> Option<Instant> {
        self.last_sent
    }

    pub fn last_ack(&self) -> Option<Instant> {
        self.last_ack
    }

    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }
}
