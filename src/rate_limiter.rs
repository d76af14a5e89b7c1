use dashmap::DashMap;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// Outcome of [`RateLimiter::check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    /// `notify` is set only on the first denial since the client's last
    /// allowed message, so a flooder costs at most one notice per window.
    Denied { notify: bool },
}

impl RateDecision {
    pub fn is_allowed(self) -> bool {
        matches!(self, RateDecision::Allowed)
    }
}

#[derive(Default)]
struct Window {
    hits: VecDeque<Instant>,
    notified: bool,
}

/// Sliding-window limiter keyed by client id.
///
/// Only allowed messages are recorded, so a client that keeps hammering a
/// closed window is let through again as soon as its oldest allowed message
/// ages out. Windows outlive the client's sockets and are only dropped by
/// [`RateLimiter::prune`] once empty.
pub struct RateLimiter {
    max_messages: usize,
    window: Duration,
    clients: DashMap<String, Window>,
}

impl RateLimiter {
    pub fn new(max_messages: usize, window: Duration) -> Self {
        Self {
            max_messages,
            window,
            clients: DashMap::new(),
        }
    }

    pub fn check(&self, client_id: &str, now: Instant) -> RateDecision {
        let mut entry = self.clients.entry(client_id.to_string()).or_default();
        let window = entry.value_mut();
        evict_expired(&mut window.hits, now, self.window);

        if window.hits.len() < self.max_messages {
            window.hits.push_back(now);
            window.notified = false;
            RateDecision::Allowed
        } else {
            let notify = !window.notified;
            window.notified = true;
            RateDecision::Denied { notify }
        }
    }

    /// Drops clients with nothing left in their window.
    pub fn prune(&self, now: Instant) -> usize {
        let before = self.clients.len();
        self.clients.retain(|_, window| {
            evict_expired(&mut window.hits, now, self.window);
            !window.hits.is_empty()
        });
        before - self.clients.len()
    }

    pub fn tracked_clients(&self) -> usize {
        self.clients.len()
    }
}

fn evict_expired(hits: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(oldest) = hits.front() {
        if now.saturating_duration_since(*oldest) >= window {
            hits.pop_front();
        } else {
            break;
        }
    }
}
