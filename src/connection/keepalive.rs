//! Ping bookkeeping and round-trip time.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::connection::relock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum KeepAliveAction {
    Idle,
    /// Send a ping now
    Ping,
    /// The outstanding ping was not answered within the timeout
    Expired,
}

#[derive(Debug, Default)]
struct PingState {
    last_sent: Option<Instant>,
    outstanding: bool,
}

/// At most one ping is outstanding at any time
#[derive(Debug, Default)]
pub(crate) struct KeepAlive {
    state: Mutex<PingState>,
    rtt_micros: AtomicU64,
}

impl KeepAlive {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Decide what the write loop should do at `now`
    pub(crate) fn poll(&self, now: Instant, interval: Duration, timeout: Duration) -> KeepAliveAction {
        let mut state = relock(&self.state);
        match state.last_sent {
            Some(sent) if state.outstanding => {
                if now.saturating_duration_since(sent) > timeout {
                    KeepAliveAction::Expired
                } else {
                    KeepAliveAction::Idle
                }
            }
            Some(sent) if now.saturating_duration_since(sent) < interval => KeepAliveAction::Idle,
            _ => {
                state.last_sent = Some(now);
                state.outstanding = true;
                KeepAliveAction::Ping
            }
        }
    }

    /// Record a ping response. Returns the measured round-trip time, or
    /// `None` if no ping was outstanding.
    pub(crate) fn pong(&self, now: Instant) -> Option<Duration> {
        let mut state = relock(&self.state);
        if !state.outstanding {
            return None;
        }
        state.outstanding = false;
        let rtt = now.saturating_duration_since(state.last_sent?);
        self.rtt_micros
            .store(rtt.as_micros().min(u64::MAX as u128) as u64, Ordering::Relaxed);
        Some(rtt)
    }

    pub(crate) fn rtt(&self) -> Duration {
        Duration::from_micros(self.rtt_micros.load(Ordering::Relaxed))
    }

    pub(crate) fn ping(&self) -> Duration {
        self.rtt() / 2
    }
}
