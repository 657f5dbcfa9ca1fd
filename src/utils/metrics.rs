//! Per-connection counters.
//!
//! Every connection owns one [`ConnectionStats`]; the engine loops update it
//! with relaxed atomics and [`Connection::stats`](crate::connection::Connection::stats)
//! hands out a [`StatsSnapshot`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

#[derive(Debug)]
pub struct ConnectionStats {
    /// Frames written to the transport
    pub packets_sent: AtomicU64,
    /// Frames read and decoded
    pub packets_received: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
    /// Frames whose wire id was not in the peer table
    pub unknown_packets: AtomicU64,
    /// Handler calls that returned an error or panicked
    pub handler_errors: AtomicU64,
    /// Packets discarded because the unhandled buffer was full
    pub dropped_packets: AtomicU64,
    /// Type-sync requests sent
    pub sync_rounds: AtomicU64,
    pub pings_sent: AtomicU64,
    start_time: Instant,
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self {
            packets_sent: AtomicU64::new(0),
            packets_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            unknown_packets: AtomicU64::new(0),
            handler_errors: AtomicU64::new(0),
            dropped_packets: AtomicU64::new(0),
            sync_rounds: AtomicU64::new(0),
            pings_sent: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn packet_sent(&self, byte_count: usize) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(byte_count as u64, Ordering::Relaxed);
    }

    pub fn packet_received(&self, byte_count: usize) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(byte_count as u64, Ordering::Relaxed);
    }

    pub fn unknown_packet(&self) {
        self.unknown_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn handler_error(&self) {
        self.handler_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn packet_dropped(&self) {
        self.dropped_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn sync_round(&self) {
        self.sync_rounds.fetch_add(1, Ordering::Relaxed);
    }

    pub fn ping_sent(&self) {
        self.pings_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            unknown_packets: self.unknown_packets.load(Ordering::Relaxed),
            handler_errors: self.handler_errors.load(Ordering::Relaxed),
            dropped_packets: self.dropped_packets.load(Ordering::Relaxed),
            sync_rounds: self.sync_rounds.load(Ordering::Relaxed),
            pings_sent: self.pings_sent.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    /// Emit the current counters as one structured `info` event
    pub fn log_stats(&self) {
        let snapshot = self.snapshot();
        info!(
            packets_sent = snapshot.packets_sent,
            packets_received = snapshot.packets_received,
            bytes_sent = snapshot.bytes_sent,
            bytes_received = snapshot.bytes_received,
            unknown_packets = snapshot.unknown_packets,
            handler_errors = snapshot.handler_errors,
            dropped_packets = snapshot.dropped_packets,
            sync_rounds = snapshot.sync_rounds,
            pings_sent = snapshot.pings_sent,
            uptime_seconds = snapshot.uptime_seconds,
            "Connection stats"
        );
    }
}

impl Default for ConnectionStats {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub unknown_packets: u64,
    pub handler_errors: u64,
    pub dropped_packets: u64,
    pub sync_rounds: u64,
    pub pings_sent: u64,
    pub uptime_seconds: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let stats = ConnectionStats::new();
        stats.packet_sent(10);
        stats.packet_sent(6);
        stats.packet_received(32);
        stats.packet_dropped();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.packets_sent, 2);
        assert_eq!(snapshot.bytes_sent, 16);
        assert_eq!(snapshot.packets_received, 1);
        assert_eq!(snapshot.bytes_received, 32);
        assert_eq!(snapshot.dropped_packets, 1);
        assert_eq!(snapshot.unknown_packets, 0);
    }
}
