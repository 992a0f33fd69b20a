//! Agent packet statistics.
//!
//! Four monotonic counters covering the life of one agent instance. They are
//! reset only by re-initialization and are safe to read from any thread.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Monotonic packet counters for one agent lifetime.
///
/// * `received` — packets handed to the agent by a transport callback.
/// * `queued` — packets that found a free event queue slot.
/// * `processed` — packets fully handled by the processing loop.
/// * `dropped` — packets lost to a full queue, discarded as duplicates or
///   stale, or drained at shutdown.
#[derive(Debug, Default)]
pub struct AgentStatistics {
    received: AtomicU64,
    queued: AtomicU64,
    processed: AtomicU64,
    dropped: AtomicU64,
}

impl AgentStatistics {
    /// Create a zeroed counter block.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one packet received from a transport.
    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one packet accepted into the event queue.
    pub fn record_queued(&self) {
        self.queued.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one packet fully processed.
    pub fn record_processed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one packet dropped.
    pub fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Packets received so far.
    #[must_use]
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    /// Packets queued so far.
    #[must_use]
    pub fn queued(&self) -> u64 {
        self.queued.load(Ordering::Relaxed)
    }

    /// Packets processed so far.
    #[must_use]
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    /// Packets dropped so far.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Point-in-time copy of all four counters.
    #[must_use]
    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            received: self.received(),
            queued: self.queued(),
            processed: self.processed(),
            dropped: self.dropped(),
        }
    }

    /// Zero all counters.
    pub fn reset(&self) {
        self.received.store(0, Ordering::Relaxed);
        self.queued.store(0, Ordering::Relaxed);
        self.processed.store(0, Ordering::Relaxed);
        self.dropped.store(0, Ordering::Relaxed);
    }
}

/// Point-in-time copy of the agent counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatisticsSnapshot {
    /// Packets received from transports.
    pub received: u64,
    /// Packets accepted into the event queue.
    pub queued: u64,
    /// Packets fully processed.
    pub processed: u64,
    /// Packets dropped.
    pub dropped: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let stats = AgentStatistics::new();
        stats.record_received();
        stats.record_received();
        stats.record_queued();
        stats.record_processed();
        stats.record_dropped();

        let snap = stats.snapshot();
        assert_eq!(snap.received, 2);
        assert_eq!(snap.queued, 1);
        assert_eq!(snap.processed, 1);
        assert_eq!(snap.dropped, 1);
    }

    #[test]
    fn test_reset_zeroes_everything() {
        let stats = AgentStatistics::new();
        stats.record_received();
        stats.record_dropped();
        stats.reset();
        assert_eq!(stats.snapshot(), StatisticsSnapshot::default());
    }
}
