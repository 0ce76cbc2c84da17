//! Producer liveness tracker (C2).
//!
//! A single atomic 64-bit nanosecond timestamp. No locking, no allocation.
//! `stamp` is called from the ingress on every `POST /receive`, before the
//! admission check; `elapsed` is read by the scheduler's liveness loop.

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

/// Tracks the last time this replica's paired producer pushed samples.
///
/// Backed by [`Instant`] rather than wall-clock time: the spec calls for a
/// monotonic timestamp, and `Instant` is immune to clock adjustments in a
/// way `SystemTime` is not.
pub struct Liveness {
    epoch: Instant,
    last_receive_ns: AtomicU64,
}

impl Liveness {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            last_receive_ns: AtomicU64::new(0),
        }
    }

    /// Records a receive at `now`. Called on every admitted or
    /// gate-checked POST. Monotonic non-decreasing: an out-of-order store
    /// (possible if two handlers race) is simply ignored.
    pub fn stamp(&self) {
        let now_ns = self.epoch.elapsed().as_nanos() as u64;
        self.last_receive_ns.fetch_max(now_ns, Ordering::Relaxed);
    }

    /// Time elapsed since the last recorded receive. Returns the full
    /// process uptime if no receive has ever been recorded.
    pub fn elapsed(&self) -> Duration {
        let last_ns = self.last_receive_ns.load(Ordering::Relaxed);
        self.epoch.elapsed() - Duration::from_nanos(last_ns)
    }
}

impl Default for Liveness {
    fn default() -> Self {
        Self::new()
    }
}

/// Producer is alive iff `elapsed <= scrape_interval + grace`.
pub fn is_producer_alive(elapsed: Duration, scrape_interval: Duration, grace: Duration) -> bool {
    elapsed <= scrape_interval + grace
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{thread::sleep, time::Duration};

    #[test]
    fn fresh_tracker_reports_full_uptime_as_elapsed() {
        let liveness = Liveness::new();
        sleep(Duration::from_millis(5));
        assert!(liveness.elapsed() >= Duration::from_millis(5));
    }

    #[test]
    fn stamp_resets_elapsed_to_near_zero() {
        let liveness = Liveness::new();
        sleep(Duration::from_millis(10));
        liveness.stamp();
        assert!(liveness.elapsed() < Duration::from_millis(10));
    }

    #[test]
    fn alive_within_window() {
        assert!(is_producer_alive(
            Duration::from_secs(5),
            Duration::from_secs(10),
            Duration::from_secs(10)
        ));
        assert!(!is_producer_alive(
            Duration::from_secs(21),
            Duration::from_secs(10),
            Duration::from_secs(10)
        ));
    }
}
