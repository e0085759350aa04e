//! Shared time source.
//!
//! Gate expiry, collapse timers and hazard cycles are all functions of one
//! clock that every participant reads; the relay's clock is the reference and
//! participants track their offset to it.

use std::cell::Cell;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub trait Clock {
    /// Current shared time in milliseconds.
    fn now_ms(&self) -> u64;
}

/// Local wall clock in milliseconds since the Unix epoch.
pub fn get_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis() as u64
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        get_timestamp()
    }
}

/// Wall clock corrected toward the relay's clock.
#[derive(Debug, Default)]
pub struct SyncedClock {
    offset_ms: Cell<i64>,
    round_trip_ms: Cell<u64>,
}

impl SyncedClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds in a ping/pong exchange: `sent_at` and `received_at` are local
    /// times, `server_time` is the relay's clock when it answered.
    pub fn observe(&self, sent_at: u64, server_time: u64, received_at: u64) {
        let rtt = received_at.saturating_sub(sent_at);
        let estimated_local = sent_at + rtt / 2;
        self.offset_ms
            .set(server_time as i64 - estimated_local as i64);
        self.round_trip_ms.set(rtt);
    }

    pub fn offset_ms(&self) -> i64 {
        self.offset_ms.get()
    }

    pub fn round_trip_ms(&self) -> u64 {
        self.round_trip_ms.get()
    }
}

impl Clock for SyncedClock {
    fn now_ms(&self) -> u64 {
        (get_timestamp() as i64 + self.offset_ms.get()).max(0) as u64
    }
}

/// Hand-driven clock for deterministic tests and replays.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Cell<u64>,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now: Cell::new(start_ms),
        }
    }

    pub fn set(&self, ms: u64) {
        self.now.set(ms);
    }

    pub fn advance(&self, ms: u64) {
        self.now.set(self.now.get() + ms);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_timestamp_advances() {
        let t1 = get_timestamp();
        std::thread::sleep(Duration::from_millis(2));
        let t2 = get_timestamp();
        assert!(t2 > t1);
    }

    #[test]
    fn test_synced_clock_offset() {
        let clock = SyncedClock::new();
        // Sent at 1000, answered with 5050, received at 1100: one-way 50ms.
        clock.observe(1000, 5050, 1100);
        assert_eq!(clock.offset_ms(), 4000);
        assert_eq!(clock.round_trip_ms(), 100);
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(10);
        clock.advance(5);
        assert_eq!(clock.now_ms(), 15);
        clock.set(100);
        assert_eq!(clock.now_ms(), 100);
    }
}
