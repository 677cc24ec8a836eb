//! Shared send budget — a rolling-window rate gate over all workers.
//!
//! The caps come from the external provider, so the counters are
//! process-wide shared state: one atomic increment-and-check per send,
//! never a per-task copy.

use chrono::{DateTime, Duration, Utc};
use outreach_core::clock::Clock;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub struct SendGate {
    clock: Arc<dyn Clock>,
    minute_cap: u64,
    hour_cap: u64,
    minute_count: AtomicU64,
    hour_count: AtomicU64,
    minute_window_start: Mutex<DateTime<Utc>>,
    hour_window_start: Mutex<DateTime<Utc>>,
}

impl SendGate {
    pub fn new(clock: Arc<dyn Clock>, messages_per_minute: u64, messages_per_hour: u64) -> Self {
        let now = clock.now();
        Self {
            clock,
            minute_cap: messages_per_minute,
            hour_cap: messages_per_hour,
            minute_count: AtomicU64::new(0),
            hour_count: AtomicU64::new(0),
            minute_window_start: Mutex::new(now),
            hour_window_start: Mutex::new(now),
        }
    }

    /// Claim one send slot. On denial, returns the seconds until the
    /// exhausted window resets — the call never blocks.
    pub fn try_acquire(&self) -> Result<(), u64> {
        self.maybe_reset_windows();

        let per_min = self.minute_count.fetch_add(1, Ordering::Relaxed);
        let per_hour = self.hour_count.fetch_add(1, Ordering::Relaxed);

        if per_min >= self.minute_cap {
            self.minute_count.fetch_sub(1, Ordering::Relaxed);
            self.hour_count.fetch_sub(1, Ordering::Relaxed);
            return Err(self.seconds_until(&self.minute_window_start, Duration::seconds(60)));
        }
        if per_hour >= self.hour_cap {
            self.minute_count.fetch_sub(1, Ordering::Relaxed);
            self.hour_count.fetch_sub(1, Ordering::Relaxed);
            return Err(self.seconds_until(&self.hour_window_start, Duration::seconds(3600)));
        }
        Ok(())
    }

    pub fn sends_this_minute(&self) -> u64 {
        self.minute_count.load(Ordering::Relaxed)
    }

    fn maybe_reset_windows(&self) {
        let now = self.clock.now();
        {
            let mut start = self.minute_window_start.lock();
            if now - *start >= Duration::seconds(60) {
                self.minute_count.store(0, Ordering::Relaxed);
                *start = now;
            }
        }
        {
            let mut start = self.hour_window_start.lock();
            if now - *start >= Duration::seconds(3600) {
                self.hour_count.store(0, Ordering::Relaxed);
                *start = now;
            }
        }
    }

    fn seconds_until(&self, window_start: &Mutex<DateTime<Utc>>, window: Duration) -> u64 {
        let reset_at = *window_start.lock() + window;
        (reset_at - self.clock.now()).num_seconds().max(1) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use outreach_core::clock::manual_clock;

    #[test]
    fn test_minute_cap_denies_with_retry_after() {
        let clock = manual_clock(Utc::now());
        let gate = SendGate::new(clock.clone(), 2, 100);

        assert!(gate.try_acquire().is_ok());
        assert!(gate.try_acquire().is_ok());

        let retry_after = gate.try_acquire().unwrap_err();
        assert!(retry_after >= 1 && retry_after <= 60);
        // Denied acquire must not consume budget.
        assert_eq!(gate.sends_this_minute(), 2);
    }

    #[test]
    fn test_window_rollover_readmits() {
        let clock = manual_clock(Utc::now());
        let gate = SendGate::new(clock.clone(), 1, 100);

        assert!(gate.try_acquire().is_ok());
        assert!(gate.try_acquire().is_err());

        clock.advance(Duration::seconds(61));
        assert!(gate.try_acquire().is_ok());
    }

    #[test]
    fn test_hour_cap_outlives_minute_windows() {
        let clock = manual_clock(Utc::now());
        let gate = SendGate::new(clock.clone(), 100, 3);

        for _ in 0..3 {
            assert!(gate.try_acquire().is_ok());
            clock.advance(Duration::seconds(61));
        }
        let retry_after = gate.try_acquire().unwrap_err();
        assert!(retry_after > 60);

        clock.advance(Duration::seconds(3601));
        assert!(gate.try_acquire().is_ok());
    }
}
