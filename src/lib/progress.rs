//! Progress logging at record-count intervals.

use log::info;
use std::sync::atomic::{AtomicU64, Ordering};

/// Thread-safe counter that logs when the count crosses interval boundaries.
///
/// # Example
///
/// ```
/// use readforge_lib::progress::ProgressTracker;
///
/// let tracker = ProgressTracker::new("Read alignments").with_interval(1_000_000);
/// for _ in 0..10 {
///     tracker.inc(1);
/// }
/// tracker.log_final();
/// ```
pub struct ProgressTracker {
    interval: u64,
    message: String,
    count: AtomicU64,
}

impl ProgressTracker {
    /// Creates a tracker with a default interval of 1,000,000 records.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self { interval: 1_000_000, message: message.into(), count: AtomicU64::new(0) }
    }

    /// Sets the logging interval.
    #[must_use]
    pub fn with_interval(mut self, interval: u64) -> Self {
        self.interval = interval.max(1);
        self
    }

    /// Adds to the count, logging each interval boundary crossed.
    pub fn inc(&self, additional: u64) {
        let prev = self.count.fetch_add(additional, Ordering::Relaxed);
        let new_count = prev + additional;
        for i in (prev / self.interval + 1)..=(new_count / self.interval) {
            info!("{} {}", self.message, i * self.interval);
        }
    }

    /// Current count.
    #[must_use]
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Logs the final count if it did not land exactly on an interval.
    pub fn log_final(&self) {
        let count = self.count.load(Ordering::Relaxed);
        if count % self.interval != 0 {
            info!("{} {} (complete)", self.message, count);
        }
    }
}
