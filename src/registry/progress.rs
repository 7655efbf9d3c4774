//! Progress tracking for blob downloads

use crate::logging::Logger;
use std::time::{Duration, Instant};

const DEFAULT_INTERVAL: Duration = Duration::from_secs(2);
/// Minimum bytes between reports when the total size is unknown
const UNKNOWN_TOTAL_STEP: u64 = 1024 * 1024;

#[derive(Clone)]
pub struct ProgressTracker {
    total_size: Option<u64>,
    transferred: u64,
    start_time: Instant,
    last_update: Instant,
    last_reported: u64,
    interval: Duration,
    output: Logger,
    operation_name: String,
}

impl ProgressTracker {
    pub fn new(total_size: Option<u64>, output: Logger, operation_name: String) -> Self {
        let now = Instant::now();
        Self {
            total_size: total_size.filter(|size| *size > 0),
            transferred: 0,
            start_time: now,
            last_update: now,
            last_reported: 0,
            interval: DEFAULT_INTERVAL,
            output,
            operation_name,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn transferred(&self) -> u64 {
        self.transferred
    }

    /// Record `bytes` more received and report if due
    pub fn advance(&mut self, bytes: u64) {
        self.advance_at(bytes, Instant::now());
    }

    /// Returns whether a progress line was emitted
    pub(crate) fn advance_at(&mut self, bytes: u64, now: Instant) -> bool {
        self.transferred += bytes;
        if !self.should_report(now) {
            return false;
        }

        let elapsed_since_last = now.duration_since(self.last_update);
        let speed = match elapsed_since_last.as_secs() {
            0 => 0,
            secs => (self.transferred - self.last_reported) / secs,
        };
        let amount = match self.total_size {
            Some(total) => format!(
                "{}% ({}/{})",
                (self.transferred as f64 / total as f64 * 100.0).min(100.0) as u8,
                self.output.format_size(self.transferred),
                self.output.format_size(total)
            ),
            None => self.output.format_size(self.transferred),
        };
        self.output.progress(&format!(
            "{}: {} - {}",
            self.operation_name,
            amount,
            self.output.format_speed(speed)
        ));
        self.last_update = now;
        self.last_reported = self.transferred;
        true
    }

    // Both a time interval and a byte step must pass, whichever is coarser.
    fn should_report(&self, now: Instant) -> bool {
        if now.duration_since(self.last_update) < self.interval {
            return false;
        }
        let step = match self.total_size {
            Some(total) => (total / 20).max(1),
            None => UNKNOWN_TOTAL_STEP,
        };
        self.transferred - self.last_reported >= step
    }

    /// Summary line once the body has been fully received
    pub fn finish(&self) {
        let total_elapsed = self.start_time.elapsed();
        let avg_speed = match total_elapsed.as_secs() {
            0 => self.transferred,
            secs => self.transferred / secs,
        };

        self.output.detail(&format!(
            "{} received {} in {} (avg speed: {})",
            self.operation_name,
            self.output.format_size(self.transferred),
            self.output.format_duration(total_elapsed),
            self.output.format_speed(avg_speed)
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(total: Option<u64>) -> ProgressTracker {
        ProgressTracker::new(total, Logger::new_quiet(), "alpine sha256:abc".to_string())
    }

    #[test]
    fn test_no_report_before_interval() {
        let mut progress = tracker(Some(1000));
        let start = progress.last_update;
        assert!(!progress.advance_at(900, start + Duration::from_millis(500)));
        assert!(progress.advance_at(0, start + Duration::from_secs(3)));
    }

    #[test]
    fn test_no_report_below_five_percent() {
        let mut progress = tracker(Some(10_000));
        let start = progress.last_update;
        assert!(!progress.advance_at(100, start + Duration::from_secs(10)));
        assert!(progress.advance_at(400, start + Duration::from_secs(11)));
        assert_eq!(progress.transferred(), 500);
    }

    #[test]
    fn test_unknown_total_uses_byte_step() {
        let mut progress = tracker(None);
        let start = progress.last_update;
        assert!(!progress.advance_at(1024, start + Duration::from_secs(5)));
        assert!(progress.advance_at(UNKNOWN_TOTAL_STEP, start + Duration::from_secs(6)));
    }
}
