//! Line-based progress tracking for sync passes.
//!
//! The dry-run line count is only an estimate of the work the real pass will
//! report, so percentages are clamped and a zero estimate never divides.

use serde::Serialize;
use std::time::{Duration, Instant};

/// Progress of a running sync, in units (output lines)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncProgress {
    /// Units reported so far
    pub completed_units: u64,

    /// Units estimated by the dry-run
    pub total_units: u64,

    /// Percentage complete (0-100)
    pub percent_complete: f64,

    /// Current rate in units/second
    pub units_per_second: u64,

    /// Estimated time remaining (seconds)
    pub eta_seconds: u64,
}

impl SyncProgress {
    pub fn new(total_units: u64) -> Self {
        Self {
            completed_units: 0,
            total_units,
            percent_complete: 0.0,
            units_per_second: 0,
            eta_seconds: 0,
        }
    }

    /// Update with the number of completed units
    pub fn update(&mut self, completed_units: u64) {
        self.completed_units = completed_units;
        self.percent_complete = percent(completed_units, self.total_units);
    }

    pub fn is_complete(&self) -> bool {
        self.completed_units >= self.total_units
    }
}

/// Percentage of `completed` over `total`, clamped to 0..=100.
///
/// A zero total yields 0.0.
pub fn percent(completed: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    ((completed as f64 / total as f64) * 100.0).min(100.0)
}

/// Progress tracker with time-based rate calculation.
///
/// The rate is averaged over the whole run. rsync emits lines in bursts
/// between large files, so a per-callback rate swings between huge values
/// and zero.
pub struct ProgressTracker {
    start_time: Instant,
    progress: SyncProgress,
}

impl ProgressTracker {
    pub fn new(total_units: u64) -> Self {
        Self {
            start_time: Instant::now(),
            progress: SyncProgress::new(total_units),
        }
    }

    /// Update progress and recompute rate and ETA
    pub fn update(&mut self, completed_units: u64) -> &SyncProgress {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        let rate = if elapsed > 0.0 {
            completed_units as f64 / elapsed
        } else {
            0.0
        };

        let remaining = self.progress.total_units.saturating_sub(completed_units);
        self.progress.units_per_second = rate as u64;
        // Unknown until the first unit completes
        self.progress.eta_seconds = if rate > 0.0 {
            (remaining as f64 / rate).ceil() as u64
        } else {
            0
        };

        self.progress.update(completed_units);
        &self.progress
    }
}

/// Rate limiter for progress output (4 updates per second by default)
pub struct ProgressThrottle {
    last_emit: Option<Instant>,
    interval: Duration,
}

impl ProgressThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            last_emit: None,
            interval,
        }
    }

    /// True if an update should be emitted now. The first call always is.
    pub fn ready(&mut self) -> bool {
        let now = Instant::now();
        match self.last_emit {
            Some(last) if now.duration_since(last) < self.interval => false,
            _ => {
                self.last_emit = Some(now);
                true
            }
        }
    }
}

impl Default for ProgressThrottle {
    fn default() -> Self {
        Self::new(Duration::from_millis(250))
    }
}

/// Format duration as human-readable string
pub fn format_duration(seconds: u64) -> String {
    if seconds < 60 {
        format!("{}s", seconds)
    } else if seconds < 3600 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else {
        format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_sync_progress_update() {
        let mut progress = SyncProgress::new(200);
        progress.update(50);
        assert_eq!(progress.completed_units, 50);
        assert!((progress.percent_complete - 25.0).abs() < 0.01);
        assert!(!progress.is_complete());
    }

    #[test]
    fn test_zero_estimate_does_not_divide() {
        let mut progress = SyncProgress::new(0);
        progress.update(0);
        assert_eq!(progress.percent_complete, 0.0);
        progress.update(7);
        assert_eq!(progress.percent_complete, 0.0);
        assert!(progress.is_complete());
    }

    #[test]
    fn test_percent_is_clamped_when_estimate_is_low() {
        assert_eq!(percent(150, 100), 100.0);
        assert!((percent(1, 3) - 33.333).abs() < 0.01);
    }

    #[test]
    fn test_progress_tracker_rate() {
        let mut tracker = ProgressTracker::new(1000);
        assert_eq!(tracker.update(0).eta_seconds, 0);

        thread::sleep(Duration::from_millis(100));
        let progress = tracker.update(60);
        assert_eq!(progress.completed_units, 60);
        assert!(progress.units_per_second > 0);
        assert!(progress.eta_seconds > 0);
    }

    #[test]
    fn test_eta_after_burst_then_slow_line() {
        let mut tracker = ProgressTracker::new(100);
        for completed in 0..3 {
            tracker.update(completed);
        }

        thread::sleep(Duration::from_millis(1500));
        let progress = tracker.update(3);
        assert!(progress.units_per_second <= 2);
        // 97 units left at no more than 2 units/s
        assert!(progress.eta_seconds >= 48, "eta {}", progress.eta_seconds);
    }

    #[test]
    fn test_eta_is_zero_when_done() {
        let mut tracker = ProgressTracker::new(10);
        thread::sleep(Duration::from_millis(20));
        let progress = tracker.update(10);
        assert_eq!(progress.eta_seconds, 0);
        assert!(progress.is_complete());
    }

    #[test]
    fn test_throttle() {
        let mut throttle = ProgressThrottle::new(Duration::from_secs(3600));
        assert!(throttle.ready());
        assert!(!throttle.ready());

        let mut eager = ProgressThrottle::new(Duration::ZERO);
        assert!(eager.ready());
        assert!(eager.ready());
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(30), "30s");
        assert_eq!(format_duration(90), "1m 30s");
        assert_eq!(format_duration(3665), "1h 1m");
    }
}
