//! Aggregate progress computation: smoothed speed/ETA and the throttling
//! policy that decides when a `Progress` event is actually emitted.

use crate::event::ProgressSnapshot;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

const SPEED_SAMPLE_WINDOW: usize = 10;
const MIN_EMIT_INTERVAL: Duration = Duration::from_millis(1000);
const MIN_PERCENT_DELTA: f64 = 1.0;

/// Tracks the running totals and speed samples needed to produce
/// [`ProgressSnapshot`]s, and decides when a `Progress` event should fire.
pub struct ProgressTracker {
    total_size: u64,
    start: Instant,
    last_sample: Option<(Instant, u64)>,
    speed_samples: VecDeque<f64>,
    last_emit: Option<Instant>,
    last_emitted_percent: f64,
}

impl ProgressTracker {
    pub fn new(total_size: u64) -> Self {
        Self {
            total_size,
            start: Instant::now(),
            last_sample: None,
            speed_samples: VecDeque::with_capacity(SPEED_SAMPLE_WINDOW),
            last_emit: None,
            last_emitted_percent: -1.0,
        }
    }

    /// Recomputes the snapshot for `downloaded_bytes` and pushes a new
    /// instantaneous speed sample onto the smoothing window.
    pub fn sample(&mut self, downloaded_bytes: u64) -> ProgressSnapshot {
        let downloaded_bytes = downloaded_bytes.min(self.total_size);
        let now = Instant::now();

        if let Some((prev_time, prev_bytes)) = self.last_sample {
            let elapsed_ms = now.duration_since(prev_time).as_millis().max(1) as f64;
            let delta = downloaded_bytes.saturating_sub(prev_bytes) as f64;
            let instantaneous = delta / elapsed_ms * 1000.0;
            if self.speed_samples.len() == SPEED_SAMPLE_WINDOW {
                self.speed_samples.pop_front();
            }
            self.speed_samples.push_back(instantaneous);
        }
        self.last_sample = Some((now, downloaded_bytes));

        let percent = if self.total_size == 0 {
            0.0
        } else {
            (downloaded_bytes as f64 / self.total_size as f64 * 100.0).min(100.0)
        };

        let speed = if self.speed_samples.is_empty() {
            0.0
        } else {
            self.speed_samples.iter().sum::<f64>() / self.speed_samples.len() as f64
        };

        let remaining = self.total_size.saturating_sub(downloaded_bytes) as f64;
        let eta = if speed > 0.0 { remaining / speed } else { 0.0 };

        ProgressSnapshot {
            total_bytes: self.total_size,
            downloaded_bytes,
            percent,
            speed,
            eta,
        }
    }

    /// Whether a `Progress` event should be emitted for `snapshot` right
    /// now: forced, or a ≥1% change, or ≥1000ms since the last emission.
    pub fn should_emit(&mut self, snapshot: &ProgressSnapshot, forced: bool) -> bool {
        let now = Instant::now();
        let percent_delta = (snapshot.percent - self.last_emitted_percent).abs();
        let time_elapsed = self
            .last_emit
            .map(|t| now.duration_since(t) >= MIN_EMIT_INTERVAL)
            .unwrap_or(true);

        if forced || percent_delta >= MIN_PERCENT_DELTA || time_elapsed {
            self.last_emit = Some(now);
            self.last_emitted_percent = snapshot.percent;
            true
        } else {
            false
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_never_exceeds_100() {
        let mut tracker = ProgressTracker::new(100);
        let snapshot = tracker.sample(1000);
        assert_eq!(snapshot.percent, 100.0);
        assert_eq!(snapshot.downloaded_bytes, 100);
    }

    #[test]
    fn eta_is_zero_without_samples() {
        let mut tracker = ProgressTracker::new(100);
        let snapshot = tracker.sample(0);
        assert_eq!(snapshot.eta, 0.0);
        assert_eq!(snapshot.speed, 0.0);
    }

    #[test]
    fn percent_is_zero_for_zero_total_size() {
        let mut tracker = ProgressTracker::new(0);
        let snapshot = tracker.sample(0);
        assert_eq!(snapshot.percent, 0.0);
    }

    #[test]
    fn forced_emission_bypasses_throttling() {
        let mut tracker = ProgressTracker::new(1000);
        let snapshot = tracker.sample(10);
        assert!(tracker.should_emit(&snapshot, true));
        // Immediately after, a non-forced call with an unchanged snapshot
        // should be throttled.
        assert!(!tracker.should_emit(&snapshot, false));
    }

    #[test]
    fn percent_delta_of_one_forces_emission() {
        let mut tracker = ProgressTracker::new(1000);
        let first = tracker.sample(10);
        assert!(tracker.should_emit(&first, true));
        let second = tracker.sample(20); // +1.0%
        assert!(tracker.should_emit(&second, false));
    }
}
