//! Pipeline counters and frame-rate estimation.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;

/// Lock-free counters shared by every pipeline thread.
#[derive(Debug, Default)]
pub struct PipelineStats {
    frames_delivered: AtomicU64,
    frames_replaced: AtomicU64,
    frames_processed: AtomicU64,
    detection_runs: AtomicU64,
    detection_failures: AtomicU64,
    format_errors: AtomicU64,
    liveness_submitted: AtomicU64,
    liveness_completed: AtomicU64,
    liveness_dropped: AtomicU64,
    liveness_failed: AtomicU64,
    renders: AtomicU64,
}

/// Point-in-time copy of `PipelineStats`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub frames_delivered: u64,
    /// Pending frames overwritten by a newer one before processing.
    pub frames_replaced: u64,
    pub frames_processed: u64,
    pub detection_runs: u64,
    pub detection_failures: u64,
    pub format_errors: u64,
    pub liveness_submitted: u64,
    pub liveness_completed: u64,
    /// Requests rejected because the liveness queue was full.
    pub liveness_dropped: u64,
    pub liveness_failed: u64,
    pub renders: u64,
}

macro_rules! counter {
    ($($method:ident => $field:ident),* $(,)?) => {
        impl PipelineStats {
            $(
                pub fn $method(&self) {
                    self.$field.fetch_add(1, Ordering::Relaxed);
                }
            )*
        }
    };
}

counter! {
    frame_delivered => frames_delivered,
    frame_replaced => frames_replaced,
    frame_processed => frames_processed,
    detection_run => detection_runs,
    detection_failed => detection_failures,
    format_error => format_errors,
    liveness_submitted => liveness_submitted,
    liveness_completed => liveness_completed,
    liveness_dropped => liveness_dropped,
    liveness_failed => liveness_failed,
    rendered => renders,
}

impl PipelineStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        StatsSnapshot {
            frames_delivered: load(&self.frames_delivered),
            frames_replaced: load(&self.frames_replaced),
            frames_processed: load(&self.frames_processed),
            detection_runs: load(&self.detection_runs),
            detection_failures: load(&self.detection_failures),
            format_errors: load(&self.format_errors),
            liveness_submitted: load(&self.liveness_submitted),
            liveness_completed: load(&self.liveness_completed),
            liveness_dropped: load(&self.liveness_dropped),
            liveness_failed: load(&self.liveness_failed),
            renders: load(&self.renders),
        }
    }
}

/// Frames per second over a sliding window.
#[derive(Debug)]
pub struct FpsMeter {
    window: Duration,
    ticks: VecDeque<Instant>,
}

impl FpsMeter {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            ticks: VecDeque::new(),
        }
    }

    pub fn tick(&mut self) -> f32 {
        self.tick_at(Instant::now())
    }

    /// Record a frame at `now` and return the current rate.
    pub fn tick_at(&mut self, now: Instant) -> f32 {
        self.ticks.push_back(now);
        while let Some(&oldest) = self.ticks.front() {
            if now.saturating_duration_since(oldest) > self.window {
                self.ticks.pop_front();
            } else {
                break;
            }
        }
        self.ticks.len() as f32 / self.window.as_secs_f32()
    }
}

impl Default for FpsMeter {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_counters() {
        let stats = PipelineStats::default();
        stats.frame_delivered();
        stats.frame_delivered();
        stats.liveness_dropped();
        let snap = stats.snapshot();
        assert_eq!(snap.frames_delivered, 2);
        assert_eq!(snap.liveness_dropped, 1);
        assert_eq!(snap.renders, 0);
    }

    #[test]
    fn snapshot_serializes_to_json() {
        let stats = PipelineStats::default();
        stats.rendered();
        let json = serde_json::to_value(stats.snapshot()).unwrap();
        assert_eq!(json["renders"], 1);
    }

    #[test]
    fn fps_counts_ticks_inside_window() {
        let mut meter = FpsMeter::new(Duration::from_secs(1));
        let start = Instant::now();
        let mut fps = 0.0;
        for i in 0..30 {
            fps = meter.tick_at(start + Duration::from_millis(i * 33));
        }
        assert_eq!(fps, 30.0);
        // Two seconds later only the new tick remains.
        assert_eq!(meter.tick_at(start + Duration::from_secs(3)), 1.0);
    }
}
