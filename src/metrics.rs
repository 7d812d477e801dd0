//! Process-wide counters shared by every pipeline, the supervisor and the
//! sinks. Relaxed atomics only; readers get an approximate snapshot.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

#[derive(Debug)]
pub struct PipelineMetrics {
    pub frames_applied: AtomicU64,
    pub frames_dropped: AtomicU64,
    pub detections_rejected: AtomicU64,
    pub tracks_spawned: AtomicU64,
    pub tracks_refused: AtomicU64,
    pub tracks_evicted: AtomicU64,
    pub episodes_discarded: AtomicU64,
    pub roi_entries: AtomicU64,
    pub cleaning_timeouts: AtomicU64,
    pub verdicts_ok: AtomicU64,
    pub violations: AtomicU64,
    pub sink_deliveries: AtomicU64,
    pub sink_failures: AtomicU64,
    pub progress_dropped: AtomicU64,
    pub videos_started: AtomicU64,
    pub videos_failed: AtomicU64,
    pub started_at: Instant,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self {
            frames_applied: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
            detections_rejected: AtomicU64::new(0),
            tracks_spawned: AtomicU64::new(0),
            tracks_refused: AtomicU64::new(0),
            tracks_evicted: AtomicU64::new(0),
            episodes_discarded: AtomicU64::new(0),
            roi_entries: AtomicU64::new(0),
            cleaning_timeouts: AtomicU64::new(0),
            verdicts_ok: AtomicU64::new(0),
            violations: AtomicU64::new(0),
            sink_deliveries: AtomicU64::new(0),
            sink_failures: AtomicU64::new(0),
            progress_dropped: AtomicU64::new(0),
            videos_started: AtomicU64::new(0),
            videos_failed: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    pub fn inc(&self, counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, counter: &AtomicU64, n: u64) {
        if n > 0 {
            counter.fetch_add(n, Ordering::Relaxed);
        }
    }

    pub fn fps(&self) -> f64 {
        let frames = self.frames_applied.load(Ordering::Relaxed);
        let elapsed = self.started_at.elapsed().as_secs_f64();
        if elapsed > 0.01 {
            frames as f64 / elapsed
        } else {
            0.0
        }
    }

    pub fn summary(&self) -> MetricsSummary {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSummary {
            frames_applied: load(&self.frames_applied),
            frames_dropped: load(&self.frames_dropped),
            detections_rejected: load(&self.detections_rejected),
            fps: self.fps(),
            tracks_spawned: load(&self.tracks_spawned),
            tracks_refused: load(&self.tracks_refused),
            tracks_evicted: load(&self.tracks_evicted),
            episodes_discarded: load(&self.episodes_discarded),
            roi_entries: load(&self.roi_entries),
            cleaning_timeouts: load(&self.cleaning_timeouts),
            verdicts_ok: load(&self.verdicts_ok),
            violations: load(&self.violations),
            sink_deliveries: load(&self.sink_deliveries),
            sink_failures: load(&self.sink_failures),
            progress_dropped: load(&self.progress_dropped),
            videos_started: load(&self.videos_started),
            videos_failed: load(&self.videos_failed),
            elapsed_secs: self.started_at.elapsed().as_secs_f64(),
        }
    }
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSummary {
    pub frames_applied: u64,
    pub frames_dropped: u64,
    pub detections_rejected: u64,
    pub fps: f64,
    pub tracks_spawned: u64,
    pub tracks_refused: u64,
    pub tracks_evicted: u64,
    pub episodes_discarded: u64,
    pub roi_entries: u64,
    pub cleaning_timeouts: u64,
    pub verdicts_ok: u64,
    pub violations: u64,
    pub sink_deliveries: u64,
    pub sink_failures: u64,
    pub progress_dropped: u64,
    pub videos_started: u64,
    pub videos_failed: u64,
    pub elapsed_secs: f64,
}
