//! Per-video violation engine.
//!
//! A `VideoPipeline` owns one `TrackTable` and applies frames strictly in
//! frame-number order: associate hands to tracks, step every track's state
//! machine against the current ROI snapshot, evaluate pizza contacts, then
//! prune stale tracks.

pub mod association;
pub mod evaluator;
pub mod pipeline;
pub mod reorder;
pub mod state_machine;
pub mod table;
pub mod track;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

pub use association::{greedy_match, AssignmentResult, CoLocation};
pub use evaluator::{evaluate, ContactContext, Verdict};
pub use pipeline::VideoPipeline;
pub use reorder::{FrameDrop, ReorderBuffer};
pub use state_machine::{FrameContext, TrackStateMachine, Transition};
pub use table::{SpawnOutcome, TrackTable};
pub use track::{Track, TrackState};

/// Policy constants for one pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Frames per second used to derive timestamps the producer omitted.
    pub fps: f64,
    pub confidence_floor: f32,
    /// Minimum IoU (exclusive) for a hand detection to continue a track.
    pub hand_match_iou: f32,
    /// Minimum IoU (exclusive) for scooper/pizza co-location.
    pub colocation_min_iou: f32,
    /// Pixels added around the hand box before co-location tests.
    pub proximity_margin_px: f32,
    /// Fraction of the hand inside an ROI (exclusive) that opens an episode.
    pub roi_entry_threshold: f32,
    /// Fraction of the hand inside the visited ROI (inclusive) that counts
    /// as having left it.
    pub roi_exit_threshold: f32,
    pub min_scooper_frames: u32,
    pub left_roi_window_frames: u64,
    pub track_ttl_frames: u64,
    pub max_tracks: usize,
    pub reorder_depth: usize,
    pub roi_refresh_frames: u64,
    pub progress_interval_frames: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            fps: 30.0,
            confidence_floor: 0.5,
            hand_match_iou: 0.3,
            colocation_min_iou: 0.0,
            proximity_margin_px: 0.0,
            roi_entry_threshold: 0.3,
            roi_exit_threshold: 0.0,
            min_scooper_frames: 1,
            left_roi_window_frames: 90,
            track_ttl_frames: 15,
            max_tracks: 16,
            reorder_depth: 4,
            roi_refresh_frames: 30,
            progress_interval_frames: 30,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.fps.is_finite() && self.fps > 0.0) {
            return Err(anyhow!("fps must be positive (got {})", self.fps));
        }
        for (name, value) in [
            ("confidence_floor", self.confidence_floor),
            ("hand_match_iou", self.hand_match_iou),
            ("colocation_min_iou", self.colocation_min_iou),
            ("roi_entry_threshold", self.roi_entry_threshold),
            ("roi_exit_threshold", self.roi_exit_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(anyhow!("{} must be within [0, 1] (got {})", name, value));
            }
        }
        if self.roi_exit_threshold > self.roi_entry_threshold {
            return Err(anyhow!(
                "roi_exit_threshold ({}) must not exceed roi_entry_threshold ({})",
                self.roi_exit_threshold,
                self.roi_entry_threshold
            ));
        }
        if !(self.proximity_margin_px.is_finite() && self.proximity_margin_px >= 0.0) {
            return Err(anyhow!(
                "proximity_margin_px must be non-negative (got {})",
                self.proximity_margin_px
            ));
        }
        if self.min_scooper_frames == 0 {
            return Err(anyhow!("min_scooper_frames must be at least 1"));
        }
        if self.max_tracks == 0 {
            return Err(anyhow!("max_tracks must be at least 1"));
        }
        if self.progress_interval_frames == 0 || self.roi_refresh_frames == 0 {
            return Err(anyhow!(
                "progress_interval_frames and roi_refresh_frames must be at least 1"
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        EngineConfig::default().validate().expect("defaults are valid");
    }

    #[test]
    fn exit_threshold_above_entry_is_rejected() {
        let config = EngineConfig {
            roi_entry_threshold: 0.2,
            roi_exit_threshold: 0.4,
            ..EngineConfig::default()
        };
        let err = config.validate().expect_err("inverted hysteresis");
        assert!(err.to_string().contains("roi_exit_threshold"));
    }

    #[test]
    fn partial_engine_section_keeps_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"left_roi_window_frames": 45}"#).expect("parse");
        assert_eq!(config.left_roi_window_frames, 45);
        assert_eq!(config.track_ttl_frames, 15);
    }
}
