//! Records the engine hands to the outside world.
//!
//! Every record here is self-contained: a consumer never needs a follow-up
//! lookup to interpret one.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::geometry::BBox;

pub const VIOLATION_DESCRIPTION: &str = "Hand grabbed from ROI without scooper and placed on pizza";

/// Bounding boxes captured at the moment of pizza contact, keyed by role.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ViolationBoxes {
    pub hand: BBox,
    pub pizza: BBox,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scooper: Option<BBox>,
}

/// Immutable once built. Produced at most once per grab episode.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ViolationEvent {
    /// Hex SHA-256 over `(video_id, track_id, roi_enter_frame)`.
    pub event_id: String,
    pub video_id: String,
    pub frame_number: u64,
    pub timestamp: f64,
    pub track_id: u64,
    pub roi_id: i64,
    pub roi_enter_frame: u64,
    pub boxes: ViolationBoxes,
    pub description: String,
}

impl ViolationEvent {
    /// De-duplication key for at-least-once delivery.
    pub fn dedup_key(video_id: &str, track_id: u64, roi_enter_frame: u64) -> String {
        let mut hasher = Sha256::new();
        hasher.update(video_id.as_bytes());
        hasher.update([0u8]);
        hasher.update(track_id.to_be_bytes());
        hasher.update(roi_enter_frame.to_be_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Periodic processed-frame counters for one video.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub video_id: String,
    pub frames_processed: u64,
    pub frames_dropped: u64,
    pub violations: u64,
}

/// Video metadata carried on incoming frames.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct VideoInfo {
    pub video_id: String,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub total_frames: Option<u64>,
    #[serde(default)]
    pub fps: Option<f64>,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoStatus {
    Processing,
    Completed,
    Cancelled,
    Failed,
}

impl VideoStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }
}

/// Everything that flows from pipelines to sinks.
#[derive(Clone, Debug, PartialEq)]
pub enum SinkMessage {
    VideoStarted(VideoInfo),
    Violation(ViolationEvent),
    Progress(ProgressUpdate),
    VideoFinished {
        video_id: String,
        status: VideoStatus,
        violations: u64,
    },
}

impl SinkMessage {
    pub fn video_id(&self) -> &str {
        match self {
            Self::VideoStarted(info) => &info.video_id,
            Self::Violation(ev) => &ev.video_id,
            Self::Progress(update) => &update.video_id,
            Self::VideoFinished { video_id, .. } => video_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_key_is_stable_and_distinct() {
        let a = ViolationEvent::dedup_key("vid", 3, 11);
        assert_eq!(a, ViolationEvent::dedup_key("vid", 3, 11));
        assert_eq!(a.len(), 64);
        assert_ne!(a, ViolationEvent::dedup_key("vid", 3, 12));
        assert_ne!(a, ViolationEvent::dedup_key("vid", 4, 11));
        assert_ne!(a, ViolationEvent::dedup_key("vid2", 3, 11));
    }

    #[test]
    fn scooper_box_omitted_from_json_when_absent() {
        let boxes = ViolationBoxes {
            hand: BBox::new(0.0, 0.0, 1.0, 1.0),
            pizza: BBox::new(0.0, 0.0, 2.0, 2.0),
            scooper: None,
        };
        let json = serde_json::to_value(&boxes).expect("serialize boxes");
        assert!(json.get("hand").is_some());
        assert!(json.get("pizza").is_some());
        assert!(json.get("scooper").is_none());
    }
}
