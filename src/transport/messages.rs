//! MQTT topic layout and JSON payloads.
//!
//! Inbound:
//! - `{prefix}/detections/{video_id}`: one `FrameMessage` per frame
//! - `{prefix}/control/{video_id}`: `{"action": "stop" | "complete"}`
//!
//! Outbound:
//! - `{prefix}/violations/{video_id}`: `ViolationEvent`
//! - `{prefix}/progress/{video_id}`: `ProgressUpdate` / `VideoStatusPayload` (retained)
//! - `{prefix}/status`: `online` / `offline` (retained, last will)

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::detect::{RawDetection, RawFrameDetections};
use crate::event::{VideoInfo, VideoStatus};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Topics {
    prefix: String,
}

/// Inbound topic, borrowed from the topic string.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InboundTopic<'a> {
    Detections(&'a str),
    Control(&'a str),
}

impl Topics {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.trim_matches('/').to_string(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn detections_filter(&self) -> String {
        format!("{}/detections/+", self.prefix)
    }

    pub fn control_filter(&self) -> String {
        format!("{}/control/+", self.prefix)
    }

    pub fn violations(&self, video_id: &str) -> String {
        format!("{}/violations/{}", self.prefix, video_id)
    }

    pub fn progress(&self, video_id: &str) -> String {
        format!("{}/progress/{}", self.prefix, video_id)
    }

    pub fn status(&self) -> String {
        format!("{}/status", self.prefix)
    }

    pub fn classify<'t>(&self, topic: &'t str) -> Option<InboundTopic<'t>> {
        let rest = topic.strip_prefix(self.prefix.as_str())?.strip_prefix('/')?;
        let (kind, video_id) = rest.split_once('/')?;
        if video_id.is_empty() || video_id.contains('/') {
            return None;
        }
        match kind {
            "detections" => Some(InboundTopic::Detections(video_id)),
            "control" => Some(InboundTopic::Control(video_id)),
            _ => None,
        }
    }
}

/// One frame of detector output plus the video's metadata.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FrameMessage {
    /// May be omitted when the topic names the video.
    #[serde(default)]
    pub video_id: String,
    pub frame_number: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fps: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_frames: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(default)]
    pub detections: Vec<RawDetection>,
}

impl FrameMessage {
    /// Parse a payload; `topic_video_id` fills in or must agree with the
    /// payload's `video_id`.
    pub fn parse(payload: &[u8], topic_video_id: Option<&str>) -> Result<Self> {
        let mut msg: FrameMessage =
            serde_json::from_slice(payload).map_err(|e| anyhow!("parse error: {}", e))?;
        match topic_video_id {
            Some(topic_id) if msg.video_id.is_empty() => msg.video_id = topic_id.to_string(),
            Some(topic_id) if msg.video_id != topic_id => {
                return Err(anyhow!(
                    "payload video_id '{}' does not match topic video '{}'",
                    msg.video_id,
                    topic_id
                ))
            }
            _ => {}
        }
        if msg.video_id.is_empty() {
            return Err(anyhow!("frame message without video_id"));
        }
        crate::validate_video_id(&msg.video_id)?;
        Ok(msg)
    }

    pub fn video_info(&self) -> VideoInfo {
        VideoInfo {
            video_id: self.video_id.clone(),
            filename: self.filename.clone(),
            total_frames: self.total_frames,
            fps: self.fps,
            width: self.width,
            height: self.height,
        }
    }

    pub fn into_raw(self) -> RawFrameDetections {
        RawFrameDetections {
            video_id: self.video_id,
            frame_number: self.frame_number,
            timestamp: self.timestamp,
            fps: self.fps,
            detections: self.detections,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlAction {
    /// Cancel: discard buffered frames and open episodes.
    Stop,
    /// End of stream: flush buffered frames, then finish.
    Complete,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlMessage {
    pub action: ControlAction,
}

impl ControlMessage {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        serde_json::from_slice(payload).map_err(|e| anyhow!("invalid control message: {}", e))
    }
}

/// Final state of a video, published on its progress topic.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VideoStatusPayload {
    pub video_id: String,
    pub status: VideoStatus,
    pub violations: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topics_round_trip_through_classify() {
        let topics = Topics::new("/hygiene/");
        assert_eq!(topics.detections_filter(), "hygiene/detections/+");
        assert_eq!(topics.status(), "hygiene/status");
        assert_eq!(
            topics.classify("hygiene/detections/line-1"),
            Some(InboundTopic::Detections("line-1"))
        );
        assert_eq!(
            topics.classify("hygiene/control/line-1"),
            Some(InboundTopic::Control("line-1"))
        );
        assert_eq!(topics.classify("hygiene/violations/line-1"), None);
        assert_eq!(topics.classify("other/detections/line-1"), None);
        assert_eq!(topics.classify("hygiene/detections/a/b"), None);
    }

    #[test]
    fn frame_message_takes_video_from_topic() {
        let payload = br#"{"frame_number": 7, "detections": [
            {"class_name": "hand", "class_id": 0, "confidence": 0.9, "bbox": [1, 2, 3, 4]}
        ]}"#;
        let msg = FrameMessage::parse(payload, Some("line-1")).expect("parse");
        assert_eq!(msg.video_id, "line-1");
        assert_eq!(msg.detections.len(), 1);
        assert_eq!(msg.detections[0].class_id, Some(0));
    }

    #[test]
    fn frame_message_rejects_topic_mismatch() {
        let payload = br#"{"video_id": "line-2", "frame_number": 1}"#;
        assert!(FrameMessage::parse(payload, Some("line-1")).is_err());
        assert!(FrameMessage::parse(payload, None).is_ok());
        assert!(FrameMessage::parse(br#"{"frame_number": 1}"#, None).is_err());
    }

    #[test]
    fn control_actions_parse() {
        assert_eq!(
            ControlMessage::parse(br#"{"action":"stop"}"#).expect("stop").action,
            ControlAction::Stop
        );
        assert_eq!(
            ControlMessage::parse(br#"{"action":"complete"}"#)
                .expect("complete")
                .action,
            ControlAction::Complete
        );
        assert!(ControlMessage::parse(br#"{"action":"pause"}"#).is_err());
    }
}
