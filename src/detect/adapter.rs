//! Detector output normalization.
//!
//! Every raw detection either becomes a `Detection` or is rejected with a
//! reason. A rejected detection never affects the other detections of the
//! same frame.

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

use crate::geometry::BBox;

use super::result::{Detection, FrameDetections, ObjectClass};

/// Detector output as it arrives over the wire.
///
/// Deserializing never fails on the shape of a single entry: an entry that
/// is not a well-typed detection is kept as a placeholder and rejected by
/// the adapter, so its neighbours in the frame survive.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RawDetection {
    pub class_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub class_id: Option<u32>,
    pub confidence: f32,
    pub bbox: [f32; 4],
    #[serde(skip)]
    shape_error: Option<String>,
}

#[derive(Deserialize)]
struct WireDetection {
    class_name: String,
    #[serde(default)]
    class_id: Option<u32>,
    confidence: f32,
    bbox: [f32; 4],
}

impl RawDetection {
    pub fn new(class_name: &str, confidence: f32, bbox: [f32; 4]) -> Self {
        Self {
            class_name: class_name.to_string(),
            class_id: None,
            confidence,
            bbox,
            shape_error: None,
        }
    }

    /// Placeholder for a wire entry that could not be read.
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self {
            class_name: String::new(),
            class_id: None,
            confidence: 0.0,
            bbox: [0.0; 4],
            shape_error: Some(reason.into()),
        }
    }

    pub fn shape_error(&self) -> Option<&str> {
        self.shape_error.as_deref()
    }
}

impl<'de> Deserialize<'de> for RawDetection {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = serde_json::Value::deserialize(deserializer)?;
        Ok(match serde_json::from_value::<WireDetection>(value) {
            Ok(wire) => Self {
                class_name: wire.class_name,
                class_id: wire.class_id,
                confidence: wire.confidence,
                bbox: wire.bbox,
                shape_error: None,
            },
            Err(e) => Self::malformed(e.to_string()),
        })
    }
}

/// One frame of raw detector output for one video.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RawFrameDetections {
    pub video_id: String,
    pub frame_number: u64,
    /// Seconds; derived from `frame_number / fps` when absent.
    #[serde(default)]
    pub timestamp: Option<f64>,
    #[serde(default)]
    pub fps: Option<f64>,
    #[serde(default)]
    pub detections: Vec<RawDetection>,
}

#[derive(Clone, Debug, Error, PartialEq)]
pub enum Rejection {
    #[error("malformed detection: {0}")]
    Malformed(String),
    #[error("unknown class '{0}'")]
    UnknownClass(String),
    #[error("malformed bbox {0:?}")]
    MalformedBox([f32; 4]),
    #[error("confidence {0} outside [0, 1]")]
    ConfidenceOutOfRange(f32),
    #[error("confidence {confidence:.3} below floor {floor:.3}")]
    BelowFloor { confidence: f32, floor: f32 },
}

/// Result of normalizing one frame.
#[derive(Clone, Debug)]
pub struct AdaptedFrame {
    pub frame: FrameDetections,
    pub rejected: Vec<Rejection>,
}

#[derive(Clone, Debug)]
pub struct DetectionAdapter {
    confidence_floor: f32,
    default_fps: f64,
}

impl DetectionAdapter {
    pub fn new(confidence_floor: f32, default_fps: f64) -> Self {
        Self {
            confidence_floor,
            default_fps,
        }
    }

    pub fn confidence_floor(&self) -> f32 {
        self.confidence_floor
    }

    /// Frame timestamp in seconds, preferring the producer's value.
    pub fn timestamp_for(&self, raw: &RawFrameDetections) -> f64 {
        if let Some(ts) = raw.timestamp.filter(|ts| ts.is_finite() && *ts >= 0.0) {
            return ts;
        }
        let fps = raw
            .fps
            .filter(|fps| fps.is_finite() && *fps > 0.0)
            .unwrap_or(self.default_fps);
        raw.frame_number as f64 / fps
    }

    pub fn normalize_one(
        &self,
        raw: &RawDetection,
        frame_number: u64,
        timestamp: f64,
    ) -> Result<Detection, Rejection> {
        if let Some(reason) = raw.shape_error() {
            return Err(Rejection::Malformed(reason.to_string()));
        }
        let class: ObjectClass = raw
            .class_name
            .parse()
            .map_err(Rejection::UnknownClass)?;
        let bbox = BBox::from_tlbr(raw.bbox);
        if !bbox.is_well_formed() {
            return Err(Rejection::MalformedBox(raw.bbox));
        }
        if !raw.confidence.is_finite() || !(0.0..=1.0).contains(&raw.confidence) {
            return Err(Rejection::ConfidenceOutOfRange(raw.confidence));
        }
        if raw.confidence < self.confidence_floor {
            return Err(Rejection::BelowFloor {
                confidence: raw.confidence,
                floor: self.confidence_floor,
            });
        }
        Ok(Detection::new(
            class,
            bbox,
            raw.confidence,
            frame_number,
            timestamp,
        ))
    }

    pub fn normalize_frame(&self, raw: &RawFrameDetections) -> AdaptedFrame {
        let timestamp = self.timestamp_for(raw);
        let mut frame = FrameDetections::new(raw.video_id.clone(), raw.frame_number, timestamp);
        let mut rejected = Vec::new();
        for det in &raw.detections {
            match self.normalize_one(det, raw.frame_number, timestamp) {
                Ok(d) => frame.detections.push(d),
                Err(reason) => {
                    log::debug!(
                        "video={} frame={} dropped detection: {}",
                        raw.video_id,
                        raw.frame_number,
                        reason
                    );
                    rejected.push(reason);
                }
            }
        }
        AdaptedFrame { frame, rejected }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_frame(detections: Vec<RawDetection>) -> RawFrameDetections {
        RawFrameDetections {
            video_id: "vid".to_string(),
            frame_number: 60,
            timestamp: None,
            fps: None,
            detections,
        }
    }

    #[test]
    fn keeps_valid_and_drops_bad_detections_independently() {
        let adapter = DetectionAdapter::new(0.5, 30.0);
        let adapted = adapter.normalize_frame(&raw_frame(vec![
            RawDetection::new("hand", 0.9, [10.0, 10.0, 50.0, 50.0]),
            RawDetection::new("person", 0.9, [0.0, 0.0, 100.0, 200.0]),
            RawDetection::new("scooper", 0.8, [30.0, 30.0, 20.0, 40.0]),
            RawDetection::new("pizza", 0.3, [200.0, 200.0, 300.0, 300.0]),
            RawDetection::new("pizza", 1.7, [200.0, 200.0, 300.0, 300.0]),
            RawDetection::new("Pizza", 0.95, [200.0, 200.0, 300.0, 300.0]),
        ]));

        assert_eq!(adapted.frame.detections.len(), 2);
        assert_eq!(adapted.frame.count(ObjectClass::Hand), 1);
        assert_eq!(adapted.frame.count(ObjectClass::Pizza), 1);
        assert_eq!(adapted.rejected.len(), 4);
        assert_eq!(
            adapted.rejected[0],
            Rejection::UnknownClass("person".to_string())
        );
        assert!(matches!(adapted.rejected[1], Rejection::MalformedBox(_)));
        assert!(matches!(adapted.rejected[2], Rejection::BelowFloor { .. }));
        assert!(matches!(
            adapted.rejected[3],
            Rejection::ConfidenceOutOfRange(_)
        ));
    }

    #[test]
    fn timestamp_derives_from_fps_when_missing() {
        let adapter = DetectionAdapter::new(0.5, 30.0);
        let mut raw = raw_frame(vec![]);
        assert!((adapter.timestamp_for(&raw) - 2.0).abs() < 1e-9);

        raw.fps = Some(15.0);
        assert!((adapter.timestamp_for(&raw) - 4.0).abs() < 1e-9);

        raw.timestamp = Some(1.25);
        assert!((adapter.timestamp_for(&raw) - 1.25).abs() < 1e-9);
    }

    #[test]
    fn raw_detection_deserializes_detector_shape() {
        let json = r#"{"class_id": 1, "class_name": "hand", "confidence": 0.92, "bbox": [1, 2, 3, 4]}"#;
        let raw: RawDetection = serde_json::from_str(json).expect("raw detection");
        assert_eq!(raw.class_id, Some(1));
        assert_eq!(raw.bbox, [1.0, 2.0, 3.0, 4.0]);
        assert!(raw.shape_error().is_none());
    }

    #[test]
    fn misshapen_entries_become_rejections() {
        let json = r#"[
            {"class_name": "hand", "confidence": 0.9, "bbox": [10, 10, 50, 50]},
            {"class_name": "pizza", "confidence": 0.9, "bbox": [1, 2, 3]},
            {"class_name": "pizza", "confidence": 0.9, "bbox": null},
            {"confidence": 0.9, "bbox": [1, 2, 3, 4]},
            "hand"
        ]"#;
        let detections: Vec<RawDetection> = serde_json::from_str(json).expect("detections");
        assert_eq!(detections.len(), 5);

        let adapted = DetectionAdapter::new(0.5, 30.0).normalize_frame(&raw_frame(detections));
        assert_eq!(adapted.frame.count(ObjectClass::Hand), 1);
        assert_eq!(adapted.rejected.len(), 4);
        assert!(adapted
            .rejected
            .iter()
            .all(|r| matches!(r, Rejection::Malformed(_))));
    }
}
