use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::geometry::BBox;

/// Object classes the engine reasons about.
///
/// The detector may emit other labels (e.g. `person`); those never become a
/// `Detection`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectClass {
    Hand,
    Scooper,
    Pizza,
}

impl ObjectClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hand => "hand",
            Self::Scooper => "scooper",
            Self::Pizza => "pizza",
        }
    }
}

impl FromStr for ObjectClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "hand" => Ok(Self::Hand),
            "scooper" => Ok(Self::Scooper),
            "pizza" => Ok(Self::Pizza),
            other => Err(other.to_string()),
        }
    }
}

impl std::fmt::Display for ObjectClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One observed object in one frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub class: ObjectClass,
    pub bbox: BBox,
    pub confidence: f32,
    pub frame_number: u64,
    /// Seconds since the start of the video.
    pub timestamp: f64,
}

impl Detection {
    pub fn new(
        class: ObjectClass,
        bbox: BBox,
        confidence: f32,
        frame_number: u64,
        timestamp: f64,
    ) -> Self {
        Self {
            class,
            bbox,
            confidence,
            frame_number,
            timestamp,
        }
    }
}

/// All accepted detections for one frame of one video.
#[derive(Clone, Debug, PartialEq)]
pub struct FrameDetections {
    pub video_id: String,
    pub frame_number: u64,
    pub timestamp: f64,
    pub detections: Vec<Detection>,
}

impl FrameDetections {
    pub fn new(video_id: impl Into<String>, frame_number: u64, timestamp: f64) -> Self {
        Self {
            video_id: video_id.into(),
            frame_number,
            timestamp,
            detections: Vec::new(),
        }
    }

    pub fn of_class(&self, class: ObjectClass) -> impl Iterator<Item = &Detection> + '_ {
        self.detections.iter().filter(move |d| d.class == class)
    }

    pub fn count(&self, class: ObjectClass) -> usize {
        self.of_class(class).count()
    }
}
