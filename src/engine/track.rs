use serde::Serialize;

use crate::geometry::BBox;
use crate::roi::Roi;

/// Per-hand grab lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrackState {
    /// Not inside an ROI, no open episode.
    #[default]
    Idle,
    /// Inside the visited ROI.
    InRoi,
    /// Left the visited ROI, waiting for pizza contact or timeout.
    LeftRoi,
}

/// Hypothesis that a sequence of hand detections is one physical hand.
#[derive(Debug, Clone, PartialEq)]
pub struct Track {
    pub track_id: u64,
    pub state: TrackState,
    pub last_bbox: BBox,
    pub last_confidence: f32,
    pub first_seen_frame: u64,
    pub last_seen_frame: u64,
    pub roi_id_visited: Option<i64>,
    /// Rectangle of the visited ROI as it was at entry.
    pub visited_roi_rect: Option<BBox>,
    pub roi_enter_frame: Option<u64>,
    pub roi_exit_frame: Option<u64>,
    pub scooper_seen_during_grab: bool,
    pub scooper_seen_frame_count: u32,
    pub last_scooper_bbox: Option<BBox>,
    pub cycle_evaluated: bool,
}

impl Track {
    pub fn new(track_id: u64, bbox: BBox, confidence: f32, frame_number: u64) -> Self {
        Self {
            track_id,
            state: TrackState::Idle,
            last_bbox: bbox,
            last_confidence: confidence,
            first_seen_frame: frame_number,
            last_seen_frame: frame_number,
            roi_id_visited: None,
            visited_roi_rect: None,
            roi_enter_frame: None,
            roi_exit_frame: None,
            scooper_seen_during_grab: false,
            scooper_seen_frame_count: 0,
            last_scooper_bbox: None,
            cycle_evaluated: false,
        }
    }

    pub fn observe(&mut self, bbox: BBox, confidence: f32, frame_number: u64) {
        self.last_bbox = bbox;
        self.last_confidence = confidence;
        self.last_seen_frame = frame_number;
    }

    /// Consecutive frames since the last matched detection.
    pub fn frames_unseen(&self, frame_number: u64) -> u64 {
        frame_number.saturating_sub(self.last_seen_frame)
    }

    /// True while an episode is in flight (IN_ROI or LEFT_ROI).
    pub fn has_open_episode(&self) -> bool {
        self.state != TrackState::Idle
    }

    pub(crate) fn enter_roi(&mut self, roi: &Roi, frame_number: u64) {
        self.state = TrackState::InRoi;
        self.roi_id_visited = Some(roi.id);
        self.visited_roi_rect = Some(roi.rect);
        self.roi_enter_frame = Some(frame_number);
        self.roi_exit_frame = None;
        self.scooper_seen_during_grab = false;
        self.scooper_seen_frame_count = 0;
        self.last_scooper_bbox = None;
        self.cycle_evaluated = false;
    }

    pub(crate) fn record_scooper(&mut self, scooper: BBox) {
        self.scooper_seen_during_grab = true;
        self.scooper_seen_frame_count = self.scooper_seen_frame_count.saturating_add(1);
        self.last_scooper_bbox = Some(scooper);
    }

    pub(crate) fn leave_roi(&mut self, frame_number: u64) {
        self.state = TrackState::LeftRoi;
        self.roi_exit_frame = Some(frame_number);
    }

    /// Back inside the visited ROI before the episode resolved.
    pub(crate) fn return_to_roi(&mut self) {
        self.state = TrackState::InRoi;
        self.roi_exit_frame = None;
    }

    pub(crate) fn close_episode(&mut self, evaluated: bool) {
        self.state = TrackState::Idle;
        self.cycle_evaluated = evaluated;
    }
}
