//! The verdict rule. Pure: no I/O, no clock, no shared state.

use crate::event::{ViolationBoxes, ViolationEvent, VIOLATION_DESCRIPTION};
use crate::geometry::BBox;

/// Everything known about a track at the moment its hand touches a pizza.
#[derive(Debug, Clone, PartialEq)]
pub struct ContactContext<'a> {
    pub video_id: &'a str,
    pub frame_number: u64,
    pub timestamp: f64,
    pub track_id: u64,
    pub roi_id: i64,
    pub roi_enter_frame: u64,
    pub hand_bbox: BBox,
    pub pizza_bbox: BBox,
    pub scooper_seen_during_grab: bool,
    pub scooper_seen_frame_count: u32,
    pub last_scooper_bbox: Option<BBox>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Ok,
    Violation(ViolationEvent),
}

impl Verdict {
    pub fn is_violation(&self) -> bool {
        matches!(self, Verdict::Violation(_))
    }
}

/// A grab is a violation when the scooper was co-located for fewer than
/// `min_scooper_frames` frames of the episode.
pub fn evaluate(ctx: &ContactContext<'_>, min_scooper_frames: u32) -> Verdict {
    if ctx.scooper_seen_frame_count >= min_scooper_frames.max(1) {
        return Verdict::Ok;
    }
    Verdict::Violation(ViolationEvent {
        event_id: ViolationEvent::dedup_key(ctx.video_id, ctx.track_id, ctx.roi_enter_frame),
        video_id: ctx.video_id.to_string(),
        frame_number: ctx.frame_number,
        timestamp: ctx.timestamp,
        track_id: ctx.track_id,
        roi_id: ctx.roi_id,
        roi_enter_frame: ctx.roi_enter_frame,
        boxes: ViolationBoxes {
            hand: ctx.hand_bbox,
            pizza: ctx.pizza_bbox,
            scooper: ctx.last_scooper_bbox,
        },
        description: VIOLATION_DESCRIPTION.to_string(),
    })
}
