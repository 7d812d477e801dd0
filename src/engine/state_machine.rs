//! Per-track grab lifecycle: IDLE -> IN_ROI -> LEFT_ROI -> verdict -> IDLE.

use crate::detect::Detection;
use crate::geometry::BBox;
use crate::roi::{Roi, RoiSnapshot};

use super::association::CoLocation;
use super::evaluator::{evaluate, ContactContext, Verdict};
use super::track::{Track, TrackState};
use super::EngineConfig;

/// Read-only view of the frame being applied.
#[derive(Debug, Clone, Copy)]
pub struct FrameContext<'a> {
    pub video_id: &'a str,
    pub frame_number: u64,
    pub timestamp: f64,
    pub rois: &'a RoiSnapshot,
    pub scoopers: &'a [&'a Detection],
    pub pizzas: &'a [&'a Detection],
}

/// What a single step did to a track.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Unchanged,
    EnteredRoi { roi_id: i64 },
    LeftRoi,
    ReturnedToRoi,
    Resolved(Verdict),
    /// LEFT_ROI window elapsed without pizza contact.
    TimedOut,
}

#[derive(Debug, Clone)]
pub struct TrackStateMachine {
    entry_threshold: f32,
    exit_threshold: f32,
    left_roi_window: u64,
    min_scooper_frames: u32,
    colocation: CoLocation,
}

impl TrackStateMachine {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            entry_threshold: config.roi_entry_threshold,
            exit_threshold: config.roi_exit_threshold,
            left_roi_window: config.left_roi_window_frames,
            min_scooper_frames: config.min_scooper_frames,
            colocation: CoLocation::new(config.colocation_min_iou, config.proximity_margin_px),
        }
    }

    /// Advance `track` by one frame.
    ///
    /// `matched` tells whether the track's `last_bbox` was refreshed by a
    /// detection in this frame. Unmatched tracks only age toward timeout.
    pub fn step(&self, track: &mut Track, matched: bool, ctx: &FrameContext<'_>) -> Transition {
        if self.window_elapsed(track, ctx.frame_number) {
            track.close_episode(false);
            return Transition::TimedOut;
        }
        if !matched {
            return Transition::Unchanged;
        }

        let hand = track.last_bbox;
        match track.state {
            TrackState::Idle => match self.roi_entered(&hand, ctx.rois) {
                Some(roi) => {
                    track.enter_roi(roi, ctx.frame_number);
                    self.note_scooper(track, &hand, ctx);
                    Transition::EnteredRoi { roi_id: roi.id }
                }
                None => Transition::Unchanged,
            },
            TrackState::InRoi => {
                self.note_scooper(track, &hand, ctx);
                let Some(rect) = track.visited_roi_rect else {
                    track.close_episode(false);
                    return Transition::Unchanged;
                };
                if hand.coverage_by(&rect) > self.exit_threshold {
                    return Transition::Unchanged;
                }
                track.leave_roi(ctx.frame_number);
                match self.contact(track, &hand, ctx) {
                    Some(verdict) => Transition::Resolved(verdict),
                    None => Transition::LeftRoi,
                }
            }
            TrackState::LeftRoi => {
                self.note_scooper(track, &hand, ctx);
                if let Some(verdict) = self.contact(track, &hand, ctx) {
                    return Transition::Resolved(verdict);
                }
                let back_inside = track
                    .visited_roi_rect
                    .map(|rect| hand.coverage_by(&rect) > self.exit_threshold)
                    .unwrap_or(false);
                if back_inside {
                    track.return_to_roi();
                    return Transition::ReturnedToRoi;
                }
                Transition::Unchanged
            }
        }
    }

    fn window_elapsed(&self, track: &Track, frame_number: u64) -> bool {
        match (track.state, track.roi_exit_frame) {
            (TrackState::LeftRoi, Some(exit)) => {
                frame_number.saturating_sub(exit) > self.left_roi_window
            }
            _ => false,
        }
    }

    /// Best-covered ROI above the entry threshold; earlier snapshot order
    /// wins ties.
    fn roi_entered<'r>(&self, hand: &BBox, rois: &'r RoiSnapshot) -> Option<&'r Roi> {
        let mut best: Option<(&Roi, f32)> = None;
        for roi in rois.rois() {
            let coverage = hand.coverage_by(&roi.rect);
            if coverage <= self.entry_threshold {
                continue;
            }
            if best.map_or(true, |(_, c)| coverage > c) {
                best = Some((roi, coverage));
            }
        }
        best.map(|(roi, _)| roi)
    }

    fn note_scooper(&self, track: &mut Track, hand: &BBox, ctx: &FrameContext<'_>) {
        if let Some(scooper) = self.colocation.best(hand, ctx.scoopers) {
            track.record_scooper(scooper.bbox);
        }
    }

    fn contact(&self, track: &mut Track, hand: &BBox, ctx: &FrameContext<'_>) -> Option<Verdict> {
        let pizza = self.colocation.best(hand, ctx.pizzas)?;
        let (Some(roi_id), Some(roi_enter_frame)) = (track.roi_id_visited, track.roi_enter_frame)
        else {
            track.close_episode(false);
            return None;
        };
        let verdict = evaluate(
            &ContactContext {
                video_id: ctx.video_id,
                frame_number: ctx.frame_number,
                timestamp: ctx.timestamp,
                track_id: track.track_id,
                roi_id,
                roi_enter_frame,
                hand_bbox: *hand,
                pizza_bbox: pizza.bbox,
                scooper_seen_during_grab: track.scooper_seen_during_grab,
                scooper_seen_frame_count: track.scooper_seen_frame_count,
                last_scooper_bbox: track.last_scooper_bbox,
            },
            self.min_scooper_frames,
        );
        track.close_episode(true);
        Some(verdict)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::ObjectClass;

    const ROI: [f32; 4] = [100.0, 150.0, 400.0, 400.0];

    fn machine() -> TrackStateMachine {
        TrackStateMachine::new(&EngineConfig::default())
    }

    fn rois() -> RoiSnapshot {
        RoiSnapshot::from_rois(vec![Roi::new(1, "sauce", BBox::from_tlbr(ROI))], 1)
    }

    fn det(class: ObjectClass, bbox: [f32; 4]) -> Detection {
        Detection::new(class, BBox::from_tlbr(bbox), 0.9, 0, 0.0)
    }

    fn run(
        sm: &TrackStateMachine,
        track: &mut Track,
        frame: u64,
        hand: Option<[f32; 4]>,
        objects: &[Detection],
    ) -> Transition {
        let snapshot = rois();
        let scoopers: Vec<&Detection> = objects
            .iter()
            .filter(|d| d.class == ObjectClass::Scooper)
            .collect();
        let pizzas: Vec<&Detection> = objects
            .iter()
            .filter(|d| d.class == ObjectClass::Pizza)
            .collect();
        if let Some(bbox) = hand {
            track.observe(BBox::from_tlbr(bbox), 0.9, frame);
        }
        let ctx = FrameContext {
            video_id: "v",
            frame_number: frame,
            timestamp: frame as f64 / 30.0,
            rois: &snapshot,
            scoopers: &scoopers,
            pizzas: &pizzas,
        };
        sm.step(track, hand.is_some(), &ctx)
    }

    const IN: [f32; 4] = [200.0, 200.0, 240.0, 240.0];
    const OUT: [f32; 4] = [500.0, 500.0, 540.0, 540.0];
    const PIZZA: [f32; 4] = [480.0, 480.0, 700.0, 700.0];

    #[test]
    fn entry_exit_and_contact_without_scooper_is_violation() {
        let sm = machine();
        let mut track = Track::new(1, BBox::from_tlbr(OUT), 0.9, 0);

        assert_eq!(
            run(&sm, &mut track, 1, Some(IN), &[]),
            Transition::EnteredRoi { roi_id: 1 }
        );
        assert_eq!(run(&sm, &mut track, 2, Some([450.0, 450.0, 470.0, 470.0]), &[]), Transition::LeftRoi);
        match run(&sm, &mut track, 3, Some(OUT), &[det(ObjectClass::Pizza, PIZZA)]) {
            Transition::Resolved(Verdict::Violation(ev)) => assert_eq!(ev.roi_enter_frame, 1),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(track.state, TrackState::Idle);
        assert!(track.cycle_evaluated);
    }

    #[test]
    fn scooper_alongside_hand_in_roi_clears_episode() {
        let sm = machine();
        let mut track = Track::new(1, BBox::from_tlbr(OUT), 0.9, 0);
        run(&sm, &mut track, 1, Some(IN), &[det(ObjectClass::Scooper, [205.0, 205.0, 245.0, 245.0])]);
        assert_eq!(track.scooper_seen_frame_count, 1);
        let outcome = run(&sm, &mut track, 2, Some(OUT), &[det(ObjectClass::Pizza, PIZZA)]);
        assert_eq!(outcome, Transition::Resolved(Verdict::Ok));
    }

    #[test]
    fn left_roi_window_times_out_even_without_observations() {
        let sm = machine();
        let window = EngineConfig::default().left_roi_window_frames;
        let mut track = Track::new(1, BBox::from_tlbr(OUT), 0.9, 0);
        run(&sm, &mut track, 1, Some(IN), &[]);
        run(&sm, &mut track, 2, Some([450.0, 450.0, 470.0, 470.0]), &[]);

        assert_eq!(run(&sm, &mut track, 2 + window, None, &[]), Transition::Unchanged);
        assert_eq!(run(&sm, &mut track, 3 + window, None, &[]), Transition::TimedOut);
        assert_eq!(track.state, TrackState::Idle);
        assert!(!track.cycle_evaluated);
    }

    #[test]
    fn returning_to_roi_keeps_the_episode() {
        let sm = machine();
        let mut track = Track::new(1, BBox::from_tlbr(OUT), 0.9, 0);
        run(&sm, &mut track, 1, Some(IN), &[]);
        run(&sm, &mut track, 2, Some([450.0, 450.0, 470.0, 470.0]), &[]);
        assert_eq!(run(&sm, &mut track, 3, Some(IN), &[]), Transition::ReturnedToRoi);
        assert_eq!(track.roi_enter_frame, Some(1));
        assert_eq!(track.state, TrackState::InRoi);
    }

    #[test]
    fn pizza_contact_while_idle_is_ignored() {
        let sm = machine();
        let mut track = Track::new(1, BBox::from_tlbr(OUT), 0.9, 0);
        let outcome = run(&sm, &mut track, 1, Some(OUT), &[det(ObjectClass::Pizza, PIZZA)]);
        assert_eq!(outcome, Transition::Unchanged);
        assert_eq!(track.state, TrackState::Idle);
    }
}
