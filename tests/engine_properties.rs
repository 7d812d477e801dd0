use std::sync::atomic::Ordering;
use std::sync::Arc;

use hygiene_kernel::{
    BBox, Detection, EngineConfig, FrameDetections, ObjectClass, PipelineMetrics, Roi,
    RoiRegistry, SinkMessage, TrackState, VideoPipeline, ViolationEvent,
};

const VIDEO: &str = "line-1";
const ROI: [f32; 4] = [100.0, 150.0, 400.0, 400.0];
const PIZZA: [f32; 4] = [455.0, 180.0, 650.0, 330.0];
/// Fully right of the ROI, 13px short of the pizza.
const OUTSIDE: [f32; 4] = [402.0, 200.0, 442.0, 240.0];
/// 37.5% of the hand inside the ROI.
const INSIDE: [f32; 4] = [385.0, 200.0, 425.0, 240.0];
/// Touching the pizza.
const ON_PIZZA: [f32; 4] = [420.0, 200.0, 460.0, 240.0];
const SCOOPER: [f32; 4] = [380.0, 190.0, 430.0, 250.0];

/// Policy sets every property must hold under.
fn threshold_sets() -> Vec<EngineConfig> {
    vec![
        EngineConfig::default(),
        EngineConfig {
            hand_match_iou: 0.2,
            roi_entry_threshold: 0.2,
            proximity_margin_px: 10.0,
            min_scooper_frames: 3,
            left_roi_window_frames: 30,
            ..EngineConfig::default()
        },
        EngineConfig {
            hand_match_iou: 0.35,
            roi_entry_threshold: 0.35,
            roi_exit_threshold: 0.05,
            track_ttl_frames: 5,
            reorder_depth: 0,
            ..EngineConfig::default()
        },
    ]
}

struct Harness {
    pipeline: VideoPipeline,
    registry: Arc<RoiRegistry>,
    metrics: Arc<PipelineMetrics>,
    out: Vec<SinkMessage>,
}

impl Harness {
    fn new(config: EngineConfig, rois: Vec<Roi>) -> Self {
        let metrics = Arc::new(PipelineMetrics::new());
        let registry = Arc::new(RoiRegistry::with_rois(rois));
        Self {
            pipeline: VideoPipeline::new(VIDEO, config, Arc::clone(&registry), Arc::clone(&metrics)),
            registry,
            metrics,
            out: Vec::new(),
        }
    }

    fn with_roi(config: EngineConfig) -> Self {
        Self::new(config, vec![Roi::new(1, "sauce", BBox::from_tlbr(ROI))])
    }

    fn frame(&mut self, n: u64, hand: Option<[f32; 4]>, extra: &[(ObjectClass, [f32; 4])]) {
        let mut frame = FrameDetections::new(VIDEO, n, n as f64 / 30.0);
        let mut push = |class, bbox: [f32; 4]| {
            frame.detections.push(Detection::new(
                class,
                BBox::from_tlbr(bbox),
                0.9,
                n,
                n as f64 / 30.0,
            ))
        };
        if let Some(hand) = hand {
            push(ObjectClass::Hand, hand);
        }
        for (class, bbox) in extra {
            push(*class, *bbox);
        }
        let messages = self.pipeline.push(frame).expect("push frame");
        self.out.extend(messages);
    }

    fn finish(&mut self) -> Vec<ViolationEvent> {
        let messages = self.pipeline.finish();
        self.out.extend(messages);
        self.out
            .iter()
            .filter_map(|m| match m {
                SinkMessage::Violation(event) => Some(event.clone()),
                _ => None,
            })
            .collect()
    }
}

fn with_scooper_at(pizza: [f32; 4]) -> [(ObjectClass, [f32; 4]); 2] {
    [(ObjectClass::Pizza, pizza), (ObjectClass::Scooper, SCOOPER)]
}

/// Frames 1-10 outside, 11-20 inside (scooper in 15-17 if `with_scooper`),
/// 21-25 outside, 26 on the pizza.
fn grab_trace(h: &mut Harness, with_scooper: bool) {
    let pizza = [(ObjectClass::Pizza, PIZZA)];
    for n in 1..=10 {
        h.frame(n, Some(OUTSIDE), &pizza);
    }
    for n in 11..=20 {
        if with_scooper && (15..=17).contains(&n) {
            h.frame(n, Some(INSIDE), &with_scooper_at(PIZZA));
        } else {
            h.frame(n, Some(INSIDE), &pizza);
        }
    }
    for n in 21..=25 {
        h.frame(n, Some(OUTSIDE), &pizza);
    }
    h.frame(26, Some(ON_PIZZA), &pizza);
}

#[test]
fn scenario_scooper_in_roi_yields_ok() {
    for config in threshold_sets() {
        let mut h = Harness::with_roi(config.clone());
        grab_trace(&mut h, true);
        let events = h.finish();
        assert!(events.is_empty(), "config {:?}: {:?}", config, events);
        assert_eq!(h.metrics.verdicts_ok.load(Ordering::Relaxed), 1);
    }
}

#[test]
fn scenario_without_scooper_yields_one_violation_at_contact() {
    for config in threshold_sets() {
        let mut h = Harness::with_roi(config.clone());
        grab_trace(&mut h, false);
        let events = h.finish();
        assert_eq!(events.len(), 1, "config {:?}", config);
        let event = &events[0];
        assert_eq!(event.track_id, 1);
        assert_eq!(event.frame_number, 26);
        assert_eq!(event.roi_id, 1);
        assert_eq!(event.roi_enter_frame, 11);
        assert_eq!(event.boxes.hand, BBox::from_tlbr(ON_PIZZA));
        assert_eq!(event.boxes.pizza, BBox::from_tlbr(PIZZA));
        assert!(event.boxes.scooper.is_none());
        assert_eq!(event.event_id, ViolationEvent::dedup_key(VIDEO, 1, 11));
    }
}

#[test]
fn no_active_roi_never_violates() {
    for config in threshold_sets() {
        let mut h = Harness::new(config.clone(), Vec::new());
        grab_trace(&mut h, false);
        assert!(h.finish().is_empty(), "config {:?}", config);

        let mut inactive = Roi::new(1, "sauce", BBox::from_tlbr(ROI));
        inactive.active = false;
        let mut h = Harness::new(config.clone(), vec![inactive]);
        grab_trace(&mut h, false);
        assert!(h.finish().is_empty(), "config {:?}", config);
    }
}

#[test]
fn straight_to_pizza_is_safe() {
    for config in threshold_sets() {
        let mut h = Harness::with_roi(config.clone());
        let pizza = [(ObjectClass::Pizza, PIZZA)];
        for n in 1..=5 {
            h.frame(n, Some(OUTSIDE), &pizza);
        }
        for n in 6..=15 {
            h.frame(n, Some(ON_PIZZA), &pizza);
        }
        assert!(h.finish().is_empty(), "config {:?}", config);
        let track = h.pipeline.tracks().get(1).expect("track 1");
        assert_eq!(track.state, TrackState::Idle);
        assert!(track.roi_id_visited.is_none());
    }
}

#[test]
fn cleaning_times_out_silently() {
    for config in threshold_sets() {
        let window = config.left_roi_window_frames;
        let mut h = Harness::with_roi(config.clone());
        let pizza = [(ObjectClass::Pizza, PIZZA)];
        for n in 1..=5 {
            h.frame(n, Some(INSIDE), &pizza);
        }
        // Leaves at frame 6 and lingers next to the pizza past the window.
        let last_outside = 6 + window + 1;
        for n in 6..=last_outside {
            h.frame(n, Some(OUTSIDE), &pizza);
        }
        // Contact after the timeout belongs to no episode.
        for n in last_outside + 1..=last_outside + 5 {
            h.frame(n, Some(ON_PIZZA), &pizza);
        }
        assert!(h.finish().is_empty(), "config {:?}", config);
        assert_eq!(h.metrics.cleaning_timeouts.load(Ordering::Relaxed), 1);
        let track = h.pipeline.tracks().get(1).expect("track 1");
        assert_eq!(track.state, TrackState::Idle);
        assert!(!track.has_open_episode());
    }
}

#[test]
fn repeated_contact_yields_single_verdict() {
    for config in threshold_sets() {
        let mut h = Harness::with_roi(config.clone());
        grab_trace(&mut h, false);
        let pizza = [(ObjectClass::Pizza, PIZZA)];
        for n in 27..=40 {
            h.frame(n, Some(ON_PIZZA), &pizza);
        }
        assert_eq!(h.finish().len(), 1, "config {:?}", config);
    }
}

#[test]
fn second_grab_is_a_new_episode() {
    for config in threshold_sets() {
        let mut h = Harness::with_roi(config.clone());
        grab_trace(&mut h, false);
        let pizza = [(ObjectClass::Pizza, PIZZA)];
        h.frame(27, Some(OUTSIDE), &pizza);
        for n in 28..=32 {
            h.frame(n, Some(INSIDE), &pizza);
        }
        for n in 33..=35 {
            h.frame(n, Some(OUTSIDE), &pizza);
        }
        h.frame(36, Some(ON_PIZZA), &pizza);

        let events = h.finish();
        assert_eq!(events.len(), 2, "config {:?}", config);
        assert_eq!(events[1].roi_enter_frame, 28);
        assert_eq!(events[1].frame_number, 36);
        assert_ne!(events[0].event_id, events[1].event_id);
    }
}

#[test]
fn lost_track_is_discarded_without_event() {
    for with_scooper in [false, true] {
        for config in threshold_sets() {
            let ttl = config.track_ttl_frames;
            let mut h = Harness::with_roi(config.clone());
            let pizza = [(ObjectClass::Pizza, PIZZA)];
            for n in 1..=5 {
                h.frame(n, Some(INSIDE), &pizza);
            }
            if with_scooper {
                h.frame(6, Some(INSIDE), &with_scooper_at(PIZZA));
            } else {
                h.frame(6, Some(INSIDE), &pizza);
            }
            h.frame(7, Some(OUTSIDE), &pizza);
            // Hand vanishes mid LEFT_ROI for longer than the TTL.
            let gone_until = 7 + ttl + 2;
            for n in 8..=gone_until {
                h.frame(n, None, &pizza);
            }
            // A fresh hand landing on the pizza has no episode.
            for n in gone_until + 1..=gone_until + 3 {
                h.frame(n, Some(ON_PIZZA), &pizza);
            }

            assert!(h.finish().is_empty(), "config {:?}", config);
            assert!(h.pipeline.tracks().get(1).is_none());
            assert_eq!(h.metrics.episodes_discarded.load(Ordering::Relaxed), 1);
        }
    }
}

#[test]
fn out_of_order_frames_within_depth_are_applied_in_order() {
    let config = EngineConfig {
        reorder_depth: 4,
        ..EngineConfig::default()
    };
    let mut h = Harness::with_roi(config);
    let pizza = [(ObjectClass::Pizza, PIZZA)];
    h.frame(1, Some(INSIDE), &pizza);
    h.frame(2, Some(INSIDE), &pizza);
    h.frame(4, Some(ON_PIZZA), &pizza);
    h.frame(3, Some(OUTSIDE), &pizza);
    h.frame(5, Some(ON_PIZZA), &pizza);

    let events = h.finish();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].frame_number, 4);
    assert_eq!(h.pipeline.frames_dropped(), 0);
    assert_eq!(h.pipeline.last_applied(), Some(5));
}

#[test]
fn removing_the_roi_mid_episode_keeps_the_episode() {
    for config in threshold_sets() {
        let config = EngineConfig {
            reorder_depth: 0,
            ..config
        };
        let mut h = Harness::with_roi(config.clone());
        let pizza = [(ObjectClass::Pizza, PIZZA)];
        h.frame(1, Some(INSIDE), &pizza);
        assert_eq!(h.registry.replace(Vec::new()), 0);
        h.frame(2, Some(OUTSIDE), &pizza);
        h.frame(3, Some(ON_PIZZA), &pizza);

        let events = h.finish();
        assert_eq!(events.len(), 1, "config {:?}", config);
        assert_eq!(events[0].roi_id, 1);
        assert_eq!(events[0].roi_enter_frame, 1);
        assert_eq!(events[0].frame_number, 3);
    }
}

#[test]
fn roi_added_mid_video_applies_from_the_next_frame() {
    for config in threshold_sets() {
        let config = EngineConfig {
            reorder_depth: 0,
            ..config
        };
        let mut h = Harness::new(config.clone(), Vec::new());
        let pizza = [(ObjectClass::Pizza, PIZZA)];
        for n in 1..=3 {
            h.frame(n, Some(INSIDE), &pizza);
        }
        let track = h.pipeline.tracks().get(1).expect("track 1");
        assert_eq!(track.state, TrackState::Idle);

        h.registry
            .replace(vec![Roi::new(1, "sauce", BBox::from_tlbr(ROI))]);
        h.frame(4, Some(INSIDE), &pizza);
        h.frame(5, Some(OUTSIDE), &pizza);
        h.frame(6, Some(ON_PIZZA), &pizza);

        let events = h.finish();
        assert_eq!(events.len(), 1, "config {:?}", config);
        assert_eq!(events[0].roi_enter_frame, 4);
        assert_eq!(events[0].frame_number, 6);
    }
}
