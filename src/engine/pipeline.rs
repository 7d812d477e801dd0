use anyhow::{anyhow, Result};
use std::collections::HashSet;
use std::sync::Arc;

use crate::detect::{Detection, FrameDetections, ObjectClass};
use crate::event::{ProgressUpdate, SinkMessage, ViolationEvent};
use crate::metrics::PipelineMetrics;
use crate::roi::{RoiRegistry, RoiSnapshot};

use super::association::{greedy_match, spawn_order};
use super::evaluator::Verdict;
use super::reorder::{FrameDrop, ReorderBuffer};
use super::state_machine::{FrameContext, TrackStateMachine, Transition};
use super::table::{SpawnOutcome, TrackTable};
use super::track::Track;
use super::EngineConfig;

/// Single-writer engine for one video.
pub struct VideoPipeline {
    video_id: String,
    config: EngineConfig,
    table: TrackTable,
    machine: TrackStateMachine,
    reorder: ReorderBuffer,
    registry: Arc<RoiRegistry>,
    rois: Arc<RoiSnapshot>,
    frames_since_refresh: u64,
    metrics: Arc<PipelineMetrics>,
    frames_processed: u64,
    frames_dropped: u64,
    violations: u64,
    last_applied: Option<u64>,
}

impl VideoPipeline {
    pub fn new(
        video_id: impl Into<String>,
        config: EngineConfig,
        registry: Arc<RoiRegistry>,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        let video_id = video_id.into();
        let rois = registry.snapshot(Some(&video_id));
        Self {
            table: TrackTable::new(config.max_tracks, config.track_ttl_frames),
            machine: TrackStateMachine::new(&config),
            reorder: ReorderBuffer::new(config.reorder_depth),
            video_id,
            config,
            registry,
            rois,
            frames_since_refresh: 0,
            metrics,
            frames_processed: 0,
            frames_dropped: 0,
            violations: 0,
            last_applied: None,
        }
    }

    pub fn video_id(&self) -> &str {
        &self.video_id
    }

    pub fn frames_processed(&self) -> u64 {
        self.frames_processed
    }

    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped
    }

    pub fn violations(&self) -> u64 {
        self.violations
    }

    pub fn last_applied(&self) -> Option<u64> {
        self.last_applied
    }

    pub fn tracks(&self) -> &TrackTable {
        &self.table
    }

    pub fn progress(&self) -> ProgressUpdate {
        ProgressUpdate {
            video_id: self.video_id.clone(),
            frames_processed: self.frames_processed,
            frames_dropped: self.frames_dropped,
            violations: self.violations,
        }
    }

    /// Accept one frame. Frames are buffered and applied in order; the
    /// returned messages come from every frame released by this call.
    pub fn push(&mut self, frame: FrameDetections) -> Result<Vec<SinkMessage>> {
        if frame.video_id != self.video_id {
            return Err(anyhow!(
                "frame {} belongs to video '{}', pipeline serves '{}'",
                frame.frame_number,
                frame.video_id,
                self.video_id
            ));
        }

        let mut out = Vec::new();
        if let Err(drop) = self.reorder.admit(frame) {
            self.record_drop(drop);
            return Ok(out);
        }
        while let Some(ready) = self.reorder.pop_ready() {
            self.apply(&ready, &mut out);
        }
        Ok(out)
    }

    /// Apply every buffered frame and report final progress.
    pub fn finish(&mut self) -> Vec<SinkMessage> {
        let mut out = Vec::new();
        for frame in self.reorder.drain() {
            self.apply(&frame, &mut out);
        }
        out.push(SinkMessage::Progress(self.progress()));
        out
    }

    /// Stop without resolving anything. Buffered frames and open episodes
    /// are discarded.
    pub fn cancel(&mut self) {
        let buffered = self.reorder.clear();
        let open = self.table.iter().filter(|t| t.has_open_episode()).count() as u64;
        self.table.clear();
        self.metrics.add(&self.metrics.episodes_discarded, open);
        log::info!(
            "video {}: cancelled after {} frames ({} buffered frames, {} open episodes discarded)",
            self.video_id,
            self.frames_processed,
            buffered,
            open
        );
    }

    fn record_drop(&mut self, drop: FrameDrop) {
        self.frames_dropped += 1;
        self.metrics.inc(&self.metrics.frames_dropped);
        match drop {
            FrameDrop::Stale {
                frame_number,
                last_released,
            } => log::warn!(
                "video {}: dropping late frame {} (already past {})",
                self.video_id,
                frame_number,
                last_released
            ),
            FrameDrop::Duplicate { frame_number } => log::warn!(
                "video {}: dropping duplicate frame {}",
                self.video_id,
                frame_number
            ),
        }
    }

    fn refresh_rois(&mut self) {
        self.frames_since_refresh += 1;
        let stale_generation = self.registry.generation() != self.rois.generation();
        if stale_generation || self.frames_since_refresh >= self.config.roi_refresh_frames {
            self.rois = self.registry.snapshot(Some(&self.video_id));
            self.frames_since_refresh = 0;
        }
    }

    fn apply(&mut self, frame: &FrameDetections, out: &mut Vec<SinkMessage>) {
        self.refresh_rois();
        let frame_number = frame.frame_number;

        let hands: Vec<&Detection> = frame.of_class(ObjectClass::Hand).collect();
        let scoopers: Vec<&Detection> = frame.of_class(ObjectClass::Scooper).collect();
        let pizzas: Vec<&Detection> = frame.of_class(ObjectClass::Pizza).collect();

        let hand_boxes: Vec<_> = hands.iter().map(|d| d.bbox).collect();
        let assignment = greedy_match(&self.table.boxes(), &hand_boxes, self.config.hand_match_iou);

        let mut matched: HashSet<u64> = HashSet::with_capacity(hands.len());
        for &(track_id, det_idx) in &assignment.matches {
            if let Some(track) = self.table.get_mut(track_id) {
                let hand = hands[det_idx];
                track.observe(hand.bbox, hand.confidence, frame_number);
                matched.insert(track_id);
            }
        }
        for det_idx in spawn_order(&hands, &assignment.unmatched_detections) {
            let hand = hands[det_idx];
            match self.table.spawn(hand.bbox, hand.confidence, frame_number) {
                SpawnOutcome::Spawned { track_id, evicted } => {
                    self.metrics.inc(&self.metrics.tracks_spawned);
                    if let Some(evicted) = evicted {
                        self.metrics.inc(&self.metrics.tracks_evicted);
                        log::debug!(
                            "video {}: evicted idle track {} to make room for track {}",
                            self.video_id,
                            evicted.track_id,
                            track_id
                        );
                    }
                    matched.insert(track_id);
                }
                SpawnOutcome::Refused => {
                    self.metrics.inc(&self.metrics.tracks_refused);
                    log::warn!(
                        "video {}: frame {}: track table full of open episodes, hand ignored",
                        self.video_id,
                        frame_number
                    );
                }
            }
        }

        let rois = Arc::clone(&self.rois);
        let ctx = FrameContext {
            video_id: &self.video_id,
            frame_number,
            timestamp: frame.timestamp,
            rois: &rois,
            scoopers: &scoopers,
            pizzas: &pizzas,
        };
        let mut transitions = Vec::new();
        for track in self.table.iter_mut() {
            let transition = self
                .machine
                .step(track, matched.contains(&track.track_id), &ctx);
            if transition != Transition::Unchanged {
                transitions.push((track.track_id, transition));
            }
        }
        for (track_id, transition) in transitions {
            self.record_transition(track_id, frame_number, transition, out);
        }

        for evicted in self.table.evict_stale(frame_number) {
            self.record_eviction(&evicted);
        }

        self.frames_processed += 1;
        self.last_applied = Some(frame_number);
        self.metrics.inc(&self.metrics.frames_applied);
        if self.frames_processed % self.config.progress_interval_frames == 0 {
            out.push(SinkMessage::Progress(self.progress()));
        }
    }

    fn record_transition(
        &mut self,
        track_id: u64,
        frame_number: u64,
        transition: Transition,
        out: &mut Vec<SinkMessage>,
    ) {
        match transition {
            Transition::Unchanged => {}
            Transition::EnteredRoi { roi_id } => {
                self.metrics.inc(&self.metrics.roi_entries);
                log::debug!(
                    "video {}: frame {}: track {} entered ROI {}",
                    self.video_id,
                    frame_number,
                    track_id,
                    roi_id
                );
            }
            Transition::LeftRoi => log::debug!(
                "video {}: frame {}: track {} left ROI",
                self.video_id,
                frame_number,
                track_id
            ),
            Transition::ReturnedToRoi => log::debug!(
                "video {}: frame {}: track {} back in ROI",
                self.video_id,
                frame_number,
                track_id
            ),
            Transition::TimedOut => {
                self.metrics.inc(&self.metrics.cleaning_timeouts);
                log::debug!(
                    "video {}: frame {}: track {} never reached a pizza",
                    self.video_id,
                    frame_number,
                    track_id
                );
            }
            Transition::Resolved(Verdict::Ok) => {
                self.metrics.inc(&self.metrics.verdicts_ok);
                log::info!(
                    "video {}: frame {}: track {} used a scooper",
                    self.video_id,
                    frame_number,
                    track_id
                );
            }
            Transition::Resolved(Verdict::Violation(event)) => {
                self.violations += 1;
                self.metrics.inc(&self.metrics.violations);
                log_violation(&event);
                out.push(SinkMessage::Violation(event));
            }
        }
    }

    fn record_eviction(&self, track: &Track) {
        self.metrics.inc(&self.metrics.tracks_evicted);
        if track.has_open_episode() {
            self.metrics.inc(&self.metrics.episodes_discarded);
            log::info!(
                "video {}: track {} lost in {:?}, episode from frame {} discarded",
                self.video_id,
                track.track_id,
                track.state,
                track.roi_enter_frame.unwrap_or(track.first_seen_frame)
            );
        }
    }
}

fn log_violation(event: &ViolationEvent) {
    log::warn!(
        "video {}: frame {}: violation by track {} (ROI {}, entered at frame {})",
        event.video_id,
        event.frame_number,
        event.track_id,
        event.roi_id,
        event.roi_enter_frame
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::BBox;
    use crate::roi::Roi;

    fn pipeline(config: EngineConfig) -> VideoPipeline {
        let registry = Arc::new(RoiRegistry::with_rois(vec![Roi::new(
            1,
            "sauce",
            BBox::new(100.0, 150.0, 400.0, 400.0),
        )]));
        VideoPipeline::new("v", config, registry, Arc::new(PipelineMetrics::new()))
    }

    fn frame(n: u64, dets: &[(ObjectClass, [f32; 4])]) -> FrameDetections {
        let mut f = FrameDetections::new("v", n, n as f64 / 30.0);
        for (class, bbox) in dets {
            f.detections
                .push(Detection::new(*class, BBox::from_tlbr(*bbox), 0.9, n, f.timestamp));
        }
        f
    }

    fn violations(messages: &[SinkMessage]) -> usize {
        messages
            .iter()
            .filter(|m| matches!(m, SinkMessage::Violation(_)))
            .count()
    }

    #[test]
    fn foreign_video_frames_are_rejected() {
        let mut p = pipeline(EngineConfig::default());
        let err = p
            .push(FrameDetections::new("other", 1, 0.0))
            .expect_err("wrong video");
        assert!(err.to_string().contains("other"));
    }

    #[test]
    fn late_frames_are_counted_not_applied() {
        let mut p = pipeline(EngineConfig {
            reorder_depth: 0,
            ..EngineConfig::default()
        });
        p.push(frame(5, &[])).expect("push");
        p.push(frame(3, &[])).expect("push");
        assert_eq!(p.frames_processed(), 1);
        assert_eq!(p.frames_dropped(), 1);
    }

    #[test]
    fn grab_without_scooper_emits_once() {
        let mut p = pipeline(EngineConfig::default());
        let pizza = (ObjectClass::Pizza, [480.0, 480.0, 700.0, 700.0]);

        // Small steps keep IoU above the match threshold, so one track
        // carries the hand from the ROI to the pizza.
        let mut out = Vec::new();
        let mut x = 200.0;
        let mut n = 1;
        while x < 500.0 {
            let hand = (ObjectClass::Hand, [x, x, x + 40.0, x + 40.0]);
            out.extend(p.push(frame(n, &[hand, pizza])).expect("push"));
            x += 8.0;
            n += 1;
        }
        out.extend(p.finish());

        assert_eq!(violations(&out), 1);
        assert_eq!(p.violations(), 1);
        assert!(matches!(out.last(), Some(SinkMessage::Progress(_))));
    }

    #[test]
    fn cancel_discards_buffered_frames() {
        let mut p = pipeline(EngineConfig::default());
        for n in 1..=3 {
            p.push(frame(n, &[])).expect("push");
        }
        p.cancel();
        assert_eq!(p.frames_processed(), 0);
        assert!(p.tracks().is_empty());
    }
}
