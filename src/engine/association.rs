//! Frame-to-track association and per-frame co-location.

use crate::detect::Detection;
use crate::geometry::{iou_matrix, BBox};

/// Outcome of matching one frame's hands against the live tracks.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AssignmentResult {
    /// `(track_id, detection index)`, in acceptance order.
    pub matches: Vec<(u64, usize)>,
    pub unmatched_tracks: Vec<u64>,
    pub unmatched_detections: Vec<usize>,
}

/// Greedy IoU matching.
///
/// `tracks` must be in ascending `track_id` order. A pair is a candidate
/// only when its IoU is strictly above `threshold`; candidates are accepted
/// by IoU descending, then track id, then detection index.
pub fn greedy_match(tracks: &[(u64, BBox)], hands: &[BBox], threshold: f32) -> AssignmentResult {
    if tracks.is_empty() || hands.is_empty() {
        return AssignmentResult {
            matches: vec![],
            unmatched_tracks: tracks.iter().map(|(id, _)| *id).collect(),
            unmatched_detections: (0..hands.len()).collect(),
        };
    }

    let track_boxes: Vec<BBox> = tracks.iter().map(|(_, bbox)| *bbox).collect();
    let ious = iou_matrix(&track_boxes, hands);

    let mut candidates: Vec<(f32, usize, usize)> = Vec::new();
    for ((row, col), &iou) in ious.indexed_iter() {
        if iou > threshold {
            candidates.push((iou, row, col));
        }
    }
    candidates.sort_by(|a, b| {
        b.0.total_cmp(&a.0)
            .then(tracks[a.1].0.cmp(&tracks[b.1].0))
            .then(a.2.cmp(&b.2))
    });

    let mut track_taken = vec![false; tracks.len()];
    let mut det_taken = vec![false; hands.len()];
    let mut matches = Vec::new();
    for (_, row, col) in candidates {
        if track_taken[row] || det_taken[col] {
            continue;
        }
        track_taken[row] = true;
        det_taken[col] = true;
        matches.push((tracks[row].0, col));
    }

    AssignmentResult {
        matches,
        unmatched_tracks: tracks
            .iter()
            .zip(&track_taken)
            .filter(|(_, taken)| !**taken)
            .map(|((id, _), _)| *id)
            .collect(),
        unmatched_detections: det_taken
            .iter()
            .enumerate()
            .filter(|(_, taken)| !**taken)
            .map(|(idx, _)| idx)
            .collect(),
    }
}

/// Instantaneous hand/object proximity test.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CoLocation {
    pub min_iou: f32,
    pub margin_px: f32,
}

impl CoLocation {
    pub fn new(min_iou: f32, margin_px: f32) -> Self {
        Self { min_iou, margin_px }
    }

    /// Overlap above `min_iou` after expanding the hand, or either centre
    /// inside the other box.
    pub fn is_colocated(&self, hand: &BBox, other: &BBox) -> bool {
        let hand = hand.expand(self.margin_px);
        hand.iou(other) > self.min_iou
            || hand.contains_point(other.center())
            || other.contains_point(hand.center())
    }

    /// Best co-located object for `hand`: highest IoU, then highest
    /// confidence, then earliest in the frame.
    pub fn best<'a>(&self, hand: &BBox, objects: &[&'a Detection]) -> Option<&'a Detection> {
        let expanded = hand.expand(self.margin_px);
        objects
            .iter()
            .copied()
            .filter(|det| self.is_colocated(hand, &det.bbox))
            .enumerate()
            .max_by(|(ia, a), (ib, b)| {
                expanded
                    .iou(&a.bbox)
                    .total_cmp(&expanded.iou(&b.bbox))
                    .then(a.confidence.total_cmp(&b.confidence))
                    .then_with(|| ib.cmp(ia))
            })
            .map(|(_, det)| det)
    }
}

/// Indices of `hands` ordered by confidence descending, index ascending.
pub fn spawn_order(hands: &[&Detection], unmatched: &[usize]) -> Vec<usize> {
    let mut order = unmatched.to_vec();
    order.sort_by(|&a, &b| {
        hands[b]
            .confidence
            .total_cmp(&hands[a].confidence)
            .then(a.cmp(&b))
    });
    order
}
