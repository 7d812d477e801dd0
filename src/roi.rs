//! Monitored regions (ROIs) and their shared, immutable snapshots.
//!
//! The registry never mutates a published snapshot. `replace` builds a new
//! `Arc<RoiSnapshot>` and swaps it in; readers holding the old one keep a
//! consistent view until they refresh.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::geometry::BBox;

pub const DEFAULT_ROI_COLOR: &str = "#00FF00";

fn default_color() -> String {
    DEFAULT_ROI_COLOR.to_string()
}

fn default_active() -> bool {
    true
}

/// A named rectangle whose crossing by a hand starts a grab episode.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Roi {
    pub id: i64,
    pub name: String,
    pub rect: BBox,
    #[serde(default = "default_active")]
    pub active: bool,
    /// `None` applies the ROI to every video.
    #[serde(default)]
    pub video_id: Option<String>,
    /// Display only.
    #[serde(default = "default_color")]
    pub color: String,
}

impl Roi {
    pub fn new(id: i64, name: &str, rect: BBox) -> Self {
        Self {
            id,
            name: name.to_string(),
            rect,
            active: true,
            video_id: None,
            color: default_color(),
        }
    }

    pub fn applies_to(&self, video_id: Option<&str>) -> bool {
        match (&self.video_id, video_id) {
            (None, _) => true,
            (Some(_), None) => true,
            (Some(own), Some(requested)) => own == requested,
        }
    }
}

/// Point-in-time, ordered (by id) set of active, well-formed ROIs.
#[derive(Clone, Debug, Default)]
pub struct RoiSnapshot {
    rois: Vec<Roi>,
    generation: u64,
}

impl RoiSnapshot {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Validate and order `rois`. Malformed and inactive entries are dropped.
    pub fn from_rois(rois: Vec<Roi>, generation: u64) -> Self {
        Self {
            rois: validated(rois, true),
            generation,
        }
    }

    pub fn rois(&self) -> &[Roi] {
        &self.rois
    }

    pub fn is_empty(&self) -> bool {
        self.rois.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rois.len()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn get(&self, id: i64) -> Option<&Roi> {
        self.rois.iter().find(|roi| roi.id == id)
    }

    fn for_video(&self, video_id: &str) -> Self {
        Self {
            rois: self
                .rois
                .iter()
                .filter(|roi| roi.applies_to(Some(video_id)))
                .cloned()
                .collect(),
            generation: self.generation,
        }
    }
}

fn validated(rois: Vec<Roi>, warn: bool) -> Vec<Roi> {
    let mut seen = HashSet::new();
    let mut accepted: Vec<Roi> = Vec::with_capacity(rois.len());
    for roi in rois {
        if !roi.rect.is_well_formed() {
            if warn {
                log::warn!(
                    "ignoring ROI {} '{}': malformed rectangle {:?}",
                    roi.id,
                    roi.name,
                    roi.rect.to_tlbr()
                );
            }
            continue;
        }
        if !roi.active {
            continue;
        }
        if !seen.insert(roi.id) {
            if warn {
                log::warn!("ignoring duplicate ROI id {} '{}'", roi.id, roi.name);
            }
            continue;
        }
        accepted.push(roi);
    }
    accepted.sort_by_key(|roi| roi.id);
    accepted
}

/// Thread-safe holder of the current ROI snapshot.
pub struct RoiRegistry {
    current: RwLock<Arc<RoiSnapshot>>,
    generation: AtomicU64,
}

impl RoiRegistry {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(Arc::new(RoiSnapshot::empty())),
            generation: AtomicU64::new(0),
        }
    }

    pub fn with_rois(rois: Vec<Roi>) -> Self {
        let registry = Self::new();
        registry.replace(rois);
        registry
    }

    /// Publish a new ROI set. Returns the number of ROIs accepted.
    pub fn replace(&self, rois: Vec<Roi>) -> usize {
        let generation = self.generation.load(Ordering::Acquire) + 1;
        let snapshot = Arc::new(RoiSnapshot::from_rois(rois, generation));
        let accepted = snapshot.len();
        {
            let mut guard = self
                .current
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            *guard = snapshot;
        }
        self.generation.store(generation, Ordering::Release);
        accepted
    }

    /// True when `rois`, once validated, is exactly the published set.
    pub fn is_current(&self, rois: &[Roi]) -> bool {
        self.snapshot(None).rois() == validated(rois.to_vec(), false).as_slice()
    }

    /// Bumped on every `replace`; pipelines compare it to decide when to
    /// re-snapshot.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Active ROIs applying to `video_id` (all active ROIs for `None`).
    pub fn snapshot(&self, video_id: Option<&str>) -> Arc<RoiSnapshot> {
        let current = self
            .current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        match video_id {
            None => current,
            Some(_) if current.rois.iter().all(|roi| roi.video_id.is_none()) => current,
            Some(video_id) => Arc::new(current.for_video(video_id)),
        }
    }
}

impl Default for RoiRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roi(id: i64, rect: [f32; 4]) -> Roi {
        Roi::new(id, &format!("roi-{}", id), BBox::from_tlbr(rect))
    }

    #[test]
    fn malformed_and_inactive_rois_are_ignored() {
        let mut inactive = roi(3, [0.0, 0.0, 10.0, 10.0]);
        inactive.active = false;
        let registry = RoiRegistry::with_rois(vec![
            roi(2, [100.0, 150.0, 400.0, 400.0]),
            roi(1, [50.0, 50.0, 40.0, 80.0]),
            inactive,
            roi(4, [0.0, 0.0, 10.0, 10.0]),
        ]);

        let snapshot = registry.snapshot(None);
        let ids: Vec<i64> = snapshot.rois().iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![2, 4]);
    }

    #[test]
    fn replace_swaps_without_touching_held_snapshots() {
        let registry = RoiRegistry::with_rois(vec![roi(1, [0.0, 0.0, 10.0, 10.0])]);
        let held = registry.snapshot(None);
        let before = registry.generation();

        registry.replace(vec![]);

        assert_eq!(held.len(), 1);
        assert!(registry.snapshot(None).is_empty());
        assert_eq!(registry.generation(), before + 1);
    }

    #[test]
    fn per_video_rois_only_reach_their_video() {
        let mut scoped = roi(2, [0.0, 0.0, 10.0, 10.0]);
        scoped.video_id = Some("line-2".to_string());
        let registry = RoiRegistry::with_rois(vec![roi(1, [0.0, 0.0, 10.0, 10.0]), scoped]);

        assert_eq!(registry.snapshot(Some("line-1")).len(), 1);
        assert_eq!(registry.snapshot(Some("line-2")).len(), 2);
        assert_eq!(registry.snapshot(None).len(), 2);
    }

    #[test]
    fn stored_rows_with_a_malformed_roi_still_match_the_published_set() {
        let rows = vec![
            roi(2, [100.0, 150.0, 400.0, 400.0]),
            roi(1, [50.0, 50.0, 40.0, 80.0]),
        ];
        let registry = RoiRegistry::with_rois(rows.clone());
        let generation = registry.generation();

        assert!(registry.is_current(&rows));
        assert!(!registry.is_current(&[roi(2, [100.0, 150.0, 410.0, 400.0])]));
        assert!(!registry.is_current(&[]));
        assert_eq!(registry.generation(), generation);
    }
}
