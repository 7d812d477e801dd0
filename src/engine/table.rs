//! Track lifetime for one video.
//!
//! The table is the only owner of `Track`s. Tracks leave it in exactly two
//! ways: TTL eviction and capacity eviction of an IDLE track.

use std::collections::BTreeMap;

use crate::geometry::BBox;

use super::track::{Track, TrackState};

#[derive(Debug, Clone, PartialEq)]
pub enum SpawnOutcome {
    Spawned {
        track_id: u64,
        /// IDLE track removed to make room.
        evicted: Option<Track>,
    },
    /// Table full of tracks with open episodes.
    Refused,
}

#[derive(Debug, Clone)]
pub struct TrackTable {
    tracks: BTreeMap<u64, Track>,
    next_id: u64,
    max_tracks: usize,
    ttl_frames: u64,
}

impl TrackTable {
    pub fn new(max_tracks: usize, ttl_frames: u64) -> Self {
        Self {
            tracks: BTreeMap::new(),
            next_id: 1,
            max_tracks: max_tracks.max(1),
            ttl_frames,
        }
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn get(&self, track_id: u64) -> Option<&Track> {
        self.tracks.get(&track_id)
    }

    pub(crate) fn get_mut(&mut self, track_id: u64) -> Option<&mut Track> {
        self.tracks.get_mut(&track_id)
    }

    /// Tracks in ascending `track_id` order.
    pub fn iter(&self) -> impl Iterator<Item = &Track> {
        self.tracks.values()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut Track> {
        self.tracks.values_mut()
    }

    /// `(track_id, last_bbox)` in ascending id order.
    pub fn boxes(&self) -> Vec<(u64, BBox)> {
        self.tracks
            .values()
            .map(|t| (t.track_id, t.last_bbox))
            .collect()
    }

    pub fn spawn(&mut self, bbox: BBox, confidence: f32, frame_number: u64) -> SpawnOutcome {
        let mut evicted = None;
        if self.tracks.len() >= self.max_tracks {
            let Some(victim) = self.capacity_victim() else {
                return SpawnOutcome::Refused;
            };
            evicted = self.tracks.remove(&victim);
        }

        let track_id = self.next_id;
        self.next_id += 1;
        self.tracks
            .insert(track_id, Track::new(track_id, bbox, confidence, frame_number));
        SpawnOutcome::Spawned { track_id, evicted }
    }

    /// Lowest-confidence IDLE track, oldest first on ties.
    fn capacity_victim(&self) -> Option<u64> {
        self.tracks
            .values()
            .filter(|t| t.state == TrackState::Idle)
            .min_by(|a, b| {
                a.last_confidence
                    .total_cmp(&b.last_confidence)
                    .then(a.last_seen_frame.cmp(&b.last_seen_frame))
                    .then(a.track_id.cmp(&b.track_id))
            })
            .map(|t| t.track_id)
    }

    /// Remove tracks unmatched for more than the TTL as of `frame_number`.
    pub fn evict_stale(&mut self, frame_number: u64) -> Vec<Track> {
        let ttl = self.ttl_frames;
        let stale: Vec<u64> = self
            .tracks
            .values()
            .filter(|t| t.frames_unseen(frame_number) > ttl)
            .map(|t| t.track_id)
            .collect();
        stale
            .into_iter()
            .filter_map(|id| self.tracks.remove(&id))
            .collect()
    }

    /// Drop every track. Open episodes are discarded, never resolved.
    pub fn clear(&mut self) -> usize {
        let n = self.tracks.len();
        self.tracks.clear();
        n
    }
}
