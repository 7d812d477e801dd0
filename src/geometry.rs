//! Axis-aligned bounding boxes in pixel space.
//!
//! All boxes use TLBR layout: `(x1, y1)` top-left, `(x2, y2)` bottom-right.

use ndarray::Array2;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BBox {
    #[inline]
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// Build from a `[x1, y1, x2, y2]` array as produced by the detector.
    #[inline]
    pub fn from_tlbr(tlbr: [f32; 4]) -> Self {
        Self::new(tlbr[0], tlbr[1], tlbr[2], tlbr[3])
    }

    #[inline]
    pub fn to_tlbr(&self) -> [f32; 4] {
        [self.x1, self.y1, self.x2, self.y2]
    }

    /// Finite coordinates with strictly positive width and height.
    pub fn is_well_formed(&self) -> bool {
        self.to_tlbr().iter().all(|v| v.is_finite()) && self.x1 < self.x2 && self.y1 < self.y2
    }

    #[inline]
    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    #[inline]
    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    #[inline]
    pub fn area(&self) -> f32 {
        self.width().max(0.0) * self.height().max(0.0)
    }

    #[inline]
    pub fn center(&self) -> (f32, f32) {
        ((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }

    /// Inclusive point containment.
    #[inline]
    pub fn contains_point(&self, (x, y): (f32, f32)) -> bool {
        self.x1 <= x && x <= self.x2 && self.y1 <= y && y <= self.y2
    }

    /// Grow the box by `margin` pixels on every side.
    pub fn expand(&self, margin: f32) -> Self {
        Self::new(
            self.x1 - margin,
            self.y1 - margin,
            self.x2 + margin,
            self.y2 + margin,
        )
    }

    pub fn intersection_area(&self, other: &BBox) -> f32 {
        let w = (self.x2.min(other.x2) - self.x1.max(other.x1)).max(0.0);
        let h = (self.y2.min(other.y2) - self.y1.max(other.y1)).max(0.0);
        w * h
    }

    /// Intersection over Union.
    pub fn iou(&self, other: &BBox) -> f32 {
        let inter = self.intersection_area(other);
        let union = self.area() + other.area() - inter;
        if union > 0.0 {
            inter / union
        } else {
            0.0
        }
    }

    /// Fraction of this box's area that lies inside `region`.
    ///
    /// Used for ROI overlap, where the region is typically much larger than
    /// a hand and IoU would stay small even for a hand fully inside it.
    pub fn coverage_by(&self, region: &BBox) -> f32 {
        let area = self.area();
        if area > 0.0 {
            self.intersection_area(region) / area
        } else {
            0.0
        }
    }
}

/// IoU matrix of shape `(a.len(), b.len())`.
pub fn iou_matrix(boxes_a: &[BBox], boxes_b: &[BBox]) -> Array2<f32> {
    let mut out = Array2::zeros((boxes_a.len(), boxes_b.len()));
    for (i, a) in boxes_a.iter().enumerate() {
        for (j, b) in boxes_b.iter().enumerate() {
            out[[i, j]] = a.iou(b);
        }
    }
    out
}
