use serde::{Deserialize, Serialize};

use crate::types::UNKNOWN_CLASS;

/// An axis-aligned box given by its center (x, y) and size (w, h).
///
/// Detection layers use normalized image coordinates in [0, 1]; the algebra
/// itself is unit-agnostic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
    #[serde(default)]
    pub score: f32,
    #[serde(default = "unknown_class")]
    pub class_id: usize,
    /// Grid cell a detection was decoded from; 0 for ground truth.
    #[serde(skip)]
    pub cell_id: usize,
    /// Set when no class score cleared the confidence threshold.
    #[serde(skip)]
    pub unknown: bool,
}

fn unknown_class() -> usize {
    UNKNOWN_CLASS
}

impl BoundingBox {
    pub fn new(x: f32, y: f32, w: f32, h: f32) -> Self {
        Self {
            x,
            y,
            w,
            h,
            score: 0.0,
            class_id: UNKNOWN_CLASS,
            cell_id: 0,
            unknown: false,
        }
    }

    /// Length of the overlap of two centered intervals; negative when they
    /// are disjoint.
    pub fn overlap_1d(center1: f32, size1: f32, center2: f32, size2: f32) -> f32 {
        let left = (center1 - size1 / 2.0).max(center2 - size2 / 2.0);
        let right = (center1 + size1 / 2.0).min(center2 + size2 / 2.0);
        right - left
    }

    pub fn intersection(&self, other: &BoundingBox) -> f32 {
        let horizontal = Self::overlap_1d(self.x, self.w, other.x, other.w);
        let vertical = Self::overlap_1d(self.y, self.h, other.y, other.h);
        if horizontal < 0.0 || vertical < 0.0 {
            0.0
        } else {
            horizontal * vertical
        }
    }

    pub fn union(&self, other: &BoundingBox) -> f32 {
        self.w * self.h + other.w * other.h - self.intersection(other)
    }

    pub fn iou(&self, other: &BoundingBox) -> f32 {
        self.intersection(other) / self.union(other)
    }
}

/// Non-maximum suppression: whenever two boxes of the same class overlap with
/// IoU above 0.5, the lower-scoring one has its score zeroed; zero-scored
/// boxes are then dropped.
pub fn non_maximum_suppression(boxes: &mut Vec<BoundingBox>) {
    if boxes.len() < 2 {
        return;
    }
    boxes.sort_by(|a, b| a.score.total_cmp(&b.score));
    for low in 0..boxes.len() - 1 {
        for high in low + 1..boxes.len() {
            if boxes[high].class_id == boxes[low].class_id
                && boxes[high].score > boxes[low].score
                && boxes[low].iou(&boxes[high]) > 0.5
            {
                boxes[low].score = 0.0;
                break;
            }
        }
    }
    boxes.retain(|b| b.score != 0.0);
}
