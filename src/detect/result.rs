use serde::Serialize;

use crate::error::{StageError, StageResult};
use crate::frame::Region;

/// Axis-aligned box in coordinates normalized to the frame, `0..=1`.
///
/// Invariant: `x1 < x2` and `y1 < y2`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct BoundingBox {
    x1: f32,
    y1: f32,
    x2: f32,
    y2: f32,
}

impl BoundingBox {
    /// Clamp to the unit square and check the ordering invariant.
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> StageResult<Self> {
        if ![x1, y1, x2, y2].iter().all(|v| v.is_finite()) {
            return Err(StageError::region("bounding box has non-finite coordinates"));
        }
        let (x1, y1) = (x1.clamp(0.0, 1.0), y1.clamp(0.0, 1.0));
        let (x2, y2) = (x2.clamp(0.0, 1.0), y2.clamp(0.0, 1.0));
        if x1 >= x2 || y1 >= y2 {
            return Err(StageError::region(format!(
                "degenerate bounding box ({}, {}) - ({}, {})",
                x1, y1, x2, y2
            )));
        }
        Ok(Self { x1, y1, x2, y2 })
    }

    pub fn x1(&self) -> f32 {
        self.x1
    }
    pub fn y1(&self) -> f32 {
        self.y1
    }
    pub fn x2(&self) -> f32 {
        self.x2
    }
    pub fn y2(&self) -> f32 {
        self.y2
    }

    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    /// Intersection over union, `0..=1`.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let ix = (self.x2.min(other.x2) - self.x1.max(other.x1)).max(0.0);
        let iy = (self.y2.min(other.y2) - self.y1.max(other.y1)).max(0.0);
        let inter = ix * iy;
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }

    /// Pixel rectangle inside a `width` x `height` frame. May be empty when the
    /// box is thinner than a pixel.
    pub fn to_region(&self, width: u32, height: u32) -> Region {
        let (fw, fh) = (width as f32, height as f32);
        let x = ((self.x1 * fw) as u32).min(width);
        let y = ((self.y1 * fh) as u32).min(height);
        let w = ((self.width() * fw) as u32).min(width - x);
        let h = ((self.height() * fh) as u32).min(height - y);
        Region::new(x, y, w, h)
    }
}

/// One detector output.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub confidence: f32,
}
