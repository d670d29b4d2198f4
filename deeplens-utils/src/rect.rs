//! Integer rectangles in image coordinates.

/// Axis-aligned rectangle, `cv::Rect`-style: top-left corner plus size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl Rect {
    pub const fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Build from floating-point corner coordinates, rounding outward.
    pub fn from_corners_f32(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        let x = x1.floor() as i32;
        let y = y1.floor() as i32;
        Self {
            x,
            y,
            width: (x2.ceil() as i32 - x).max(0),
            height: (y2.ceil() as i32 - y).max(0),
        }
    }

    pub fn area(&self) -> i64 {
        i64::from(self.width.max(0)) * i64::from(self.height.max(0))
    }

    pub fn is_empty(&self) -> bool {
        self.width <= 0 || self.height <= 0
    }

    /// Intersection with `[0,width) x [0,height)`, collapsing to a zero-area
    /// rectangle when disjoint. Idempotent.
    pub fn clamp(&self, width: u32, height: u32) -> Self {
        let w = width as i32;
        let h = height as i32;
        let x1 = self.x.clamp(0, w);
        let y1 = self.y.clamp(0, h);
        let x2 = self.x.saturating_add(self.width).clamp(0, w);
        let y2 = self.y.saturating_add(self.height).clamp(0, h);
        Self {
            x: x1,
            y: y1,
            width: (x2 - x1).max(0),
            height: (y2 - y1).max(0),
        }
    }

    /// Intersection over union with another rectangle.
    pub fn iou(&self, other: &Self) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.width).min(other.x + other.width);
        let y2 = (self.y + self.height).min(other.y + other.height);

        if x2 <= x1 || y2 <= y1 {
            return 0.0;
        }

        let intersection = i64::from(x2 - x1) * i64::from(y2 - y1);
        let union = self.area() + other.area() - intersection;
        if union > 0 {
            intersection as f32 / union as f32
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_is_idempotent() {
        let cases = [
            Rect::new(-10, -10, 30, 30),
            Rect::new(90, 90, 30, 30),
            Rect::new(200, 200, 10, 10),
            Rect::new(10, 10, 20, 20),
        ];
        for r in cases {
            let once = r.clamp(100, 100);
            let twice = once.clamp(100, 100);
            assert_eq!(once, twice, "clamp not idempotent for {r:?}");
        }
    }

    #[test]
    fn clamp_collapses_disjoint_rects() {
        let r = Rect::new(500, 500, 10, 10).clamp(100, 100);
        assert_eq!(r.area(), 0);
        let r = Rect::new(-50, -50, 10, 10).clamp(100, 100);
        assert_eq!(r.area(), 0);
    }

    #[test]
    fn clamp_intersects_with_bounds() {
        let r = Rect::new(-10, 90, 30, 30).clamp(100, 100);
        assert_eq!(r, Rect::new(0, 90, 20, 10));
    }

    #[test]
    fn iou_of_known_boxes() {
        let a = Rect::new(0, 0, 10, 10);
        let b = Rect::new(1, 1, 10, 10);
        let iou = a.iou(&b);
        // 81 / (100 + 100 - 81)
        assert!((iou - 81.0 / 119.0).abs() < 1e-5);

        let c = Rect::new(50, 50, 10, 10);
        assert_eq!(a.iou(&c), 0.0);
        assert_eq!(a.iou(&a), 1.0);
    }
}
