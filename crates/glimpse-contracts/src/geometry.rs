use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Point {
    pub x: u32,
    pub y: u32,
}

impl Point {
    pub fn new(x: u32, y: u32) -> Self {
        Self { x, y }
    }

    /// Maps a point observed on a `from` screen onto a `to` screen, each axis
    /// scaled independently.
    pub fn rescale(self, from: Size, to: Size) -> Self {
        let (sx, sy) = from.scale_to(to);
        Self {
            x: scale_value(self.x, sx),
            y: scale_value(self.y, sy),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Per-axis factors that take coordinates from `self` to `to`.
    /// A zero-sized source yields identity factors.
    pub fn scale_to(self, to: Size) -> (f64, f64) {
        let sx = if self.width == 0 {
            1.0
        } else {
            to.width as f64 / self.width as f64
        };
        let sy = if self.height == 0 {
            1.0
        } else {
            to.height as f64 / self.height as f64
        };
        (sx, sy)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn from_size(size: Size) -> Self {
        Self::new(0, 0, size.width, size.height)
    }

    pub fn right(&self) -> u32 {
        self.x.saturating_add(self.width)
    }

    pub fn bottom(&self) -> u32 {
        self.y.saturating_add(self.height)
    }

    pub fn size(&self) -> Size {
        Size::new(self.width, self.height)
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn center(&self) -> Point {
        Point::new(self.x + self.width / 2, self.y + self.height / 2)
    }

    /// A `size` box centered on `point`, pinned at the top-left screen edge.
    pub fn centered_on(point: Point, size: Size) -> Self {
        Self::new(
            point.x.saturating_sub(size.width / 2),
            point.y.saturating_sub(size.height / 2),
            size.width,
            size.height,
        )
    }

    pub fn rescale(&self, from: Size, to: Size) -> Self {
        let (sx, sy) = from.scale_to(to);
        Self::new(
            scale_value(self.x, sx),
            scale_value(self.y, sy),
            scale_value(self.width, sx),
            scale_value(self.height, sy),
        )
    }

    /// Intersection with a `bounds` screen; `None` when nothing remains.
    pub fn clip_to(&self, bounds: Size) -> Option<Self> {
        let right = self.right().min(bounds.width);
        let bottom = self.bottom().min(bounds.height);
        if self.x >= right || self.y >= bottom {
            return None;
        }
        Some(Self::new(self.x, self.y, right - self.x, bottom - self.y))
    }
}

/// A rectangle of the original screenshot under examination at a given depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchRegion {
    pub rect: Rect,
    pub depth: u32,
}

impl SearchRegion {
    pub fn root(size: Size) -> Self {
        Self {
            rect: Rect::from_size(size),
            depth: 0,
        }
    }

    pub fn child(&self, rect: Rect) -> Self {
        Self {
            rect,
            depth: self.depth + 1,
        }
    }

    pub fn width(&self) -> u32 {
        self.rect.width
    }

    pub fn height(&self) -> u32 {
        self.rect.height
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchResult {
    pub found: bool,
    pub confidence: u8,
    pub region: SearchRegion,
}

fn scale_value(value: u32, factor: f64) -> u32 {
    let scaled = (value as f64 * factor).round();
    if scaled <= 0.0 {
        0
    } else if scaled >= u32::MAX as f64 {
        u32::MAX
    } else {
        scaled as u32
    }
}
