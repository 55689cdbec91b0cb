use glimpse_contracts::{Point, Rect};
use image::{DynamicImage, GrayImage};

/// Tuning for the dark-content scan used to tighten a terminal region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefineParams {
    /// Luma strictly below this counts as dark.
    pub dark_threshold: u8,
    /// A row or column has content when it holds more dark pixels than this.
    pub min_dark_pixels: u32,
    pub margin: u32,
}

impl Default for RefineParams {
    fn default() -> Self {
        Self {
            dark_threshold: 200,
            min_dark_pixels: 3,
            margin: 2,
        }
    }
}

/// Bounding box of the dark content in `region`, in region-local pixels,
/// grown by the margin and clipped. An axis without content spans the whole
/// region. `None` when neither axis has content or the box is degenerate.
pub fn refine_bounds(region: &DynamicImage, params: &RefineParams) -> Option<Rect> {
    let gray = region.to_luma8();
    let (width, height) = gray.dimensions();
    if width == 0 || height == 0 {
        return None;
    }
    let (rows, cols) = dark_counts(&gray, params.dark_threshold);
    let row_span = content_span(&rows, params.min_dark_pixels);
    let col_span = content_span(&cols, params.min_dark_pixels);
    if row_span.is_none() && col_span.is_none() {
        return None;
    }
    let (top, bottom) = row_span.unwrap_or((0, height - 1));
    let (left, right) = col_span.unwrap_or((0, width - 1));

    let top = top.saturating_sub(params.margin);
    let left = left.saturating_sub(params.margin);
    let bottom = bottom.saturating_add(params.margin).min(height - 1);
    let right = right.saturating_add(params.margin).min(width - 1);
    if left >= right || top >= bottom {
        return None;
    }
    Some(Rect::new(left, top, right - left + 1, bottom - top + 1))
}

/// Absolute point for a terminal region: the center of its dark content, or
/// the geometric center when nothing stands out.
pub fn refine_centroid(region: &DynamicImage, offset: Point, params: &RefineParams) -> Point {
    let local = match refine_bounds(region, params) {
        Some(bounds) => Point::new(
            bounds.x + (bounds.width - 1) / 2,
            bounds.y + (bounds.height - 1) / 2,
        ),
        None => Point::new(region.width() / 2, region.height() / 2),
    };
    Point::new(offset.x + local.x, offset.y + local.y)
}

/// First and last index whose count exceeds `floor`.
fn content_span(counts: &[u32], floor: u32) -> Option<(u32, u32)> {
    let first = counts.iter().position(|count| *count > floor)?;
    let last = counts.iter().rposition(|count| *count > floor)?;
    Some((first as u32, last as u32))
}

fn dark_counts(gray: &GrayImage, threshold: u8) -> (Vec<u32>, Vec<u32>) {
    let (width, height) = gray.dimensions();
    let mut rows = vec![0u32; height as usize];
    let mut cols = vec![0u32; width as usize];
    for (x, y, pixel) in gray.enumerate_pixels() {
        if pixel.0[0] < threshold {
            rows[y as usize] += 1;
            cols[x as usize] += 1;
        }
    }
    (rows, cols)
}
