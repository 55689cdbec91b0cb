use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use glimpse_contracts::{Point, SearchRegion};
use image::{DynamicImage, Rgba, RgbaImage};

const MARKER_RADIUS: u32 = 6;
const MARKER_COLOR: Rgba<u8> = Rgba([255, 0, 0, 255]);

/// Writes the region crops examined by a search, plus the screenshot with
/// the located point marked.
#[derive(Debug, Clone)]
pub struct ArtifactWriter {
    dir: PathBuf,
}

impl ArtifactWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn region_path(&self, region: &SearchRegion) -> PathBuf {
        self.dir.join(format!(
            "square_depth_{}_offset_{}_{}.png",
            region.depth, region.rect.x, region.rect.y
        ))
    }

    pub fn result_path(&self) -> PathBuf {
        self.dir.join("result.png")
    }

    pub fn save_region(&self, region: &SearchRegion, crop: &DynamicImage) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create {}", self.dir.display()))?;
        let path = self.region_path(region);
        crop.save(&path)
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(path)
    }

    pub fn save_result(&self, screen: &DynamicImage, point: Point) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create {}", self.dir.display()))?;
        let mut marked = screen.to_rgba8();
        draw_marker(&mut marked, point, MARKER_RADIUS);
        let path = self.result_path();
        marked
            .save(&path)
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(path)
    }
}

/// Filled dot with a one-pixel crosshair through it. Pixels outside the
/// image are skipped.
pub fn draw_marker(image: &mut RgbaImage, point: Point, radius: u32) {
    let (width, height) = image.dimensions();
    let r = radius as i64;
    let (cx, cy) = (point.x as i64, point.y as i64);
    let mut paint = |x: i64, y: i64| {
        if x >= 0 && y >= 0 && (x as u32) < width && (y as u32) < height {
            image.put_pixel(x as u32, y as u32, MARKER_COLOR);
        }
    };
    for dy in -r..=r {
        for dx in -r..=r {
            if dx * dx + dy * dy <= r * r {
                paint(cx + dx, cy + dy);
            }
        }
    }
    for d in -(3 * r)..=(3 * r) {
        paint(cx + d, cy);
        paint(cx, cy + d);
    }
}
