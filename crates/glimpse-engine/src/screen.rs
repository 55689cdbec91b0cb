use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use glimpse_contracts::memory::screen_fingerprint_digest;
use glimpse_contracts::{Rect, Size};
use image::imageops::FilterType;
use image::DynamicImage;

const FINGERPRINT_SIDE: u32 = 100;

/// Where the current screenshot comes from.
pub trait ScreenSource {
    fn capture(&self) -> Result<DynamicImage>;
}

/// A fixed in-memory screenshot.
#[derive(Debug, Clone)]
pub struct StaticScreen {
    image: DynamicImage,
}

impl StaticScreen {
    pub fn new(image: DynamicImage) -> Self {
        Self { image }
    }
}

impl ScreenSource for StaticScreen {
    fn capture(&self) -> Result<DynamicImage> {
        Ok(self.image.clone())
    }
}

/// Re-reads an image file on every capture, so an external tool can keep
/// overwriting it.
#[derive(Debug, Clone)]
pub struct FileScreen {
    path: PathBuf,
}

impl FileScreen {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ScreenSource for FileScreen {
    fn capture(&self) -> Result<DynamicImage> {
        image::open(&self.path)
            .with_context(|| format!("failed to read screenshot {}", self.path.display()))
    }
}

pub fn screen_size(image: &DynamicImage) -> Size {
    Size::new(image.width(), image.height())
}

/// Perceptual fingerprint: 100×100 Lanczos downsample, greyscale, SHA-256.
pub fn fingerprint(image: &DynamicImage) -> String {
    let small = image
        .resize_exact(FINGERPRINT_SIDE, FINGERPRINT_SIDE, FilterType::Lanczos3)
        .to_luma8();
    screen_fingerprint_digest(small.as_raw())
}

/// Crop of `rect` clipped to the image; `None` when nothing overlaps.
pub fn crop(image: &DynamicImage, rect: Rect) -> Option<DynamicImage> {
    let clipped = rect.clip_to(screen_size(image))?;
    Some(image.crop_imm(clipped.x, clipped.y, clipped.width, clipped.height))
}

/// Visual similarity on a 0–100 scale: both images are shrunk to
/// `compare_size` square and greyscaled, then `max(0, 100 − mse/10)`.
pub fn similarity(a: &DynamicImage, b: &DynamicImage, compare_size: u32) -> f64 {
    let side = compare_size.max(1);
    let a = a.resize_exact(side, side, FilterType::Triangle).to_luma8();
    let b = b.resize_exact(side, side, FilterType::Triangle).to_luma8();
    let total: f64 = a
        .as_raw()
        .iter()
        .zip(b.as_raw())
        .map(|(left, right)| {
            let diff = *left as f64 - *right as f64;
            diff * diff
        })
        .sum();
    let mse = total / (side as f64 * side as f64);
    (100.0 - mse / 10.0).max(0.0)
}
