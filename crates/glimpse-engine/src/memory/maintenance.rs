use std::fs;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use glimpse_contracts::memory::Element;
use serde::Serialize;

use super::LocationMemory;

pub const DEFAULT_MAX_AGE_DAYS: u32 = 30;
pub const DEFAULT_MIN_SUCCESS_RATE: f64 = 0.2;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanReport {
    pub removed_elements: usize,
    pub removed_files: usize,
    /// Records whose reference file had already disappeared.
    pub cleared_references: usize,
}

/// Only elements that are both stale and unreliable are dropped.
pub fn should_retain(
    element: &Element,
    now: DateTime<Utc>,
    max_age: Duration,
    min_success_rate: f64,
) -> bool {
    now.signed_duration_since(element.last_found) <= max_age
        || element.success_rate >= min_success_rate
}

impl LocationMemory {
    pub fn clean_old_entries(
        &mut self,
        max_age_days: u32,
        min_success_rate: f64,
    ) -> Result<CleanReport> {
        self.clean_old_entries_at(Utc::now(), max_age_days, min_success_rate)
    }

    /// Evicts stale, unreliable elements, then makes the screenshots
    /// directory and the surviving records agree: unnamed files are deleted
    /// and names without a file are cleared.
    pub fn clean_old_entries_at(
        &mut self,
        now: DateTime<Utc>,
        max_age_days: u32,
        min_success_rate: f64,
    ) -> Result<CleanReport> {
        let max_age = Duration::days(i64::from(max_age_days));
        let before = self.store.elements.len();
        self.store
            .elements
            .retain(|element| should_retain(element, now, max_age, min_success_rate));
        let removed_elements = before - self.store.elements.len();

        let mut cleared_references = 0;
        let screenshots_dir = self.screenshots_dir().to_path_buf();
        for element in &mut self.store.elements {
            for record in &mut element.locations {
                let dangling = record
                    .screenshot_reference
                    .as_deref()
                    .map(|name| !screenshots_dir.join(name).is_file())
                    .unwrap_or(false);
                if dangling {
                    record.screenshot_reference = None;
                    cleared_references += 1;
                }
            }
        }
        self.persist()?;

        let referenced = self.store.referenced_files();
        let mut removed_files = 0;
        let entries = match fs::read_dir(&screenshots_dir) {
            Ok(entries) => Some(entries),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to list {}", screenshots_dir.display()))
            }
        };
        for entry in entries.into_iter().flatten() {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if referenced.contains(&name) {
                continue;
            }
            fs::remove_file(entry.path())
                .with_context(|| format!("failed to remove {}", entry.path().display()))?;
            log::debug!("removed orphaned reference {name}");
            removed_files += 1;
        }

        let report = CleanReport {
            removed_elements,
            removed_files,
            cleared_references,
        };
        log::info!(
            "memory cleanup: {} elements evicted, {} files deleted, {} references cleared",
            report.removed_elements,
            report.removed_files,
            report.cleared_references
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::path::Path;

    use glimpse_contracts::Point;
    use image::{DynamicImage, Rgb, RgbImage};

    use super::*;
    use crate::config::MemoryConfig;
    use crate::memory::RememberRequest;

    fn screen() -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_pixel(200, 200, Rgb([240, 240, 240])))
    }

    fn set_history(memory: &mut LocationMemory, id: &str, last_found: DateTime<Utc>, rate: f64) {
        if let Some(element) = memory.store.get_mut(id) {
            element.last_found = last_found;
            element.success_rate = rate;
        }
    }

    fn files_in(dir: &Path) -> anyhow::Result<BTreeSet<String>> {
        let mut names = BTreeSet::new();
        for entry in fs::read_dir(dir)? {
            names.insert(entry?.file_name().to_string_lossy().into_owned());
        }
        Ok(names)
    }

    #[test]
    fn retention_needs_both_stale_and_unreliable_to_evict() {
        let now = Utc::now();
        let max_age = Duration::days(30);
        let template = Element::new(
            "id",
            "Submit",
            None,
            "",
            glimpse_contracts::memory::LocationRecord {
                coordinates: Point::new(1, 1),
                screen_size: glimpse_contracts::Size::new(10, 10),
                element_rect: glimpse_contracts::Rect::new(0, 0, 2, 2),
                match_percentage: 80,
                timestamp: now,
                screen_hash: String::new(),
                screenshot_reference: None,
            },
        );
        let with = |age_days: i64, rate: f64| {
            let mut element = template.clone();
            element.last_found = now - Duration::days(age_days);
            element.success_rate = rate;
            element
        };

        assert!(!should_retain(&with(40, 0.1), now, max_age, 0.2));
        assert!(should_retain(&with(40, 0.5), now, max_age, 0.2));
        assert!(should_retain(&with(5, 0.1), now, max_age, 0.2));
        assert!(should_retain(&with(30, 0.0), now, max_age, 0.2));
        assert!(should_retain(&with(40, 0.2), now, max_age, 0.2));
    }

    #[test]
    fn clean_evicts_and_leaves_no_orphans() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let mut memory = LocationMemory::open(MemoryConfig::in_dir(temp.path()))?;
        let now = Utc::now();
        let mut remember = |query: &str, at: Point| {
            memory.save(&RememberRequest::new(query, at, 60), &screen())
        };
        let stale = remember("Stale", Point::new(20, 20))?;
        let reliable = remember("Reliable", Point::new(60, 60))?;
        let young = remember("Young", Point::new(120, 120))?;
        set_history(&mut memory, &stale, now - Duration::days(45), 0.1);
        set_history(&mut memory, &reliable, now - Duration::days(45), 0.9);
        set_history(&mut memory, &young, now - Duration::days(2), 0.05);

        let screenshots_dir = memory.config().screenshots_dir.clone();
        fs::write(screenshots_dir.join("stray.png"), b"not an image")?;
        let young_file = memory
            .element(&young)
            .and_then(|element| element.latest())
            .and_then(|record| record.screenshot_reference.clone())
            .unwrap_or_default();
        fs::remove_file(screenshots_dir.join(&young_file))?;

        let report =
            memory.clean_old_entries_at(now, DEFAULT_MAX_AGE_DAYS, DEFAULT_MIN_SUCCESS_RATE)?;
        assert_eq!(report.removed_elements, 1);
        assert_eq!(report.removed_files, 2);
        assert_eq!(report.cleared_references, 1);

        assert!(memory.element(&stale).is_none());
        assert!(memory.element(&reliable).is_some());
        assert!(memory.element(&young).is_some());

        let on_disk = files_in(&screenshots_dir)?;
        assert_eq!(on_disk, memory.store().referenced_files());
        for name in memory.store().referenced_files() {
            assert!(screenshots_dir.join(name).is_file());
        }

        let reopened = LocationMemory::open(MemoryConfig::in_dir(temp.path()))?;
        assert_eq!(reopened.elements().len(), 2);
        Ok(())
    }

    #[test]
    fn clean_with_nothing_to_do_is_a_no_op() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let mut memory = LocationMemory::open(MemoryConfig::in_dir(temp.path()))?;
        memory.save(&RememberRequest::new("OK", Point::new(20, 20), 60), &screen())?;
        let report = memory.clean_old_entries(DEFAULT_MAX_AGE_DAYS, DEFAULT_MIN_SUCCESS_RATE)?;
        assert_eq!(report, CleanReport::default());
        assert_eq!(memory.elements().len(), 1);
        Ok(())
    }
}
