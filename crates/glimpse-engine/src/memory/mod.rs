mod maintenance;
mod similarity;

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use glimpse_contracts::memory::{
    element_id, load_store, write_store, Element, LocationRecord, MemoryStore, StoreLoad,
};
use glimpse_contracts::trace::{TraceEvent, TraceWriter};
use glimpse_contracts::{Point, Rect, Size};
use image::imageops::FilterType;
use image::DynamicImage;
use serde::Serialize;

use crate::config::MemoryConfig;
use crate::screen::{crop, fingerprint, screen_size, similarity};

pub use maintenance::{should_retain, CleanReport, DEFAULT_MAX_AGE_DAYS, DEFAULT_MIN_SUCCESS_RATE};
pub use similarity::{ContextSimilarity, TfIdfCosine, WordOverlap};

const MIN_CONTEXT_CHARS: usize = 5;

/// Everything needed to remember one successful location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RememberRequest {
    pub query: String,
    pub context: Option<String>,
    pub point: Point,
    pub confidence: u8,
    pub screen_context: String,
    /// Reference crop size; the configured default when absent.
    pub element_size: Option<Size>,
}

impl RememberRequest {
    pub fn new(query: impl Into<String>, point: Point, confidence: u8) -> Self {
        Self {
            query: query.into(),
            context: None,
            point,
            confidence,
            screen_context: String::new(),
            element_size: None,
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into()).filter(|value| !value.is_empty());
        self
    }

    pub fn with_screen_context(mut self, screen_context: impl Into<String>) -> Self {
        self.screen_context = screen_context.into();
        self
    }

    pub fn with_element_size(mut self, size: Size) -> Self {
        self.element_size = Some(size);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimilarElement {
    pub id: String,
    pub search_text: String,
    pub similarity: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecallOutcome {
    pub coordinates: Option<Point>,
    pub found_in_memory: bool,
    pub similar: Vec<SimilarElement>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemoryStats {
    pub total_elements: usize,
    pub total_locations: usize,
    pub avg_success_rate: f64,
    pub screenshot_count: usize,
    pub screenshot_bytes: u64,
    pub store_bytes: u64,
    pub store_path: PathBuf,
    pub screenshots_dir: PathBuf,
    pub last_updated: DateTime<Utc>,
}

/// Durable cache of previously located elements.
///
/// Every mutation is flushed to disk before the call returns. The store is
/// meant for a single process; nothing here locks the files.
pub struct LocationMemory {
    config: MemoryConfig,
    store: MemoryStore,
    similarity: Box<dyn ContextSimilarity>,
    trace: Option<TraceWriter>,
}

impl LocationMemory {
    pub fn open(config: MemoryConfig) -> Result<Self> {
        let (store, status) = load_store(&config.store_path);
        match &status {
            StoreLoad::Fresh => log::info!(
                "starting empty memory store at {}",
                config.store_path.display()
            ),
            StoreLoad::Loaded => log::info!(
                "loaded {} remembered elements from {}",
                store.elements.len(),
                config.store_path.display()
            ),
            StoreLoad::Recovered { reason } => log::warn!(
                "memory store {} discarded ({reason}); continuing empty",
                config.store_path.display()
            ),
        }
        fs::create_dir_all(&config.screenshots_dir).with_context(|| {
            format!(
                "failed to create screenshots dir {}",
                config.screenshots_dir.display()
            )
        })?;
        Ok(Self {
            config,
            store,
            similarity: Box::new(WordOverlap),
            trace: None,
        })
    }

    pub fn with_similarity(mut self, similarity: impl ContextSimilarity + 'static) -> Self {
        self.similarity = Box::new(similarity);
        self
    }

    pub fn with_trace(mut self, trace: TraceWriter) -> Self {
        self.trace = Some(trace);
        self
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    pub fn store(&self) -> &MemoryStore {
        &self.store
    }

    pub fn elements(&self) -> &[Element] {
        &self.store.elements
    }

    pub fn element(&self, id: &str) -> Option<&Element> {
        self.store.get(id)
    }

    /// Cached coordinate for `(query, context)` on `screen`, or `None`.
    ///
    /// An unknown identity leaves the store untouched. A known one is scanned
    /// most recent record first; the first record that confirms counts as a
    /// success, and if none does the element records a failed search.
    pub fn lookup(
        &mut self,
        query: &str,
        context: Option<&str>,
        screen: &DynamicImage,
        verify: bool,
    ) -> Result<Option<Point>> {
        let id = element_id(query, context);
        let Some(element) = self.store.get(&id) else {
            log::info!("{query:?} is not in memory");
            self.record(TraceEvent::CacheMiss {
                query: query.to_string(),
                element_id: id,
                known: false,
            });
            return Ok(None);
        };

        let size = screen_size(screen);
        let current_hash = if verify {
            fingerprint(screen)
        } else {
            String::new()
        };
        let confirmed = element.locations.iter().find_map(|record| {
            let point = record.scaled_coordinates(size);
            if !verify || self.confirm_record(record, screen, size, &current_hash) {
                Some(point)
            } else {
                None
            }
        });

        let now = Utc::now();
        let Some(element) = self.store.get_mut(&id) else {
            return Ok(None);
        };
        element.record_outcome(confirmed.is_some(), now);
        self.persist()?;

        match confirmed {
            Some(point) => {
                log::info!("{query:?} recalled at ({}, {})", point.x, point.y);
                self.record(TraceEvent::CacheHit {
                    element_id: id,
                    point,
                    via: "identity".to_string(),
                });
            }
            None => {
                log::info!("{query:?} is remembered but no stored location confirmed");
                self.record(TraceEvent::CacheMiss {
                    query: query.to_string(),
                    element_id: id,
                    known: true,
                });
            }
        }
        Ok(confirmed)
    }

    /// Stores a new sighting plus a reference crop taken from `screen`.
    /// Returns the element id.
    pub fn save(&mut self, request: &RememberRequest, screen: &DynamicImage) -> Result<String> {
        let id = element_id(&request.query, request.context.as_deref());
        let size = screen_size(screen);
        let element_size = request
            .element_size
            .unwrap_or(self.config.default_element_size);
        let wanted = Rect::centered_on(request.point, element_size);
        let element_rect = wanted.clip_to(size).unwrap_or(wanted);
        let timestamp = Utc::now();

        let screenshot_reference = match crop(screen, wanted) {
            Some(reference) => Some(self.write_reference(&id, timestamp, &reference)?),
            None => {
                log::warn!(
                    "({}, {}) lies outside the {}x{} screen; no reference crop saved",
                    request.point.x,
                    request.point.y,
                    size.width,
                    size.height
                );
                None
            }
        };
        let written = screenshot_reference.clone();
        let record = LocationRecord {
            coordinates: request.point,
            screen_size: size,
            element_rect,
            match_percentage: request.confidence.min(100),
            timestamp,
            screen_hash: fingerprint(screen),
            screenshot_reference,
        };

        let previous = self.store.get(&id).cloned();
        match self.store.get_mut(&id) {
            Some(element) => {
                element.push_location(record);
                if element.screen_context.trim().is_empty() {
                    element.screen_context = request.screen_context.clone();
                }
            }
            None => self.store.elements.push(Element::new(
                id.clone(),
                request.query.clone(),
                request.context.as_deref(),
                request.screen_context.clone(),
                record,
            )),
        }
        if let Err(err) = self.persist() {
            match previous {
                Some(previous) => {
                    if let Some(element) = self.store.get_mut(&id) {
                        *element = previous;
                    }
                }
                None => {
                    self.store.remove(&id);
                }
            }
            if let Some(name) = written {
                let path = self.reference_path(&name);
                if let Err(remove_err) = fs::remove_file(&path) {
                    log::warn!("failed removing {}: {remove_err}", path.display());
                }
            }
            return Err(err);
        }
        log::info!(
            "remembered {:?} at ({}, {}) as {}",
            request.query,
            request.point.x,
            request.point.y,
            id
        );
        Ok(id)
    }

    /// Counts a search made outside the cache. Returns whether the element
    /// is known.
    pub fn update_statistics(
        &mut self,
        query: &str,
        context: Option<&str>,
        success: bool,
    ) -> Result<bool> {
        let id = element_id(query, context);
        let Some(element) = self.store.get_mut(&id) else {
            log::info!("{query:?} is not in memory; statistics unchanged");
            return Ok(false);
        };
        element.record_outcome(success, Utc::now());
        let rate = element.success_rate;
        self.persist()?;
        log::info!("search statistics for {query:?} now at {rate:.2}");
        Ok(true)
    }

    /// Drops an element and its reference crops.
    pub fn remove_element(&mut self, id: &str) -> Result<bool> {
        let Some(element) = self.store.remove(id) else {
            log::info!("no element {id} to remove");
            return Ok(false);
        };
        self.persist()?;
        for name in element.screenshot_references() {
            let path = self.reference_path(name);
            match fs::remove_file(&path) {
                Ok(()) => log::debug!("removed reference {}", path.display()),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(err).with_context(|| format!("failed to remove {}", path.display()))
                }
            }
        }
        log::info!("removed element {id} ({:?})", element.search_text);
        Ok(true)
    }

    /// Edits the query and/or context text. The id follows the new texts so
    /// that lookups by the new wording resolve. `Ok(false)` when `id` is
    /// unknown; an error when the new texts collide with another element.
    pub fn update_element(
        &mut self,
        id: &str,
        new_query: Option<&str>,
        new_context: Option<&str>,
    ) -> Result<bool> {
        let Some(current) = self.store.get(id) else {
            log::info!("no element {id} to update");
            return Ok(false);
        };
        let query = new_query.unwrap_or(current.search_text.as_str()).to_string();
        let context = match new_context {
            Some(context) => context.to_string(),
            None => current.context_info.clone(),
        };
        let new_id = element_id(&query, Some(context.as_str()));
        if new_id != id && self.store.get(&new_id).is_some() {
            bail!("another element already uses query {query:?} with context {context:?}");
        }

        if let Some(element) = self.store.get_mut(id) {
            element.search_text = query;
            element.context_info = context;
            element.id = new_id.clone();
        }
        self.persist()?;
        log::info!("updated element {id} (now {new_id})");
        Ok(true)
    }

    pub fn stats(&self) -> Result<MemoryStats> {
        let total_elements = self.store.elements.len();
        let avg_success_rate = if total_elements == 0 {
            0.0
        } else {
            self.store
                .elements
                .iter()
                .map(|element| element.success_rate)
                .sum::<f64>()
                / total_elements as f64
        };
        let mut screenshot_count = 0;
        let mut screenshot_bytes = 0;
        for entry in fs::read_dir(&self.config.screenshots_dir).with_context(|| {
            format!("failed to list {}", self.config.screenshots_dir.display())
        })? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("png") {
                continue;
            }
            let metadata = entry.metadata()?;
            if metadata.is_file() {
                screenshot_count += 1;
                screenshot_bytes += metadata.len();
            }
        }
        let store_bytes = fs::metadata(&self.config.store_path)
            .map(|metadata| metadata.len())
            .unwrap_or(0);
        Ok(MemoryStats {
            total_elements,
            total_locations: self.store.total_locations(),
            avg_success_rate,
            screenshot_count,
            screenshot_bytes,
            store_bytes,
            store_path: self.config.store_path.clone(),
            screenshots_dir: self.config.screenshots_dir.clone(),
            last_updated: self.store.last_updated,
        })
    }

    /// Elements whose stored screen description resembles `screen_context`,
    /// best first. Descriptions shorter than five characters are skipped.
    pub fn find_by_context(&self, screen_context: &str) -> Vec<SimilarElement> {
        if screen_context.trim().chars().count() < MIN_CONTEXT_CHARS {
            log::warn!("screen context too short for a similarity search");
            return Vec::new();
        }
        let candidates: Vec<&Element> = self
            .store
            .elements
            .iter()
            .filter(|element| element.screen_context.trim().chars().count() >= MIN_CONTEXT_CHARS)
            .collect();
        if candidates.is_empty() {
            return Vec::new();
        }
        let texts: Vec<&str> = candidates
            .iter()
            .map(|element| element.screen_context.as_str())
            .collect();
        let scores = self.similarity.scores(screen_context, &texts);

        let mut similar: Vec<SimilarElement> = candidates
            .iter()
            .zip(scores)
            .filter(|(_, score)| *score >= self.config.context_threshold)
            .map(|(element, score)| SimilarElement {
                id: element.id.clone(),
                search_text: element.search_text.clone(),
                similarity: score,
            })
            .collect();
        similar.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
        log::info!(
            "{} elements share a similar screen context ({})",
            similar.len(),
            self.similarity.name()
        );
        similar
    }

    /// Re-finds an element near its last known rectangle by sliding the
    /// rescaled reference crop up to `max_offset` pixels in each direction.
    /// Returns the center of the best match when it clears the similarity
    /// threshold.
    pub fn verify_on_screen(
        &self,
        element: &Element,
        screen: &DynamicImage,
        max_offset: u32,
    ) -> Option<Point> {
        let record = element.latest()?;
        let reference = self.load_reference(record)?;
        let size = screen_size(screen);
        let expected = record.scaled_rect(size);
        if expected.is_empty() || expected.width > size.width || expected.height > size.height {
            return None;
        }
        let reference = if reference.width() == expected.width
            && reference.height() == expected.height
        {
            reference
        } else {
            reference.resize_exact(expected.width, expected.height, FilterType::Triangle)
        };

        let left = expected.x.saturating_sub(max_offset);
        let top = expected.y.saturating_sub(max_offset);
        let right = expected
            .right()
            .saturating_add(max_offset)
            .min(size.width);
        let bottom = expected
            .bottom()
            .saturating_add(max_offset)
            .min(size.height);

        let mut best: Option<(f64, Rect)> = None;
        let mut y = top;
        while y + expected.height <= bottom {
            let mut x = left;
            while x + expected.width <= right {
                let candidate = Rect::new(x, y, expected.width, expected.height);
                if let Some(current) = crop(screen, candidate) {
                    let score = similarity(&current, &reference, self.config.compare_size);
                    if best.map(|(leading, _)| score > leading).unwrap_or(true) {
                        best = Some((score, candidate));
                    }
                }
                x += 1;
            }
            y += 1;
        }

        let (score, rect) = best?;
        if score < self.config.similarity_threshold {
            log::info!(
                "{:?} not on screen near its last location (best similarity {score:.1})",
                element.search_text
            );
            return None;
        }
        let center = rect.center();
        log::info!(
            "{:?} verified on screen at ({}, {}) with similarity {score:.1}",
            element.search_text,
            center.x,
            center.y
        );
        Some(center)
    }

    /// Identity lookup first; on a miss, elements with a similar screen
    /// context whose text contains `query` are tried.
    pub fn recall(
        &mut self,
        query: &str,
        screen_context: &str,
        context: Option<&str>,
        screen: &DynamicImage,
        verify: bool,
    ) -> Result<RecallOutcome> {
        if let Some(point) = self.lookup(query, context, screen, verify)? {
            return Ok(RecallOutcome {
                coordinates: Some(point),
                found_in_memory: true,
                similar: Vec::new(),
            });
        }

        let similar = self.find_by_context(screen_context);
        let needle = query.to_lowercase();
        let candidate = similar
            .iter()
            .filter_map(|found| self.store.get(&found.id))
            .find(|element| element.search_text.to_lowercase().contains(&needle));

        let coordinates = candidate.and_then(|element| {
            if verify {
                self.verify_on_screen(element, screen, self.config.verify_max_offset)
            } else {
                element
                    .latest()
                    .map(|record| record.scaled_coordinates(screen_size(screen)))
            }
        });
        if let (Some(point), Some(element)) = (coordinates, candidate) {
            self.record(TraceEvent::CacheHit {
                element_id: element.id.clone(),
                point,
                via: "context".to_string(),
            });
        }
        Ok(RecallOutcome {
            coordinates,
            found_in_memory: coordinates.is_some(),
            similar,
        })
    }

    fn confirm_record(
        &self,
        record: &LocationRecord,
        screen: &DynamicImage,
        size: Size,
        current_hash: &str,
    ) -> bool {
        if !record.screen_hash.is_empty() && record.screen_hash == current_hash {
            log::debug!("screen fingerprint unchanged since {}", record.timestamp);
            return true;
        }
        let Some(reference) = self.load_reference(record) else {
            return false;
        };
        let Some(current) = crop(screen, record.scaled_rect(size)) else {
            return false;
        };
        let score = similarity(&current, &reference, self.config.compare_size);
        log::debug!("reference similarity {score:.1} for record from {}", record.timestamp);
        score >= self.config.similarity_threshold
    }

    fn load_reference(&self, record: &LocationRecord) -> Option<DynamicImage> {
        let name = record.screenshot_reference.as_deref()?;
        let path = self.reference_path(name);
        if !path.exists() {
            log::warn!("reference crop {} is missing", path.display());
            return None;
        }
        match image::open(&path) {
            Ok(reference) => Some(reference),
            Err(err) => {
                log::warn!("unreadable reference crop {}: {err}", path.display());
                None
            }
        }
    }

    fn write_reference(
        &self,
        id: &str,
        timestamp: DateTime<Utc>,
        reference: &DynamicImage,
    ) -> Result<String> {
        fs::create_dir_all(&self.config.screenshots_dir).with_context(|| {
            format!("failed to create {}", self.config.screenshots_dir.display())
        })?;
        let stem = format!("{id}_{}", timestamp.timestamp_millis());
        let mut name = format!("{stem}.png");
        let mut suffix = 1;
        while self.reference_path(&name).exists() {
            name = format!("{stem}_{suffix}.png");
            suffix += 1;
        }
        let path = self.reference_path(&name);
        reference
            .save(&path)
            .with_context(|| format!("failed to write reference crop {}", path.display()))?;
        Ok(name)
    }

    fn reference_path(&self, name: &str) -> PathBuf {
        self.config.screenshots_dir.join(name)
    }

    fn screenshots_dir(&self) -> &Path {
        &self.config.screenshots_dir
    }

    fn persist(&mut self) -> Result<()> {
        write_store(&self.config.store_path, &mut self.store)
    }

    fn record(&self, event: TraceEvent) {
        if let Some(trace) = self.trace.as_ref() {
            trace.record(&event);
        }
    }
}
