use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::geometry::{Point, Rect, Size};

pub const STORE_SCHEMA_VERSION: u32 = 1;

/// One sighting of an element on a particular screen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationRecord {
    pub coordinates: Point,
    pub screen_size: Size,
    pub element_rect: Rect,
    pub match_percentage: u8,
    pub timestamp: DateTime<Utc>,
    pub screen_hash: String,
    /// File name of the reference crop inside the screenshots directory.
    pub screenshot_reference: Option<String>,
}

impl LocationRecord {
    pub fn scaled_coordinates(&self, current: Size) -> Point {
        self.coordinates.rescale(self.screen_size, current)
    }

    pub fn scaled_rect(&self, current: Size) -> Rect {
        self.element_rect.rescale(self.screen_size, current)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Element {
    pub id: String,
    pub search_text: String,
    pub context_info: String,
    pub screen_context: String,
    pub created: DateTime<Utc>,
    pub last_found: DateTime<Utc>,
    /// Most recent first.
    pub locations: Vec<LocationRecord>,
    pub success_count: u64,
    pub total_searches: u64,
    pub success_rate: f64,
}

impl Element {
    pub fn new(
        id: impl Into<String>,
        search_text: impl Into<String>,
        context_info: Option<&str>,
        screen_context: impl Into<String>,
        first: LocationRecord,
    ) -> Self {
        let seen = first.timestamp;
        Self {
            id: id.into(),
            search_text: search_text.into(),
            context_info: context_info.unwrap_or_default().to_string(),
            screen_context: screen_context.into(),
            created: seen,
            last_found: seen,
            locations: vec![first],
            success_count: 1,
            total_searches: 1,
            success_rate: 1.0,
        }
    }

    pub fn context(&self) -> Option<&str> {
        Some(self.context_info.as_str()).filter(|value| !value.is_empty())
    }

    pub fn latest(&self) -> Option<&LocationRecord> {
        self.locations.first()
    }

    /// Adds a fresh sighting at the head of the history and counts it as a
    /// successful search.
    pub fn push_location(&mut self, record: LocationRecord) {
        let seen = record.timestamp;
        self.locations.insert(0, record);
        self.record_outcome(true, seen);
    }

    pub fn record_outcome(&mut self, success: bool, at: DateTime<Utc>) {
        self.total_searches += 1;
        if success {
            self.success_count += 1;
            self.last_found = at;
        }
        self.refresh_success_rate();
    }

    pub fn refresh_success_rate(&mut self) {
        self.success_rate = if self.total_searches == 0 {
            0.0
        } else {
            self.success_count as f64 / self.total_searches as f64
        };
    }

    pub fn screenshot_references(&self) -> impl Iterator<Item = &str> {
        self.locations
            .iter()
            .filter_map(|location| location.screenshot_reference.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryStore {
    pub elements: Vec<Element>,
    pub last_updated: DateTime<Utc>,
    pub version: u32,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::empty()
    }
}

impl MemoryStore {
    pub fn empty() -> Self {
        Self {
            elements: Vec::new(),
            last_updated: Utc::now(),
            version: STORE_SCHEMA_VERSION,
        }
    }

    pub fn get(&self, id: &str) -> Option<&Element> {
        self.elements.iter().find(|element| element.id == id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Element> {
        self.elements.iter_mut().find(|element| element.id == id)
    }

    pub fn remove(&mut self, id: &str) -> Option<Element> {
        let index = self.elements.iter().position(|element| element.id == id)?;
        Some(self.elements.remove(index))
    }

    pub fn referenced_files(&self) -> BTreeSet<String> {
        self.elements
            .iter()
            .flat_map(Element::screenshot_references)
            .map(str::to_string)
            .collect()
    }

    pub fn total_locations(&self) -> usize {
        self.elements
            .iter()
            .map(|element| element.locations.len())
            .sum()
    }
}
