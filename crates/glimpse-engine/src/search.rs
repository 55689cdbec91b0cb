use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use glimpse_contracts::trace::{CellScore, TraceEvent, TraceWriter};
use glimpse_contracts::{MatchResult, Point, Rect, SearchRegion, Size};
use image::DynamicImage;
use serde::Serialize;

use crate::artifacts::ArtifactWriter;
use crate::cancel::CancelToken;
use crate::config::{SearchConfig, SearchMode};
use crate::oracle::{Oracle, RegionView, Target};
use crate::refine::{refine_centroid, RefineParams};
use crate::screen::screen_size;

/// A located target in absolute screenshot pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Located {
    pub point: Point,
    pub confidence: u8,
    /// Region the point was refined from.
    pub region: SearchRegion,
}

#[derive(Debug, Clone)]
pub struct SearchReport {
    pub located: Option<Located>,
    pub oracle_calls: u64,
    /// Deepest level examined.
    pub deepest: u32,
    pub elapsed: Duration,
}

impl SearchReport {
    pub fn found(&self) -> bool {
        self.located.is_some()
    }
}

/// Recursive region-narrowing search driven by an [`Oracle`].
pub struct SearchEngine {
    oracle: Arc<dyn Oracle>,
    config: SearchConfig,
    refine: RefineParams,
    trace: Option<TraceWriter>,
    artifacts: Option<ArtifactWriter>,
}

struct SearchRun<'a> {
    screen: &'a DynamicImage,
    target: &'a Target,
    cancel: &'a CancelToken,
    oracle_calls: u64,
    deepest: u32,
}

impl SearchEngine {
    pub fn new(oracle: Arc<dyn Oracle>, config: SearchConfig) -> Self {
        Self {
            oracle,
            config,
            refine: RefineParams::default(),
            trace: None,
            artifacts: None,
        }
    }

    pub fn with_trace(mut self, trace: TraceWriter) -> Self {
        self.trace = Some(trace);
        self
    }

    pub fn with_artifacts(mut self, dir: impl Into<PathBuf>) -> Self {
        self.artifacts = Some(ArtifactWriter::new(dir));
        self
    }

    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    pub fn oracle(&self) -> &Arc<dyn Oracle> {
        &self.oracle
    }

    /// Runs one search over `screen`. "Not found" is a normal outcome; only
    /// cancellation and timeouts are errors.
    pub fn search(
        &self,
        screen: &DynamicImage,
        target: &Target,
        cancel: &CancelToken,
    ) -> Result<SearchReport> {
        let started = Instant::now();
        let size = screen_size(screen);
        self.record(TraceEvent::SearchStarted {
            query: target.query.clone(),
            context: target.context().map(str::to_string),
            mode: self.config.mode.as_str().to_string(),
            width: size.width,
            height: size.height,
        });
        log::info!(
            "searching for {:?} in {}x{} screenshot ({} mode)",
            target.query,
            size.width,
            size.height,
            self.config.mode.as_str()
        );

        let mut run = SearchRun {
            screen,
            target,
            cancel,
            oracle_calls: 0,
            deepest: 0,
        };
        let root = SearchRegion::root(size);
        let located = if root.rect.is_empty() {
            log::warn!("empty screenshot; nothing to search");
            None
        } else {
            self.descend(&mut run, root, None)?
        };

        let report = SearchReport {
            located,
            oracle_calls: run.oracle_calls,
            deepest: run.deepest,
            elapsed: started.elapsed(),
        };
        self.record(TraceEvent::SearchFinished {
            found: report.found(),
            point: located.map(|hit| hit.point),
            confidence: located.map(|hit| hit.confidence),
            oracle_calls: report.oracle_calls,
            elapsed_ms: report.elapsed.as_millis(),
        });
        match located {
            Some(hit) => {
                log::info!(
                    "found {:?} at ({}, {}) with {}% confidence after {} oracle calls",
                    target.query,
                    hit.point.x,
                    hit.point.y,
                    hit.confidence,
                    report.oracle_calls
                );
                if let Some(artifacts) = self.artifacts.as_ref() {
                    if let Err(err) = artifacts.save_result(screen, hit.point) {
                        log::warn!("failed writing result artifact: {err:#}");
                    }
                }
            }
            None => log::info!(
                "{:?} not found after {} oracle calls",
                target.query,
                report.oracle_calls
            ),
        }
        Ok(report)
    }

    fn descend(
        &self,
        run: &mut SearchRun<'_>,
        region: SearchRegion,
        parent_confidence: Option<u8>,
    ) -> Result<Option<Located>> {
        run.cancel.check()?;
        run.deepest = run.deepest.max(region.depth);
        let crop = crop_region(run.screen, region.rect);
        self.save_region_artifact(&region, &crop);
        log::debug!(
            "checking {}x{} at ({}, {}), depth {}",
            region.width(),
            region.height(),
            region.rect.x,
            region.rect.y,
            region.depth
        );

        if !self.ask_presence(run, &crop, region)? {
            self.record(TraceEvent::RegionChecked {
                depth: region.depth,
                region: region.rect,
                present: false,
                confidence: None,
            });
            log::debug!("oracle denies the target at depth {}", region.depth);
            return Ok(None);
        }
        let current = self.ask_confidence(run, &crop, region)?;
        self.record(TraceEvent::RegionChecked {
            depth: region.depth,
            region: region.rect,
            present: true,
            confidence: Some(current),
        });

        let element_size = run.target.reference.as_ref().map(screen_size);
        let below_element = element_size
            .map(|size| region.width() < size.width || region.height() < size.height)
            .unwrap_or(false);
        if below_element
            || self.config.is_terminal_size(region.rect.size())
            || region.depth >= self.config.max_depth
        {
            if current > self.config.found_threshold {
                return Ok(Some(self.settle(&crop, region, current, "terminal")));
            }
            log::info!(
                "terminal region at depth {} only {}% confident (needs > {}%)",
                region.depth,
                current,
                self.config.found_threshold
            );
            return Ok(None);
        }

        let floor = cell_floor(self.config.min_cell_size, element_size);
        let Some(cells) = split_region(region.rect, self.config.mode, floor) else {
            return Ok(Some(self.settle(&crop, region, current, "cells too small")));
        };

        let mut scored = Vec::with_capacity(cells.len());
        for cell in cells {
            let child = region.child(cell);
            let cell_crop = crop_region(run.screen, cell);
            let confidence = self.ask_confidence(run, &cell_crop, child)?;
            scored.push(MatchResult {
                found: confidence > 0,
                confidence,
                region: child,
            });
        }
        let best = best_cell(&scored);
        self.record(TraceEvent::CellsScored {
            depth: region.depth,
            cells: scored
                .iter()
                .map(|cell| CellScore {
                    region: cell.region.rect,
                    confidence: cell.confidence,
                })
                .collect(),
            best,
        });

        let Some(best) = best.map(|index| scored[index]) else {
            return Ok(Some(self.settle(&crop, region, current, "no cell scored")));
        };
        if best.confidence < self.config.min_viable_confidence {
            return Ok(Some(self.settle(&crop, region, current, "best cell below viable")));
        }
        if let Some(parent) = parent_confidence.filter(|value| *value > 0) {
            if (best.confidence as f64) < parent as f64 * self.config.degradation_ratio {
                log::debug!(
                    "confidence degraded from {parent}% to {}% at depth {}",
                    best.confidence,
                    region.depth
                );
                return Ok(Some(self.settle(&crop, region, current, "confidence degraded")));
            }
        }

        match self.descend(run, best.region, Some(best.confidence))? {
            Some(hit) => Ok(Some(hit)),
            None => {
                let best_crop = crop_region(run.screen, best.region.rect);
                Ok(Some(self.settle(
                    &best_crop,
                    best.region,
                    best.confidence,
                    "deeper search failed",
                )))
            }
        }
    }

    fn settle(
        &self,
        crop: &DynamicImage,
        region: SearchRegion,
        confidence: u8,
        reason: &str,
    ) -> Located {
        let offset = Point::new(region.rect.x, region.rect.y);
        let point = refine_centroid(crop, offset, &self.refine);
        log::debug!(
            "refined depth {} region to ({}, {}): {reason}",
            region.depth,
            point.x,
            point.y
        );
        self.record(TraceEvent::Refined {
            depth: region.depth,
            region: region.rect,
            point,
            reason: reason.to_string(),
        });
        Located {
            point,
            confidence,
            region,
        }
    }

    fn ask_presence(
        &self,
        run: &mut SearchRun<'_>,
        crop: &DynamicImage,
        region: SearchRegion,
    ) -> Result<bool> {
        run.cancel.check()?;
        run.oracle_calls += 1;
        let view = RegionView {
            image: crop,
            region,
        };
        match self.oracle.is_present(&view, run.target, run.cancel) {
            Ok(present) => Ok(present),
            Err(err) => {
                run.cancel.check()?;
                log::warn!("presence check failed at depth {}: {err:#}", region.depth);
                Ok(false)
            }
        }
    }

    fn ask_confidence(
        &self,
        run: &mut SearchRun<'_>,
        crop: &DynamicImage,
        region: SearchRegion,
    ) -> Result<u8> {
        run.cancel.check()?;
        run.oracle_calls += 1;
        let view = RegionView {
            image: crop,
            region,
        };
        match self.oracle.confidence(&view, run.target, run.cancel) {
            Ok(confidence) => Ok(confidence.min(100)),
            Err(err) => {
                run.cancel.check()?;
                log::warn!("confidence query failed at depth {}: {err:#}", region.depth);
                Ok(0)
            }
        }
    }

    fn save_region_artifact(&self, region: &SearchRegion, crop: &DynamicImage) {
        if let Some(artifacts) = self.artifacts.as_ref() {
            if let Err(err) = artifacts.save_region(region, crop) {
                log::warn!("failed writing region artifact: {err:#}");
            }
        }
    }

    fn record(&self, event: TraceEvent) {
        if let Some(trace) = self.trace.as_ref() {
            trace.record(&event);
        }
    }
}

/// Smallest cell worth asking about: `min_cell` square, grown to the
/// reference element's size when there is one.
pub fn cell_floor(min_cell: u32, element_size: Option<Size>) -> Size {
    let min_cell = min_cell.max(1);
    match element_size {
        Some(size) => Size::new(min_cell.max(size.width), min_cell.max(size.height)),
        None => Size::new(min_cell, min_cell),
    }
}

/// Cells for the next level in row-major order, or `None` when they would
/// be narrower or shorter than `floor`. The last row and column take any
/// remainder.
pub fn split_region(rect: Rect, mode: SearchMode, floor: Size) -> Option<Vec<Rect>> {
    let (cols, rows) = match mode {
        SearchMode::Text if rect.width > rect.height => (2, 1),
        SearchMode::Text => (1, 2),
        SearchMode::Element if rect.width >= rect.height => (4, 2),
        SearchMode::Element => (2, 4),
    };
    let cell_width = rect.width / cols;
    let cell_height = rect.height / rows;
    if cell_width < floor.width.max(1) || cell_height < floor.height.max(1) {
        return None;
    }
    let mut cells = Vec::with_capacity((cols * rows) as usize);
    for row in 0..rows {
        for col in 0..cols {
            let x = col * cell_width;
            let y = row * cell_height;
            let width = if col + 1 == cols {
                rect.width - x
            } else {
                cell_width
            };
            let height = if row + 1 == rows {
                rect.height - y
            } else {
                cell_height
            };
            cells.push(Rect::new(rect.x + x, rect.y + y, width, height));
        }
    }
    Some(cells)
}

/// Index of the strictly highest positive score; ties go to the earlier cell.
fn best_cell(scored: &[MatchResult]) -> Option<usize> {
    let mut best: Option<(usize, u8)> = None;
    for (index, cell) in scored.iter().enumerate() {
        let leading = best.map(|(_, confidence)| confidence).unwrap_or(0);
        if cell.confidence > leading {
            best = Some((index, cell.confidence));
        }
    }
    best.map(|(index, _)| index)
}

fn crop_region(screen: &DynamicImage, rect: Rect) -> DynamicImage {
    screen.crop_imm(rect.x, rect.y, rect.width, rect.height)
}
