use std::time::Duration;

use anyhow::Result;
use glimpse_contracts::memory::element_id;
use glimpse_contracts::Point;
use image::DynamicImage;
use serde::Serialize;

use crate::cancel::CancelToken;
use crate::memory::{LocationMemory, RememberRequest};
use crate::oracle::Target;
use crate::screen::ScreenSource;
use crate::search::{SearchEngine, SearchReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LocateSource {
    Memory,
    Search,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LocateOutcome {
    pub point: Option<Point>,
    pub confidence: Option<u8>,
    pub source: Option<LocateSource>,
    /// Cache identity of the target, set whenever a point was produced.
    pub element_id: Option<String>,
    pub oracle_calls: u64,
}

impl LocateOutcome {
    fn missing(oracle_calls: u64) -> Self {
        Self {
            point: None,
            confidence: None,
            source: None,
            element_id: None,
            oracle_calls,
        }
    }
}

/// Search engine, location cache and screen source behind one entry point.
pub struct Locator {
    engine: SearchEngine,
    memory: LocationMemory,
    screen: Box<dyn ScreenSource>,
    search_timeout: Option<Duration>,
}

impl Locator {
    pub fn new(
        engine: SearchEngine,
        memory: LocationMemory,
        screen: impl ScreenSource + 'static,
    ) -> Self {
        Self {
            engine,
            memory,
            screen: Box::new(screen),
            search_timeout: None,
        }
    }

    /// Caps every search started by [`Locator::locate_or_search`].
    pub fn with_search_timeout(mut self, timeout: Duration) -> Self {
        self.search_timeout = Some(timeout);
        self
    }

    pub fn engine(&self) -> &SearchEngine {
        &self.engine
    }

    pub fn memory(&self) -> &LocationMemory {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut LocationMemory {
        &mut self.memory
    }

    /// Full region search over an explicit screenshot; the cache is not
    /// consulted.
    pub fn locate(
        &self,
        target: &Target,
        screenshot: &DynamicImage,
        cancel: &CancelToken,
    ) -> Result<SearchReport> {
        self.engine.search(screenshot, target, cancel)
    }

    /// Cache-only lookup against a fresh capture, with visual verification.
    pub fn locate_cached(&mut self, query: &str, context: Option<&str>) -> Result<Option<Point>> {
        let screen = self.screen.capture()?;
        self.memory.lookup(query, context, &screen, true)
    }

    /// Remembers `request` against a fresh capture.
    pub fn remember(&mut self, request: &RememberRequest) -> Result<String> {
        let screen = self.screen.capture()?;
        self.memory.save(request, &screen)
    }

    pub fn locate_or_search(
        &mut self,
        target: &Target,
        cancel: &CancelToken,
    ) -> Result<LocateOutcome> {
        let screen = self.screen.capture()?;
        if let Some(point) = self
            .memory
            .lookup(&target.query, target.context(), &screen, true)?
        {
            return Ok(LocateOutcome {
                point: Some(point),
                confidence: None,
                source: Some(LocateSource::Memory),
                element_id: Some(element_id(&target.query, target.context())),
                oracle_calls: 0,
            });
        }

        let cancel = match self.search_timeout {
            Some(timeout) => cancel.child_with_timeout(timeout),
            None => cancel.clone(),
        };
        let report = self.engine.search(&screen, target, &cancel)?;
        let Some(hit) = report.located else {
            return Ok(LocateOutcome::missing(report.oracle_calls));
        };

        let screen_context = match self.engine.oracle().describe_screen(&screen, &cancel) {
            Ok(description) => description,
            Err(err) => {
                cancel.check()?;
                log::warn!("screen description failed: {err:#}");
                String::new()
            }
        };
        let mut request = RememberRequest::new(target.query.clone(), hit.point, hit.confidence)
            .with_screen_context(screen_context);
        if let Some(context) = target.context() {
            request = request.with_context(context);
        }
        let id = self.memory.save(&request, &screen)?;

        Ok(LocateOutcome {
            point: Some(hit.point),
            confidence: Some(hit.confidence),
            source: Some(LocateSource::Search),
            element_id: Some(id),
            oracle_calls: report.oracle_calls,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    use image::{Rgb, RgbImage};

    use super::*;
    use crate::config::{MemoryConfig, SearchConfig};
    use crate::oracle::{Oracle, RegionView};
    use crate::screen::StaticScreen;

    /// Sees the target wherever the crop contains dark pixels.
    #[derive(Default)]
    struct DarkPixelOracle {
        calls: AtomicU64,
        description: String,
    }

    impl DarkPixelOracle {
        fn sees_target(&self, view: &RegionView<'_>) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            view.image.to_luma8().pixels().any(|pixel| pixel.0[0] < 128)
        }
    }

    impl Oracle for DarkPixelOracle {
        fn is_present(
            &self,
            view: &RegionView<'_>,
            _target: &Target,
            _cancel: &CancelToken,
        ) -> Result<bool> {
            Ok(self.sees_target(view))
        }

        fn confidence(
            &self,
            view: &RegionView<'_>,
            _target: &Target,
            _cancel: &CancelToken,
        ) -> Result<u8> {
            Ok(if self.sees_target(view) { 90 } else { 0 })
        }

        fn describe_screen(&self, _screen: &DynamicImage, _cancel: &CancelToken) -> Result<String> {
            Ok(self.description.clone())
        }
    }

    fn screen_with_button() -> DynamicImage {
        let mut image = RgbImage::from_pixel(800, 200, Rgb([250, 250, 250]));
        for y in 150..160 {
            for x in 600..620 {
                image.put_pixel(x, y, Rgb([20, 20, 20]));
            }
        }
        DynamicImage::ImageRgb8(image)
    }

    fn locator(
        dir: &std::path::Path,
        screen: DynamicImage,
    ) -> anyhow::Result<(Locator, Arc<DarkPixelOracle>)> {
        let oracle = Arc::new(DarkPixelOracle {
            description: "settings window with a dark apply button".to_string(),
            ..DarkPixelOracle::default()
        });
        let engine = SearchEngine::new(oracle.clone(), SearchConfig::default());
        let memory = LocationMemory::open(MemoryConfig::in_dir(dir))?;
        let locator = Locator::new(engine, memory, StaticScreen::new(screen))
            .with_search_timeout(Duration::from_secs(30));
        Ok((locator, oracle))
    }

    #[test]
    fn search_result_is_remembered_and_reused() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let (mut locator, oracle) = locator(temp.path(), screen_with_button())?;
        let target = Target::text("Apply").with_context("settings");

        let first = locator.locate_or_search(&target, &CancelToken::new())?;
        assert_eq!(first.source, Some(LocateSource::Search));
        assert_eq!(first.confidence, Some(90));
        assert_eq!(first.oracle_calls, 14);
        let point = first.point.ok_or_else(|| anyhow::anyhow!("search missed"))?;
        assert!((595..=625).contains(&point.x), "x = {}", point.x);
        assert!((145..=165).contains(&point.y), "y = {}", point.y);

        let id = first
            .element_id
            .clone()
            .ok_or_else(|| anyhow::anyhow!("nothing remembered"))?;
        let element = locator
            .memory()
            .element(&id)
            .ok_or_else(|| anyhow::anyhow!("element missing"))?;
        assert_eq!(element.screen_context, "settings window with a dark apply button");
        assert_eq!(element.context(), Some("settings"));

        let calls_before = oracle.calls.load(Ordering::SeqCst);
        let second = locator.locate_or_search(&target, &CancelToken::new())?;
        assert_eq!(second.source, Some(LocateSource::Memory));
        assert_eq!(second.point, Some(point));
        assert_eq!(second.element_id, Some(id));
        assert_eq!(oracle.calls.load(Ordering::SeqCst), calls_before);
        Ok(())
    }

    #[test]
    fn nothing_is_remembered_when_the_search_misses() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let blank = DynamicImage::ImageRgb8(RgbImage::from_pixel(800, 200, Rgb([250, 250, 250])));
        let (mut locator, _oracle) = locator(temp.path(), blank)?;

        let outcome = locator.locate_or_search(&Target::text("Apply"), &CancelToken::new())?;
        assert_eq!(outcome, LocateOutcome::missing(1));
        assert!(locator.memory().elements().is_empty());
        Ok(())
    }

    #[test]
    fn cancelled_search_is_an_error() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let (mut locator, oracle) = locator(temp.path(), screen_with_button())?;
        let cancel = CancelToken::new();
        cancel.cancel();

        let err = locator
            .locate_or_search(&Target::text("Apply"), &cancel)
            .err()
            .ok_or_else(|| anyhow::anyhow!("cancelled search succeeded"))?;
        assert!(format!("{err:#}").contains("cancelled"));
        assert_eq!(oracle.calls.load(Ordering::SeqCst), 0);
        assert!(locator.memory().elements().is_empty());
        Ok(())
    }

    #[test]
    fn remember_then_locate_cached() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let (mut locator, oracle) = locator(temp.path(), screen_with_button())?;

        assert_eq!(locator.locate_cached("Apply", None)?, None);
        locator.remember(&RememberRequest::new("Apply", Point::new(610, 155), 88))?;
        assert_eq!(locator.locate_cached("apply", None)?, Some(Point::new(610, 155)));
        assert_eq!(oracle.calls.load(Ordering::SeqCst), 0);
        Ok(())
    }

    #[test]
    fn locate_searches_the_given_screenshot() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let blank = DynamicImage::ImageRgb8(RgbImage::from_pixel(800, 200, Rgb([250, 250, 250])));
        let (locator, _oracle) = locator(temp.path(), blank)?;

        let report = locator.locate(
            &Target::text("Apply"),
            &screen_with_button(),
            &CancelToken::new(),
        )?;
        assert!(report.found());
        assert_eq!(report.deepest, 3);
        assert!(locator.memory().elements().is_empty());
        Ok(())
    }
}
