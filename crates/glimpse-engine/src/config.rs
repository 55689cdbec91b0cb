use std::env;
use std::path::PathBuf;
use std::time::Duration;

use glimpse_contracts::Size;

/// How a region is split when the engine descends a level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    /// Halves: left/right when wider than tall, otherwise top/bottom.
    Text,
    /// Eight cells: 4×2 when at least as wide as tall, otherwise 2×4.
    Element,
}

impl SearchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchMode::Text => "text",
            SearchMode::Element => "element",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SearchConfig {
    pub mode: SearchMode,
    pub min_region_width: u32,
    pub min_region_height: u32,
    pub max_depth: u32,
    /// Confidence a terminal region must exceed to count as found.
    pub found_threshold: u8,
    /// Best cell confidence below this stops the descent.
    pub min_viable_confidence: u8,
    /// Best cell confidence below `ratio × parent` stops the descent.
    pub degradation_ratio: f64,
    pub min_cell_size: u32,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            mode: SearchMode::Text,
            min_region_width: 500,
            min_region_height: 100,
            max_depth: 8,
            found_threshold: 50,
            min_viable_confidence: 30,
            degradation_ratio: 0.8,
            min_cell_size: 10,
        }
    }
}

impl SearchConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            mode: match env::var("GLIMPSE_SEARCH_MODE")
                .ok()
                .map(|raw| raw.trim().to_ascii_lowercase())
                .as_deref()
            {
                Some("element") => SearchMode::Element,
                _ => defaults.mode,
            },
            min_region_width: env_u64("GLIMPSE_MIN_REGION_WIDTH", 1, 10_000)
                .map(|value| value as u32)
                .unwrap_or(defaults.min_region_width),
            min_region_height: env_u64("GLIMPSE_MIN_REGION_HEIGHT", 1, 10_000)
                .map(|value| value as u32)
                .unwrap_or(defaults.min_region_height),
            max_depth: env_u64("GLIMPSE_MAX_DEPTH", 1, 16)
                .map(|value| value as u32)
                .unwrap_or(defaults.max_depth),
            found_threshold: env_u64("GLIMPSE_FOUND_THRESHOLD", 0, 100)
                .map(|value| value as u8)
                .unwrap_or(defaults.found_threshold),
            min_viable_confidence: env_u64("GLIMPSE_MIN_VIABLE_CONFIDENCE", 0, 100)
                .map(|value| value as u8)
                .unwrap_or(defaults.min_viable_confidence),
            degradation_ratio: env_f64("GLIMPSE_DEGRADATION_RATIO", 0.0, 1.0)
                .unwrap_or(defaults.degradation_ratio),
            min_cell_size: defaults.min_cell_size,
        }
    }

    pub fn with_mode(mut self, mode: SearchMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn is_terminal_size(&self, size: Size) -> bool {
        size.width <= self.min_region_width && size.height <= self.min_region_height
    }

    /// Upper bound on wall-clock time for one search: every level may spend
    /// its full retry budget on a call.
    pub fn default_overall_timeout(&self, oracle: &OracleConfig) -> Duration {
        oracle
            .request_timeout
            .saturating_mul(self.max_depth.max(1))
            .saturating_mul(oracle.retry.max_attempts.max(1))
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total tries including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction of each delay randomized in either direction, 0.0–1.0.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            jitter: 0.25,
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: 0.0,
        }
    }

    /// Exponential delay before retry number `attempt` (1-based), before
    /// jitter is applied.
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct OracleConfig {
    pub api_base: String,
    pub api_key: Option<String>,
    pub model: String,
    pub request_timeout: Duration,
    /// Minimum gap between consecutive oracle calls.
    pub throttle: Duration,
    pub max_output_tokens: u32,
    pub retry: RetryPolicy,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.openai.com/v1".to_string(),
            api_key: None,
            model: "gpt-4o".to_string(),
            request_timeout: Duration::from_secs(60),
            throttle: Duration::from_millis(500),
            max_output_tokens: 300,
            retry: RetryPolicy::default(),
        }
    }
}

impl OracleConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let retry = RetryPolicy {
            max_attempts: env_u64("GLIMPSE_ORACLE_MAX_ATTEMPTS", 1, 8)
                .map(|value| value as u32)
                .unwrap_or(defaults.retry.max_attempts),
            base_delay: env_u64("GLIMPSE_ORACLE_BACKOFF_MS", 50, 10_000)
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry.base_delay),
            ..defaults.retry.clone()
        };
        Self {
            api_base: normalize_api_base(
                first_non_empty_env(&["OPENAI_API_BASE", "OPENAI_BASE_URL"])
                    .as_deref()
                    .unwrap_or(defaults.api_base.as_str()),
            ),
            api_key: first_non_empty_env(&["OPENAI_API_KEY"]),
            model: first_non_empty_env(&["GLIMPSE_ORACLE_MODEL"]).unwrap_or(defaults.model),
            request_timeout: env_f64("GLIMPSE_ORACLE_TIMEOUT_S", 1.0, 300.0)
                .map(Duration::from_secs_f64)
                .unwrap_or(defaults.request_timeout),
            throttle: env_u64("GLIMPSE_ORACLE_THROTTLE_MS", 0, 10_000)
                .map(Duration::from_millis)
                .unwrap_or(defaults.throttle),
            max_output_tokens: defaults.max_output_tokens,
            retry,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MemoryConfig {
    pub store_path: PathBuf,
    pub screenshots_dir: PathBuf,
    /// Reference crop size when the caller gives no element size.
    pub default_element_size: Size,
    /// Side of the square both crops are shrunk to before comparison.
    pub compare_size: u32,
    /// Minimum similarity (0–100) for a visual re-verification to pass.
    pub similarity_threshold: f64,
    pub context_threshold: f64,
    pub verify_max_offset: u32,
}

impl MemoryConfig {
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            store_path: dir.join("search_memory.json"),
            screenshots_dir: dir.join("memory_screenshots"),
            default_element_size: Size::new(100, 50),
            compare_size: 50,
            similarity_threshold: 70.0,
            context_threshold: 0.6,
            verify_max_offset: 10,
        }
    }

    pub fn from_env() -> Self {
        let dir = first_non_empty_env(&["GLIMPSE_HOME"])
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("glimpse-memory"));
        let mut config = Self::in_dir(dir);
        if let Some(threshold) = env_f64("GLIMPSE_SIMILARITY_THRESHOLD", 0.0, 100.0) {
            config.similarity_threshold = threshold;
        }
        if let Some(threshold) = env_f64("GLIMPSE_CONTEXT_THRESHOLD", 0.0, 1.0) {
            config.context_threshold = threshold;
        }
        config
    }
}

pub(crate) fn first_non_empty_env(keys: &[&str]) -> Option<String> {
    for key in keys {
        if let Ok(value) = env::var(key) {
            let trimmed = value.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }
    None
}

fn env_u64(key: &str, min: u64, max: u64) -> Option<u64> {
    env::var(key)
        .ok()
        .and_then(|raw| raw.trim().parse::<u64>().ok())
        .map(|value| value.clamp(min, max))
}

fn env_f64(key: &str, min: f64, max: f64) -> Option<f64> {
    env::var(key)
        .ok()
        .and_then(|raw| raw.trim().parse::<f64>().ok())
        .filter(|value| value.is_finite())
        .map(|value| value.clamp(min, max))
}

fn normalize_api_base(raw: &str) -> String {
    let mut base = raw.trim().trim_end_matches('/').to_string();
    if let Ok(parsed) = reqwest::Url::parse(&base) {
        if parsed.path().trim().is_empty() || parsed.path() == "/" {
            base = format!("{base}/v1");
        }
    }
    base.trim_end_matches('/').to_string()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn terminal_size_requires_both_axes() {
        let config = SearchConfig::default();
        assert!(config.is_terminal_size(Size::new(500, 100)));
        assert!(!config.is_terminal_size(Size::new(501, 50)));
        assert!(!config.is_terminal_size(Size::new(200, 101)));
    }

    #[test]
    fn backoff_doubles_until_capped() {
        let policy = RetryPolicy {
            max_attempts: 6,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(700),
            jitter: 0.0,
        };
        assert_eq!(policy.base_delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.base_delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.base_delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.base_delay_for(4), Duration::from_millis(700));
    }

    #[test]
    fn overall_timeout_multiplies_depth_attempts_and_call_timeout() {
        let search = SearchConfig {
            max_depth: 6,
            ..SearchConfig::default()
        };
        let oracle = OracleConfig {
            request_timeout: Duration::from_secs(10),
            retry: RetryPolicy {
                max_attempts: 3,
                ..RetryPolicy::default()
            },
            ..OracleConfig::default()
        };
        assert_eq!(
            search.default_overall_timeout(&oracle),
            Duration::from_secs(180)
        );
    }

    #[test]
    fn api_base_gains_version_path() {
        assert_eq!(
            normalize_api_base("https://example.test/"),
            "https://example.test/v1"
        );
        assert_eq!(
            normalize_api_base("https://example.test/openai/v1/"),
            "https://example.test/openai/v1"
        );
    }

    #[test]
    fn memory_config_places_files_in_dir() {
        let config = MemoryConfig::in_dir("/tmp/glimpse");
        assert!(config.store_path.ends_with("search_memory.json"));
        assert!(config.screenshots_dir.ends_with("memory_screenshots"));
        assert_eq!(config.default_element_size, Size::new(100, 50));
    }
}
