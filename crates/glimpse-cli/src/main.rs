use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use glimpse_contracts::trace::TraceWriter;
use glimpse_contracts::{Point, Size};
use glimpse_engine::memory::{TfIdfCosine, DEFAULT_MAX_AGE_DAYS, DEFAULT_MIN_SUCCESS_RATE};
use glimpse_engine::{
    CancelToken, FileScreen, LocationMemory, Locator, MemoryConfig, OracleClient, OracleConfig,
    RememberRequest, SearchConfig, SearchEngine, SearchMode, Target,
};
use serde::Serialize;
use serde_json::json;

#[derive(Debug, Parser)]
#[command(name = "glimpse", version, about = "Locate UI targets in screenshots")]
struct Cli {
    /// Directory holding the location store and reference crops.
    #[arg(long, global = true, env = "GLIMPSE_HOME", default_value = "glimpse-memory")]
    memory_dir: PathBuf,
    /// Rank screen contexts with TF-IDF cosine instead of word overlap.
    #[arg(long, global = true)]
    tfidf: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Find a target, trying the location cache before a region search.
    Locate(LocateArgs),
    /// Look a target up in the cache only.
    Recall(RecallArgs),
    /// Store a known location.
    Remember(RememberArgs),
    /// Elements remembered on screens with a similar description.
    Similar(SimilarArgs),
    List,
    Stats,
    Update(UpdateArgs),
    Remove(RemoveArgs),
    /// Evict stale, unreliable elements and orphaned reference crops.
    Clean(CleanArgs),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ModeArg {
    Text,
    Element,
}

impl From<ModeArg> for SearchMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Text => SearchMode::Text,
            ModeArg::Element => SearchMode::Element,
        }
    }
}

#[derive(Debug, Parser)]
struct LocateArgs {
    #[arg(long)]
    screenshot: PathBuf,
    #[arg(long)]
    query: String,
    #[arg(long)]
    context: Option<String>,
    #[arg(long, value_enum)]
    mode: Option<ModeArg>,
    /// Picture of the element, sent alongside every region.
    #[arg(long)]
    reference: Option<PathBuf>,
    /// Write per-region crops and the marked result here.
    #[arg(long)]
    artifacts: Option<PathBuf>,
    /// Append a JSONL search trace to this file.
    #[arg(long)]
    trace: Option<PathBuf>,
    /// Skip the cache and do not remember the result.
    #[arg(long)]
    no_cache: bool,
    /// Overall search timeout in seconds.
    #[arg(long)]
    timeout_secs: Option<u64>,
}

#[derive(Debug, Parser)]
struct RecallArgs {
    #[arg(long)]
    screenshot: PathBuf,
    #[arg(long)]
    query: String,
    #[arg(long)]
    context: Option<String>,
    #[arg(long, default_value = "")]
    screen_context: String,
    /// Trust stored coordinates without comparing reference crops.
    #[arg(long)]
    no_verify: bool,
}

#[derive(Debug, Parser)]
struct RememberArgs {
    #[arg(long)]
    screenshot: PathBuf,
    #[arg(long)]
    query: String,
    #[arg(long)]
    x: u32,
    #[arg(long)]
    y: u32,
    #[arg(long, default_value_t = 100)]
    confidence: u8,
    #[arg(long)]
    context: Option<String>,
    #[arg(long, default_value = "")]
    screen_context: String,
    #[arg(long, requires = "height")]
    width: Option<u32>,
    #[arg(long, requires = "width")]
    height: Option<u32>,
}

#[derive(Debug, Parser)]
struct SimilarArgs {
    #[arg(long)]
    screen_context: String,
}

#[derive(Debug, Parser)]
struct UpdateArgs {
    #[arg(long)]
    id: String,
    #[arg(long)]
    query: Option<String>,
    #[arg(long)]
    context: Option<String>,
}

#[derive(Debug, Parser)]
struct RemoveArgs {
    #[arg(long)]
    id: String,
}

#[derive(Debug, Parser)]
struct CleanArgs {
    #[arg(long, default_value_t = DEFAULT_MAX_AGE_DAYS)]
    max_age_days: u32,
    #[arg(long, default_value_t = DEFAULT_MIN_SUCCESS_RATE)]
    min_success_rate: f64,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("glimpse error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let memory_config = memory_config(&cli.memory_dir);
    match cli.command {
        Command::Locate(args) => run_locate(memory_config, cli.tfidf, args),
        Command::Recall(args) => {
            let mut memory = open_memory(memory_config, cli.tfidf)?;
            let screen = load_image(&args.screenshot)?;
            let outcome = memory.recall(
                &args.query,
                &args.screen_context,
                args.context.as_deref(),
                &screen,
                !args.no_verify,
            )?;
            print_json(&outcome)?;
            Ok(if outcome.found_in_memory { 0 } else { 2 })
        }
        Command::Remember(args) => {
            let mut memory = open_memory(memory_config, cli.tfidf)?;
            let screen = load_image(&args.screenshot)?;
            let mut request =
                RememberRequest::new(args.query, Point::new(args.x, args.y), args.confidence)
                    .with_screen_context(args.screen_context);
            if let Some(context) = args.context {
                request = request.with_context(context);
            }
            if let (Some(width), Some(height)) = (args.width, args.height) {
                request = request.with_element_size(Size::new(width, height));
            }
            let id = memory.save(&request, &screen)?;
            print_json(&json!({ "element_id": id }))?;
            Ok(0)
        }
        Command::Similar(args) => {
            let memory = open_memory(memory_config, cli.tfidf)?;
            print_json(&memory.find_by_context(&args.screen_context))?;
            Ok(0)
        }
        Command::List => {
            let memory = open_memory(memory_config, cli.tfidf)?;
            let listing: Vec<_> = memory
                .elements()
                .iter()
                .map(|element| {
                    json!({
                        "id": element.id,
                        "search_text": element.search_text,
                        "context_info": element.context_info,
                        "screen_context": element.screen_context,
                        "locations": element.locations.len(),
                        "latest": element.latest().map(|record| record.coordinates),
                        "success_rate": element.success_rate,
                        "last_found": element.last_found,
                    })
                })
                .collect();
            print_json(&listing)?;
            Ok(0)
        }
        Command::Stats => {
            let memory = open_memory(memory_config, cli.tfidf)?;
            print_json(&memory.stats()?)?;
            Ok(0)
        }
        Command::Update(args) => {
            if args.query.is_none() && args.context.is_none() {
                bail!("update needs --query and/or --context");
            }
            let mut memory = open_memory(memory_config, cli.tfidf)?;
            let updated =
                memory.update_element(&args.id, args.query.as_deref(), args.context.as_deref())?;
            print_json(&json!({ "updated": updated }))?;
            Ok(if updated { 0 } else { 2 })
        }
        Command::Remove(args) => {
            let mut memory = open_memory(memory_config, cli.tfidf)?;
            let removed = memory.remove_element(&args.id)?;
            print_json(&json!({ "removed": removed }))?;
            Ok(if removed { 0 } else { 2 })
        }
        Command::Clean(args) => {
            let mut memory = open_memory(memory_config, cli.tfidf)?;
            let report = memory.clean_old_entries(args.max_age_days, args.min_success_rate)?;
            print_json(&report)?;
            Ok(0)
        }
    }
}

fn run_locate(memory_config: MemoryConfig, tfidf: bool, args: LocateArgs) -> Result<i32> {
    let oracle_config = OracleConfig::from_env();
    let mut search_config = SearchConfig::from_env();
    if let Some(mode) = args.mode {
        search_config = search_config.with_mode(mode.into());
    }
    let timeout = args
        .timeout_secs
        .map(std::time::Duration::from_secs)
        .unwrap_or_else(|| search_config.default_overall_timeout(&oracle_config));

    let oracle = OracleClient::from_config(&oracle_config)?;
    log::info!("oracle transport: {}", oracle.transport_name());
    let mut engine = SearchEngine::new(Arc::new(oracle), search_config);
    let mut memory = open_memory(memory_config, tfidf)?;
    if let Some(path) = args.trace.as_ref() {
        let trace = TraceWriter::new(path);
        engine = engine.with_trace(trace.clone());
        memory = memory.with_trace(trace);
    }
    if let Some(dir) = args.artifacts.as_ref() {
        engine = engine.with_artifacts(dir);
    }

    let mut target = Target::text(args.query);
    if let Some(context) = args.context {
        target = target.with_context(context);
    }
    if let Some(path) = args.reference.as_ref() {
        target = target.with_reference(load_image(path)?);
    }

    let mut locator = Locator::new(engine, memory, FileScreen::new(&args.screenshot))
        .with_search_timeout(timeout);
    let cancel = CancelToken::new();
    if args.no_cache {
        let screen = load_image(&args.screenshot)?;
        let report = locator.locate(&target, &screen, &cancel.child_with_timeout(timeout))?;
        print_json(&json!({
            "point": report.located.map(|hit| hit.point),
            "confidence": report.located.map(|hit| hit.confidence),
            "source": report.located.map(|_| "search"),
            "oracle_calls": report.oracle_calls,
            "deepest": report.deepest,
            "elapsed_ms": report.elapsed.as_millis(),
        }))?;
        return Ok(if report.found() { 0 } else { 2 });
    }

    let outcome = locator.locate_or_search(&target, &cancel)?;
    print_json(&outcome)?;
    Ok(if outcome.point.is_some() { 0 } else { 2 })
}

fn memory_config(dir: &Path) -> MemoryConfig {
    let defaults = MemoryConfig::from_env();
    MemoryConfig {
        similarity_threshold: defaults.similarity_threshold,
        context_threshold: defaults.context_threshold,
        ..MemoryConfig::in_dir(dir)
    }
}

fn open_memory(config: MemoryConfig, tfidf: bool) -> Result<LocationMemory> {
    let memory = LocationMemory::open(config)?;
    Ok(if tfidf {
        memory.with_similarity(TfIdfCosine)
    } else {
        memory
    })
}

fn load_image(path: &Path) -> Result<image::DynamicImage> {
    image::open(path).with_context(|| format!("failed to read image {}", path.display()))
}

fn print_json(value: &impl Serialize) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value).context("failed to render output")?;
    println!("{rendered}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locate_flags_parse() -> anyhow::Result<()> {
        let cli = Cli::try_parse_from([
            "glimpse",
            "--memory-dir",
            "/tmp/mem",
            "locate",
            "--screenshot",
            "shot.png",
            "--query",
            "Submit",
            "--mode",
            "element",
            "--no-cache",
        ])?;
        assert_eq!(cli.memory_dir, PathBuf::from("/tmp/mem"));
        let Command::Locate(args) = cli.command else {
            bail!("expected locate");
        };
        assert_eq!(args.query, "Submit");
        assert_eq!(args.mode, Some(ModeArg::Element));
        assert!(args.no_cache);
        assert_eq!(SearchMode::from(ModeArg::Element), SearchMode::Element);
        Ok(())
    }

    #[test]
    fn remember_needs_both_dimensions() {
        let base = [
            "glimpse", "remember", "--screenshot", "s.png", "--query", "OK", "--x", "1", "--y",
            "2",
        ];
        assert!(Cli::try_parse_from(base).is_ok());
        let with_width = base.iter().copied().chain(["--width", "40"]);
        assert!(Cli::try_parse_from(with_width).is_err());
    }

    #[test]
    fn clean_defaults_match_the_engine() -> anyhow::Result<()> {
        let cli = Cli::try_parse_from(["glimpse", "clean"])?;
        let Command::Clean(args) = cli.command else {
            bail!("expected clean");
        };
        assert_eq!(args.max_age_days, DEFAULT_MAX_AGE_DAYS);
        assert_eq!(args.min_success_rate, DEFAULT_MIN_SUCCESS_RATE);
        Ok(())
    }

    #[test]
    fn memory_config_uses_the_chosen_directory() {
        let config = memory_config(Path::new("/data/glimpse"));
        assert_eq!(config.store_path, PathBuf::from("/data/glimpse/search_memory.json"));
        assert_eq!(
            config.screenshots_dir,
            PathBuf::from("/data/glimpse/memory_screenshots")
        );
    }
}
