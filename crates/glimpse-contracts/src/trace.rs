use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::geometry::{Point, Rect};

/// One step of a search or cache session.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TraceEvent {
    SearchStarted {
        query: String,
        context: Option<String>,
        mode: String,
        width: u32,
        height: u32,
    },
    RegionChecked {
        depth: u32,
        region: Rect,
        present: bool,
        confidence: Option<u8>,
    },
    CellsScored {
        depth: u32,
        cells: Vec<CellScore>,
        best: Option<usize>,
    },
    Refined {
        depth: u32,
        region: Rect,
        point: Point,
        reason: String,
    },
    SearchFinished {
        found: bool,
        point: Option<Point>,
        confidence: Option<u8>,
        oracle_calls: u64,
        elapsed_ms: u128,
    },
    CacheHit {
        element_id: String,
        point: Point,
        via: String,
    },
    CacheMiss {
        query: String,
        element_id: String,
        known: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CellScore {
    pub region: Rect,
    pub confidence: u8,
}

/// Append-only writer for `trace.jsonl`.
///
/// Each line is a compact JSON object carrying `type`, `session_id` and `ts`
/// followed by the event's own fields.
#[derive(Debug, Clone)]
pub struct TraceWriter {
    inner: Arc<TraceWriterInner>,
}

#[derive(Debug)]
struct TraceWriterInner {
    path: PathBuf,
    session_id: String,
    lock: Mutex<()>,
}

impl TraceWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_session(path, Uuid::new_v4().to_string())
    }

    pub fn with_session(path: impl Into<PathBuf>, session_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(TraceWriterInner {
                path: path.into(),
                session_id: session_id.into(),
                lock: Mutex::new(()),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    pub fn emit(&self, event: &TraceEvent) -> anyhow::Result<Value> {
        let mut line = Map::new();
        line.insert(
            "session_id".to_string(),
            Value::String(self.inner.session_id.clone()),
        );
        line.insert("ts".to_string(), Value::String(now_utc_iso()));
        if let Value::Object(fields) = serde_json::to_value(event)? {
            for (key, value) in fields {
                line.insert(key, value);
            }
        }

        if let Some(parent) = self.inner.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let encoded = serde_json::to_string(&line)?;
        let _guard = self
            .inner
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("trace writer lock poisoned"))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.inner.path)?;
        file.write_all(encoded.as_bytes())?;
        file.write_all(b"\n")?;

        Ok(Value::Object(line))
    }

    /// Like `emit`, but a failed write is only logged.
    pub fn record(&self, event: &TraceEvent) {
        if let Err(err) = self.emit(event) {
            log::warn!(
                "failed writing trace event to {}: {err:#}",
                self.inner.path.display()
            );
        }
    }
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}
