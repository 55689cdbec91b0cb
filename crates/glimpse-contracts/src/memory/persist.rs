use std::io::{ErrorKind, Write};
use std::path::Path;

use anyhow::Context;
use chrono::Utc;
use tempfile::NamedTempFile;

use super::records::{MemoryStore, STORE_SCHEMA_VERSION};

/// How the store came to be in memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreLoad {
    /// No file on disk yet.
    Fresh,
    Loaded,
    /// The file existed but could not be used; an empty store replaced it.
    Recovered { reason: String },
}

/// Reads the store, failing closed: anything unreadable or malformed yields an
/// empty store and a `Recovered` marker instead of an error.
pub fn load_store(path: &Path) -> (MemoryStore, StoreLoad) {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            return (MemoryStore::empty(), StoreLoad::Fresh);
        }
        Err(err) => {
            let reason = format!("failed reading {}: {err}", path.display());
            log::error!("{reason}; starting with an empty memory store");
            return (MemoryStore::empty(), StoreLoad::Recovered { reason });
        }
    };

    match serde_json::from_str::<MemoryStore>(&raw) {
        Ok(store) if store.version > STORE_SCHEMA_VERSION => {
            let reason = format!(
                "store version {} is newer than supported version {STORE_SCHEMA_VERSION}",
                store.version
            );
            log::error!("{reason}; starting with an empty memory store");
            (MemoryStore::empty(), StoreLoad::Recovered { reason })
        }
        Ok(store) => {
            log::info!(
                "loaded memory store from {} ({} elements)",
                path.display(),
                store.elements.len()
            );
            (store, StoreLoad::Loaded)
        }
        Err(err) => {
            let reason = format!("malformed store {}: {err}", path.display());
            log::error!("{reason}; starting with an empty memory store");
            (MemoryStore::empty(), StoreLoad::Recovered { reason })
        }
    }
}

/// Stamps `last_updated` and replaces the file atomically: the JSON goes to a
/// temporary sibling which is then renamed over `path`.
pub fn write_store(path: &Path, store: &mut MemoryStore) -> anyhow::Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(parent)
        .with_context(|| format!("failed creating {}", parent.display()))?;

    store.last_updated = Utc::now();
    store.version = STORE_SCHEMA_VERSION;

    let mut temp = NamedTempFile::new_in(parent)
        .with_context(|| format!("failed creating temp file in {}", parent.display()))?;
    serde_json::to_writer_pretty(&mut temp, store)?;
    temp.write_all(b"\n")?;
    temp.as_file().sync_all()?;
    temp.persist(path)
        .with_context(|| format!("failed replacing {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use crate::geometry::{Point, Rect, Size};
    use crate::memory::{Element, LocationRecord};

    use super::*;

    fn sample_store() -> MemoryStore {
        let mut store = MemoryStore::empty();
        store.elements.push(Element::new(
            "id-1",
            "Submit",
            Some("bottom-right button"),
            "checkout page",
            LocationRecord {
                coordinates: Point::new(1800, 1000),
                screen_size: Size::new(1920, 1080),
                element_rect: Rect::new(1750, 975, 100, 50),
                match_percentage: 88,
                timestamp: Utc::now(),
                screen_hash: "f00".to_string(),
                screenshot_reference: Some("id-1_1.png".to_string()),
            },
        ));
        store
    }

    #[test]
    fn missing_file_is_fresh() {
        let temp = tempfile::tempdir().unwrap();
        let (store, load) = load_store(&temp.path().join("memory.json"));
        assert_eq!(load, StoreLoad::Fresh);
        assert!(store.elements.is_empty());
    }

    #[test]
    fn write_then_load_round_trips() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("nested").join("memory.json");
        let mut store = sample_store();
        write_store(&path, &mut store)?;

        let (loaded, load) = load_store(&path);
        assert_eq!(load, StoreLoad::Loaded);
        assert_eq!(loaded, store);
        Ok(())
    }

    #[test]
    fn write_leaves_no_temp_files_behind() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("memory.json");
        let mut store = sample_store();
        write_store(&path, &mut store)?;
        write_store(&path, &mut store)?;

        let names: Vec<String> = std::fs::read_dir(temp.path())?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["memory.json".to_string()]);
        Ok(())
    }

    #[test]
    fn corrupt_file_recovers_to_empty_store() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("memory.json");
        std::fs::write(&path, "{\"elements\": [ {\"id\": ")?;

        let (store, load) = load_store(&path);
        assert!(store.elements.is_empty());
        assert!(matches!(load, StoreLoad::Recovered { .. }));
        Ok(())
    }

    #[test]
    fn newer_schema_version_is_rejected() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("memory.json");
        let mut store = sample_store();
        write_store(&path, &mut store)?;

        let raw = std::fs::read_to_string(&path)?;
        let mut value: serde_json::Value = serde_json::from_str(&raw)?;
        value["version"] = serde_json::json!(STORE_SCHEMA_VERSION + 1);
        std::fs::write(&path, serde_json::to_string(&value)?)?;

        let (loaded, load) = load_store(&path);
        assert!(loaded.elements.is_empty());
        assert!(matches!(load, StoreLoad::Recovered { .. }));
        Ok(())
    }

    #[test]
    fn persisted_schema_uses_documented_field_names() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("memory.json");
        let mut store = sample_store();
        write_store(&path, &mut store)?;

        let value: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path)?)?;
        for key in ["elements", "last_updated", "version"] {
            assert!(value.get(key).is_some(), "missing {key}");
        }
        let element = &value["elements"][0];
        for key in [
            "id",
            "search_text",
            "context_info",
            "screen_context",
            "created",
            "last_found",
            "locations",
            "success_count",
            "total_searches",
            "success_rate",
        ] {
            assert!(element.get(key).is_some(), "missing element.{key}");
        }
        let location = &element["locations"][0];
        for key in [
            "coordinates",
            "screen_size",
            "element_rect",
            "match_percentage",
            "timestamp",
            "screen_hash",
            "screenshot_reference",
        ] {
            assert!(location.get(key).is_some(), "missing location.{key}");
        }
        Ok(())
    }
}
