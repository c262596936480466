//! Atomic JSON persistence — create a temp file next to the target, then
//! rename over it.  Every persisted store in the gateway goes through here so
//! a crash mid-write never leaves a truncated file behind.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Serialize `value` as pretty JSON and atomically replace `path`.
pub fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create {}", parent.display()))?;
    }

    let rendered = serde_json::to_vec_pretty(value).context("serialize store")?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, rendered).with_context(|| format!("write {}", tmp.display()))?;
    fs::rename(&tmp, path)
        .with_context(|| format!("rename {} -> {}", tmp.display(), path.display()))?;
    Ok(())
}

/// Load a JSON file, returning `None` when it does not exist.  A corrupt file
/// is an error — callers decide whether to start fresh.
pub fn load_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let value = serde_json::from_str(&raw)
        .with_context(|| format!("parse {}", path.display()))?;
    Ok(Some(value))
}
