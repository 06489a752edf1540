use std::path::PathBuf;

use anyhow::{Context, Result};
use routecodex_core::config::ConfigDocument;

/// Resolves the config document path per spec §6: `--config`, then
/// `ROUTECODEX_CONFIG`, then `~/.routecodex/config.json`.
pub fn resolve_path(explicit: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path);
    }
    if let Ok(path) = std::env::var("ROUTECODEX_CONFIG") {
        return Ok(PathBuf::from(path));
    }
    let home = dirs::home_dir().context("cannot determine home directory for default config path")?;
    Ok(home.join(".routecodex").join("config.json"))
}

/// Loads and parses the single JSON configuration document (spec §6). Only
/// `.json` is supported, matching "a single JSON document" in spec §6.
pub fn load(path: &PathBuf) -> Result<ConfigDocument> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("reading config document at {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parsing config document at {}", path.display()))
}
