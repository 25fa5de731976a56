use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use steamcat_core::{AppId, AppIdRecord};
use steamcat_storage::{CheckpointStore, CsvCheckpoint};

/// Non-empty, non-comment lines of a plain-text id list.
pub fn read_lines(path: &Path) -> Result<Vec<String>> {
    let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(ToString::to_string)
        .collect())
}

pub fn read_app_ids(path: &Path) -> Result<Vec<AppId>> {
    read_lines(path)?
        .into_iter()
        .map(|line| {
            line.parse::<AppId>()
                .with_context(|| format!("invalid app id {line:?} in {}", path.display()))
        })
        .collect()
}

/// Resolved app ids from an appid checkpoint; titles without a match are skipped.
pub async fn app_ids_from_checkpoint(path: &Path) -> Result<Vec<AppId>> {
    let records: Vec<AppIdRecord> = CsvCheckpoint::new(path)
        .load()
        .await?
        .with_context(|| format!("appid checkpoint {} does not exist", path.display()))?;
    Ok(records.into_iter().filter_map(|r| r.appid).collect())
}
