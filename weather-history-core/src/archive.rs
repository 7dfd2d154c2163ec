use anyhow::{Context, Result};
use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::model::LocationSummary;

/// Keeps the untouched provider response for each fetched location, one JSON
/// file per point, so summaries can be recomputed without new API calls.
#[derive(Debug, Clone)]
pub struct RawArchive {
    dir: PathBuf,
}

impl RawArchive {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// `{latitude}_{longitude}_{date}.json` inside the archive directory.
    pub fn file_for(&self, key: &LocationSummary) -> PathBuf {
        self.dir.join(format!(
            "{}_{}_{}.json",
            key.latitude,
            key.longitude,
            key.date.format("%Y-%m-%d")
        ))
    }

    pub fn store(&self, key: &LocationSummary, body: &str) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create archive directory: {}", self.dir.display()))?;

        let path = self.file_for(key);
        fs::write(&path, body)
            .with_context(|| format!("Failed to write raw payload: {}", path.display()))?;

        Ok(path)
    }
}
