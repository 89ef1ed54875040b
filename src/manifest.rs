//! Durable membership manifests.
//!
//! A manifest records which source ids have already been committed to an
//! index, one id per line. It is append-only except for explicit per-id
//! deletion, which removes exactly that id's line. The custom-chunk manifest
//! uses the same format for injected chunk ids.
//!
//! Sync appends only after the store persisted the data (data before
//! membership), so a crash can leave chunks persisted-but-unrecorded, which
//! the next sync repairs, but never recorded-but-missing.

use anyhow::{Context, Result};
use std::collections::BTreeSet;
use std::io::Write;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Manifest {
    path: PathBuf,
}

impl Manifest {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Manifest { path: path.into() }
    }

    /// Load the recorded id set. A missing file is an empty manifest.
    pub fn load(&self) -> Result<BTreeSet<String>> {
        if !self.path.exists() {
            return Ok(BTreeSet::new());
        }
        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read manifest: {}", self.path.display()))?;
        Ok(content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Append ids, creating the file (and parents) on first use.
    pub fn append(&self, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open manifest: {}", self.path.display()))?;
        for id in ids {
            writeln!(file, "{}", id)?;
        }
        file.sync_all()?;
        Ok(())
    }

    /// Remove exactly `id`'s entry. Returns whether it was present.
    pub fn strike(&self, id: &str) -> Result<bool> {
        let mut ids = self.load()?;
        if !ids.remove(id) {
            return Ok(false);
        }
        let mut content = String::new();
        for id in &ids {
            content.push_str(id);
            content.push('\n');
        }
        std::fs::write(&self.path, content)
            .with_context(|| format!("Failed to rewrite manifest: {}", self.path.display()))?;
        Ok(true)
    }

    /// Drop every entry. Used by force-refresh and corrupt-store eviction.
    pub fn clear(&self) -> Result<()> {
        if self.path.exists() {
            std::fs::write(&self.path, "")?;
        }
        Ok(())
    }
}
