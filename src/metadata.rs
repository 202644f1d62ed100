// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1

//! Per-container allocation records
//!
//! One JSON file per live container, named by the container id. Records are
//! written once at allocation, read on inspection, and deleted at release.
//! The store is auxiliary to the state file: a missing record is never
//! fatal, the allocator degrades to an `unknown` owner.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

/// Durable descriptor of one allocation. Never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AllocationRecord {
    pub container: String,
    pub user: String,
    pub gpu_id: String,
    pub priority: i64,
    /// ISO-8601, local clock.
    pub allocated_at: String,
}

/// Owner of the container metadata directory.
pub struct MetadataStore {
    dir: PathBuf,
}

impl MetadataStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, container: &str) -> PathBuf {
        self.dir.join(format!("{}.json", container))
    }

    /// Atomic write (sibling temp + rename).
    pub fn write(&self, record: &AllocationRecord) -> Result<()> {
        let mut tmp = NamedTempFile::new_in(&self.dir)
            .with_context(|| format!("creating metadata temp file in {}", self.dir.display()))?;
        serde_json::to_writer_pretty(&mut tmp, record)?;
        tmp.as_file().sync_all()?;
        tmp.persist(self.path_for(&record.container))
            .with_context(|| format!("persisting metadata for {}", record.container))?;
        debug!("💾 Wrote metadata for {}", record.container);
        Ok(())
    }

    /// Read a record. Missing and unreadable files both resolve to `None`;
    /// release must be able to proceed without metadata.
    pub fn read(&self, container: &str) -> Option<AllocationRecord> {
        let path = self.path_for(container);
        let raw = std::fs::read_to_string(&path).ok()?;
        match serde_json::from_str(&raw) {
            Ok(record) => Some(record),
            Err(err) => {
                warn!("⚠️ Metadata for {} unreadable: {}", container, err);
                None
            }
        }
    }

    /// Delete a record. A missing file is tolerated.
    pub fn remove(&self, container: &str) -> Result<()> {
        match std::fs::remove_file(self.path_for(container)) {
            Ok(()) => {
                debug!("🗑️ Removed metadata for {}", container);
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("removing metadata for {}", container)),
        }
    }
}
