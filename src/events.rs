// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1

//! Append-only allocation event log
//!
//! One UTF-8 line per event:
//! `<ISO-8601>|<EVENT>|<user>|<container>|<device-id-or-N/A>|priority=<int>|<reason>`
//!
//! Events are written last in every operation, after the state file commit,
//! so the log never mentions an allocation the state does not hold.

use anyhow::{Context, Result};
use chrono::Local;
use std::io::Write;
use std::path::{Path, PathBuf};

const TIMESTAMP_FMT: &str = "%Y-%m-%dT%H:%M:%S%.6f";

/// Local-clock ISO-8601 timestamp, the format used in both the event log
/// and allocation records.
pub fn local_timestamp() -> String {
    Local::now().format(TIMESTAMP_FMT).to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Allocated,
    Released,
    Rejected,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Allocated => "ALLOCATED",
            EventKind::Released => "RELEASED",
            EventKind::Rejected => "REJECTED",
        }
    }
}

/// Writer for the allocation event log.
pub struct EventLog {
    path: PathBuf,
}

impl EventLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(
        &self,
        kind: EventKind,
        user: &str,
        container: &str,
        gpu_id: Option<&str>,
        priority: i64,
        reason: &str,
    ) -> Result<()> {
        let line = format!(
            "{}|{}|{}|{}|{}|priority={}|{}\n",
            local_timestamp(),
            kind.as_str(),
            user,
            container,
            gpu_id.unwrap_or("N/A"),
            priority,
            reason
        );
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("opening event log {}", self.path.display()))?;
        file.write_all(line.as_bytes())
            .context("appending allocation event")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_line_format() {
        let dir = tempfile::tempdir().unwrap();
        let log = EventLog::new(dir.path().join("gpu-allocations.log"));

        log.append(EventKind::Allocated, "alice", "c1", Some("0"), 50, "ALLOCATED physical_gpu (now has 1 containers)")
            .unwrap();
        log.append(EventKind::Rejected, "bob", "c2", None, 10, "NO_GPU_AVAILABLE")
            .unwrap();

        let raw = std::fs::read_to_string(log.path()).unwrap();
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines.len(), 2);

        let fields: Vec<&str> = lines[0].split('|').collect();
        assert_eq!(fields.len(), 7);
        assert_eq!(fields[1], "ALLOCATED");
        assert_eq!(fields[2], "alice");
        assert_eq!(fields[3], "c1");
        assert_eq!(fields[4], "0");
        assert_eq!(fields[5], "priority=50");
        assert_eq!(fields[6], "ALLOCATED physical_gpu (now has 1 containers)");

        let fields: Vec<&str> = lines[1].split('|').collect();
        assert_eq!(fields[1], "REJECTED");
        assert_eq!(fields[4], "N/A");
        assert_eq!(fields[5], "priority=10");
    }

    #[test]
    fn test_append_only() {
        let dir = tempfile::tempdir().unwrap();
        let log = EventLog::new(dir.path().join("gpu-allocations.log"));
        for i in 0..3 {
            log.append(EventKind::Released, "alice", &format!("c{}", i), Some("1"), 0, "RELEASED")
                .unwrap();
        }
        let raw = std::fs::read_to_string(log.path()).unwrap();
        assert_eq!(raw.lines().count(), 3);
    }

    #[test]
    fn test_timestamp_parses_back() {
        let stamp = local_timestamp();
        assert!(crate::config::parse_local_timestamp(&stamp).is_some());
    }
}
