// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1

//! Durable allocation state
//!
//! A single JSON document (`gpu-state.json`) holds the device map: every
//! physical GPU or MIG instance, the containers it carries, per-user counts,
//! and any administratively-set reservation window. The file is the source
//! of truth for every allocation decision; container metadata is auxiliary.
//!
//! Writers serialize on an exclusive `fs2` lock held on a sibling lock file
//! for the whole read-modify-write section. The lock deliberately does not
//! live on the state file itself: saves replace the file by atomic rename,
//! which would swap the locked inode out from under concurrent waiters.

use crate::config::{parse_local_timestamp, PolicyConfig};
use crate::probe::DeviceProbe;
use chrono::NaiveDateTime;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tempfile::NamedTempFile;
use tracing::{debug, info};

/// The only implemented allocation strategy.
pub const LEAST_ALLOCATED: &str = "least_allocated";

const LOCK_WAIT: Duration = Duration::from_secs(10);
const LOCK_RETRY: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("state file does not exist")]
    Missing,

    #[error("state file corrupt: {0}")]
    Corrupt(String),

    #[error("timed out waiting for the state lock")]
    LockTimeout,

    #[error("unknown allocation strategy: {0}")]
    UnknownStrategy(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Unit of allocation: a whole GPU or one MIG compute instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    PhysicalGpu,
    MigInstance,
}

impl DeviceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceKind::PhysicalGpu => "physical_gpu",
            DeviceKind::MigInstance => "mig_instance",
        }
    }
}

/// Per-device record in the state file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GpuEntry {
    #[serde(rename = "type")]
    pub kind: DeviceKind,
    /// Owning physical GPU index; only present on MIG instances.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub physical_gpu: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mig_instance: Option<u32>,
    #[serde(default)]
    pub containers: Vec<String>,
    #[serde(default)]
    pub users: BTreeMap<String, u32>,
    #[serde(default)]
    pub reserved_until: Option<String>,
    #[serde(default)]
    pub reserved_for: Option<String>,
}

impl GpuEntry {
    pub fn physical() -> Self {
        Self {
            kind: DeviceKind::PhysicalGpu,
            physical_gpu: None,
            mig_instance: None,
            containers: Vec::new(),
            users: BTreeMap::new(),
            reserved_until: None,
            reserved_for: None,
        }
    }

    pub fn mig(physical_gpu: &str, mig_instance: u32) -> Self {
        Self {
            kind: DeviceKind::MigInstance,
            physical_gpu: Some(physical_gpu.to_string()),
            mig_instance: Some(mig_instance),
            ..Self::physical()
        }
    }

    /// Physical GPU index backing this device; for whole GPUs that is the
    /// device id itself.
    pub fn physical_index<'a>(&'a self, own_id: &'a str) -> &'a str {
        self.physical_gpu.as_deref().unwrap_or(own_id)
    }

    /// The user holding an active reservation on this device, if any.
    /// Resolved against `now`, never cached.
    pub fn active_reservation(&self, now: NaiveDateTime) -> Option<(&str, &str)> {
        let (until_raw, holder) = match (&self.reserved_until, &self.reserved_for) {
            (Some(until), Some(holder)) => (until, holder),
            _ => return None,
        };
        let until = parse_local_timestamp(until_raw)?;
        if now <= until {
            Some((holder.as_str(), until_raw.as_str()))
        } else {
            None
        }
    }
}

/// Top-level persisted object. `mig_enabled` and the strategy are
/// snapshotted at initialization; changing them requires recreating the
/// state file.
///
/// `gpus` is a BTreeMap so traversal follows string-sorted device ids,
/// which is what makes scoring ties deterministic.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GpuState {
    pub gpus: BTreeMap<String, GpuEntry>,
    pub mig_enabled: bool,
    pub allocation_strategy: String,
}

impl GpuState {
    /// Device currently holding `container`, if any.
    pub fn find_container(&self, container: &str) -> Option<&str> {
        self.gpus
            .iter()
            .find(|(_, entry)| entry.containers.iter().any(|c| c == container))
            .map(|(gpu_id, _)| gpu_id.as_str())
    }

    /// Total devices held by `user` across the host.
    pub fn user_gpu_count(&self, user: &str) -> u32 {
        self.gpus
            .values()
            .filter_map(|entry| entry.users.get(user))
            .sum()
    }
}

/// Owner of the on-disk state file.
pub struct StateStore {
    state_file: PathBuf,
    lock_file: PathBuf,
    lock_wait: Duration,
}

impl StateStore {
    pub fn new(state_file: impl Into<PathBuf>) -> Self {
        let state_file = state_file.into();
        let lock_file = state_file.with_extension("lock");
        Self {
            state_file,
            lock_file,
            lock_wait: LOCK_WAIT,
        }
    }

    /// Shorten the lock acquisition window (tests).
    pub fn with_lock_wait(mut self, lock_wait: Duration) -> Self {
        self.lock_wait = lock_wait;
        self
    }

    pub fn state_file(&self) -> &Path {
        &self.state_file
    }

    /// Lock-free snapshot read. Corrupt JSON is fatal to the caller.
    pub fn read(&self) -> Result<GpuState, StateError> {
        let raw = match std::fs::read_to_string(&self.state_file) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Err(StateError::Missing),
            Err(err) => return Err(err.into()),
        };
        serde_json::from_str(&raw).map_err(|err| StateError::Corrupt(err.to_string()))
    }

    /// Acquire the exclusive cross-process lock, waiting up to the bounded
    /// window. Operations complete or fail before the guard drops.
    pub fn lock(&self) -> Result<StateLock<'_>, StateError> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&self.lock_file)?;
        let deadline = Instant::now() + self.lock_wait;
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => {
                    debug!("🔒 Acquired state lock");
                    return Ok(StateLock { store: self, file });
                }
                Err(_) if Instant::now() < deadline => std::thread::sleep(LOCK_RETRY),
                Err(_) => return Err(StateError::LockTimeout),
            }
        }
    }

    /// Create the state file on first run: validate the configured
    /// strategy, enumerate devices through the probe, and persist the
    /// settings that were actually applied. An existing state file is left
    /// untouched; the strategy is snapshotted at initialization and later
    /// config drift does not invalidate the host.
    pub fn initialize_if_missing(
        &self,
        probe: &dyn DeviceProbe,
        config: &PolicyConfig,
    ) -> Result<(), StateError> {
        if self.state_file.exists() {
            return Ok(());
        }
        let strategy = config.strategy();
        if strategy != LEAST_ALLOCATED {
            return Err(StateError::UnknownStrategy(strategy.to_string()));
        }

        let lock = self.lock()?;
        // Re-check: another process may have initialized while we waited.
        if self.state_file.exists() {
            return Ok(());
        }

        let inventory = probe.enumerate(config.enable_mig());

        let mut gpus = BTreeMap::new();
        let mig_enabled = config.enable_mig() && !inventory.mig_instances.is_empty();
        if mig_enabled {
            for mig in &inventory.mig_instances {
                gpus.insert(mig.id.clone(), GpuEntry::mig(&mig.physical_gpu, mig.mig_instance));
            }
        } else {
            for index in 0..inventory.physical_count {
                gpus.insert(index.to_string(), GpuEntry::physical());
            }
        }

        let state = GpuState {
            gpus,
            mig_enabled,
            allocation_strategy: strategy.to_string(),
        };
        lock.save(&state)?;
        info!(
            "📦 Initialized GPU state: {} devices, mig_enabled={}",
            state.gpus.len(),
            mig_enabled
        );
        Ok(())
    }

    fn save(&self, state: &GpuState) -> Result<(), StateError> {
        let dir = self.state_file.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(&mut tmp, state)
            .map_err(|err| StateError::Corrupt(err.to_string()))?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.state_file).map_err(|err| StateError::Io(err.error))?;
        Ok(())
    }
}

/// RAII guard over the exclusive state lock.
pub struct StateLock<'a> {
    store: &'a StateStore,
    file: File,
}

impl StateLock<'_> {
    pub fn load(&self) -> Result<GpuState, StateError> {
        self.store.read()
    }

    /// Persist the full document: write a sibling temp file, fsync, rename.
    /// A crash leaves either the prior state or the new one, never a torn
    /// file.
    pub fn save(&self, state: &GpuState) -> Result<(), StateError> {
        self.store.save(state)
    }
}

impl Drop for StateLock<'_> {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
        debug!("🔓 Released state lock");
    }
}
