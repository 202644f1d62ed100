// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1

//! Priority-aware GPU allocation
//!
//! The scheduler composes the device probe, the persisted state, the
//! per-container metadata store, and the policy configuration into one
//! decision procedure. Every mutating operation runs under the exclusive
//! state lock and commits in a fixed order: state file first (fsync +
//! rename), metadata second, event log last. A crash therefore never
//! leaves a metadata record pointing at a device that does not list the
//! container.
//!
//! Placement uses the `least_allocated` strategy: candidates are scored by
//! the lexicographic triple `(priority_diff, container_count,
//! memory_percent)` and the lowest score wins, with ties falling to the
//! first device in string-sorted id order. Reservations trump scoring in
//! both directions: a user's own active reservation short-circuits
//! selection, and devices reserved for someone else are never candidates.

use crate::config::PolicyConfig;
use crate::events::{local_timestamp, EventKind, EventLog};
use crate::metadata::{AllocationRecord, MetadataStore};
use crate::probe::DeviceProbe;
use crate::state::{DeviceKind, GpuEntry, GpuState, StateError, StateStore, LEAST_ALLOCATED};
use anyhow::{Context, Result};
use chrono::Local;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const SUCCESS: &str = "SUCCESS";
pub const ALREADY_ALLOCATED: &str = "ALREADY_ALLOCATED";
pub const USER_AT_LIMIT: &str = "USER_AT_LIMIT";
pub const NO_GPU_AVAILABLE: &str = "NO_GPU_AVAILABLE";
pub const NOT_ALLOCATED: &str = "NOT_ALLOCATED";
pub const LOCK_TIMEOUT: &str = "LOCK_TIMEOUT";

/// Result of an allocate or release call: the device involved (when any)
/// and a stable reason code, possibly followed by free text after the
/// first space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationOutcome {
    pub gpu_id: Option<String>,
    pub reason: String,
}

impl AllocationOutcome {
    fn placed(gpu_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            gpu_id: Some(gpu_id.into()),
            reason: reason.into(),
        }
    }

    fn failed(reason: impl Into<String>) -> Self {
        Self {
            gpu_id: None,
            reason: reason.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.gpu_id.is_some()
    }
}

/// One device in a status snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct GpuStatus {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: DeviceKind,
    pub physical_gpu: String,
    pub container_count: usize,
    pub containers: Vec<String>,
    pub users: BTreeMap<String, u32>,
    pub utilization: u32,
    pub memory_used: u64,
    pub memory_total: u64,
    pub memory_percent: f64,
    pub reserved: bool,
    pub reserved_for: Option<String>,
    pub reserved_until: Option<String>,
}

/// Snapshot of persisted state merged with live probe load. Reservation
/// flags are resolved against the clock at call time, never stored.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub total_gpus: usize,
    pub total_allocated_containers: usize,
    pub mig_enabled: bool,
    pub gpus: Vec<GpuStatus>,
}

/// One entry of a user's allocation listing.
#[derive(Debug, Clone, Serialize)]
pub struct UserContainer {
    pub container: String,
    pub gpu_id: String,
    pub priority: i64,
    pub allocated_at: String,
}

/// The GPU allocation manager.
///
/// Holds no long-lived mutable state of its own; every operation re-reads
/// the persisted state so that independent short-lived processes observe a
/// consistent view.
pub struct GpuAllocator {
    state: StateStore,
    metadata: MetadataStore,
    config: PolicyConfig,
    events: EventLog,
    probe: Box<dyn DeviceProbe>,
}

impl GpuAllocator {
    /// Build the allocator, creating the state and log directories and
    /// initializing the state file on first run.
    pub fn new(
        state_dir: impl Into<PathBuf>,
        log_dir: impl Into<PathBuf>,
        config_path: &Path,
        probe: Box<dyn DeviceProbe>,
    ) -> Result<Self> {
        let state_dir = state_dir.into();
        let log_dir = log_dir.into();
        let metadata_dir = state_dir.join("container-metadata");

        std::fs::create_dir_all(&state_dir)
            .with_context(|| format!("creating state dir {}", state_dir.display()))?;
        std::fs::create_dir_all(&log_dir)
            .with_context(|| format!("creating log dir {}", log_dir.display()))?;
        std::fs::create_dir_all(&metadata_dir)
            .with_context(|| format!("creating metadata dir {}", metadata_dir.display()))?;

        let allocator = Self {
            state: StateStore::new(state_dir.join("gpu-state.json")),
            metadata: MetadataStore::new(metadata_dir),
            config: PolicyConfig::load(config_path),
            events: EventLog::new(log_dir.join("gpu-allocations.log")),
            probe,
        };
        allocator
            .state
            .initialize_if_missing(allocator.probe.as_ref(), &allocator.config)?;
        Ok(allocator)
    }

    /// Shorten the bounded lock wait (tests).
    pub fn with_lock_wait(mut self, lock_wait: std::time::Duration) -> Self {
        self.state = self.state.with_lock_wait(lock_wait);
        self
    }

    /// Allocate a device to `container` for `user`.
    ///
    /// Idempotent per container: repeating the call returns the device the
    /// container already holds without touching state.
    pub fn allocate(
        &self,
        user: &str,
        container: &str,
        max_gpus: u32,
        priority: i64,
    ) -> Result<AllocationOutcome> {
        self.ensure_initialized()?;
        let lock = match self.state.lock() {
            Ok(lock) => lock,
            Err(StateError::LockTimeout) => {
                warn!("⚠️ Lock timeout allocating for {} ({})", user, container);
                return Ok(AllocationOutcome::failed(LOCK_TIMEOUT));
            }
            Err(err) => return Err(err.into()),
        };
        let mut state = lock.load()?;
        if state.allocation_strategy != LEAST_ALLOCATED {
            return Err(
                StateError::UnknownStrategy(state.allocation_strategy.clone()).into(),
            );
        }

        if let Some(gpu_id) = state.find_container(container) {
            debug!("Container {} already on {}", container, gpu_id);
            return Ok(AllocationOutcome::placed(gpu_id, ALREADY_ALLOCATED));
        }

        let current_count = state.user_gpu_count(user);
        if current_count >= max_gpus {
            let reason = format!("{} ({}/{})", USER_AT_LIMIT, current_count, max_gpus);
            warn!("🚫 {}: {}", user, reason);
            self.events
                .append(EventKind::Rejected, user, container, None, priority, &reason)?;
            return Ok(AllocationOutcome::failed(reason));
        }

        let Some(gpu_id) = self.select_device(&state, user, priority) else {
            warn!("🚫 No GPU available for {} ({})", user, container);
            self.events.append(
                EventKind::Rejected,
                user,
                container,
                None,
                priority,
                NO_GPU_AVAILABLE,
            )?;
            return Ok(AllocationOutcome::failed(NO_GPU_AVAILABLE));
        };

        let entry = state
            .gpus
            .get_mut(&gpu_id)
            .context("selected device vanished from state")?;
        entry.containers.push(container.to_string());
        *entry.users.entry(user.to_string()).or_insert(0) += 1;
        let container_count = entry.containers.len();
        let kind = entry.kind;

        // State first, metadata second; the state file is the source of truth.
        lock.save(&state)?;
        self.metadata.write(&AllocationRecord {
            container: container.to_string(),
            user: user.to_string(),
            gpu_id: gpu_id.clone(),
            priority,
            allocated_at: local_timestamp(),
        })?;

        let reason = format!(
            "ALLOCATED {} (now has {} containers)",
            kind.as_str(),
            container_count
        );
        self.events.append(
            EventKind::Allocated,
            user,
            container,
            Some(&gpu_id),
            priority,
            &reason,
        )?;
        info!("✅ Allocated {} to {} for {}", gpu_id, container, user);
        Ok(AllocationOutcome::placed(gpu_id, SUCCESS))
    }

    /// Release whatever device `container` holds.
    pub fn release(&self, container: &str) -> Result<AllocationOutcome> {
        self.ensure_initialized()?;
        let lock = match self.state.lock() {
            Ok(lock) => lock,
            Err(StateError::LockTimeout) => {
                warn!("⚠️ Lock timeout releasing {}", container);
                return Ok(AllocationOutcome::failed(LOCK_TIMEOUT));
            }
            Err(err) => return Err(err.into()),
        };
        let mut state = lock.load()?;

        let Some(gpu_id) = state.find_container(container).map(str::to_string) else {
            debug!("Release of {}: not allocated", container);
            return Ok(AllocationOutcome::failed(NOT_ALLOCATED));
        };

        let record = self.metadata.read(container);
        let entry = state
            .gpus
            .get_mut(&gpu_id)
            .context("device holding container vanished from state")?;
        entry.containers.retain(|c| c != container);

        // Identify whose count to decrement. When the metadata record is
        // gone the owner is reconstructed from the surviving records of the
        // device's remaining containers, so the users map stays consistent
        // with the container list.
        let (user_label, priority, decrement) = match &record {
            Some(record) => (record.user.clone(), record.priority, Some(record.user.clone())),
            None => {
                let owner = reconstruct_owner(entry, &self.metadata);
                if let Some(owner) = &owner {
                    warn!(
                        "⚠️ Metadata for {} missing, reconstructed owner {}",
                        container, owner
                    );
                } else {
                    warn!("⚠️ Metadata for {} missing, owner unknown", container);
                }
                ("unknown".to_string(), 0, owner)
            }
        };
        if let Some(owner) = decrement {
            match entry.users.get_mut(&owner) {
                Some(count) => {
                    *count = count.saturating_sub(1);
                    if *count == 0 {
                        entry.users.remove(&owner);
                    }
                }
                None => warn!("⚠️ No user count for {} on {}", owner, gpu_id),
            }
        }
        let container_count = entry.containers.len();

        lock.save(&state)?;
        self.metadata.remove(container)?;

        let reason = format!("RELEASED (now has {} containers)", container_count);
        self.events.append(
            EventKind::Released,
            &user_label,
            container,
            Some(&gpu_id),
            priority,
            &reason,
        )?;
        info!("✅ Released {} from {}", gpu_id, container);
        Ok(AllocationOutcome::placed(gpu_id, SUCCESS))
    }

    /// Pick the best device for `user` at `priority`, or `None` when every
    /// device is reserved away from the user.
    fn select_device(&self, state: &GpuState, user: &str, priority: i64) -> Option<String> {
        let now = Local::now().naive_local();

        // A user's own active reservation pins them to their devices.
        let reserved = self.config.reserved_gpus(user, now);
        for gpu_id in &reserved {
            if state.gpus.contains_key(gpu_id) {
                debug!("📌 {} has an active reservation for {}", user, gpu_id);
                return Some(gpu_id.clone());
            }
        }

        let load = self.probe.load();
        let mut scored: Vec<((i64, usize, f64), &String)> = Vec::new();
        for (gpu_id, entry) in &state.gpus {
            if let Some((holder, _)) = entry.active_reservation(now) {
                if holder != user {
                    continue;
                }
            }

            // Highest priority among work already on the device; a
            // higher-priority requester prefers devices carrying
            // lower-priority containers.
            let max_priority_on_device = entry
                .containers
                .iter()
                .filter_map(|c| self.metadata.read(c))
                .map(|record| record.priority)
                .fold(0, i64::max);

            let memory_percent = load
                .get(entry.physical_index(gpu_id))
                .map(|l| l.memory_percent)
                .unwrap_or(0.0);

            scored.push((
                (
                    max_priority_on_device - priority,
                    entry.containers.len(),
                    memory_percent,
                ),
                gpu_id,
            ));
        }

        // Stable sort on the score alone: ties keep the BTreeMap's
        // string-sorted id order.
        scored.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(Ordering::Equal));
        scored.first().map(|(_, gpu_id)| (*gpu_id).clone())
    }

    /// Snapshot of every device with live load and reservation flags.
    /// Never mutates state.
    pub fn status(&self) -> Result<StatusReport> {
        self.ensure_initialized()?;
        let state = self.state.read()?;
        let load = self.probe.load();
        let now = Local::now().naive_local();

        let mut total_allocated_containers = 0;
        let mut gpus = Vec::with_capacity(state.gpus.len());
        for (gpu_id, entry) in &state.gpus {
            let physical_gpu = entry.physical_index(gpu_id).to_string();
            let gpu_load = load.get(&physical_gpu).cloned().unwrap_or_default();
            let reservation = entry.active_reservation(now);
            total_allocated_containers += entry.containers.len();

            gpus.push(GpuStatus {
                id: gpu_id.clone(),
                kind: entry.kind,
                physical_gpu,
                container_count: entry.containers.len(),
                containers: entry.containers.clone(),
                users: entry.users.clone(),
                utilization: gpu_load.utilization,
                memory_used: gpu_load.memory_used,
                memory_total: gpu_load.memory_total,
                memory_percent: gpu_load.memory_percent,
                reserved: reservation.is_some(),
                reserved_for: reservation.map(|(holder, _)| holder.to_string()),
                reserved_until: reservation.map(|(_, until)| until.to_string()),
            });
        }

        Ok(StatusReport {
            total_gpus: state.gpus.len(),
            total_allocated_containers,
            mig_enabled: state.mig_enabled,
            gpus,
        })
    }

    /// Devices currently held by `user`, summed across the host.
    pub fn user_gpu_count(&self, user: &str) -> Result<u32> {
        self.ensure_initialized()?;
        Ok(self.state.read()?.user_gpu_count(user))
    }

    /// The user's live containers with device, priority, and allocation
    /// time, resolved through the metadata store.
    pub fn user_containers(&self, user: &str) -> Result<Vec<UserContainer>> {
        self.ensure_initialized()?;
        let state = self.state.read()?;
        let mut containers = Vec::new();
        for (gpu_id, entry) in &state.gpus {
            for container in &entry.containers {
                let Some(record) = self.metadata.read(container) else {
                    continue;
                };
                if record.user == user {
                    containers.push(UserContainer {
                        container: container.clone(),
                        gpu_id: gpu_id.clone(),
                        priority: record.priority,
                        allocated_at: record.allocated_at,
                    });
                }
            }
        }
        Ok(containers)
    }

    /// Recreate the state file if it was removed out from under us.
    fn ensure_initialized(&self) -> Result<()> {
        self.state
            .initialize_if_missing(self.probe.as_ref(), &self.config)?;
        Ok(())
    }
}

/// Find the user whose recorded count on `entry` exceeds what the
/// surviving metadata accounts for. Deterministic: users are visited in
/// sorted order.
fn reconstruct_owner(entry: &GpuEntry, metadata: &MetadataStore) -> Option<String> {
    let mut accounted: BTreeMap<String, u32> = BTreeMap::new();
    for container in &entry.containers {
        if let Some(record) = metadata.read(container) {
            *accounted.entry(record.user).or_insert(0) += 1;
        }
    }
    entry
        .users
        .iter()
        .find(|(user, count)| **count > accounted.get(*user).copied().unwrap_or(0))
        .map(|(user, _)| user.clone())
}
