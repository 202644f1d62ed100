// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1

//! Device discovery and live load via `nvidia-smi`
//!
//! Everything the allocator knows about the hardware flows through the
//! [`DeviceProbe`] trait: how many physical GPUs exist, which MIG compute
//! instances are carved out of them, and the current utilization/memory
//! figures used by placement scoring. All probe failures degrade to
//! deterministic defaults so that allocation keeps working on hosts where
//! the vendor tool is missing (CI, tests, misconfigured drivers).

use std::collections::HashMap;
use std::process::Command;
use tracing::{debug, warn};

/// Physical GPU count reported when `nvidia-smi` cannot be executed at all.
pub const FALLBACK_PHYSICAL_GPUS: usize = 4;

/// Instances synthesized per MIG-enabled GPU when the instance listing
/// cannot be parsed (2g.20gb profile parity).
pub const DEFAULT_MIG_INSTANCES: u32 = 3;

/// One MIG compute instance, addressed as `"<gpu>:<instance>"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigInstance {
    pub physical_gpu: String,
    pub mig_instance: u32,
    pub id: String,
}

impl MigInstance {
    pub fn new(physical_gpu: &str, mig_instance: u32) -> Self {
        Self {
            physical_gpu: physical_gpu.to_string(),
            mig_instance,
            id: format!("{}:{}", physical_gpu, mig_instance),
        }
    }
}

/// Result of a device enumeration pass.
#[derive(Debug, Clone, Default)]
pub struct DeviceInventory {
    pub physical_count: usize,
    pub mig_instances: Vec<MigInstance>,
}

/// Live utilization and memory figures for one physical GPU (MiB).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GpuLoad {
    pub utilization: u32,
    pub memory_used: u64,
    pub memory_total: u64,
    pub memory_percent: f64,
}

/// Abstraction over the vendor query tool.
///
/// Both operations are synchronous and idempotent; `load` may be called
/// while the allocation lock is held because its result feeds the scoring
/// critical section.
pub trait DeviceProbe {
    /// Enumerate physical GPUs and, when `mig_requested`, the MIG compute
    /// instances of every MIG-enabled GPU.
    fn enumerate(&self, mig_requested: bool) -> DeviceInventory;

    /// Live load per physical GPU index. Missing keys mean the probe could
    /// not report that GPU; callers treat missing as zero load.
    fn load(&self) -> HashMap<String, GpuLoad>;
}

/// Production probe shelling out to `nvidia-smi`.
pub struct NvidiaSmiProbe;

impl NvidiaSmiProbe {
    fn query(args: &[&str]) -> Option<String> {
        let output = Command::new("nvidia-smi").args(args).output().ok()?;
        if !output.status.success() {
            warn!("⚠️ nvidia-smi {:?} exited with {}", args, output.status);
            return None;
        }
        Some(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn mig_instances_for(gpu_id: &str) -> Vec<MigInstance> {
        let listed = Self::query(&["mig", "-lgi", "-i", gpu_id])
            .map(|raw| parse_mig_instance_ids(&raw))
            .unwrap_or_default();

        if listed.is_empty() {
            // Listing unparseable; synthesize the common 2g.20gb layout.
            warn!(
                "⚠️ Could not parse MIG instances for GPU {}, assuming {}",
                gpu_id, DEFAULT_MIG_INSTANCES
            );
            return (0..DEFAULT_MIG_INSTANCES)
                .map(|instance| MigInstance::new(gpu_id, instance))
                .collect();
        }

        listed
            .into_iter()
            .map(|instance| MigInstance::new(gpu_id, instance))
            .collect()
    }
}

impl DeviceProbe for NvidiaSmiProbe {
    fn enumerate(&self, mig_requested: bool) -> DeviceInventory {
        let physical_count = match Self::query(&["--query-gpu=index", "--format=csv,noheader"]) {
            Some(raw) => parse_gpu_indices(&raw).len(),
            None => {
                warn!(
                    "⚠️ nvidia-smi unreachable, assuming {} physical GPUs",
                    FALLBACK_PHYSICAL_GPUS
                );
                FALLBACK_PHYSICAL_GPUS
            }
        };

        let mut mig_instances = Vec::new();
        if mig_requested {
            let modes = Self::query(&[
                "--query-gpu=index,mig.mode.current",
                "--format=csv,noheader",
            ])
            .map(|raw| parse_mig_modes(&raw))
            .unwrap_or_default();

            for (gpu_id, mode) in modes {
                if mode == "Enabled" {
                    mig_instances.extend(Self::mig_instances_for(&gpu_id));
                }
            }
        }

        debug!(
            "🔍 Enumerated {} physical GPUs, {} MIG instances",
            physical_count,
            mig_instances.len()
        );
        DeviceInventory {
            physical_count,
            mig_instances,
        }
    }

    fn load(&self) -> HashMap<String, GpuLoad> {
        match Self::query(&[
            "--query-gpu=index,utilization.gpu,memory.used,memory.total",
            "--format=csv,noheader,nounits",
        ]) {
            Some(raw) => parse_gpu_load(&raw),
            None => HashMap::new(),
        }
    }
}

/// Parse `--query-gpu=index` output into the listed GPU indices.
fn parse_gpu_indices(raw: &str) -> Vec<String> {
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse `--query-gpu=index,mig.mode.current` output into (index, mode) pairs.
fn parse_mig_modes(raw: &str) -> Vec<(String, String)> {
    raw.lines()
        .filter_map(|line| {
            let mut parts = line.split(',').map(str::trim);
            let gpu_id = parts.next()?;
            if gpu_id.is_empty() {
                return None;
            }
            let mode = parts.next().unwrap_or("N/A");
            Some((gpu_id.to_string(), mode.to_string()))
        })
        .collect()
}

/// Parse `nvidia-smi mig -lgi` table rows into GPU instance ids.
///
/// Rows look like `|   0  MIG 2g.20gb  14  3  0:2  |`; the instance id is
/// the second numeric column after the profile name.
fn parse_mig_instance_ids(raw: &str) -> Vec<u32> {
    raw.lines()
        .filter_map(|line| {
            let trimmed = line.trim().trim_matches('|').trim();
            let tokens: Vec<&str> = trimmed.split_whitespace().collect();
            if tokens.len() < 5 || tokens[1] != "MIG" {
                return None;
            }
            tokens[4].parse::<u32>().ok()
        })
        .collect()
}

/// Parse `--query-gpu=index,utilization.gpu,memory.used,memory.total`
/// (nounits) output into per-GPU load. Malformed lines are skipped.
fn parse_gpu_load(raw: &str) -> HashMap<String, GpuLoad> {
    let mut loads = HashMap::new();
    for line in raw.lines() {
        let parts: Vec<&str> = line.split(',').map(str::trim).collect();
        if parts.len() < 4 {
            continue;
        }
        let (Ok(utilization), Ok(memory_used), Ok(memory_total)) = (
            parts[1].parse::<u32>(),
            parts[2].parse::<u64>(),
            parts[3].parse::<u64>(),
        ) else {
            continue;
        };
        let memory_percent = if memory_total == 0 {
            0.0
        } else {
            (memory_used as f64 / memory_total as f64) * 100.0
        };
        loads.insert(
            parts[0].to_string(),
            GpuLoad {
                utilization,
                memory_used,
                memory_total,
                memory_percent,
            },
        );
    }
    loads
}

/// Configurable probe for tests.
#[derive(Debug, Clone, Default)]
pub struct MockProbe {
    inventory: DeviceInventory,
    load: HashMap<String, GpuLoad>,
}

impl MockProbe {
    /// Probe reporting `count` physical GPUs and no MIG instances.
    pub fn physical(count: usize) -> Self {
        Self {
            inventory: DeviceInventory {
                physical_count: count,
                ..Default::default()
            },
            load: HashMap::new(),
        }
    }

    /// Probe behaving like an unreachable vendor tool: the deterministic
    /// fallback count and no load data.
    pub fn unreachable() -> Self {
        Self::physical(FALLBACK_PHYSICAL_GPUS)
    }

    /// Add MIG instances for one physical GPU (only reported when the
    /// enumeration requests MIG).
    pub fn with_mig(mut self, physical_gpu: &str, instances: u32) -> Self {
        for instance in 0..instances {
            self.inventory
                .mig_instances
                .push(MigInstance::new(physical_gpu, instance));
        }
        self
    }

    /// Set the live load for one physical GPU index.
    pub fn with_load(mut self, gpu_id: &str, load: GpuLoad) -> Self {
        self.load.insert(gpu_id.to_string(), load);
        self
    }
}

impl DeviceProbe for MockProbe {
    fn enumerate(&self, mig_requested: bool) -> DeviceInventory {
        let mut inventory = self.inventory.clone();
        if !mig_requested {
            inventory.mig_instances.clear();
        }
        inventory
    }

    fn load(&self) -> HashMap<String, GpuLoad> {
        self.load.clone()
    }
}
