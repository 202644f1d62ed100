// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1

//! Read-only view over `resource-limits.yaml`
//!
//! The allocator consumes only a slice of the shared configuration file:
//! per-user overrides (priority, reservation windows, reserved devices),
//! group memberships and priorities, the default group, and the global
//! `gpu_allocation` settings. A missing or unparseable file is never an
//! error; allocation proceeds with defaults (priority 10, no reservations,
//! MIG off).

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::warn;

/// Priority applied when neither an override nor a group matches.
pub const DEFAULT_PRIORITY: i64 = 10;

/// Priority applied when a user has an override block without a `priority`.
pub const OVERRIDE_DEFAULT_PRIORITY: i64 = 100;

/// Group consulted when the user belongs to no configured group.
pub const DEFAULT_GROUP: &str = "student";

/// Per-user override block.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserOverride {
    #[serde(default)]
    pub priority: Option<i64>,
    #[serde(default)]
    pub reservation_start: Option<String>,
    #[serde(default)]
    pub reservation_end: Option<String>,
    /// Device ids; YAML authors write these as bare ints or strings.
    #[serde(default)]
    pub reserved_gpus: Vec<serde_yaml::Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GroupConfig {
    #[serde(default)]
    pub members: Vec<String>,
    #[serde(default)]
    pub priority: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GpuAllocationConfig {
    #[serde(default)]
    pub enable_mig: bool,
    #[serde(default = "default_strategy")]
    pub strategy: String,
}

fn default_strategy() -> String {
    crate::state::LEAST_ALLOCATED.to_string()
}

impl Default for GpuAllocationConfig {
    fn default() -> Self {
        Self {
            enable_mig: false,
            strategy: default_strategy(),
        }
    }
}

/// The subset of `resource-limits.yaml` the allocator reads.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResourceLimits {
    #[serde(default)]
    pub user_overrides: BTreeMap<String, UserOverride>,
    #[serde(default)]
    pub groups: BTreeMap<String, GroupConfig>,
    #[serde(default)]
    pub default_group: Option<String>,
    #[serde(default)]
    pub gpu_allocation: GpuAllocationConfig,
}

/// Policy lookups against the loaded configuration.
#[derive(Debug, Clone, Default)]
pub struct PolicyConfig {
    limits: ResourceLimits,
}

impl PolicyConfig {
    /// Load from `path`. Missing or unparseable files degrade to the empty
    /// configuration.
    pub fn load(path: &Path) -> Self {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(_) => {
                warn!("⚠️ Config {} not readable, using defaults", path.display());
                return Self::default();
            }
        };
        match serde_yaml::from_str::<ResourceLimits>(&raw) {
            Ok(limits) => Self { limits },
            Err(err) => {
                warn!("⚠️ Config {} unparseable ({}), using defaults", path.display(), err);
                Self::default()
            }
        }
    }

    pub fn from_limits(limits: ResourceLimits) -> Self {
        Self { limits }
    }

    /// Effective priority: override > group membership > default group > 10.
    pub fn user_priority(&self, user: &str) -> i64 {
        if let Some(over) = self.limits.user_overrides.get(user) {
            return over.priority.unwrap_or(OVERRIDE_DEFAULT_PRIORITY);
        }

        for group in self.limits.groups.values() {
            if group.members.iter().any(|member| member == user) {
                return group.priority.unwrap_or(DEFAULT_PRIORITY);
            }
        }

        let default_group = self
            .limits
            .default_group
            .as_deref()
            .unwrap_or(DEFAULT_GROUP);
        if let Some(group) = self.limits.groups.get(default_group) {
            return group.priority.unwrap_or(DEFAULT_PRIORITY);
        }

        DEFAULT_PRIORITY
    }

    /// Device ids reserved for `user` when `now` falls inside the user's
    /// configured window (`start <= now <= end`, closed on both ends).
    /// Unparseable window bounds disable the reservation.
    pub fn reserved_gpus(&self, user: &str, now: NaiveDateTime) -> Vec<String> {
        let Some(over) = self.limits.user_overrides.get(user) else {
            return Vec::new();
        };
        let (Some(start_raw), Some(end_raw)) =
            (over.reservation_start.as_deref(), over.reservation_end.as_deref())
        else {
            return Vec::new();
        };
        let (Some(start), Some(end)) = (
            parse_local_timestamp(start_raw),
            parse_local_timestamp(end_raw),
        ) else {
            warn!("⚠️ Unparseable reservation window for {}, ignoring", user);
            return Vec::new();
        };

        if start <= now && now <= end {
            over.reserved_gpus.iter().filter_map(yaml_device_id).collect()
        } else {
            Vec::new()
        }
    }

    pub fn enable_mig(&self) -> bool {
        self.limits.gpu_allocation.enable_mig
    }

    pub fn strategy(&self) -> &str {
        &self.limits.gpu_allocation.strategy
    }
}

fn yaml_device_id(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        serde_yaml::Value::String(s) => Some(s.clone()),
        _ => None,
    }
}

/// Parse an ISO-8601 timestamp as written by local tooling: RFC 3339,
/// naive date-time, or a bare date (midnight).
pub fn parse_local_timestamp(raw: &str) -> Option<NaiveDateTime> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.naive_local());
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(dt);
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}
