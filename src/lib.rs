// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
pub mod allocator;
pub mod cli;
pub mod config;
pub mod events;
pub mod metadata;
pub mod probe;
pub mod state;

// Re-export main types
pub use allocator::{AllocationOutcome, GpuAllocator, GpuStatus, StatusReport, UserContainer};
pub use config::{PolicyConfig, ResourceLimits};
pub use events::{EventKind, EventLog};
pub use metadata::{AllocationRecord, MetadataStore};
pub use probe::{DeviceInventory, DeviceProbe, GpuLoad, MigInstance, MockProbe, NvidiaSmiProbe};
pub use state::{DeviceKind, GpuEntry, GpuState, StateError, StateStore};
