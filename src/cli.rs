// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1

//! Command-line surface for the allocation manager
//!
//! Exit codes: 0 on success, 1 on invalid usage (mapped in `main`), 2 when
//! an allocate or release request is denied.

use crate::allocator::{GpuAllocator, StatusReport};
use crate::probe::NvidiaSmiProbe;
use crate::state::DeviceKind;
use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub const DEFAULT_STATE_DIR: &str = "/var/lib/ds01";
pub const DEFAULT_LOG_DIR: &str = "/var/logs/ds01";
pub const DEFAULT_CONFIG_PATH: &str = "/opt/ds01-infra/config/resource-limits.yaml";

/// Filesystem roots, overridable through the environment for test and
/// staging deployments.
#[derive(Debug, Clone)]
pub struct AllocatorPaths {
    pub state_dir: PathBuf,
    pub log_dir: PathBuf,
    pub config_path: PathBuf,
}

impl Default for AllocatorPaths {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(DEFAULT_STATE_DIR),
            log_dir: PathBuf::from(DEFAULT_LOG_DIR),
            config_path: PathBuf::from(DEFAULT_CONFIG_PATH),
        }
    }
}

impl AllocatorPaths {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let from = |var: &str, fallback: PathBuf| {
            std::env::var(var).map(PathBuf::from).unwrap_or(fallback)
        };
        Self {
            state_dir: from("DS01_STATE_DIR", defaults.state_dir),
            log_dir: from("DS01_LOG_DIR", defaults.log_dir),
            config_path: from("DS01_CONFIG_PATH", defaults.config_path),
        }
    }
}

/// GPU allocation manager CLI
#[derive(Parser, Debug)]
#[command(name = "gpu-allocator")]
#[command(version)]
#[command(about = "Priority-aware GPU/MIG allocation for shared servers", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Show GPU allocations
    Status,

    /// Allocate a GPU/MIG instance to a container
    Allocate {
        user: String,
        container: String,
        max_gpus: u32,
        priority: i64,
    },

    /// Release a container's GPU/MIG instance
    Release { container: String },

    /// Show a user's allocations
    UserStatus { user: String },

    /// Show how many devices a user holds
    UserCount { user: String },
}

/// Run one command against the live allocator and return the process exit
/// code.
pub fn execute(cli: Cli) -> Result<i32> {
    let paths = AllocatorPaths::from_env();
    let allocator = GpuAllocator::new(
        &paths.state_dir,
        &paths.log_dir,
        &paths.config_path,
        Box::new(NvidiaSmiProbe),
    )?;

    match cli.command {
        Commands::Status => {
            print_status(&allocator.status()?);
            Ok(0)
        }
        Commands::Allocate {
            user,
            container,
            max_gpus,
            priority,
        } => {
            let outcome = allocator.allocate(&user, &container, max_gpus, priority)?;
            match &outcome.gpu_id {
                Some(gpu_id) => {
                    println!("✓ Allocated GPU/MIG {} to {}", gpu_id, container);
                    Ok(0)
                }
                None => {
                    println!("✗ Allocation failed: {}", outcome.reason);
                    Ok(2)
                }
            }
        }
        Commands::Release { container } => {
            let outcome = allocator.release(&container)?;
            match &outcome.gpu_id {
                Some(gpu_id) => {
                    println!("✓ Released GPU/MIG {} from {}", gpu_id, container);
                    Ok(0)
                }
                None => {
                    println!("✗ No GPU allocated to {}", container);
                    Ok(2)
                }
            }
        }
        Commands::UserStatus { user } => {
            let containers = allocator.user_containers(&user)?;
            let count = allocator.user_gpu_count(&user)?;
            println!(
                "\n{}: {} GPU/MIG instances across {} containers\n",
                user,
                count,
                containers.len()
            );
            for entry in &containers {
                println!(
                    "  GPU {}: {} (priority {})",
                    entry.gpu_id, entry.container, entry.priority
                );
            }
            Ok(0)
        }
        Commands::UserCount { user } => {
            println!("{}", allocator.user_gpu_count(&user)?);
            Ok(0)
        }
    }
}

fn print_status(status: &StatusReport) {
    let mig_banner = if status.mig_enabled {
        "MIG ENABLED"
    } else {
        "Standard GPUs"
    };
    let unit = if status.mig_enabled { " instances" } else { "s" };
    println!(
        "\nGPU Status ({}): {} containers across {} GPU{}\n",
        mig_banner, status.total_allocated_containers, status.total_gpus, unit
    );

    for gpu in &status.gpus {
        let label = match gpu.kind {
            DeviceKind::MigInstance => "MIG",
            DeviceKind::PhysicalGpu => "GPU",
        };
        let reserved = gpu
            .reserved_for
            .as_deref()
            .map(|holder| format!(" [RESERVED for {}]", holder))
            .unwrap_or_default();
        println!("{} {}: {} containers{}", label, gpu.id, gpu.container_count, reserved);
        println!(
            "  Util: {}% | Mem: {}/{} MB",
            gpu.utilization, gpu.memory_used, gpu.memory_total
        );
        for container in &gpu.containers {
            println!("    - {}", container);
        }
        println!();
    }
}
