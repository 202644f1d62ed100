// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1

//! End-to-end allocation scenarios against real state, metadata, and log
//! files in a temp directory, with a mock device probe.

use ds01_gpu_allocator::allocator::{
    ALREADY_ALLOCATED, LOCK_TIMEOUT, NOT_ALLOCATED, NO_GPU_AVAILABLE,
};
use ds01_gpu_allocator::{GpuAllocator, GpuLoad, GpuState, MockProbe, StateStore};
use std::path::PathBuf;
use tempfile::TempDir;

struct Harness {
    dir: TempDir,
    allocator: GpuAllocator,
}

fn harness(probe: MockProbe, config_yaml: &str) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("resource-limits.yaml");
    if !config_yaml.is_empty() {
        std::fs::write(&config_path, config_yaml).unwrap();
    }
    let allocator = GpuAllocator::new(
        dir.path().join("state"),
        dir.path().join("logs"),
        &config_path,
        Box::new(probe),
    )
    .unwrap();
    Harness { dir, allocator }
}

impl Harness {
    fn state_file(&self) -> PathBuf {
        self.dir.path().join("state/gpu-state.json")
    }

    fn metadata_file(&self, container: &str) -> PathBuf {
        self.dir
            .path()
            .join("state/container-metadata")
            .join(format!("{}.json", container))
    }

    fn read_state(&self) -> GpuState {
        StateStore::new(self.state_file()).read().unwrap()
    }

    fn event_log(&self) -> String {
        std::fs::read_to_string(self.dir.path().join("logs/gpu-allocations.log"))
            .unwrap_or_default()
    }

    /// Administrative out-of-band reservation write, the way operator
    /// tooling edits the state file directly.
    fn reserve_device(&self, gpu_id: &str, user: &str, until: &str) {
        let raw = std::fs::read_to_string(self.state_file()).unwrap();
        let mut doc: serde_json::Value = serde_json::from_str(&raw).unwrap();
        doc["gpus"][gpu_id]["reserved_for"] = serde_json::json!(user);
        doc["gpus"][gpu_id]["reserved_until"] = serde_json::json!(until);
        std::fs::write(self.state_file(), serde_json::to_string_pretty(&doc).unwrap()).unwrap();
    }

    fn assert_conservation(&self) {
        let state = self.read_state();
        for (gpu_id, entry) in &state.gpus {
            let user_sum: u32 = entry.users.values().sum();
            assert_eq!(
                user_sum as usize,
                entry.containers.len(),
                "user counts diverge from containers on {}",
                gpu_id
            );
            assert!(entry.users.values().all(|count| *count > 0));
        }
    }
}

const FAR_FUTURE: &str = "2099-01-01T00:00:00";

fn reservation_yaml(user: &str, gpus: &str) -> String {
    format!(
        "user_overrides:\n  {}:\n    reservation_start: \"2020-01-01T00:00:00\"\n    reservation_end: \"{}\"\n    reserved_gpus: {}\n",
        user, FAR_FUTURE, gpus
    )
}

#[test]
fn fresh_init_with_unreachable_probe_reports_four_devices() {
    let h = harness(MockProbe::unreachable(), "");
    let status = h.allocator.status().unwrap();

    assert_eq!(status.total_gpus, 4);
    assert_eq!(status.total_allocated_containers, 0);
    assert!(!status.mig_enabled);
    let ids: Vec<&str> = status.gpus.iter().map(|g| g.id.as_str()).collect();
    assert_eq!(ids, vec!["0", "1", "2", "3"]);
    assert!(status.gpus.iter().all(|g| g.containers.is_empty()));
}

#[test]
fn same_user_fills_in_id_order_then_hits_limit() {
    let h = harness(MockProbe::physical(4), "");

    let first = h.allocator.allocate("alice", "c1", 2, 50).unwrap();
    assert_eq!(first.gpu_id.as_deref(), Some("0"));
    assert_eq!(first.reason, "SUCCESS");

    // Device 0 now carries equal-priority work; empty devices score lower.
    let second = h.allocator.allocate("alice", "c2", 2, 50).unwrap();
    assert_eq!(second.gpu_id.as_deref(), Some("1"));

    let third = h.allocator.allocate("alice", "c3", 2, 50).unwrap();
    assert_eq!(third.gpu_id, None);
    assert_eq!(third.reason, "USER_AT_LIMIT (2/2)");

    assert_eq!(h.allocator.user_gpu_count("alice").unwrap(), 2);
    assert!(h.event_log().contains("REJECTED"));
    h.assert_conservation();
}

#[test]
fn allocate_is_idempotent_per_container() {
    let h = harness(MockProbe::physical(2), "");

    let first = h.allocator.allocate("alice", "c1", 2, 50).unwrap();
    let before = std::fs::read_to_string(h.state_file()).unwrap();

    let again = h.allocator.allocate("alice", "c1", 2, 50).unwrap();
    assert_eq!(again.gpu_id, first.gpu_id);
    assert_eq!(again.reason, ALREADY_ALLOCATED);

    let after = std::fs::read_to_string(h.state_file()).unwrap();
    assert_eq!(before, after, "repeat allocate must not mutate state");
    assert_eq!(h.allocator.user_gpu_count("alice").unwrap(), 1);
}

#[test]
fn release_then_release_again() {
    let h = harness(MockProbe::physical(2), "");

    h.allocator.allocate("alice", "c1", 2, 50).unwrap();
    let released = h.allocator.release("c1").unwrap();
    assert_eq!(released.gpu_id.as_deref(), Some("0"));
    assert_eq!(released.reason, "SUCCESS");
    assert!(!h.metadata_file("c1").exists());

    let before = h.read_state();
    let again = h.allocator.release("c1").unwrap();
    assert_eq!(again.gpu_id, None);
    assert_eq!(again.reason, NOT_ALLOCATED);
    assert_eq!(h.read_state(), before, "repeat release must not mutate state");
}

#[test]
fn allocate_release_round_trip_restores_state() {
    let h = harness(MockProbe::physical(3), "");
    h.allocator.allocate("bob", "warm", 4, 20).unwrap();

    let before = h.read_state();
    h.allocator.allocate("alice", "c1", 2, 50).unwrap();
    h.allocator.release("c1").unwrap();
    assert_eq!(h.read_state(), before);
}

#[test]
fn reservation_overrides_scoring() {
    let h = harness(MockProbe::physical(4), &reservation_yaml("bob", "[3]"));

    // Devices 0..2 are emptier, but the active reservation pins bob to 3.
    let outcome = h.allocator.allocate("bob", "cb", 1, 50).unwrap();
    assert_eq!(outcome.gpu_id.as_deref(), Some("3"));
    assert_eq!(outcome.reason, "SUCCESS");
}

#[test]
fn expired_reservation_falls_back_to_scoring() {
    let yaml = "user_overrides:\n  bob:\n    reservation_start: \"2020-01-01T00:00:00\"\n    reservation_end: \"2020-01-02T00:00:00\"\n    reserved_gpus: [3]\n";
    let h = harness(MockProbe::physical(4), yaml);
    let outcome = h.allocator.allocate("bob", "cb", 1, 50).unwrap();
    assert_eq!(outcome.gpu_id.as_deref(), Some("0"));
}

#[test]
fn foreign_device_reservation_blocks_other_users() {
    let h = harness(MockProbe::physical(4), "");
    h.reserve_device("2", "carol", FAR_FUTURE);

    // Dave fills the host; device 2 is never his.
    for container in ["d1", "d2", "d3"] {
        let outcome = h.allocator.allocate("dave", container, 10, 50).unwrap();
        assert_ne!(outcome.gpu_id.as_deref(), Some("2"));
    }
    let state = h.read_state();
    assert!(state.gpus["2"].containers.is_empty());

    // The reservation holder still lands on their own device when it wins.
    let outcome = h.allocator.allocate("carol", "cc", 1, 50).unwrap();
    assert_eq!(outcome.gpu_id.as_deref(), Some("2"));
}

#[test]
fn fully_reserved_host_yields_no_gpu_available() {
    let h = harness(MockProbe::physical(2), "");
    h.reserve_device("0", "carol", FAR_FUTURE);
    h.reserve_device("1", "carol", FAR_FUTURE);

    let outcome = h.allocator.allocate("dave", "cd", 1, 50).unwrap();
    assert_eq!(outcome.gpu_id, None);
    assert_eq!(outcome.reason, NO_GPU_AVAILABLE);
    assert!(h.event_log().contains(NO_GPU_AVAILABLE));
}

#[test]
fn release_with_missing_metadata_reconstructs_owner() {
    let h = harness(MockProbe::physical(2), "");
    h.allocator.allocate("alice", "c1", 2, 50).unwrap();

    // Simulate operator damage: the metadata file is gone.
    std::fs::remove_file(h.metadata_file("c1")).unwrap();

    let outcome = h.allocator.release("c1").unwrap();
    assert_eq!(outcome.gpu_id.as_deref(), Some("0"));
    assert_eq!(outcome.reason, "SUCCESS");

    // The user count was still decremented, keeping counts consistent.
    let state = h.read_state();
    assert!(state.gpus["0"].containers.is_empty());
    assert!(state.gpus["0"].users.is_empty());
    h.assert_conservation();

    // The event is attributed to an unknown user.
    assert!(h.event_log().lines().any(|line| {
        line.contains("RELEASED") && line.split('|').nth(2) == Some("unknown")
    }));
}

#[test]
fn release_with_missing_metadata_picks_right_owner_on_shared_device() {
    let h = harness(MockProbe::physical(1), "");
    h.allocator.allocate("alice", "a1", 4, 50).unwrap();
    h.allocator.allocate("bob", "b1", 4, 50).unwrap();

    std::fs::remove_file(h.metadata_file("b1")).unwrap();
    h.allocator.release("b1").unwrap();

    let state = h.read_state();
    assert_eq!(state.gpus["0"].containers, vec!["a1"]);
    assert_eq!(state.gpus["0"].users.get("alice"), Some(&1));
    assert!(!state.gpus["0"].users.contains_key("bob"));
}

#[test]
fn mig_init_tracks_instances() {
    let yaml = "gpu_allocation:\n  enable_mig: true\n";
    let h = harness(MockProbe::physical(1).with_mig("0", 3), yaml);

    let status = h.allocator.status().unwrap();
    assert!(status.mig_enabled);
    let ids: Vec<&str> = status.gpus.iter().map(|g| g.id.as_str()).collect();
    assert_eq!(ids, vec!["0:0", "0:1", "0:2"]);

    let outcome = h.allocator.allocate("alice", "c1", 2, 50).unwrap();
    assert_eq!(outcome.gpu_id.as_deref(), Some("0:0"));
}

#[test]
fn tie_break_follows_id_order() {
    let h = harness(MockProbe::physical(2), "");

    let first = h.allocator.allocate("u1", "c1", 4, 50).unwrap();
    assert_eq!(first.gpu_id.as_deref(), Some("0"));

    // Empty device 1 scores lower on priority_diff for an equal-priority
    // requester.
    let second = h.allocator.allocate("u2", "c2", 4, 50).unwrap();
    assert_eq!(second.gpu_id.as_deref(), Some("1"));

    // Now both devices score identically; the first id wins.
    let third = h.allocator.allocate("u3", "c3", 4, 50).unwrap();
    assert_eq!(third.gpu_id.as_deref(), Some("0"));
    h.assert_conservation();
}

#[test]
fn memory_load_breaks_ties() {
    let probe = MockProbe::physical(2)
        .with_load(
            "0",
            GpuLoad {
                utilization: 10,
                memory_used: 20480,
                memory_total: 40960,
                memory_percent: 50.0,
            },
        )
        .with_load(
            "1",
            GpuLoad {
                utilization: 5,
                memory_used: 4096,
                memory_total: 40960,
                memory_percent: 10.0,
            },
        );
    let h = harness(probe, "");

    let outcome = h.allocator.allocate("alice", "c1", 2, 50).unwrap();
    assert_eq!(outcome.gpu_id.as_deref(), Some("1"));
}

#[test]
fn low_priority_requester_avoids_high_priority_device() {
    let h = harness(MockProbe::physical(2), "");

    h.allocator.allocate("lowuser", "c1", 4, 10).unwrap(); // lands on 0
    h.allocator.allocate("highuser", "c2", 4, 90).unwrap(); // prefers empty 1

    // Device 0 (priority-10 work) scores diff 0, device 1 (priority-90
    // work) scores diff 80. Low-priority work stacks together and the
    // high-priority device is left undisturbed.
    let third = h.allocator.allocate("another", "c3", 4, 10).unwrap();
    assert_eq!(third.gpu_id.as_deref(), Some("0"));
    h.assert_conservation();
}

#[test]
fn user_queries_reflect_allocations() {
    let h = harness(MockProbe::physical(3), "");
    h.allocator.allocate("alice", "c1", 3, 50).unwrap();
    h.allocator.allocate("alice", "c2", 3, 50).unwrap();
    h.allocator.allocate("bob", "c3", 3, 20).unwrap();

    assert_eq!(h.allocator.user_gpu_count("alice").unwrap(), 2);
    assert_eq!(h.allocator.user_gpu_count("bob").unwrap(), 1);
    assert_eq!(h.allocator.user_gpu_count("nobody").unwrap(), 0);

    let mut containers = h.allocator.user_containers("alice").unwrap();
    containers.sort_by(|a, b| a.container.cmp(&b.container));
    assert_eq!(containers.len(), 2);
    assert_eq!(containers[0].container, "c1");
    assert_eq!(containers[0].gpu_id, "0");
    assert_eq!(containers[0].priority, 50);
    assert!(!containers[0].allocated_at.is_empty());

    assert!(h.allocator.user_containers("nobody").unwrap().is_empty());
}

#[test]
fn status_surfaces_reservations_and_load() {
    let probe = MockProbe::physical(2).with_load(
        "0",
        GpuLoad {
            utilization: 45,
            memory_used: 2048,
            memory_total: 40960,
            memory_percent: 5.0,
        },
    );
    let h = harness(probe, "");
    h.reserve_device("1", "carol", FAR_FUTURE);
    h.allocator.allocate("alice", "c1", 2, 50).unwrap();

    let status = h.allocator.status().unwrap();
    assert_eq!(status.total_allocated_containers, 1);

    let gpu0 = &status.gpus[0];
    assert_eq!(gpu0.utilization, 45);
    assert_eq!(gpu0.memory_used, 2048);
    assert!(!gpu0.reserved);

    let gpu1 = &status.gpus[1];
    assert!(gpu1.reserved);
    assert_eq!(gpu1.reserved_for.as_deref(), Some("carol"));
    assert_eq!(gpu1.reserved_until.as_deref(), Some(FAR_FUTURE));
}

#[test]
fn event_log_records_lifecycle() {
    let h = harness(MockProbe::physical(1), "");
    h.allocator.allocate("alice", "c1", 1, 50).unwrap();
    h.allocator.allocate("alice", "c2", 1, 50).unwrap(); // rejected
    h.allocator.release("c1").unwrap();

    let log = h.event_log();
    let lines: Vec<&str> = log.lines().collect();
    assert_eq!(lines.len(), 3);
    assert!(lines[0].contains("|ALLOCATED|alice|c1|0|priority=50|"));
    assert!(lines[0].contains("ALLOCATED physical_gpu (now has 1 containers)"));
    assert!(lines[1].contains("|REJECTED|alice|c2|N/A|priority=50|USER_AT_LIMIT (1/1)"));
    assert!(lines[2].contains("|RELEASED|alice|c1|0|priority=50|"));
    assert!(lines[2].contains("RELEASED (now has 0 containers)"));
}

#[test]
fn lock_timeout_is_reported_not_fatal() {
    let h = harness(MockProbe::physical(2), "");
    let config_path = h.dir.path().join("resource-limits.yaml");
    let contender = GpuAllocator::new(
        h.dir.path().join("state"),
        h.dir.path().join("logs"),
        &config_path,
        Box::new(MockProbe::physical(2)),
    )
    .unwrap()
    .with_lock_wait(std::time::Duration::from_millis(250));

    let store = StateStore::new(h.state_file());
    let _held = store.lock().unwrap();

    let outcome = contender.allocate("alice", "c1", 2, 50).unwrap();
    assert_eq!(outcome.gpu_id, None);
    assert_eq!(outcome.reason, LOCK_TIMEOUT);

    let released = contender.release("c1").unwrap();
    assert_eq!(released.reason, LOCK_TIMEOUT);
}

#[test]
fn deleted_state_file_is_reinitialized() {
    let h = harness(MockProbe::physical(2), "");
    h.allocator.allocate("alice", "c1", 2, 50).unwrap();

    std::fs::remove_file(h.state_file()).unwrap();
    let status = h.allocator.status().unwrap();
    assert_eq!(status.total_gpus, 2);
    assert_eq!(status.total_allocated_containers, 0);
}

#[test]
fn unknown_strategy_in_config_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("resource-limits.yaml");
    std::fs::write(&config_path, "gpu_allocation:\n  strategy: best_fit\n").unwrap();

    let result = GpuAllocator::new(
        dir.path().join("state"),
        dir.path().join("logs"),
        &config_path,
        Box::new(MockProbe::physical(2)),
    );
    assert!(result.is_err());
}

#[test]
fn config_strategy_drift_after_init_is_ignored() {
    let h = harness(MockProbe::physical(2), "");
    h.allocator.allocate("alice", "c1", 2, 50).unwrap();

    // The strategy was snapshotted into the state file at initialization;
    // a later config edit must not break a validly initialized host.
    let config_path = h.dir.path().join("resource-limits.yaml");
    std::fs::write(&config_path, "gpu_allocation:\n  strategy: best_fit\n").unwrap();

    let drifted = GpuAllocator::new(
        h.dir.path().join("state"),
        h.dir.path().join("logs"),
        &config_path,
        Box::new(MockProbe::physical(2)),
    )
    .unwrap();

    let status = drifted.status().unwrap();
    assert_eq!(status.total_gpus, 2);

    let outcome = drifted.allocate("alice", "c2", 2, 50).unwrap();
    assert_eq!(outcome.gpu_id.as_deref(), Some("1"));
    assert_eq!(drifted.user_gpu_count("alice").unwrap(), 2);
    assert_eq!(drifted.release("c1").unwrap().reason, "SUCCESS");
}

#[test]
fn conservation_holds_across_mixed_history() {
    let h = harness(MockProbe::physical(3), "");
    let ops: &[(&str, &str, bool)] = &[
        ("alice", "a1", true),
        ("bob", "b1", true),
        ("alice", "a2", true),
        ("bob", "b1", false),
        ("carol", "x1", true),
        ("alice", "a1", false),
        ("carol", "x2", true),
        ("carol", "x1", false),
    ];
    for (user, container, is_alloc) in ops {
        if *is_alloc {
            h.allocator.allocate(user, container, 5, 30).unwrap();
        } else {
            h.allocator.release(container).unwrap();
        }
        h.assert_conservation();
    }

    assert_eq!(h.allocator.user_gpu_count("alice").unwrap(), 1);
    assert_eq!(h.allocator.user_gpu_count("bob").unwrap(), 0);
    assert_eq!(h.allocator.user_gpu_count("carol").unwrap(), 1);
}
