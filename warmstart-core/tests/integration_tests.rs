// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! End-to-end lifecycle tests for warmstart.
//!
//! These tests drive the coordinator and orchestrator against the simulated
//! control plane and a real address pool.

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use warmstart_core::sim::{Operation, SimVmState, SimulatedControlPlane};
use warmstart_core::{
    AddressPool, ContainerId, ControlPlaneError, Coordinator, ImageName, InstanceState,
    LifecycleError, Orchestrator, OrchestratorConfig, StartPath, Timeouts, VmId,
};

struct Harness {
    dir: TempDir,
    sim: Arc<SimulatedControlPlane>,
    pool: Arc<AddressPool>,
    coordinator: Coordinator,
}

fn fast_timeouts() -> Timeouts {
    Timeouts {
        cold_boot: Duration::from_secs(5),
        snapshot: Duration::from_secs(5),
        restore: Duration::from_secs(5),
        teardown: Duration::from_secs(5),
        stop_grace: Duration::ZERO,
    }
}

fn harness_with(configure: impl FnOnce(OrchestratorConfig) -> OrchestratorConfig) -> Harness {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let config = configure(
        OrchestratorConfig::default()
            .with_snapshot_dir(dir.path().join("snapshots"))
            .with_timeouts(fast_timeouts())
            .without_cluster_dns(),
    );

    let sim = Arc::new(SimulatedControlPlane::new());
    let pool = Arc::new(AddressPool::new(config.network));
    let orchestrator = Orchestrator::new(sim.clone(), pool.clone(), config)
        .expect("Failed to create orchestrator");

    Harness {
        dir,
        sim,
        pool,
        coordinator: Coordinator::new(Arc::new(orchestrator)),
    }
}

fn harness() -> Harness {
    harness_with(|config| config)
}

fn image(name: &str) -> ImageName {
    ImageName::new(name).unwrap()
}

fn container(id: &str) -> ContainerId {
    ContainerId::new(id).unwrap()
}

/// Cold boot, offload on stop, then restore from the idle pool.
#[tokio::test]
async fn test_cold_offload_restore_cycle() {
    let h = harness();
    let nginx = image("nginx:1.17-alpine");

    let first = h.coordinator.start(&nginx, &[]).await.unwrap();
    assert_eq!(first.path, StartPath::ColdBoot);
    let vm_id = first.instance.vm_id();
    h.coordinator
        .register_active(container("c1"), first.instance.clone())
        .unwrap();
    assert!(h.coordinator.is_active(&container("c1")));

    h.coordinator.stop(&container("c1")).await.unwrap();
    assert!(!h.coordinator.is_active(&container("c1")));
    assert_eq!(h.coordinator.idle_count(&nginx), 1);
    assert_eq!(first.instance.state(), InstanceState::Idle);
    assert!(first.instance.has_snapshot());
    assert_eq!(h.sim.vm_state(vm_id), Some(SimVmState::Stopped));
    assert_eq!(h.pool.device_generation(vm_id), Some(1));

    let orch = h.coordinator.orchestrator();
    assert!(orch.memory_file(vm_id).is_file());
    assert!(orch.snapshot_file(vm_id).is_file());

    let second = h.coordinator.start(&nginx, &[]).await.unwrap();
    assert_eq!(second.path, StartPath::Restored);
    assert_eq!(second.instance.vm_id(), vm_id);
    assert_eq!(second.guest_address, first.guest_address);
    assert_eq!(h.coordinator.idle_count(&nginx), 0);
    assert_eq!(h.sim.vm_state(vm_id), Some(SimVmState::Running));

    // The restore path never pulls images or creates containers
    assert_eq!(h.sim.count(Operation::PullImage), 1);
    assert_eq!(h.sim.count(Operation::CreateVm), 1);
    assert_eq!(h.sim.count(Operation::CreateContainer), 1);
    assert_eq!(h.sim.count(Operation::RestoreVm), 1);
}

#[tokio::test]
async fn test_duplicate_registration_rejected() {
    let h = harness();
    let nginx = image("nginx");

    let a = h.coordinator.start(&nginx, &[]).await.unwrap();
    let b = h.coordinator.start(&nginx, &[]).await.unwrap();

    h.coordinator
        .register_active(container("c1"), a.instance.clone())
        .unwrap();

    let err = h
        .coordinator
        .register_active(container("c1"), b.instance.clone())
        .unwrap_err();
    assert!(matches!(
        err,
        LifecycleError::DuplicateRegistration { vm_id, .. } if vm_id == a.instance.vm_id()
    ));

    // The same instance cannot back a second container either
    let err = h
        .coordinator
        .register_active(container("c2"), a.instance.clone())
        .unwrap_err();
    assert!(matches!(err, LifecycleError::DuplicateRegistration { .. }));

    // First registration is untouched
    let registered = h.coordinator.get(&container("c1")).unwrap();
    assert_eq!(registered.vm_id(), a.instance.vm_id());
    assert_eq!(h.coordinator.active_count(), 1);
}

#[tokio::test]
async fn test_stop_unknown_container_is_noop() {
    let h = harness();
    h.coordinator.stop(&container("missing")).await.unwrap();
    assert!(h.sim.calls().is_empty());
}

#[tokio::test]
async fn test_snapshots_disabled_tears_down() {
    let h = harness_with(|config| config.with_snapshots(false));
    let nginx = image("nginx");

    let started = h.coordinator.start(&nginx, &[]).await.unwrap();
    let vm_id = started.instance.vm_id();
    h.coordinator
        .register_active(container("c1"), started.instance.clone())
        .unwrap();
    h.coordinator.stop(&container("c1")).await.unwrap();

    assert_eq!(h.coordinator.idle_count(&nginx), 0);
    assert_eq!(started.instance.state(), InstanceState::Stopped);
    assert_eq!(h.sim.count(Operation::KillTask), 1);
    assert_eq!(h.sim.count(Operation::DeleteTask), 1);
    assert_eq!(h.sim.count(Operation::DeleteContainer), 1);
    assert_eq!(h.sim.count(Operation::StopVm), 1);
    assert_eq!(h.sim.count(Operation::CreateSnapshot), 0);
    assert!(!h.pool.is_allocated(vm_id));
    assert!(!h.coordinator.orchestrator().is_tracked(vm_id));

    // Next start is a fresh cold boot with a new ID
    let again = h.coordinator.start(&nginx, &[]).await.unwrap();
    assert_eq!(again.path, StartPath::ColdBoot);
    assert_ne!(again.instance.vm_id(), vm_id);
}

#[tokio::test]
async fn test_idle_pool_is_per_image() {
    let h = harness();
    let nginx = image("nginx");
    let redis = image("redis");

    let started = h.coordinator.start(&nginx, &[]).await.unwrap();
    h.coordinator
        .register_active(container("c1"), started.instance)
        .unwrap();
    h.coordinator.stop(&container("c1")).await.unwrap();

    let other = h.coordinator.start(&redis, &[]).await.unwrap();
    assert_eq!(other.path, StartPath::ColdBoot);
    assert_eq!(h.coordinator.idle_count(&nginx), 1);
    assert_eq!(h.coordinator.idle_total(), 1);
}

#[tokio::test]
async fn test_idle_pool_restores_oldest_first() {
    let h = harness();
    let nginx = image("nginx");

    let a = h.coordinator.start(&nginx, &[]).await.unwrap();
    let b = h.coordinator.start(&nginx, &[]).await.unwrap();
    h.coordinator.register_active(container("a"), a.instance.clone()).unwrap();
    h.coordinator.register_active(container("b"), b.instance.clone()).unwrap();

    h.coordinator.stop(&container("a")).await.unwrap();
    h.coordinator.stop(&container("b")).await.unwrap();
    assert_eq!(h.coordinator.idle_count(&nginx), 2);

    let restored = h.coordinator.start(&nginx, &[]).await.unwrap();
    assert_eq!(restored.instance.vm_id(), a.instance.vm_id());
    assert_eq!(h.coordinator.idle_count(&nginx), 1);
}

#[tokio::test]
async fn test_concurrent_starts_get_distinct_vms() {
    let h = harness();
    let nginx = image("nginx");

    let outcomes = futures::future::join_all((0..8).map(|_| h.coordinator.start(&nginx, &[]))).await;

    let mut ids: Vec<VmId> = outcomes
        .into_iter()
        .map(|o| o.unwrap().instance.vm_id())
        .collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 8);
    assert_eq!(h.pool.allocated_count(), 8);
}

/// A failure at the last cold boot step undoes every completed step.
#[tokio::test]
async fn test_cold_boot_failure_rolls_back() {
    let h = harness();
    h.sim.fail(Operation::StartTask);

    let err = h.coordinator.start(&image("nginx"), &[]).await.unwrap_err();
    assert!(matches!(err, LifecycleError::ControlPlane(ControlPlaneError::Call { .. })));

    assert_eq!(h.pool.allocated_count(), 0);
    assert_eq!(h.sim.container_count(), 0);
    assert_eq!(h.sim.task_count(), 0);
    assert_eq!(h.sim.live_vms(), 0);
    assert_eq!(h.sim.count(Operation::KillTask), 1);
    assert_eq!(h.sim.count(Operation::DeleteTask), 1);
    assert_eq!(h.sim.count(Operation::DeleteContainer), 1);
    assert_eq!(h.sim.count(Operation::StopVm), 1);
    assert_eq!(h.coordinator.active_count(), 0);
    assert!(h.coordinator.orchestrator().tracked_vms().is_empty());
}

#[tokio::test]
async fn test_image_pull_failure_releases_network() {
    let h = harness();
    h.sim.fail(Operation::PullImage);

    let err = h.coordinator.start(&image("nginx"), &[]).await.unwrap_err();
    assert!(matches!(
        err,
        LifecycleError::ControlPlane(ControlPlaneError::ImagePull { .. })
    ));
    assert_eq!(h.pool.allocated_count(), 0);
    assert_eq!(h.sim.count(Operation::CreateVm), 0);
    assert!(h.coordinator.orchestrator().images().is_empty());
}

#[tokio::test]
async fn test_cold_boot_timeout_rolls_back() {
    let h = harness_with(|config| {
        config.with_timeouts(Timeouts {
            cold_boot: Duration::from_millis(100),
            ..fast_timeouts()
        })
    });
    h.sim
        .set_latency(Operation::CreateContainer, Duration::from_secs(2));

    let err = h.coordinator.start(&image("nginx"), &[]).await.unwrap_err();
    assert!(matches!(
        err,
        LifecycleError::ControlPlane(ControlPlaneError::Timeout { .. })
    ));

    assert_eq!(h.sim.count(Operation::StopVm), 1);
    assert_eq!(h.sim.count(Operation::DeleteContainer), 0);
    assert_eq!(h.sim.live_vms(), 0);
    assert_eq!(h.pool.allocated_count(), 0);
}

#[tokio::test]
async fn test_restore_with_missing_artifact_discards_instance() {
    let h = harness();
    let nginx = image("nginx");

    let started = h.coordinator.start(&nginx, &[]).await.unwrap();
    let vm_id = started.instance.vm_id();
    h.coordinator
        .register_active(container("c1"), started.instance.clone())
        .unwrap();
    h.coordinator.stop(&container("c1")).await.unwrap();

    let orch = h.coordinator.orchestrator();
    std::fs::remove_file(orch.memory_file(vm_id)).unwrap();

    let err = h.coordinator.start(&nginx, &[]).await.unwrap_err();
    assert!(matches!(err, LifecycleError::MissingArtifact { .. }));

    // The idle record was consumed and its resources released
    assert_eq!(h.coordinator.idle_count(&nginx), 0);
    assert_eq!(started.instance.state(), InstanceState::Stopped);
    assert!(!h.pool.is_allocated(vm_id));
    assert!(!orch.vm_base_dir(vm_id).exists());
    assert_eq!(h.sim.count(Operation::RestoreVm), 0);

    let next = h.coordinator.start(&nginx, &[]).await.unwrap();
    assert_eq!(next.path, StartPath::ColdBoot);
}

#[tokio::test]
async fn test_restore_failure_stops_vm() {
    let h = harness();
    let nginx = image("nginx");

    let started = h.coordinator.start(&nginx, &[]).await.unwrap();
    let vm_id = started.instance.vm_id();
    h.coordinator
        .register_active(container("c1"), started.instance.clone())
        .unwrap();
    h.coordinator.stop(&container("c1")).await.unwrap();
    let stops_before = h.sim.count_for(Operation::StopVm, vm_id);

    h.sim.fail(Operation::RestoreVm);
    let err = h.coordinator.start(&nginx, &[]).await.unwrap_err();
    assert!(matches!(err, LifecycleError::ControlPlane(_)));

    assert_eq!(h.sim.count_for(Operation::StopVm, vm_id), stops_before + 1);
    assert_eq!(h.coordinator.idle_count(&nginx), 0);
    assert!(!h.coordinator.orchestrator().is_tracked(vm_id));
    assert_eq!(h.sim.container_count(), 0);
    assert_eq!(h.sim.task_count(), 0);
    assert_eq!(started.instance.state(), InstanceState::Stopped);
}

/// If the discarded instance cannot be released it is orphaned, not lost.
#[tokio::test]
async fn test_failed_release_after_restore_orphans_instance() {
    let h = harness();
    let nginx = image("nginx");

    let started = h.coordinator.start(&nginx, &[]).await.unwrap();
    let vm_id = started.instance.vm_id();
    h.coordinator
        .register_active(container("c1"), started.instance.clone())
        .unwrap();
    h.coordinator.stop(&container("c1")).await.unwrap();

    h.sim.fail_once(Operation::RestoreVm);
    h.sim.fail_once(Operation::DeleteContainer);
    assert!(h.coordinator.start(&nginx, &[]).await.is_err());

    assert_eq!(h.coordinator.orphans(), vec![vm_id]);
    assert_eq!(started.instance.state(), InstanceState::Orphaned);
    assert_eq!(h.sim.container_count(), 1);

    let report = h.coordinator.reconcile_orphans().await;
    assert_eq!(report.reclaimed, vec![vm_id]);
    assert_eq!(h.sim.container_count(), 0);
    assert_eq!(h.sim.task_count(), 0);
    assert!(!h.pool.is_allocated(vm_id));
    assert!(!h.coordinator.orchestrator().vm_base_dir(vm_id).exists());
}

/// A failed offload leaves the instance orphaned until reconciled.
#[tokio::test]
async fn test_offload_failure_orphans_instance() {
    let h = harness();
    let nginx = image("nginx");

    let started = h.coordinator.start(&nginx, &[]).await.unwrap();
    let vm_id = started.instance.vm_id();
    h.coordinator
        .register_active(container("c1"), started.instance.clone())
        .unwrap();

    h.sim.fail(Operation::CreateSnapshot);
    let err = h.coordinator.stop(&container("c1")).await.unwrap_err();
    assert!(matches!(err, LifecycleError::Snapshot { .. }));

    assert_eq!(h.coordinator.orphans(), vec![vm_id]);
    assert_eq!(started.instance.state(), InstanceState::Orphaned);
    assert_eq!(h.coordinator.active_count(), 0);
    assert_eq!(h.coordinator.idle_count(&nginx), 0);
    assert!(h.pool.is_allocated(vm_id));

    // Still failing: the orphan stays put
    h.sim.fail(Operation::KillTask);
    let report = h.coordinator.reconcile_orphans().await;
    assert_eq!(report.failed, vec![vm_id]);
    assert_eq!(h.coordinator.orphans(), vec![vm_id]);

    h.sim.clear_faults();
    let report = h.coordinator.reconcile_orphans().await;
    assert_eq!(report.reclaimed, vec![vm_id]);
    assert!(h.coordinator.orphans().is_empty());
    assert_eq!(started.instance.state(), InstanceState::Stopped);
    assert!(!h.pool.is_allocated(vm_id));
    assert_eq!(h.sim.vm_state(vm_id), Some(SimVmState::Stopped));
    assert_eq!(h.sim.container_count(), 0);
    assert!(!h.coordinator.orchestrator().vm_base_dir(vm_id).exists());
}

#[tokio::test]
async fn test_shutdown_releases_everything() {
    let h = harness();
    let nginx = image("nginx");
    let redis = image("redis");

    let a = h.coordinator.start(&nginx, &[]).await.unwrap();
    let b = h.coordinator.start(&redis, &[]).await.unwrap();
    let c = h.coordinator.start(&nginx, &[]).await.unwrap();
    h.coordinator.register_active(container("a"), a.instance).unwrap();
    h.coordinator.register_active(container("b"), b.instance).unwrap();
    h.coordinator.register_active(container("c"), c.instance).unwrap();
    h.coordinator.stop(&container("c")).await.unwrap();

    let report = h.coordinator.shutdown().await.unwrap();
    assert_eq!(report.stopped, 2);
    assert_eq!(report.released, 1);
    assert!(report.failed.is_empty());

    assert_eq!(h.coordinator.active_count(), 0);
    assert_eq!(h.coordinator.idle_total(), 0);
    assert_eq!(h.pool.allocated_count(), 0);
    assert_eq!(h.sim.live_vms(), 0);
    assert_eq!(h.sim.container_count(), 0);
    assert_eq!(h.sim.task_count(), 0);
    assert!(h.sim.is_closed());
    assert!(!h.dir.path().join("snapshots").exists());
}

/// A stop still offloading when shutdown runs must not leave anything parked.
#[tokio::test]
async fn test_stop_racing_shutdown_parks_nothing() {
    let h = harness();
    let nginx = image("nginx");

    let started = h.coordinator.start(&nginx, &[]).await.unwrap();
    h.coordinator
        .register_active(container("c1"), started.instance.clone())
        .unwrap();
    h.sim.set_latency(Operation::StopVm, Duration::from_millis(300));

    let c1 = container("c1");
    let (stopped, shutdown) = futures::join!(h.coordinator.stop(&c1), async {
        while h.sim.count(Operation::StopVm) == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        h.coordinator.shutdown().await
    });

    // Shutdown released the network under the offload, so it fails late
    assert!(stopped.is_err());
    let report = shutdown.unwrap();
    assert_eq!(report.stopped + report.released, 0);

    assert_eq!(h.coordinator.idle_total(), 0);
    assert!(h.coordinator.orphans().is_empty());
    assert_eq!(h.sim.container_count(), 0);
    assert_eq!(h.sim.task_count(), 0);
}

#[derive(Clone, Copy)]
enum Step {
    Start(usize),
    Stop,
    StopUnknown,
}

/// Fixed xorshift sequence so failures are reproducible.
fn step_sequence(seed: u64, len: usize) -> Vec<Step> {
    let mut state = seed;
    let mut next = move || {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        state
    };
    (0..len)
        .map(|_| match next() % 5 {
            0 | 1 => Step::Start((next() % 3) as usize),
            2 | 3 => Step::Stop,
            _ => Step::StopUnknown,
        })
        .collect()
}

async fn check_active_set_tracks_sequence(snapshots: bool, seed: u64) {
    use std::collections::BTreeMap;

    let h = harness_with(|config| config.with_snapshots(snapshots));
    let images = [image("nginx"), image("redis"), image("python:3.11")];
    let mut model: BTreeMap<String, VmId> = BTreeMap::new();
    let mut stopped: Vec<String> = Vec::new();
    let mut next_container = 0;

    for (i, step) in step_sequence(seed, 60).into_iter().enumerate() {
        match step {
            Step::Start(which) => {
                next_container += 1;
                let id = format!("c{}", next_container);
                let started = h.coordinator.start(&images[which], &[]).await.unwrap();
                let vm_id = started.instance.vm_id();
                h.coordinator
                    .register_active(container(&id), started.instance)
                    .unwrap();
                model.insert(id, vm_id);
            }
            Step::Stop => {
                // Lowest ID first keeps the choice deterministic
                let Some(id) = model.keys().next().cloned() else {
                    continue;
                };
                h.coordinator.stop(&container(&id)).await.unwrap();
                model.remove(&id);
                stopped.push(id);
            }
            Step::StopUnknown => {
                let id = stopped
                    .last()
                    .cloned()
                    .unwrap_or_else(|| "never-started".to_string());
                h.coordinator.stop(&container(&id)).await.unwrap();
            }
        }

        assert_eq!(h.coordinator.active_count(), model.len(), "step {}", i);
        for (id, vm_id) in &model {
            assert!(h.coordinator.is_active(&container(id)), "step {}: {} missing", i, id);
            assert_eq!(h.coordinator.get(&container(id)).unwrap().vm_id(), *vm_id);
        }
        for id in &stopped {
            assert!(!h.coordinator.is_active(&container(id)), "step {}: {} still active", i, id);
        }
        if !snapshots {
            assert_eq!(h.coordinator.idle_total(), 0);
        }
    }

    // No VM backs two live containers
    let mut vms: Vec<VmId> = model.values().copied().collect();
    vms.sort();
    vms.dedup();
    assert_eq!(vms.len(), model.len());
    assert!(h.coordinator.orphans().is_empty());
}

#[tokio::test]
async fn test_active_set_tracks_sequence_with_snapshots() {
    for seed in [0x9e37_79b9_7f4a_7c15, 42, 7] {
        check_active_set_tracks_sequence(true, seed).await;
    }
}

#[tokio::test]
async fn test_active_set_tracks_sequence_without_snapshots() {
    for seed in [0x9e37_79b9_7f4a_7c15, 42, 7] {
        check_active_set_tracks_sequence(false, seed).await;
    }
}

#[tokio::test]
async fn test_config_file_drives_orchestrator() {
    use warmstart_core::ConfigLoader;

    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let snapshot_dir = temp_dir.path().join("snaps");
    let config_path = temp_dir.path().join("warmstart.yaml");

    std::fs::write(
        &config_path,
        format!(
            r#"
orchestrator:
  snapshots_enabled: false
  snapshot_dir: {}
  stop_grace_ms: 0
  network:
    cidr: 10.20.0.0/24
  dns:
    cluster_lookup: false
    fallback: ["1.1.1.1"]
"#,
            snapshot_dir.display()
        ),
    )
    .expect("Failed to write config");

    let config = ConfigLoader::load_file(&config_path).expect("Failed to load config");
    let sim = Arc::new(SimulatedControlPlane::new());
    let pool = Arc::new(AddressPool::new(config.orchestrator.network));
    let orchestrator = Orchestrator::new(sim.clone(), pool.clone(), config.orchestrator).unwrap();
    let coordinator = Coordinator::new(Arc::new(orchestrator));

    let started = coordinator.start(&image("nginx"), &[]).await.unwrap();
    assert_eq!(started.guest_address.octets()[..3], [10, 20, 0]);
    assert!(snapshot_dir.is_dir());
    assert!(!coordinator.orchestrator().snapshots_enabled());
}
