// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Lifecycle coordinator.
//!
//! Owns the active set (container ID → instance), the idle pool
//! (image → offloaded instances) and the orphan set. All three sit behind one
//! lock which is never held across a control-plane call, so an instance is
//! reachable from at most one collection at any time.

use std::collections::{HashMap, VecDeque};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::join_all;
use serde::Serialize;

use crate::error::{LifecycleError, LifecycleResult};
use crate::instance::Instance;
use crate::metrics::OperationMetric;
use crate::orchestrator::Orchestrator;
use crate::state::InstanceState;
use crate::types::{ContainerId, ImageName, VmId};

/// How an instance was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StartPath {
    ColdBoot,
    Restored,
}

/// A started instance, not yet registered under a container ID.
#[derive(Debug, Clone)]
pub struct StartOutcome {
    pub instance: Arc<Instance>,
    pub guest_address: Ipv4Addr,
    pub path: StartPath,
    pub metric: OperationMetric,
}

/// Result of an orphan reconciliation pass.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub reclaimed: Vec<VmId>,
    /// Still orphaned; retried on the next pass.
    pub failed: Vec<VmId>,
}

/// Result of a shutdown.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    pub stopped: usize,
    pub released: usize,
    pub failed: Vec<VmId>,
}

#[derive(Debug, Default)]
struct Pools {
    active: HashMap<ContainerId, Arc<Instance>>,
    /// Reverse index of `active`, so one VM cannot back two containers.
    active_vms: HashMap<VmId, ContainerId>,
    idle: HashMap<ImageName, VecDeque<Arc<Instance>>>,
    orphaned: HashMap<VmId, Arc<Instance>>,
    /// Set by `shutdown`; nothing is parked in `idle` or `orphaned` after it.
    closed: bool,
}

impl Pools {
    fn pop_idle(&mut self, image: &ImageName) -> Option<Arc<Instance>> {
        let queue = self.idle.get_mut(image)?;
        let instance = queue.pop_front();
        if queue.is_empty() {
            self.idle.remove(image);
        }
        instance
    }
}

/// Maps container IDs to VM instances and decides cold boot versus restore.
pub struct Coordinator {
    orchestrator: Arc<Orchestrator>,
    next_id: AtomicU64,
    pools: Mutex<Pools>,
}

impl Coordinator {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            orchestrator,
            next_id: AtomicU64::new(0),
            pools: Mutex::new(Pools::default()),
        }
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    fn pools(&self) -> MutexGuard<'_, Pools> {
        self.pools.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn allocate_vm_id(&self) -> VmId {
        VmId::new(self.next_id.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Obtain a running instance of `image`.
    ///
    /// With snapshots enabled an idle instance of the same image is restored
    /// if one exists; otherwise a new VM is cold booted. `env` only applies to
    /// cold boots; a restored guest keeps the environment it was booted with.
    pub async fn start(&self, image: &ImageName, env: &[String]) -> LifecycleResult<StartOutcome> {
        if self.orchestrator.snapshots_enabled() {
            let idle = self.pools().pop_idle(image);
            if let Some(instance) = idle {
                return self.restore(instance).await;
            }
        }
        self.cold_boot(image, env).await
    }

    async fn cold_boot(&self, image: &ImageName, env: &[String]) -> LifecycleResult<StartOutcome> {
        let vm_id = self.allocate_vm_id();
        let response = self.orchestrator.start_vm(vm_id, image, env).await?;

        let instance = Instance::new(
            vm_id,
            image.clone(),
            response.guest_ip,
            response.log,
            InstanceState::Cold,
        );
        instance.transition(InstanceState::Active)?;

        Ok(StartOutcome {
            instance: Arc::new(instance),
            guest_address: response.guest_ip,
            path: StartPath::ColdBoot,
            metric: response.metric,
        })
    }

    /// Restore an instance popped from the idle pool. A failed restore
    /// consumes the instance and releases what it still holds; if that release
    /// fails the instance is orphaned.
    async fn restore(&self, instance: Arc<Instance>) -> LifecycleResult<StartOutcome> {
        let vm_id = instance.vm_id();
        instance.transition(InstanceState::Restoring)?;

        match self.orchestrator.start_vm_from_snapshot(vm_id).await {
            Ok(response) => {
                instance.transition(InstanceState::Active)?;
                Ok(StartOutcome {
                    guest_address: response.guest_ip,
                    instance,
                    path: StartPath::Restored,
                    metric: response.metric,
                })
            }
            Err(e) => {
                tracing::warn!(
                    vm_id = %vm_id,
                    image = %instance.image(),
                    error = %e,
                    "Restore failed, discarding idle instance"
                );
                match self.orchestrator.release_offloaded(vm_id).await {
                    Ok(()) => {
                        if let Err(t) = instance.transition(InstanceState::Stopped) {
                            tracing::warn!(vm_id = %vm_id, error = %t, "Unexpected state after failed restore");
                        }
                    }
                    Err(release) => {
                        tracing::warn!(vm_id = %vm_id, error = %release, "Failed to release discarded instance");
                        self.orphan(instance).await;
                    }
                }
                Err(e)
            }
        }
    }

    /// Bind a running instance to `container_id`.
    pub fn register_active(&self, container_id: ContainerId, instance: Arc<Instance>) -> LifecycleResult<()> {
        let vm_id = instance.vm_id();
        let state = instance.state();
        if state != InstanceState::Active {
            return Err(LifecycleError::InternalConsistency {
                vm_id,
                reason: format!("cannot register instance in state {}", state),
            });
        }

        let mut pools = self.pools();
        if let Some(existing) = pools.active.get(&container_id) {
            let existing_vm = existing.vm_id();
            drop(pools);
            tracing::error!(
                container_id = %container_id,
                vm_id = %existing_vm,
                "Container already registered"
            );
            return Err(LifecycleError::DuplicateRegistration {
                container_id,
                vm_id: existing_vm,
            });
        }
        if let Some(owner) = pools.active_vms.get(&vm_id) {
            let owner = owner.clone();
            drop(pools);
            tracing::error!(
                container_id = %container_id,
                vm_id = %vm_id,
                owner = %owner,
                "VM already backs another container"
            );
            return Err(LifecycleError::DuplicateRegistration { container_id, vm_id });
        }

        pools.active_vms.insert(vm_id, container_id.clone());
        pools.active.insert(container_id.clone(), instance);
        drop(pools);

        tracing::info!(container_id = %container_id, vm_id = %vm_id, "Registered active instance");
        Ok(())
    }

    /// Stop the instance behind `container_id`.
    ///
    /// Unknown IDs are a no-op. With snapshots enabled the instance is
    /// offloaded into the idle pool; otherwise it is torn down permanently.
    pub async fn stop(&self, container_id: &ContainerId) -> LifecycleResult<()> {
        let instance = {
            let mut pools = self.pools();
            let instance = pools.active.remove(container_id);
            if let Some(instance) = &instance {
                pools.active_vms.remove(&instance.vm_id());
            }
            instance
        };

        let Some(instance) = instance else {
            tracing::debug!(container_id = %container_id, "Stop for unknown container ignored");
            return Ok(());
        };

        tracing::info!(
            container_id = %container_id,
            vm_id = %instance.vm_id(),
            offload = self.orchestrator.snapshots_enabled(),
            "Stopping instance"
        );

        if self.orchestrator.snapshots_enabled() {
            self.offload(instance).await
        } else {
            self.teardown(instance).await
        }
    }

    async fn offload(&self, instance: Arc<Instance>) -> LifecycleResult<()> {
        let vm_id = instance.vm_id();
        instance.transition(InstanceState::Offloading)?;

        match self.orchestrator.offload(&instance).await {
            Ok(()) => {
                instance.transition(InstanceState::Idle)?;
                let image = instance.image().clone();
                let parked = {
                    let mut pools = self.pools();
                    if pools.closed {
                        None
                    } else {
                        let queue = pools.idle.entry(image).or_default();
                        queue.push_back(Arc::clone(&instance));
                        Some(queue.len())
                    }
                };
                match parked {
                    Some(idle) => {
                        tracing::debug!(vm_id = %vm_id, idle, "Instance parked in idle pool");
                        Ok(())
                    }
                    None => self.release_late(instance).await,
                }
            }
            Err(e) => {
                self.orphan(instance).await;
                Err(e)
            }
        }
    }

    async fn teardown(&self, instance: Arc<Instance>) -> LifecycleResult<()> {
        match self.orchestrator.stop_single_vm(instance.vm_id()).await {
            Ok(()) => {
                instance.transition(InstanceState::Stopped)?;
                Ok(())
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                self.orphan(instance).await;
                Err(e)
            }
        }
    }

    async fn orphan(&self, instance: Arc<Instance>) {
        let vm_id = instance.vm_id();
        if let Err(e) = instance.transition(InstanceState::Orphaned) {
            tracing::warn!(vm_id = %vm_id, error = %e, "Unexpected state while orphaning");
        }
        tracing::error!(vm_id = %vm_id, image = %instance.image(), "Instance orphaned");

        let parked = {
            let mut pools = self.pools();
            if pools.closed {
                false
            } else {
                pools.orphaned.insert(vm_id, Arc::clone(&instance));
                true
            }
        };
        if parked {
            return;
        }

        // Shutdown has already drained the orphan set.
        match self.orchestrator.stop_single_vm(vm_id).await {
            Ok(()) => {
                if let Err(e) = instance.transition(InstanceState::Stopped) {
                    tracing::warn!(vm_id = %vm_id, error = %e, "Unexpected orphan state");
                }
            }
            Err(e) => {
                tracing::error!(vm_id = %vm_id, error = %e, "Failed to tear down instance orphaned after shutdown")
            }
        }
    }

    /// An offload that finished after `shutdown` drained the idle pool.
    async fn release_late(&self, instance: Arc<Instance>) -> LifecycleResult<()> {
        let vm_id = instance.vm_id();
        tracing::warn!(vm_id = %vm_id, "Offload finished after shutdown, releasing instance");
        self.orchestrator.release_offloaded(vm_id).await?;
        instance.transition(InstanceState::Stopped)?;
        Ok(())
    }

    pub fn is_active(&self, container_id: &ContainerId) -> bool {
        self.pools().active.contains_key(container_id)
    }

    /// Instance registered under `container_id`, if any.
    pub fn get(&self, container_id: &ContainerId) -> Option<Arc<Instance>> {
        self.pools().active.get(container_id).cloned()
    }

    pub fn active_count(&self) -> usize {
        self.pools().active.len()
    }

    pub fn idle_count(&self, image: &ImageName) -> usize {
        self.pools().idle.get(image).map_or(0, VecDeque::len)
    }

    pub fn idle_total(&self) -> usize {
        self.pools().idle.values().map(VecDeque::len).sum()
    }

    /// VMs whose offload or teardown failed midway, in ID order.
    pub fn orphans(&self) -> Vec<VmId> {
        let mut ids: Vec<VmId> = self.pools().orphaned.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Retry permanent teardown of every orphaned VM.
    pub async fn reconcile_orphans(&self) -> ReconcileReport {
        let orphans: Vec<Arc<Instance>> = self.pools().orphaned.drain().map(|(_, i)| i).collect();
        if orphans.is_empty() {
            return ReconcileReport::default();
        }

        tracing::info!(count = orphans.len(), "Reconciling orphaned instances");

        let outcomes = join_all(orphans.into_iter().map(|instance| async move {
            let result = self.orchestrator.stop_single_vm(instance.vm_id()).await;
            (instance, result)
        }))
        .await;

        let mut report = ReconcileReport::default();
        for (instance, result) in outcomes {
            let vm_id = instance.vm_id();
            match result {
                Ok(()) => {
                    if let Err(e) = instance.transition(InstanceState::Stopped) {
                        tracing::warn!(vm_id = %vm_id, error = %e, "Unexpected orphan state");
                    }
                    report.reclaimed.push(vm_id);
                }
                Err(e) => {
                    tracing::warn!(vm_id = %vm_id, error = %e, "Orphan still not reclaimed");
                    report.failed.push(vm_id);
                    self.pools().orphaned.insert(vm_id, instance);
                }
            }
        }
        report.reclaimed.sort();
        report.failed.sort();
        report
    }

    /// Tear down every tracked instance concurrently, then release the
    /// control-plane connections, network devices and snapshot directory.
    pub async fn shutdown(&self) -> LifecycleResult<ShutdownReport> {
        let (running, idle) = {
            let mut pools = self.pools();
            pools.closed = true;
            pools.active_vms.clear();
            let mut running: Vec<Arc<Instance>> = pools.active.drain().map(|(_, i)| i).collect();
            running.extend(pools.orphaned.drain().map(|(_, i)| i));
            let idle: Vec<Arc<Instance>> = pools.idle.drain().flat_map(|(_, q)| q).collect();
            (running, idle)
        };

        tracing::info!(running = running.len(), idle = idle.len(), "Shutting down");

        let stops = join_all(running.iter().map(|instance| async move {
            let vm_id = instance.vm_id();
            self.orchestrator
                .stop_single_vm(vm_id)
                .await
                .map_err(|e| (vm_id, e))
        }));
        let releases = join_all(idle.iter().map(|instance| async move {
            let vm_id = instance.vm_id();
            self.orchestrator
                .release_offloaded(vm_id)
                .await
                .map_err(|e| (vm_id, e))
        }));
        let (stops, releases) = futures::join!(stops, releases);

        let mut report = ShutdownReport::default();
        for result in stops {
            match result {
                Ok(()) => report.stopped += 1,
                Err((vm_id, e)) => {
                    tracing::error!(vm_id = %vm_id, error = %e, "Failed to stop VM during shutdown");
                    report.failed.push(vm_id);
                }
            }
        }
        for result in releases {
            match result {
                Ok(()) => report.released += 1,
                Err((vm_id, e)) => {
                    tracing::error!(vm_id = %vm_id, error = %e, "Failed to release VM during shutdown");
                    report.failed.push(vm_id);
                }
            }
        }
        report.failed.sort();

        self.orchestrator.close().await;
        self.orchestrator.cleanup().await?;

        tracing::info!(
            stopped = report.stopped,
            released = report.released,
            failed = report.failed.len(),
            "Shutdown complete"
        );
        Ok(report)
    }
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let pools = self.pools();
        f.debug_struct("Coordinator")
            .field("active", &pools.active.len())
            .field("idle", &pools.idle.values().map(VecDeque::len).sum::<usize>())
            .field("orphaned", &pools.orphaned.len())
            .finish()
    }
}
