// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Instance orchestrator.
//!
//! Drives the control plane through the multi-step VM sequences: cold boot,
//! teardown, pause/resume, snapshot, offload and restore. Every sequence is
//! bounded by a deadline and multi-step sequences roll back what they already
//! created when a later step fails.

mod boot;
mod snapshot;

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;

use crate::config::OrchestratorConfig;
use crate::control_plane::{
    ContainerHandle, ControlPlane, CreateVmRequest, SnapshotRestoreConfig, StaticNetworkConfig,
    TaskExit, TaskHandle,
};
use crate::error::{LifecycleError, LifecycleResult, ResourcePoolError};
use crate::image::ImageCache;
use crate::log_sink::WorkloadLog;
use crate::metrics::OperationMetric;
use crate::network::{ResourcePool, VmNetwork};
use crate::types::VmId;

/// File name of the guest memory image inside a VM's snapshot directory.
pub const MEMORY_FILE: &str = "mem_file";
/// File name of the machine-state snapshot inside a VM's snapshot directory.
pub const SNAPSHOT_FILE: &str = "snap_file";

/// Result of a successful cold boot or restore.
#[derive(Debug, Clone)]
pub struct StartVmResponse {
    pub guest_ip: Ipv4Addr,
    pub log: Arc<WorkloadLog>,
    pub metric: OperationMetric,
}

/// Container-runtime handles kept for a VM from cold boot until teardown.
#[derive(Debug)]
struct GuestHandles {
    container: ContainerHandle,
    task: TaskHandle,
    /// Consumed by the first teardown that waits on it.
    exit: Option<TaskExit>,
    log: Arc<WorkloadLog>,
    task_deleted: bool,
    container_deleted: bool,
}

/// Orchestrates VM lifecycle operations against the control plane.
pub struct Orchestrator {
    control: Arc<dyn ControlPlane>,
    pool: Arc<dyn ResourcePool>,
    images: ImageCache,
    guests: DashMap<VmId, GuestHandles>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    /// Create an orchestrator and its snapshot directory.
    pub fn new(
        control: Arc<dyn ControlPlane>,
        pool: Arc<dyn ResourcePool>,
        config: OrchestratorConfig,
    ) -> LifecycleResult<Self> {
        std::fs::create_dir_all(&config.snapshot_dir).map_err(|e| LifecycleError::Io {
            context: "Failed to create snapshot directory",
            source: e,
        })?;

        tracing::info!(
            snapshots_enabled = config.snapshots_enabled,
            snapshot_dir = %config.snapshot_dir.display(),
            snapshotter = %config.snapshotter,
            "Orchestrator initialized"
        );

        Ok(Self {
            control,
            pool,
            images: ImageCache::new(),
            guests: DashMap::new(),
            config,
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn snapshots_enabled(&self) -> bool {
        self.config.snapshots_enabled
    }

    pub fn images(&self) -> &ImageCache {
        &self.images
    }

    /// Directory holding the snapshot artifacts of one VM.
    pub fn vm_base_dir(&self, vm_id: VmId) -> PathBuf {
        self.config.snapshot_dir.join(vm_id.to_string())
    }

    pub fn memory_file(&self, vm_id: VmId) -> PathBuf {
        self.vm_base_dir(vm_id).join(MEMORY_FILE)
    }

    pub fn snapshot_file(&self, vm_id: VmId) -> PathBuf {
        self.vm_base_dir(vm_id).join(SNAPSHOT_FILE)
    }

    /// Whether the orchestrator holds container handles for `vm_id`.
    pub fn is_tracked(&self, vm_id: VmId) -> bool {
        self.guests.contains_key(&vm_id)
    }

    /// VMs the orchestrator holds container handles for, in ID order.
    pub fn tracked_vms(&self) -> Vec<VmId> {
        let mut ids: Vec<VmId> = self.guests.iter().map(|e| *e.key()).collect();
        ids.sort();
        ids
    }

    /// Release control-plane client connections.
    pub async fn close(&self) {
        tracing::info!("Closing control plane connections");
        self.control.close().await;
    }

    /// Remove every network device and the snapshot directory.
    pub async fn cleanup(&self) -> LifecycleResult<()> {
        tracing::info!(snapshot_dir = %self.config.snapshot_dir.display(), "Cleaning up");
        self.pool.remove_bridges().await;

        match tokio::fs::remove_dir_all(&self.config.snapshot_dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(LifecycleError::Io {
                context: "Failed to remove snapshot directory",
                source: e,
            }),
        }
    }

    /// Best-effort removal of a VM's snapshot directory.
    async fn remove_base_dir(&self, vm_id: VmId) {
        match tokio::fs::remove_dir_all(self.vm_base_dir(vm_id)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(vm_id = %vm_id, error = %e, "Failed to remove VM snapshot directory")
            }
        }
    }

    /// Nameservers handed to guests: the cluster DNS service first, then the
    /// configured fallbacks.
    pub async fn nameservers(&self) -> Vec<Ipv4Addr> {
        let mut servers = Vec::with_capacity(self.config.dns.fallback.len() + 1);
        if self.config.dns.cluster_lookup {
            match lookup_cluster_dns().await {
                Some(addr) => servers.push(addr),
                None => tracing::warn!("Cluster DNS lookup failed, using fallback nameservers"),
            }
        }
        for addr in &self.config.dns.fallback {
            if !servers.contains(addr) {
                servers.push(*addr);
            }
        }
        servers
    }

    async fn create_vm_request(
        &self,
        vm_id: VmId,
        network: &VmNetwork,
        snapshot: Option<SnapshotRestoreConfig>,
    ) -> CreateVmRequest {
        CreateVmRequest {
            vm_id,
            timeout_secs: self.config.vm_create_timeout_secs,
            kernel_args: self.config.kernel_args.clone(),
            machine: self.config.machine,
            network_interfaces: vec![StaticNetworkConfig {
                mac_address: network.mac_address.clone(),
                host_dev_name: network.host_dev_name.clone(),
                primary_addr: network.primary_cidr(),
                gateway_addr: network.gateway_address,
                nameservers: self.nameservers().await,
            }],
            snapshot,
        }
    }

    fn allocated_network(&self, vm_id: VmId) -> LifecycleResult<VmNetwork> {
        self.pool
            .network(vm_id)
            .ok_or_else(|| inconsistent(vm_id, "no network allocated"))
    }

    fn guest_log(&self, vm_id: VmId) -> LifecycleResult<Arc<WorkloadLog>> {
        self.guests
            .get(&vm_id)
            .map(|g| Arc::clone(&g.log))
            .ok_or_else(|| inconsistent(vm_id, "no container handles"))
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("guests", &self.guests.len())
            .field("images", &self.images.len())
            .field("config", &self.config)
            .finish()
    }
}

pub(crate) fn inconsistent(vm_id: VmId, reason: impl Into<String>) -> LifecycleError {
    LifecycleError::InternalConsistency {
        vm_id,
        reason: reason.into(),
    }
}

/// A second allocation for the same VM means the ID was reused.
fn pool_error(vm_id: VmId, err: ResourcePoolError) -> LifecycleError {
    match err {
        ResourcePoolError::AlreadyAllocated { .. } => {
            inconsistent(vm_id, "network already allocated for a new VM")
        }
        other => other.into(),
    }
}

/// Ask kubectl for the ClusterIP of the kube-dns service.
async fn lookup_cluster_dns() -> Option<Ipv4Addr> {
    let output = tokio::process::Command::new("kubectl")
        .args([
            "get",
            "service",
            "-n",
            "kube-system",
            "kube-dns",
            "-o=custom-columns=:.spec.clusterIP",
            "--no-headers",
        ])
        .output()
        .await
        .map_err(|e| tracing::debug!(error = %e, "kubectl not available"))
        .ok()?;

    if !output.status.success() {
        return None;
    }

    String::from_utf8_lossy(&output.stdout).trim().parse().ok()
}
