// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Boundary to the virtualization / container-runtime control plane.
//!
//! The control plane issues VM primitives (create, stop, pause, resume,
//! snapshot) for a single VM identified by its [`VmId`], and container-level
//! primitives (image pull, container and task management). Calls may fail or
//! hang; no retries happen at this layer. Deadlines and rollback are the
//! orchestrator's job.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::error::ControlPlaneError;
use crate::log_sink::WorkloadLog;
use crate::types::VmId;

/// Runtime name containers are bound to.
pub const FIRECRACKER_RUNTIME: &str = "aws.firecracker";

/// Fixed guest sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineConfig {
    pub vcpu_count: u32,
    pub mem_size_mib: u32,
}

/// Static network configuration for one guest interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticNetworkConfig {
    pub mac_address: String,
    pub host_dev_name: String,
    /// Primary address with prefix, e.g. `172.16.0.2/30`.
    pub primary_addr: String,
    pub gateway_addr: Ipv4Addr,
    pub nameservers: Vec<Ipv4Addr>,
}

/// Restore-from-snapshot parameters attached to a create request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRestoreConfig {
    pub mem_file_path: PathBuf,
    pub snapshot_path: PathBuf,
    pub enable_diff_snapshots: bool,
    pub resume_vm: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateVmRequest {
    pub vm_id: VmId,
    pub timeout_secs: u32,
    pub kernel_args: String,
    pub machine: MachineConfig,
    pub network_interfaces: Vec<StaticNetworkConfig>,
    /// Present when the VM is recreated from snapshot artifacts.
    pub snapshot: Option<SnapshotRestoreConfig>,
}

impl CreateVmRequest {
    pub fn is_restore(&self) -> bool {
        self.snapshot.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateSnapshotRequest {
    pub vm_id: VmId,
    pub mem_file_path: PathBuf,
    pub snapshot_file_path: PathBuf,
}

/// Image pull parameters; the image is unpacked into `snapshotter`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    pub reference: String,
    pub snapshotter: String,
    /// Pull over plain HTTP instead of the default resolver.
    pub plain_http: bool,
}

/// Resolved, unpacked image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageHandle {
    pub reference: String,
    pub digest: Option<String>,
}

/// Container bound to a VM, with a fresh filesystem snapshot of `image`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub vm_id: VmId,
    pub image: ImageHandle,
    pub snapshotter: String,
    pub env: Vec<String>,
    pub runtime: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContainerHandle {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskHandle {
    pub container_id: String,
    pub pid: u32,
}

/// Exit status of a guest task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitStatus {
    pub code: u32,
}

/// Completion channel signalled once when the guest task exits.
pub type TaskExit = oneshot::Receiver<ExitStatus>;

/// VM and container primitives.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn create_vm(&self, request: CreateVmRequest) -> Result<(), ControlPlaneError>;

    async fn stop_vm(&self, vm_id: VmId) -> Result<(), ControlPlaneError>;

    async fn pause_vm(&self, vm_id: VmId) -> Result<(), ControlPlaneError>;

    async fn resume_vm(&self, vm_id: VmId) -> Result<(), ControlPlaneError>;

    /// Persist guest memory and machine state to the two files in `request`.
    async fn create_snapshot(&self, request: CreateSnapshotRequest) -> Result<(), ControlPlaneError>;

    async fn pull_image(&self, request: PullRequest) -> Result<ImageHandle, ControlPlaneError>;

    async fn create_container(&self, spec: ContainerSpec) -> Result<ContainerHandle, ControlPlaneError>;

    /// Delete a container together with its filesystem snapshot.
    async fn delete_container(&self, container: &ContainerHandle) -> Result<(), ControlPlaneError>;

    /// Create the guest task; its stdout and stderr are written to `log`.
    async fn create_task(
        &self,
        container: &ContainerHandle,
        log: Arc<WorkloadLog>,
    ) -> Result<TaskHandle, ControlPlaneError>;

    async fn wait_task(&self, task: &TaskHandle) -> Result<TaskExit, ControlPlaneError>;

    async fn start_task(&self, task: &TaskHandle) -> Result<(), ControlPlaneError>;

    async fn kill_task(&self, task: &TaskHandle, signal: Signal) -> Result<(), ControlPlaneError>;

    async fn delete_task(&self, task: &TaskHandle) -> Result<(), ControlPlaneError>;

    /// Release client connections. Called once at shutdown.
    async fn close(&self);
}
