// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Pause/resume, snapshot, offload and restore.

use std::time::Instant;

use super::{inconsistent, pool_error, Orchestrator, StartVmResponse};
use crate::control_plane::{CreateSnapshotRequest, SnapshotRestoreConfig};
use crate::error::{ControlPlaneError, LifecycleError, LifecycleResult};
use crate::instance::Instance;
use crate::metrics::{OperationMetric, Stage};
use crate::types::VmId;

impl Orchestrator {
    pub async fn pause_vm(&self, vm_id: VmId) -> LifecycleResult<()> {
        tracing::debug!(vm_id = %vm_id, "Pausing VM");
        self.control.pause_vm(vm_id).await.map_err(|e| {
            tracing::error!(vm_id = %vm_id, error = %e, "Failed to pause VM");
            e.into()
        })
    }

    pub async fn resume_vm(&self, vm_id: VmId) -> LifecycleResult<OperationMetric> {
        tracing::debug!(vm_id = %vm_id, "Resuming VM");
        let mut metric = OperationMetric::new();
        let started = Instant::now();
        self.control.resume_vm(vm_id).await.map_err(|e| {
            tracing::error!(vm_id = %vm_id, error = %e, "Failed to resume VM");
            LifecycleError::from(e)
        })?;
        metric.record(Stage::Resume, started);
        Ok(metric)
    }

    /// Pause the VM and persist its memory and machine state.
    ///
    /// Runs at most once per instance. Concurrent and later callers get the
    /// outcome of the first attempt, successful or not.
    pub async fn create_snapshot(&self, instance: &Instance) -> LifecycleResult<()> {
        let vm_id = instance.vm_id();
        let deadline = self.config.timeouts.snapshot;

        instance
            .snapshot_once(|| async move {
                tracing::info!(vm_id = %vm_id, "Creating snapshot");
                tokio::time::timeout(deadline, self.pause_and_capture(vm_id))
                    .await
                    .unwrap_or_else(|_| {
                        Err(ControlPlaneError::timeout("CreateSnapshot", vm_id, deadline))
                    })
            })
            .await
            .map_err(|source| {
                tracing::error!(vm_id = %vm_id, error = %source, "Snapshot failed");
                LifecycleError::Snapshot { vm_id, source }
            })
    }

    async fn pause_and_capture(&self, vm_id: VmId) -> Result<(), ControlPlaneError> {
        self.control.pause_vm(vm_id).await?;
        self.control
            .create_snapshot(CreateSnapshotRequest {
                vm_id,
                mem_file_path: self.memory_file(vm_id),
                snapshot_file_path: self.snapshot_file(vm_id),
            })
            .await
    }

    /// Snapshot the VM, stop it and recreate its tap device so the network
    /// identity is ready for a later restore.
    pub async fn offload(&self, instance: &Instance) -> LifecycleResult<()> {
        let vm_id = instance.vm_id();
        if !self.is_tracked(vm_id) {
            return Err(inconsistent(vm_id, "Offload: no container handles"));
        }

        tracing::info!(vm_id = %vm_id, image = %instance.image(), "Offloading VM");
        self.create_snapshot(instance).await?;

        self.control.stop_vm(vm_id).await.map_err(|e| {
            tracing::error!(vm_id = %vm_id, error = %e, "Failed to stop VM during offload");
            LifecycleError::from(e)
        })?;

        self.pool
            .recreate_network_device(vm_id, &self.config.host_iface)
            .await
            .map_err(|e| {
                tracing::error!(vm_id = %vm_id, error = %e, "Failed to recreate tap device");
                pool_error(vm_id, e)
            })?;

        tracing::info!(vm_id = %vm_id, "VM offloaded");
        Ok(())
    }

    /// Recreate an offloaded VM from its snapshot artifacts, reusing its
    /// network identity. The VM resumes as part of the restore.
    pub async fn start_vm_from_snapshot(&self, vm_id: VmId) -> LifecycleResult<StartVmResponse> {
        let mem_file_path = self.memory_file(vm_id);
        let snapshot_path = self.snapshot_file(vm_id);
        for path in [&mem_file_path, &snapshot_path] {
            let present = tokio::fs::try_exists(path).await.unwrap_or(false);
            if !present {
                tracing::error!(vm_id = %vm_id, path = %path.display(), "Snapshot artifact missing");
                return Err(LifecycleError::MissingArtifact {
                    vm_id,
                    path: path.clone(),
                });
            }
        }

        let log = self.guest_log(vm_id)?;
        let network = self.allocated_network(vm_id)?;

        tracing::info!(vm_id = %vm_id, "Restoring VM from snapshot");

        let request = self
            .create_vm_request(
                vm_id,
                &network,
                Some(SnapshotRestoreConfig {
                    mem_file_path,
                    snapshot_path,
                    enable_diff_snapshots: false,
                    resume_vm: true,
                }),
            )
            .await;

        let mut metric = OperationMetric::new();
        let deadline = self.config.timeouts.restore;
        let started = Instant::now();
        let outcome = tokio::time::timeout(deadline, self.control.create_vm(request))
            .await
            .unwrap_or_else(|_| Err(ControlPlaneError::timeout("LoadSnapshot", vm_id, deadline)));

        if let Err(e) = outcome {
            tracing::error!(vm_id = %vm_id, error = %e, "Restore failed");
            if let Err(stop_err) = self.control.stop_vm(vm_id).await {
                tracing::warn!(vm_id = %vm_id, error = %stop_err, "Failed to stop VM after failed restore");
            }
            return Err(e.into());
        }
        metric.record(Stage::CreateVm, started);

        tracing::info!(
            vm_id = %vm_id,
            guest_ip = %network.primary_address,
            restore_us = metric.total().as_micros() as u64,
            "VM restored"
        );

        Ok(StartVmResponse {
            guest_ip: network.primary_address,
            log,
            metric,
        })
    }

    /// Release everything still held for an offloaded VM: its task and
    /// container, network identity and snapshot artifacts. The VM itself is
    /// already stopped.
    ///
    /// If the task or container cannot be deleted the handles are kept, so a
    /// later [`Orchestrator::stop_single_vm`] can finish the job.
    pub async fn release_offloaded(&self, vm_id: VmId) -> LifecycleResult<()> {
        tracing::debug!(vm_id = %vm_id, "Releasing offloaded VM");

        if let Some((_, mut guest)) = self.guests.remove(&vm_id) {
            let deadline = self.config.timeouts.teardown;
            let deleted = tokio::time::timeout(deadline, self.delete_guest(vm_id, &mut guest))
                .await
                .unwrap_or_else(|_| Err(ControlPlaneError::timeout("ReleaseVM", vm_id, deadline).into()));

            if let Err(e) = deleted {
                tracing::error!(vm_id = %vm_id, error = %e, "Failed to delete container of offloaded VM");
                self.guests.insert(vm_id, guest);
                return Err(e);
            }
        }

        self.pool.free(vm_id).await?;
        self.remove_base_dir(vm_id).await;
        Ok(())
    }
}
