// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Cold boot and permanent teardown.

use std::sync::Arc;
use std::time::Instant;

use dashmap::mapref::entry::Entry;
use nix::sys::signal::Signal;

use super::{inconsistent, pool_error, GuestHandles, Orchestrator, StartVmResponse};
use crate::control_plane::{ContainerSpec, FIRECRACKER_RUNTIME};
use crate::error::{ControlPlaneError, LifecycleError, LifecycleResult};
use crate::log_sink::WorkloadLog;
use crate::metrics::{OperationMetric, Stage};
use crate::rollback::Rollback;
use crate::types::{ImageName, VmId};

impl Orchestrator {
    /// Cold boot a VM running `image`.
    ///
    /// Allocates the network, pulls the image, creates the VM, its container
    /// and task, and starts the task. Any failure, including the overall
    /// deadline, undoes the completed steps in reverse order before the
    /// error is returned.
    pub async fn start_vm(
        &self,
        vm_id: VmId,
        image: &ImageName,
        env: &[String],
    ) -> LifecycleResult<StartVmResponse> {
        tracing::info!(vm_id = %vm_id, image = %image, "Cold booting VM");

        let deadline = self.config.timeouts.cold_boot;
        let mut rollback = Rollback::new(vm_id);

        let outcome = tokio::time::timeout(
            deadline,
            self.boot_sequence(vm_id, image, env, &mut rollback),
        )
        .await
        .unwrap_or_else(|_| Err(ControlPlaneError::timeout("StartVM", vm_id, deadline).into()));

        match outcome {
            Ok(response) => {
                rollback.disarm();
                tracing::info!(
                    vm_id = %vm_id,
                    image = %image,
                    guest_ip = %response.guest_ip,
                    total_us = response.metric.total().as_micros() as u64,
                    "VM started"
                );
                Ok(response)
            }
            Err(e) => {
                tracing::error!(
                    vm_id = %vm_id,
                    image = %image,
                    error = %e,
                    undo_steps = rollback.len(),
                    "Cold boot failed, rolling back"
                );
                rollback.unwind().await;
                Err(e)
            }
        }
    }

    async fn boot_sequence(
        &self,
        vm_id: VmId,
        image: &ImageName,
        env: &[String],
        rollback: &mut Rollback,
    ) -> LifecycleResult<StartVmResponse> {
        let mut metric = OperationMetric::new();

        let network = self
            .pool
            .allocate(vm_id, &self.config.host_iface)
            .await
            .map_err(|e| pool_error(vm_id, e))?;
        let pool = Arc::clone(&self.pool);
        rollback.push("free network", async move { pool.free(vm_id).await });

        let started = Instant::now();
        let image_handle = self
            .images
            .get_or_pull(self.control.as_ref(), image, &self.config.snapshotter)
            .await
            .map_err(|e| match e {
                pull @ ControlPlaneError::ImagePull { .. } => pull,
                other => ControlPlaneError::ImagePull {
                    image: image.to_string(),
                    reason: other.to_string(),
                },
            })?;
        metric.record(Stage::GetImage, started);

        let started = Instant::now();
        let request = self.create_vm_request(vm_id, &network, None).await;
        self.control.create_vm(request).await?;
        metric.record(Stage::CreateVm, started);
        let control = Arc::clone(&self.control);
        rollback.push("stop vm", async move { control.stop_vm(vm_id).await });

        let started = Instant::now();
        let container = self
            .control
            .create_container(ContainerSpec {
                vm_id,
                image: image_handle,
                snapshotter: self.config.snapshotter.clone(),
                env: env.to_vec(),
                runtime: FIRECRACKER_RUNTIME.to_string(),
            })
            .await?;
        metric.record(Stage::NewContainer, started);
        let control = Arc::clone(&self.control);
        let handle = container.clone();
        rollback.push("delete container", async move {
            control.delete_container(&handle).await
        });

        let started = Instant::now();
        let log = Arc::new(WorkloadLog::new(vm_id));
        let task = self
            .control
            .create_task(&container, Arc::clone(&log))
            .await?;
        metric.record(Stage::NewTask, started);
        let control = Arc::clone(&self.control);
        let handle = task.clone();
        rollback.push("delete task", async move { control.delete_task(&handle).await });

        let started = Instant::now();
        let exit = self.control.wait_task(&task).await?;
        metric.record(Stage::TaskWait, started);
        let control = Arc::clone(&self.control);
        let handle = task.clone();
        rollback.push("kill task", async move {
            control.kill_task(&handle, Signal::SIGKILL).await
        });

        let started = Instant::now();
        self.control.start_task(&task).await?;
        metric.record(Stage::TaskStart, started);

        tokio::fs::create_dir_all(self.vm_base_dir(vm_id))
            .await
            .map_err(|e| LifecycleError::Io {
                context: "Failed to create VM snapshot directory",
                source: e,
            })?;

        match self.guests.entry(vm_id) {
            Entry::Occupied(_) => Err(inconsistent(vm_id, "container handles already recorded")),
            Entry::Vacant(vacant) => {
                vacant.insert(GuestHandles {
                    container,
                    task,
                    exit: Some(exit),
                    log: Arc::clone(&log),
                    task_deleted: false,
                    container_deleted: false,
                });
                Ok(StartVmResponse {
                    guest_ip: network.primary_address,
                    log,
                    metric,
                })
            }
        }
    }

    /// Permanently tear down a VM: kill and delete its task, delete its
    /// container, stop the VM and free its network.
    ///
    /// Also used for VMs that were restored from a snapshot. If a step fails
    /// the handles are kept so the teardown can be retried.
    pub async fn stop_single_vm(&self, vm_id: VmId) -> LifecycleResult<()> {
        let (_, mut guest) = self
            .guests
            .remove(&vm_id)
            .ok_or_else(|| inconsistent(vm_id, "StopVM: no container handles"))?;

        tracing::info!(vm_id = %vm_id, "Stopping VM");

        let deadline = self.config.timeouts.teardown;
        let outcome = tokio::time::timeout(deadline, self.teardown(vm_id, &mut guest))
            .await
            .unwrap_or_else(|_| Err(ControlPlaneError::timeout("StopVM", vm_id, deadline).into()));

        if let Err(e) = outcome {
            tracing::error!(vm_id = %vm_id, error = %e, "Failed to stop VM");
            self.guests.insert(vm_id, guest);
            return Err(e);
        }

        tracing::info!(vm_id = %vm_id, "VM stopped");
        Ok(())
    }

    /// Steps already completed by an earlier attempt are skipped.
    async fn teardown(&self, vm_id: VmId, guest: &mut GuestHandles) -> LifecycleResult<()> {
        self.delete_guest(vm_id, guest).await?;
        self.control.stop_vm(vm_id).await?;
        self.pool.free(vm_id).await?;
        self.remove_base_dir(vm_id).await;
        Ok(())
    }

    /// Kill and delete the guest task, then delete its container.
    pub(super) async fn delete_guest(&self, vm_id: VmId, guest: &mut GuestHandles) -> LifecycleResult<()> {
        if !guest.task_deleted {
            self.control.kill_task(&guest.task, Signal::SIGKILL).await?;

            if let Some(exit) = guest.exit.take() {
                match exit.await {
                    Ok(status) => {
                        tracing::debug!(vm_id = %vm_id, code = status.code, "Task exited")
                    }
                    Err(_) => tracing::debug!(vm_id = %vm_id, "Task exit channel closed"),
                }
            }

            tokio::time::sleep(self.config.timeouts.stop_grace).await;

            self.control.delete_task(&guest.task).await?;
            guest.task_deleted = true;
        }

        if !guest.container_deleted {
            self.control.delete_container(&guest.container).await?;
            guest.container_deleted = true;
        }
        Ok(())
    }
}
