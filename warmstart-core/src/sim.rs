// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! In-process control plane.
//!
//! Keeps VM, container and task state in memory, writes real snapshot files
//! and records every call. Faults and latency can be injected per operation
//! to drive the orchestrator's failure paths. Used by the test suites and by
//! the `simulate` command.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use nix::sys::signal::Signal;
use serde::Serialize;
use tokio::sync::oneshot;

use crate::control_plane::{
    ContainerHandle, ContainerSpec, ControlPlane, CreateSnapshotRequest, CreateVmRequest,
    ExitStatus, ImageHandle, PullRequest, TaskExit, TaskHandle,
};
use crate::error::ControlPlaneError;
use crate::log_sink::WorkloadLog;
use crate::types::VmId;

/// Control-plane primitive, used to target faults and count calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Operation {
    CreateVm,
    RestoreVm,
    StopVm,
    PauseVm,
    ResumeVm,
    CreateSnapshot,
    PullImage,
    CreateContainer,
    DeleteContainer,
    CreateTask,
    WaitTask,
    StartTask,
    KillTask,
    DeleteTask,
}

impl Operation {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::CreateVm => "CreateVM",
            Self::RestoreVm => "LoadSnapshot",
            Self::StopVm => "StopVM",
            Self::PauseVm => "PauseVM",
            Self::ResumeVm => "ResumeVM",
            Self::CreateSnapshot => "CreateSnapshot",
            Self::PullImage => "PullImage",
            Self::CreateContainer => "NewContainer",
            Self::DeleteContainer => "DeleteContainer",
            Self::CreateTask => "NewTask",
            Self::WaitTask => "TaskWait",
            Self::StartTask => "TaskStart",
            Self::KillTask => "TaskKill",
            Self::DeleteTask => "TaskDelete",
        }
    }
}

/// One recorded control-plane call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub operation: Operation,
    /// None for image pulls.
    pub vm_id: Option<VmId>,
}

/// Lifecycle state of a simulated VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SimVmState {
    Running,
    Paused,
    Stopped,
}

#[derive(Debug)]
struct Fault {
    operation: Operation,
    vm_id: Option<VmId>,
    /// None fails every matching call.
    remaining: Option<usize>,
}

#[derive(Debug)]
struct SimTask {
    vm_id: VmId,
    started: bool,
    exit: Option<oneshot::Sender<ExitStatus>>,
    log: Arc<WorkloadLog>,
}

/// Simulated control plane.
#[derive(Debug, Default)]
pub struct SimulatedControlPlane {
    vms: DashMap<VmId, SimVmState>,
    containers: DashMap<String, VmId>,
    tasks: DashMap<String, SimTask>,
    calls: Mutex<Vec<Call>>,
    pulls: Mutex<Vec<PullRequest>>,
    faults: Mutex<Vec<Fault>>,
    latency: DashMap<Operation, Duration>,
    next_pid: AtomicU32,
    closed: AtomicBool,
}

impl SimulatedControlPlane {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every call of `operation`.
    pub fn fail(&self, operation: Operation) {
        self.push_fault(operation, None, None);
    }

    /// Fail every call of `operation` that targets `vm_id`.
    pub fn fail_for(&self, operation: Operation, vm_id: VmId) {
        self.push_fault(operation, Some(vm_id), None);
    }

    /// Fail the next call of `operation` only.
    pub fn fail_once(&self, operation: Operation) {
        self.push_fault(operation, None, Some(1));
    }

    pub fn clear_faults(&self) {
        lock(&self.faults).clear();
    }

    /// Delay every call of `operation` by `delay` before it takes effect.
    pub fn set_latency(&self, operation: Operation, delay: Duration) {
        self.latency.insert(operation, delay);
    }

    pub fn calls(&self) -> Vec<Call> {
        lock(&self.calls).clone()
    }

    pub fn count(&self, operation: Operation) -> usize {
        lock(&self.calls)
            .iter()
            .filter(|c| c.operation == operation)
            .count()
    }

    pub fn count_for(&self, operation: Operation, vm_id: VmId) -> usize {
        lock(&self.calls)
            .iter()
            .filter(|c| c.operation == operation && c.vm_id == Some(vm_id))
            .count()
    }

    pub fn pulls(&self) -> Vec<PullRequest> {
        lock(&self.pulls).clone()
    }

    pub fn vm_state(&self, vm_id: VmId) -> Option<SimVmState> {
        self.vms.get(&vm_id).map(|s| *s)
    }

    /// Number of VMs that are running or paused.
    pub fn live_vms(&self) -> usize {
        self.vms
            .iter()
            .filter(|e| *e.value() != SimVmState::Stopped)
            .count()
    }

    pub fn container_count(&self) -> usize {
        self.containers.len()
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Whether the task bound to `vm_id` has been started.
    pub fn task_started(&self, vm_id: VmId) -> bool {
        self.tasks.iter().any(|t| t.vm_id == vm_id && t.started)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn push_fault(&self, operation: Operation, vm_id: Option<VmId>, remaining: Option<usize>) {
        lock(&self.faults).push(Fault {
            operation,
            vm_id,
            remaining,
        });
    }

    /// Record the call, apply latency and injected faults.
    async fn enter(&self, operation: Operation, vm_id: Option<VmId>) -> Result<(), ControlPlaneError> {
        lock(&self.calls).push(Call { operation, vm_id });

        let delay = self.latency.get(&operation).map(|d| *d);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut faults = lock(&self.faults);
        let hit = faults.iter().position(|f| {
            f.operation == operation && (f.vm_id.is_none() || f.vm_id == vm_id)
        });
        if let Some(index) = hit {
            if let Some(remaining) = faults[index].remaining.as_mut() {
                *remaining -= 1;
                if *remaining == 0 {
                    faults.remove(index);
                }
            }
            return Err(ControlPlaneError::call(
                operation.name(),
                target(vm_id),
                "injected fault",
            ));
        }
        Ok(())
    }

    fn transition(
        &self,
        operation: Operation,
        vm_id: VmId,
        from: &[SimVmState],
        to: SimVmState,
    ) -> Result<(), ControlPlaneError> {
        let mut state = self
            .vms
            .get_mut(&vm_id)
            .ok_or_else(|| ControlPlaneError::call(operation.name(), vm_id, "VM does not exist"))?;
        if !from.contains(&*state) {
            return Err(ControlPlaneError::call(
                operation.name(),
                vm_id,
                format!("VM is {:?}", *state),
            ));
        }
        *state = to;
        Ok(())
    }

    fn task_vm(&self, operation: Operation, task: &TaskHandle) -> Result<VmId, ControlPlaneError> {
        self.tasks
            .get(&task.container_id)
            .map(|t| t.vm_id)
            .ok_or_else(|| {
                ControlPlaneError::call(operation.name(), &task.container_id, "task does not exist")
            })
    }
}

#[async_trait]
impl ControlPlane for SimulatedControlPlane {
    async fn create_vm(&self, request: CreateVmRequest) -> Result<(), ControlPlaneError> {
        let vm_id = request.vm_id;
        let operation = if request.is_restore() {
            Operation::RestoreVm
        } else {
            Operation::CreateVm
        };
        self.enter(operation, Some(vm_id)).await?;

        if let Some(snapshot) = &request.snapshot {
            for path in [&snapshot.mem_file_path, &snapshot.snapshot_path] {
                if !tokio::fs::try_exists(path).await.unwrap_or(false) {
                    return Err(ControlPlaneError::call(
                        operation.name(),
                        vm_id,
                        format!("{} not found", path.display()),
                    ));
                }
            }
        }

        let state = if request.snapshot.as_ref().is_some_and(|s| !s.resume_vm) {
            SimVmState::Paused
        } else {
            SimVmState::Running
        };

        match self.vms.entry(vm_id) {
            Entry::Occupied(existing) if *existing.get() != SimVmState::Stopped => Err(
                ControlPlaneError::call(operation.name(), vm_id, "VM already exists"),
            ),
            Entry::Occupied(mut existing) => {
                existing.insert(state);
                Ok(())
            }
            Entry::Vacant(vacant) => {
                vacant.insert(state);
                Ok(())
            }
        }
    }

    async fn stop_vm(&self, vm_id: VmId) -> Result<(), ControlPlaneError> {
        self.enter(Operation::StopVm, Some(vm_id)).await?;
        self.transition(
            Operation::StopVm,
            vm_id,
            &[SimVmState::Running, SimVmState::Paused, SimVmState::Stopped],
            SimVmState::Stopped,
        )
    }

    async fn pause_vm(&self, vm_id: VmId) -> Result<(), ControlPlaneError> {
        self.enter(Operation::PauseVm, Some(vm_id)).await?;
        self.transition(
            Operation::PauseVm,
            vm_id,
            &[SimVmState::Running],
            SimVmState::Paused,
        )
    }

    async fn resume_vm(&self, vm_id: VmId) -> Result<(), ControlPlaneError> {
        self.enter(Operation::ResumeVm, Some(vm_id)).await?;
        self.transition(
            Operation::ResumeVm,
            vm_id,
            &[SimVmState::Paused],
            SimVmState::Running,
        )
    }

    async fn create_snapshot(&self, request: CreateSnapshotRequest) -> Result<(), ControlPlaneError> {
        let vm_id = request.vm_id;
        self.enter(Operation::CreateSnapshot, Some(vm_id)).await?;

        if self.vm_state(vm_id) != Some(SimVmState::Paused) {
            return Err(ControlPlaneError::call(
                Operation::CreateSnapshot.name(),
                vm_id,
                "VM must be paused",
            ));
        }

        let write = |path: &std::path::Path, contents: String| {
            let path = path.to_path_buf();
            async move {
                tokio::fs::write(&path, contents).await.map_err(|e| {
                    ControlPlaneError::call(Operation::CreateSnapshot.name(), vm_id, e.to_string())
                })
            }
        };
        write(request.mem_file_path.as_path(), format!("memory of vm {}\n", vm_id)).await?;
        write(request.snapshot_file_path.as_path(), format!("state of vm {}\n", vm_id)).await
    }

    async fn pull_image(&self, request: PullRequest) -> Result<ImageHandle, ControlPlaneError> {
        self.enter(Operation::PullImage, None)
            .await
            .map_err(|e| ControlPlaneError::ImagePull {
                image: request.reference.clone(),
                reason: e.to_string(),
            })?;

        let digest = format!("sha256:{:064x}", lock(&self.pulls).len() + 1);
        let handle = ImageHandle {
            reference: request.reference.clone(),
            digest: Some(digest),
        };
        lock(&self.pulls).push(request);
        Ok(handle)
    }

    async fn create_container(&self, spec: ContainerSpec) -> Result<ContainerHandle, ControlPlaneError> {
        let vm_id = spec.vm_id;
        self.enter(Operation::CreateContainer, Some(vm_id)).await?;

        let id = vm_id.to_string();
        if self.containers.contains_key(&id) {
            return Err(ControlPlaneError::call(
                Operation::CreateContainer.name(),
                vm_id,
                "container already exists",
            ));
        }
        self.containers.insert(id.clone(), vm_id);
        Ok(ContainerHandle { id })
    }

    async fn delete_container(&self, container: &ContainerHandle) -> Result<(), ControlPlaneError> {
        let vm_id = self.containers.get(&container.id).map(|v| *v);
        self.enter(Operation::DeleteContainer, vm_id).await?;
        self.containers
            .remove(&container.id)
            .map(|_| ())
            .ok_or_else(|| {
                ControlPlaneError::call(
                    Operation::DeleteContainer.name(),
                    &container.id,
                    "container does not exist",
                )
            })
    }

    async fn create_task(
        &self,
        container: &ContainerHandle,
        log: Arc<WorkloadLog>,
    ) -> Result<TaskHandle, ControlPlaneError> {
        let vm_id = self.containers.get(&container.id).map(|v| *v);
        self.enter(Operation::CreateTask, vm_id).await?;

        let vm_id = vm_id.ok_or_else(|| {
            ControlPlaneError::call(
                Operation::CreateTask.name(),
                &container.id,
                "container does not exist",
            )
        })?;

        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst) + 1000;
        log.write_chunk(format!("task {} created in vm {}\n", pid, vm_id).as_bytes());
        self.tasks.insert(
            container.id.clone(),
            SimTask {
                vm_id,
                started: false,
                exit: None,
                log,
            },
        );
        Ok(TaskHandle {
            container_id: container.id.clone(),
            pid,
        })
    }

    async fn wait_task(&self, task: &TaskHandle) -> Result<TaskExit, ControlPlaneError> {
        let vm_id = self.task_vm(Operation::WaitTask, task)?;
        self.enter(Operation::WaitTask, Some(vm_id)).await?;

        let (tx, rx) = oneshot::channel();
        if let Some(mut entry) = self.tasks.get_mut(&task.container_id) {
            entry.exit = Some(tx);
        }
        Ok(rx)
    }

    async fn start_task(&self, task: &TaskHandle) -> Result<(), ControlPlaneError> {
        let vm_id = self.task_vm(Operation::StartTask, task)?;
        self.enter(Operation::StartTask, Some(vm_id)).await?;

        if let Some(mut entry) = self.tasks.get_mut(&task.container_id) {
            entry.started = true;
            entry.log.write_chunk(b"task started\n");
        }
        Ok(())
    }

    async fn kill_task(&self, task: &TaskHandle, signal: Signal) -> Result<(), ControlPlaneError> {
        let vm_id = self.task_vm(Operation::KillTask, task)?;
        self.enter(Operation::KillTask, Some(vm_id)).await?;

        let exit = self
            .tasks
            .get_mut(&task.container_id)
            .and_then(|mut entry| entry.exit.take());
        if let Some(exit) = exit {
            // 128 + signal number, as a shell reports it
            let _ = exit.send(ExitStatus {
                code: 128 + signal as u32,
            });
        }
        Ok(())
    }

    async fn delete_task(&self, task: &TaskHandle) -> Result<(), ControlPlaneError> {
        let vm_id = self.task_vm(Operation::DeleteTask, task)?;
        self.enter(Operation::DeleteTask, Some(vm_id)).await?;
        self.tasks.remove(&task.container_id);
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

fn target(vm_id: Option<VmId>) -> String {
    vm_id.map(|id| id.to_string()).unwrap_or_else(|| "-".to_string())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control_plane::MachineConfig;

    fn create_request(vm_id: u64) -> CreateVmRequest {
        CreateVmRequest {
            vm_id: VmId::new(vm_id),
            timeout_secs: 100,
            kernel_args: String::new(),
            machine: MachineConfig {
                vcpu_count: 1,
                mem_size_mib: 256,
            },
            network_interfaces: Vec::new(),
            snapshot: None,
        }
    }

    #[tokio::test]
    async fn test_fail_once_clears_after_first_hit() {
        let sim = SimulatedControlPlane::new();
        sim.fail_once(Operation::CreateVm);

        assert!(sim.create_vm(create_request(1)).await.is_err());
        assert!(sim.create_vm(create_request(1)).await.is_ok());
        assert_eq!(sim.count(Operation::CreateVm), 2);
        assert_eq!(sim.vm_state(VmId::new(1)), Some(SimVmState::Running));
    }

    #[tokio::test]
    async fn test_fault_targets_one_vm() {
        let sim = SimulatedControlPlane::new();
        sim.fail_for(Operation::CreateVm, VmId::new(2));

        assert!(sim.create_vm(create_request(1)).await.is_ok());
        assert!(sim.create_vm(create_request(2)).await.is_err());
    }

    #[tokio::test]
    async fn test_snapshot_requires_pause() {
        let dir = tempfile::TempDir::new().unwrap();
        let sim = SimulatedControlPlane::new();
        sim.create_vm(create_request(3)).await.unwrap();

        let request = CreateSnapshotRequest {
            vm_id: VmId::new(3),
            mem_file_path: dir.path().join("mem"),
            snapshot_file_path: dir.path().join("snap"),
        };
        assert!(sim.create_snapshot(request.clone()).await.is_err());

        sim.pause_vm(VmId::new(3)).await.unwrap();
        sim.create_snapshot(request).await.unwrap();
        assert!(dir.path().join("mem").is_file());
        assert!(dir.path().join("snap").is_file());
    }

    #[tokio::test]
    async fn test_kill_signals_exit() {
        let sim = SimulatedControlPlane::new();
        let container = sim
            .create_container(ContainerSpec {
                vm_id: VmId::new(4),
                image: ImageHandle {
                    reference: "docker.io/nginx".to_string(),
                    digest: None,
                },
                snapshotter: "devmapper".to_string(),
                env: Vec::new(),
                runtime: crate::control_plane::FIRECRACKER_RUNTIME.to_string(),
            })
            .await
            .unwrap();
        let log = Arc::new(WorkloadLog::new(VmId::new(4)));
        let task = sim.create_task(&container, Arc::clone(&log)).await.unwrap();
        let exit = sim.wait_task(&task).await.unwrap();
        sim.start_task(&task).await.unwrap();
        assert!(sim.task_started(VmId::new(4)));

        sim.kill_task(&task, Signal::SIGKILL).await.unwrap();
        assert_eq!(exit.await.unwrap().code, 137);
        assert_eq!(log.lines_forwarded(), 2);
    }
}
