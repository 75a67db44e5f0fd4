// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Instance record: one VM bound to one function image.

use std::future::Future;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::OnceCell;

use crate::error::{ControlPlaneError, StateTransitionError};
use crate::log_sink::WorkloadLog;
use crate::state::{InstanceState, InstanceStateMachine};
use crate::types::{ImageName, VmId};

/// A VM instance tracked by the coordinator.
///
/// Records move between the coordinator's active set, idle pool and orphan
/// set; they are never referenced from two collections at once. The only
/// interior mutability is the lifecycle state and the one-shot snapshot guard.
#[derive(Debug)]
pub struct Instance {
    vm_id: VmId,
    image: ImageName,
    guest_address: Ipv4Addr,
    log: Arc<WorkloadLog>,
    /// Outcome of the first snapshot attempt, shared with every later caller.
    snapshot: OnceCell<Result<(), ControlPlaneError>>,
    lifecycle: Mutex<InstanceStateMachine>,
}

impl Instance {
    pub fn new(
        vm_id: VmId,
        image: ImageName,
        guest_address: Ipv4Addr,
        log: Arc<WorkloadLog>,
        initial: InstanceState,
    ) -> Self {
        Self {
            vm_id,
            image,
            guest_address,
            log,
            snapshot: OnceCell::new(),
            lifecycle: Mutex::new(InstanceStateMachine::new(vm_id, initial)),
        }
    }

    pub fn vm_id(&self) -> VmId {
        self.vm_id
    }

    pub fn image(&self) -> &ImageName {
        &self.image
    }

    pub fn guest_address(&self) -> Ipv4Addr {
        self.guest_address
    }

    pub fn log(&self) -> &Arc<WorkloadLog> {
        &self.log
    }

    pub fn state(&self) -> InstanceState {
        self.lifecycle().state()
    }

    pub(crate) fn transition(&self, target: InstanceState) -> Result<(), StateTransitionError> {
        self.lifecycle().transition_to(target)
    }

    /// Whether a snapshot was captured successfully.
    pub fn has_snapshot(&self) -> bool {
        matches!(self.snapshot.get(), Some(Ok(())))
    }

    /// Whether a snapshot attempt has completed, successfully or not.
    pub fn snapshot_attempted(&self) -> bool {
        self.snapshot.initialized()
    }

    /// Run `capture` at most once for this instance.
    ///
    /// Concurrent callers wait for the first attempt; every caller, now or
    /// later, observes that attempt's outcome.
    pub(crate) async fn snapshot_once<F, Fut>(&self, capture: F) -> Result<(), ControlPlaneError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), ControlPlaneError>>,
    {
        self.snapshot.get_or_init(capture).await.clone()
    }

    fn lifecycle(&self) -> MutexGuard<'_, InstanceStateMachine> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
