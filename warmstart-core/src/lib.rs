// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Warmstart Core Library
//!
//! Control plane for serverless microVM instances. Provides the lifecycle
//! coordinator (active set and idle pool), the instance orchestrator (cold
//! boot, teardown, snapshot, offload and restore with rollback), configuration
//! parsing, and the collaborator boundaries for the virtualization control
//! plane and per-VM network resources.

pub mod config;
pub mod control_plane;
pub mod coordinator;
pub mod error;
pub mod image;
pub mod instance;
pub mod log_sink;
pub mod metrics;
pub mod network;
pub mod orchestrator;
pub mod rollback;
pub mod sim;
pub mod state;
pub mod types;

// Re-export commonly used types
pub use config::{Config, ConfigLoader, OrchestratorConfig, Timeouts};
pub use control_plane::ControlPlane;
pub use coordinator::{Coordinator, StartOutcome, StartPath};
pub use error::{
    ControlPlaneError, HardValidationError, LifecycleError, LifecycleResult, ResourcePoolError,
};
pub use instance::Instance;
pub use network::{AddressPool, ResourcePool};
pub use orchestrator::Orchestrator;
pub use state::{InstanceState, InstanceStateMachine};
pub use types::{ContainerId, ImageName, VmId};
