// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Custom error types for warmstart.
//!
//! This module defines explicit enum error types as per coding guidelines.
//! No `Box<dyn Error>`, no `anyhow::Result` - all errors are strongly typed.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::types::{ContainerId, VmId};

/// Top-level error type for the lifecycle coordinator and orchestrator.
#[derive(Debug, Error)]
pub enum LifecycleError {
    // =========================================================================
    // Coordinator Errors
    // =========================================================================
    #[error("Container {container_id} is already registered (vm {vm_id})")]
    DuplicateRegistration {
        container_id: ContainerId,
        vm_id: VmId,
    },

    /// Internal bookkeeping has diverged from the control plane's actual state.
    /// Not recoverable by retrying; must be surfaced to the operator.
    #[error("Internal consistency violation for vm {vm_id}: {reason}")]
    InternalConsistency { vm_id: VmId, reason: String },

    #[error("Invalid state transition: {0}")]
    InvalidStateTransition(#[from] StateTransitionError),

    // =========================================================================
    // Collaborator Errors
    // =========================================================================
    #[error("Control plane error: {0}")]
    ControlPlane(#[from] ControlPlaneError),

    #[error("Resource pool error: {0}")]
    ResourcePool(#[from] ResourcePoolError),

    // =========================================================================
    // Snapshot Errors
    // =========================================================================
    #[error("Snapshot artifact missing for vm {vm_id}: {path}")]
    MissingArtifact { vm_id: VmId, path: PathBuf },

    #[error("Snapshot of vm {vm_id} failed: {source}")]
    Snapshot {
        vm_id: VmId,
        #[source]
        source: ControlPlaneError,
    },

    // =========================================================================
    // Configuration Errors - Fail-Fast on Invalid Config
    // =========================================================================
    #[error("Hard validation error: {0}")]
    HardValidation(#[from] HardValidationError),

    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: PathBuf },

    #[error("Configuration parse error: {message}")]
    ConfigParse { message: String },

    // =========================================================================
    // System Errors
    // =========================================================================
    #[error("IO error: {context} - {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },
}

impl LifecycleError {
    /// Whether this error signals diverged bookkeeping rather than an ordinary failure.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::InternalConsistency { .. })
    }
}

/// Failures reported by the virtualization / container-runtime control plane.
///
/// `Clone` so a single captured outcome can be handed to every waiter of a
/// one-shot operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ControlPlaneError {
    #[error("{operation} failed for vm {vm_id}: {reason}")]
    Call {
        operation: &'static str,
        vm_id: String,
        reason: String,
    },

    #[error("{operation} for vm {vm_id} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        vm_id: String,
        after: Duration,
    },

    #[error("Failed to get/pull image {image}: {reason}")]
    ImagePull { image: String, reason: String },
}

impl ControlPlaneError {
    pub fn call(operation: &'static str, vm_id: impl ToString, reason: impl Into<String>) -> Self {
        Self::Call {
            operation,
            vm_id: vm_id.to_string(),
            reason: reason.into(),
        }
    }

    pub fn timeout(operation: &'static str, vm_id: impl ToString, after: Duration) -> Self {
        Self::Timeout {
            operation,
            vm_id: vm_id.to_string(),
            after,
        }
    }
}

/// Failures of the per-VM network resource pool.
#[derive(Debug, Error)]
pub enum ResourcePoolError {
    #[error("Network resources already allocated for vm {vm_id}")]
    AlreadyAllocated { vm_id: VmId },

    #[error("No network resources allocated for vm {vm_id}")]
    NotAllocated { vm_id: VmId },

    #[error("Address pool exhausted ({capacity} slots in use)")]
    Exhausted { capacity: usize },

    #[error("Network device operation failed for vm {vm_id}: {reason}")]
    Device { vm_id: VmId, reason: String },
}

/// Hard validation errors cause immediate process termination.
/// Used when configuration is invalid and the system cannot safely start.
#[derive(Debug, Error)]
pub enum HardValidationError {
    #[error("Missing required field: {field} in {context}")]
    MissingRequiredField {
        field: &'static str,
        context: String,
    },

    #[error("Invalid field value: {field} = {value} - {reason}")]
    InvalidFieldValue {
        field: &'static str,
        value: String,
        reason: String,
    },
}

/// State transition errors for the instance state machine.
#[derive(Debug, Error)]
pub enum StateTransitionError {
    #[error("Cannot transition from {from} to {to} for vm {vm_id}")]
    InvalidTransition {
        vm_id: VmId,
        from: &'static str,
        to: &'static str,
    },

    #[error("Vm {vm_id} is in terminal state: {state}")]
    TerminalState { vm_id: VmId, state: &'static str },
}

/// Result type alias using LifecycleError.
pub type LifecycleResult<T> = Result<T, LifecycleError>;
