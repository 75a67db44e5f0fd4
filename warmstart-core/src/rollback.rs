// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Compensating actions for multi-step sequences.
//!
//! Each forward step that succeeds pushes its undo action. On failure the
//! actions run in reverse order; their own errors are logged and swallowed so
//! the failing step's error reaches the caller unchanged. On success the stack is
//! disarmed and nothing runs.

use std::fmt::Display;
use std::future::Future;

use futures::future::BoxFuture;
use futures::FutureExt;

use crate::types::VmId;

struct UndoStep {
    name: &'static str,
    action: BoxFuture<'static, Result<(), String>>,
}

/// Ordered stack of undo actions for one VM.
#[must_use = "a rollback must be either unwound or disarmed"]
pub struct Rollback {
    vm_id: VmId,
    steps: Vec<UndoStep>,
}

impl Rollback {
    pub fn new(vm_id: VmId) -> Self {
        Self {
            vm_id,
            steps: Vec::new(),
        }
    }

    /// Register the undo action for a step that just succeeded.
    /// The future is not polled until [`Rollback::unwind`].
    pub fn push<F, E>(&mut self, name: &'static str, action: F)
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: Display,
    {
        self.steps.push(UndoStep {
            name,
            action: action.map(|r| r.map_err(|e| e.to_string())).boxed(),
        });
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Run all registered undo actions, most recent first.
    pub async fn unwind(self) {
        let vm_id = self.vm_id;
        for step in self.steps.into_iter().rev() {
            tracing::debug!(vm_id = %vm_id, step = step.name, "Rolling back");
            if let Err(reason) = step.action.await {
                tracing::warn!(
                    vm_id = %vm_id,
                    step = step.name,
                    error = %reason,
                    "Rollback step failed"
                );
            }
        }
    }

    /// Drop all undo actions without running them.
    pub fn disarm(self) {
        drop(self.steps);
    }
}
