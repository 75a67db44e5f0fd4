// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Instance state machine with typed state transitions.
//!
//! Implements the instance lifecycle:
//! Cold → Active → Offloading → Idle → Restoring → Active, with Stopped as the
//! terminal state and Orphaned for instances whose offload, teardown or
//! post-restore release failed midway.
//! Invalid transitions result in StateTransitionError.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::StateTransitionError;
use crate::types::VmId;

/// Instance lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceState {
    /// Cold boot in progress.
    Cold,

    /// Running and registered (or about to be) under a container ID.
    Active,

    /// Pause + snapshot + stop + tap recreation in flight.
    Offloading,

    /// Snapshotted, stopped and network-detached; eligible for the idle pool.
    Idle,

    /// Being recreated from its snapshot artifacts.
    Restoring,

    /// Offload or teardown failed midway; still consuming resources until reconciled.
    Orphaned,

    /// Torn down permanently.
    Stopped,
}

impl InstanceState {
    /// Get the state name for error messages.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Cold => "Cold",
            Self::Active => "Active",
            Self::Offloading => "Offloading",
            Self::Idle => "Idle",
            Self::Restoring => "Restoring",
            Self::Orphaned => "Orphaned",
            Self::Stopped => "Stopped",
        }
    }

    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped)
    }

    /// Check if transition to the target state is valid.
    pub fn can_transition_to(&self, target: InstanceState) -> bool {
        matches!(
            (self, target),
            (Self::Cold, Self::Active) |
            (Self::Cold, Self::Stopped) |
            (Self::Active, Self::Offloading) |
            (Self::Active, Self::Stopped) |
            (Self::Active, Self::Orphaned) |
            (Self::Offloading, Self::Idle) |
            (Self::Offloading, Self::Orphaned) |
            (Self::Idle, Self::Restoring) |
            (Self::Idle, Self::Stopped) |
            // A failed restore consumes the record
            (Self::Restoring, Self::Active) |
            (Self::Restoring, Self::Stopped) |
            (Self::Restoring, Self::Orphaned) |
            (Self::Orphaned, Self::Stopped)
        )
    }
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// State machine for an instance's lifecycle.
/// Enforces valid state transitions and tracks timing.
#[derive(Debug)]
pub struct InstanceStateMachine {
    vm_id: VmId,
    current_state: InstanceState,
    last_transition: Instant,
    transition_count: u64,
}

impl InstanceStateMachine {
    pub fn new(vm_id: VmId, initial: InstanceState) -> Self {
        Self {
            vm_id,
            current_state: initial,
            last_transition: Instant::now(),
            transition_count: 0,
        }
    }

    pub fn state(&self) -> InstanceState {
        self.current_state
    }

    pub fn time_in_current_state(&self) -> Duration {
        self.last_transition.elapsed()
    }

    pub fn transition_count(&self) -> u64 {
        self.transition_count
    }

    /// Attempt to transition to a new state.
    pub fn transition_to(&mut self, target: InstanceState) -> Result<(), StateTransitionError> {
        if self.current_state.is_terminal() {
            return Err(StateTransitionError::TerminalState {
                vm_id: self.vm_id,
                state: self.current_state.name(),
            });
        }

        if !self.current_state.can_transition_to(target) {
            return Err(StateTransitionError::InvalidTransition {
                vm_id: self.vm_id,
                from: self.current_state.name(),
                to: target.name(),
            });
        }

        tracing::debug!(
            vm_id = %self.vm_id,
            from = self.current_state.name(),
            to = target.name(),
            "State transition"
        );

        self.current_state = target;
        self.last_transition = Instant::now();
        self.transition_count += 1;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offload_restore_cycle() {
        let mut sm = InstanceStateMachine::new(VmId::new(1), InstanceState::Cold);

        sm.transition_to(InstanceState::Active).unwrap();
        sm.transition_to(InstanceState::Offloading).unwrap();
        sm.transition_to(InstanceState::Idle).unwrap();
        sm.transition_to(InstanceState::Restoring).unwrap();
        sm.transition_to(InstanceState::Active).unwrap();

        assert_eq!(sm.state(), InstanceState::Active);
        assert_eq!(sm.transition_count(), 5);
    }

    #[test]
    fn test_invalid_transitions() {
        let mut sm = InstanceStateMachine::new(VmId::new(2), InstanceState::Active);

        // Must pass through Offloading first
        assert!(sm.transition_to(InstanceState::Idle).is_err());
        assert!(sm.transition_to(InstanceState::Restoring).is_err());
        assert_eq!(sm.state(), InstanceState::Active);
    }

    #[test]
    fn test_stopped_is_terminal() {
        let mut sm = InstanceStateMachine::new(VmId::new(3), InstanceState::Active);
        sm.transition_to(InstanceState::Stopped).unwrap();

        let err = sm.transition_to(InstanceState::Active).unwrap_err();
        assert!(matches!(err, StateTransitionError::TerminalState { .. }));
    }

    #[test]
    fn test_orphan_transitions() {
        assert!(InstanceState::Offloading.can_transition_to(InstanceState::Orphaned));
        assert!(InstanceState::Active.can_transition_to(InstanceState::Orphaned));
        assert!(InstanceState::Restoring.can_transition_to(InstanceState::Orphaned));
        assert!(!InstanceState::Idle.can_transition_to(InstanceState::Orphaned));
        assert!(InstanceState::Orphaned.can_transition_to(InstanceState::Stopped));
        assert!(!InstanceState::Orphaned.can_transition_to(InstanceState::Idle));
    }
}
