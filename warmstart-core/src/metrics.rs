// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Timed stages of the start, restore and resume paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    GetImage,
    CreateVm,
    NewContainer,
    NewTask,
    TaskWait,
    TaskStart,
    Resume,
}

impl Stage {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::GetImage => "get-image",
            Self::CreateVm => "create-vm",
            Self::NewContainer => "new-container",
            Self::NewTask => "new-task",
            Self::TaskWait => "task-wait",
            Self::TaskStart => "task-start",
            Self::Resume => "resume",
        }
    }
}

/// Per-stage latencies of one orchestrator operation, in microseconds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationMetric {
    pub stages_us: BTreeMap<Stage, u64>,
}

impl OperationMetric {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the time elapsed since `started` for `stage`.
    pub fn record(&mut self, stage: Stage, started: Instant) {
        self.record_duration(stage, started.elapsed());
    }

    pub fn record_duration(&mut self, stage: Stage, elapsed: Duration) {
        self.stages_us.insert(stage, elapsed.as_micros() as u64);
    }

    pub fn get(&self, stage: Stage) -> Option<Duration> {
        self.stages_us.get(&stage).map(|us| Duration::from_micros(*us))
    }

    pub fn total(&self) -> Duration {
        Duration::from_micros(self.stages_us.values().sum())
    }
}
