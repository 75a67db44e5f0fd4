// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Guest workload output forwarding.
//!
//! Task stdout/stderr is split into lines and re-emitted through `tracing`
//! with the VM ID attached, so guest output lands in the host log stream.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::types::VmId;

/// Log sink for a single VM's guest task.
#[derive(Debug)]
pub struct WorkloadLog {
    vm_id: VmId,
    lines: AtomicU64,
}

impl WorkloadLog {
    pub fn new(vm_id: VmId) -> Self {
        Self {
            vm_id,
            lines: AtomicU64::new(0),
        }
    }

    pub fn vm_id(&self) -> VmId {
        self.vm_id
    }

    /// Forward a chunk of guest output. Returns the number of bytes consumed,
    /// which is always the full chunk.
    pub fn write_chunk(&self, chunk: &[u8]) -> usize {
        let text = String::from_utf8_lossy(chunk);
        for line in text.lines() {
            tracing::info!(target: "workload", vm_id = %self.vm_id, "{}", line);
            self.lines.fetch_add(1, Ordering::Relaxed);
        }
        chunk.len()
    }

    /// Total number of lines forwarded so far.
    pub fn lines_forwarded(&self) -> u64 {
        self.lines.load(Ordering::Relaxed)
    }
}

impl std::io::Write for &WorkloadLog {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        Ok(self.write_chunk(buf))
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
