// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! System memory probing.
//!
//! The chunker only needs a coarse signal, so memory is reduced to a
//! [`MemorySnapshot`] (total/available bytes) and a three-level
//! [`MemoryPressure`]. The [`MemoryMonitor`] trait lets callers and tests
//! inject fixed values instead of querying the OS.

use serde::Serialize;
use sysinfo::System;

/// Coarse memory pressure signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum MemoryPressure {
    /// More than half of RAM available
    Low,
    /// Between a fifth and a half available
    Medium,
    /// Less than a fifth available
    High,
}

impl MemoryPressure {
    /// Multiplier applied to the base chunk size by the adaptive strategy.
    pub fn chunk_multiplier(self) -> f64 {
        match self {
            MemoryPressure::Low => 1.5,
            MemoryPressure::Medium => 1.0,
            MemoryPressure::High => 0.5,
        }
    }
}

/// Point-in-time view of system memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MemorySnapshot {
    pub total_bytes: u64,
    pub available_bytes: u64,
}

impl MemorySnapshot {
    pub fn pressure(&self) -> MemoryPressure {
        if self.total_bytes == 0 {
            return MemoryPressure::High;
        }
        let ratio = self.available_bytes as f64 / self.total_bytes as f64;
        if ratio > 0.5 {
            MemoryPressure::Low
        } else if ratio > 0.2 {
            MemoryPressure::Medium
        } else {
            MemoryPressure::High
        }
    }
}

/// Source of memory snapshots.
pub trait MemoryMonitor: Send + Sync {
    fn snapshot(&self) -> MemorySnapshot;
}

/// Memory monitor backed by the operating system.
#[derive(Debug, Default)]
pub struct SystemMemoryMonitor;

impl SystemMemoryMonitor {
    pub fn new() -> Self {
        Self
    }
}

impl MemoryMonitor for SystemMemoryMonitor {
    fn snapshot(&self) -> MemorySnapshot {
        let mut system = System::new();
        system.refresh_memory();
        MemorySnapshot {
            total_bytes: system.total_memory(),
            available_bytes: system.available_memory(),
        }
    }
}

/// Monitor that always reports the same values.
#[derive(Debug, Clone, Copy)]
pub struct FixedMemoryMonitor(pub MemorySnapshot);

impl FixedMemoryMonitor {
    pub fn new(total_bytes: u64, available_bytes: u64) -> Self {
        Self(MemorySnapshot {
            total_bytes,
            available_bytes,
        })
    }
}

impl MemoryMonitor for FixedMemoryMonitor {
    fn snapshot(&self) -> MemorySnapshot {
        self.0
    }
}
