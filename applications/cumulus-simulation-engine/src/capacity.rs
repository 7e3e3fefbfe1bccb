//! Resource capacity vectors
//!
//! Every host, guest, and workload expresses its resources as a
//! [`Capacity`] over four dimensions. All components are unsigned, so a
//! free pool can never go negative by construction; allocation commits
//! use checked arithmetic and fail instead of wrapping.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A resource vector: CPU cores, memory, storage, and network bandwidth.
///
/// Units are scenario-defined (e.g. cores / MB / GB / Mbps); the engine
/// only ever compares and adds them component-wise.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capacity {
    pub cpu: u64,
    pub memory: u64,
    pub storage: u64,
    pub bandwidth: u64,
}

impl Capacity {
    /// Create a capacity vector with all four dimensions.
    pub fn new(cpu: u64, memory: u64, storage: u64, bandwidth: u64) -> Self {
        Capacity { cpu, memory, storage, bandwidth }
    }

    /// CPU-only capacity, the common case in small scenarios.
    pub fn cores(cpu: u64) -> Self {
        Capacity { cpu, ..Capacity::default() }
    }

    /// True when every component of `self` fits within `other`.
    pub fn fits(&self, other: &Capacity) -> bool {
        self.cpu <= other.cpu
            && self.memory <= other.memory
            && self.storage <= other.storage
            && self.bandwidth <= other.bandwidth
    }

    /// Component-wise subtraction; `None` if any component would underflow.
    pub fn checked_sub(&self, other: &Capacity) -> Option<Capacity> {
        Some(Capacity {
            cpu: self.cpu.checked_sub(other.cpu)?,
            memory: self.memory.checked_sub(other.memory)?,
            storage: self.storage.checked_sub(other.storage)?,
            bandwidth: self.bandwidth.checked_sub(other.bandwidth)?,
        })
    }

    /// Component-wise saturating addition.
    pub fn saturating_add(&self, other: &Capacity) -> Capacity {
        Capacity {
            cpu: self.cpu.saturating_add(other.cpu),
            memory: self.memory.saturating_add(other.memory),
            storage: self.storage.saturating_add(other.storage),
            bandwidth: self.bandwidth.saturating_add(other.bandwidth),
        }
    }

    /// Component-wise saturating subtraction.
    pub fn saturating_sub(&self, other: &Capacity) -> Capacity {
        Capacity {
            cpu: self.cpu.saturating_sub(other.cpu),
            memory: self.memory.saturating_sub(other.memory),
            storage: self.storage.saturating_sub(other.storage),
            bandwidth: self.bandwidth.saturating_sub(other.bandwidth),
        }
    }

    pub fn is_zero(&self) -> bool {
        *self == Capacity::default()
    }
}

impl fmt::Display for Capacity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cpu:{} mem:{} disk:{} net:{}",
            self.cpu, self.memory, self.storage, self.bandwidth
        )
    }
}
