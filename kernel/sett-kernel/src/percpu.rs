//! Per-CPU storage.

use sett_core::id::CpuId;

/// Maximum CPUs the kernel is built for.
pub const MAX_CPUS: usize = 8;

/// A value replicated per CPU, indexed by the current CPU id.
///
/// Elements must be `Sync`: "per-CPU" is an access pattern, not an enforced
/// exclusion — handoff paths deliberately touch other CPUs' slots.
pub struct CpuLocal<T> {
    items: [T; MAX_CPUS],
}

impl<T> CpuLocal<T> {
    /// Creates per-CPU storage from an array of initial values.
    pub const fn new(items: [T; MAX_CPUS]) -> Self {
        Self { items }
    }

    /// The current CPU's slot.
    pub fn get(&self) -> &T {
        &self.items[crate::arch::cpu_id()]
    }

    /// A specific CPU's slot.
    pub fn get_for(&self, cpu: CpuId) -> &T {
        &self.items[cpu.as_usize()]
    }

    /// Iterates all slots.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }
}

/// The current CPU's id.
#[must_use]
pub fn current_cpu() -> CpuId {
    CpuId::new(crate::arch::cpu_id() as u32)
}
