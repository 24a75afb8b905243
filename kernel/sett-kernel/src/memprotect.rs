//! Memory-protection contexts.
//!
//! Each process owns one [`MemProtectCtx`]: the set of address ranges its
//! user code may touch, with per-range permissions. The generic layer only
//! does the bookkeeping and tracks which context is active per CPU; actually
//! programming the protection hardware (PMP entries or a page table root) is
//! the platform port's job, registered through [`set_apply_fn`]. The switch
//! path calls [`install`] for every context change, with interrupts
//! disabled.

use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use planck_noalloc::vec::ArrayVec;
use sett_core::sync::SpinLock;
use sett_core::{Cause, Error, Location, Result};
use sett_mm::memmap::Access;

use crate::percpu::{CpuLocal, MAX_CPUS};

/// Maximum protection ranges per context (one per memory-map region).
pub const MAX_PROT_REGIONS: usize = sett_mm::memmap::MAX_REGIONS;

/// One protected range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtRegion {
    /// Base address.
    pub base: usize,
    /// Size in bytes.
    pub size: usize,
    /// Permissions granted to user mode.
    pub access: Access,
}

/// A process's protection-region set.
///
/// Mutated under the owning process's lock; read from the switch path via
/// its address, so the region list has its own short lock.
pub struct MemProtectCtx {
    regions: SpinLock<ArrayVec<ProtRegion, MAX_PROT_REGIONS>>,
    /// Bumped by [`commit`](Self::commit); lets the platform layer skip
    /// reprogramming an unchanged context.
    generation: AtomicUsize,
}

impl MemProtectCtx {
    /// Creates an empty context: user mode may touch nothing.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            regions: SpinLock::new(ArrayVec::new()),
            generation: AtomicUsize::new(0),
        }
    }

    /// Grants user mode `access` to `[base, base + size)`.
    ///
    /// `access` of [`Access::empty`] revokes the range.
    pub fn set_region(&self, base: usize, size: usize, access: Access) -> Result<()> {
        let mut regions = self.regions.lock();
        if let Some(pos) = regions.iter().position(|r| r.base == base) {
            if access.is_empty() {
                regions.remove(pos);
            } else {
                regions[pos] = ProtRegion { base, size, access };
            }
            return Ok(());
        }
        if access.is_empty() {
            return Err(Error::new(Location::Process, Cause::NotFound));
        }
        if regions.is_full() {
            return Err(Error::new(Location::Process, Cause::NoMem));
        }
        regions.push(ProtRegion { base, size, access });
        Ok(())
    }

    /// Publishes pending region changes to the hardware layer.
    ///
    /// If this context is active on the current CPU, it is re-applied
    /// immediately.
    pub fn commit(&self) {
        self.generation.fetch_add(1, Ordering::Release);
        let me = core::ptr::from_ref(self) as usize;
        if ACTIVE.get().load(Ordering::Relaxed) == me {
            apply(me);
        }
    }

    /// Snapshot of the current regions.
    pub fn regions(&self) -> ArrayVec<ProtRegion, MAX_PROT_REGIONS> {
        let mut out = ArrayVec::new();
        for r in self.regions.lock().iter() {
            out.push(*r);
        }
        out
    }

    /// Current commit generation.
    pub fn generation(&self) -> usize {
        self.generation.load(Ordering::Acquire)
    }
}

impl Default for MemProtectCtx {
    fn default() -> Self {
        Self::new()
    }
}

// ── Active-context tracking and the platform hook ───────────────────

static ACTIVE: CpuLocal<AtomicUsize> = CpuLocal::new([const { AtomicUsize::new(0) }; MAX_CPUS]);

/// Platform hook: applies the context at the given address (0 = none) to
/// the protection hardware.
pub type ApplyFn = fn(usize);

static APPLY_FN: AtomicPtr<()> = AtomicPtr::new(core::ptr::null_mut());

/// Registers the platform's protection-programming function.
pub fn set_apply_fn(f: ApplyFn) {
    APPLY_FN.store(f as *mut (), Ordering::Release);
}

fn apply(ctx_addr: usize) {
    let ptr = APPLY_FN.load(Ordering::Acquire);
    if !ptr.is_null() {
        // SAFETY: only valid `ApplyFn` pointers are stored.
        let f: ApplyFn = unsafe { core::mem::transmute(ptr) };
        f(ctx_addr);
    }
}

/// Installs the context at `ctx_addr` (0 = none) on the current CPU.
///
/// Called from the switch path with interrupts disabled; uninstalling the
/// previous context is implicit.
pub fn install(ctx_addr: usize) {
    let active = ACTIVE.get();
    if active.swap(ctx_addr, Ordering::Relaxed) != ctx_addr {
        apply(ctx_addr);
    }
}

/// The context address active on the current CPU (0 = none).
#[must_use]
pub fn active() -> usize {
    ACTIVE.get().load(Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_revoke_regions() {
        let ctx = MemProtectCtx::new();
        ctx.set_region(0x1000, 0x2000, Access::RW).unwrap();
        ctx.set_region(0x4000, 0x1000, Access::R | Access::X).unwrap();
        assert_eq!(ctx.regions().len(), 2);

        // Replacing in place.
        ctx.set_region(0x1000, 0x2000, Access::R).unwrap();
        assert_eq!(ctx.regions()[0].access, Access::R);

        // Revoking.
        ctx.set_region(0x1000, 0, Access::empty()).unwrap();
        assert_eq!(ctx.regions().len(), 1);
        assert_eq!(
            ctx.set_region(0x9000, 0, Access::empty()).unwrap_err().cause,
            Cause::NotFound
        );
    }

    #[test]
    fn install_tracks_active_context() {
        let ctx = MemProtectCtx::new();
        let addr = core::ptr::from_ref(&ctx) as usize;
        install(addr);
        assert_eq!(active(), addr);
        install(0);
        assert_eq!(active(), 0);
    }

    #[test]
    fn commit_bumps_generation() {
        let ctx = MemProtectCtx::new();
        let g0 = ctx.generation();
        ctx.set_region(0x1000, 0x1000, Access::RW).unwrap();
        ctx.commit();
        assert!(ctx.generation() > g0);
    }
}
