//! Host stand-ins for the machine layer.
//!
//! Compiled for every build that is not the RV64 kernel target, so the
//! portable kernel logic type-checks and unit-tests on the host. CPU
//! identity is pinned to 0, interrupt masking is a no-op, and the context
//! restore path is unreachable.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicI64, Ordering};

use sett_core::clock::Timestamp;

use crate::isr::IsrContext;

/// The current CPU id: always 0 on the host.
#[inline]
pub fn cpu_id() -> usize {
    0
}

/// Number of CPUs: always 1 on the host.
pub fn cpu_count() -> usize {
    1
}

/// No-op on the host.
pub fn set_cpu_count(_count: usize) {}

/// No-op on the host; reports interrupts as already masked.
pub fn irq_disable() -> bool {
    false
}

/// No-op on the host.
pub fn irq_restore(_was_enabled: bool) {}

/// No-op on the host.
pub fn irq_enable() {}

/// No-op on the host.
pub fn enable_irq_sources() {}

struct HostCtx(UnsafeCell<IsrContext>);
// SAFETY: host tests are expected to exercise the context single-threaded,
// matching the one-CPU model this stub presents.
unsafe impl Sync for HostCtx {}

static HOST_CTX: HostCtx = HostCtx(UnsafeCell::new(IsrContext::zeroed_kernel()));

/// A dummy boot context standing in for `sscratch`.
pub fn current_isr_ctx() -> *mut IsrContext {
    HOST_CTX.0.get()
}

/// No-op on the host (the dummy context stays current).
///
/// # Safety
///
/// Trivially safe; mirrors the target signature.
pub unsafe fn set_current_isr_ctx(_ctx: *mut IsrContext) {}

/// Always 0 on the host.
pub fn read_scause() -> usize {
    0
}

/// Always 0 on the host.
pub fn read_stval() -> usize {
    0
}

/// Runs `f` directly; there is no user-memory window on the host.
pub fn with_user_memory_access<R>(f: impl FnOnce() -> R) -> R {
    f()
}

/// Forwards to the registered global clock.
pub fn time_us() -> Timestamp {
    sett_core::clock::now_us()
}

/// CPU pause hint.
#[inline]
pub fn pause() {
    core::hint::spin_loop();
}

/// Busy-waits briefly; there are no interrupts to wait for.
pub fn wait_for_interrupt() {
    core::hint::spin_loop();
}

/// No-op on the host.
pub fn fence_i() {}

static LAST_TIMER: AtomicI64 = AtomicI64::new(0);

/// Records the requested deadline so tests can observe timer programming.
pub fn set_timer(at_us: Timestamp) {
    LAST_TIMER.store(at_us, Ordering::SeqCst);
}

/// The last deadline passed to [`set_timer`].
pub fn last_timer() -> Timestamp {
    LAST_TIMER.load(Ordering::SeqCst)
}

/// Unreachable on the host.
pub fn poweroff() -> ! {
    unreachable!("poweroff on host build")
}

/// Unreachable on the host.
pub fn reboot() -> ! {
    unreachable!("reboot on host build")
}

/// Unreachable on the host.
pub fn halt() -> ! {
    unreachable!("halt on host build")
}

/// Consumes the pending switch target without transferring control; host
/// tests observe scheduling decisions through the scheduler state instead.
///
/// # Safety
///
/// Trivially safe on the host; mirrors the target signature.
pub unsafe fn context_switch(ctx: *mut IsrContext) {
    // SAFETY: the host context is a static dummy.
    unsafe {
        let _ = (*ctx).take_switch_target();
    }
}

/// No-op on the host.
pub fn init_traps() {}
