//! Locking primitives.
//!
//! [`SpinLock`] is the short-critical-section primitive for allocator pools
//! and timer lists. [`Mutex`] is the blocking primitive with shared mode and
//! timeouts that the scheduler and process manager are built on.

mod mutex;
mod spinlock;

pub use mutex::{EXCLUSIVE_MAGIC, Mutex, MutexCell, WaitMode};
pub use spinlock::{SpinLock, SpinLockGuard};

use core::sync::atomic::{AtomicPtr, Ordering};

/// Signature of the registered yield hook.
pub type YieldFn = fn();

fn null_yield() {
    core::hint::spin_loop();
}

static YIELD: AtomicPtr<()> = AtomicPtr::new(null_yield as *mut ());

/// Registers the scheduler's yield function.
///
/// Thread-mode mutex waiters call this on contention. Until the scheduler is
/// up the default emits a CPU pause, which is also the correct behavior for
/// single-threaded early boot.
pub fn set_yield(f: YieldFn) {
    YIELD.store(f as *mut (), Ordering::Release);
}

/// Yields the current thread to the scheduler (or pauses, pre-scheduler).
pub fn yield_now() {
    let ptr = YIELD.load(Ordering::Acquire);
    // SAFETY: only valid `YieldFn` pointers are ever stored into YIELD.
    let f: YieldFn = unsafe { core::mem::transmute(ptr) };
    f();
}
