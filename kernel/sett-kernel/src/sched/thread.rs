//! Thread control blocks and the global thread table.
//!
//! A thread owns two register-file snapshots: the user context it runs in
//! and the kernel context syscalls and signal dispatch run in, on the
//! thread's own kernel stack. Threads are handed around as `Arc<Thread>`:
//! the table holds one reference, a runqueue (or the dead list) holds
//! another while the thread is scheduled.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicI32, AtomicU32, Ordering};

use sett_core::clock::TIMESTAMP_MAX;
use sett_core::id::{IdAlloc, Pid, Tid};
use sett_core::sync::{MutexCell, WaitMode};
use sett_core::{Cause, Error, Location, Result};

use crate::isr::IsrContext;

/// Kernel stack size per thread.
pub const KERNEL_STACK_SIZE: usize = 8192;

bitflags::bitflags! {
    /// Thread state bits, mutated atomically.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ThreadFlags: u32 {
        /// The thread is schedulable (on a runqueue or incoming list).
        const RUNNING = 1 << 0;
        /// The thread asked to exit; the scheduler will reap it.
        const EXITING = 1 << 1;
        /// The thread has fully exited and awaits joining.
        const EXITED = 1 << 2;
        /// Nobody will join this thread; reap immediately once exited.
        const DETACHED = 1 << 3;
        /// Kernel thread: no user context, never lowered to user mode.
        const KERNEL = 1 << 4;
        /// Currently executing in its kernel context.
        const PRIVILEGED = 1 << 5;
        /// Currently inside a user signal handler.
        const SIGHANDLER = 1 << 6;
        /// Schedule at the head of the runqueue instead of the tail.
        const STARTNOW = 1 << 7;
        /// Suspension requested; honored at the next safe point.
        const SUSPENDING = 1 << 8;
    }
}

/// A thread control block.
pub struct Thread {
    /// Thread id, unique for the kernel's lifetime.
    pub id: Tid,
    /// Owning process; `None` for kernel threads.
    pub process: Option<Pid>,
    /// Scheduling priority; scales the preemption quota.
    pub priority: i32,
    /// Optional name for diagnostics.
    pub name: Option<String>,
    flags: AtomicU32,
    exit_code: AtomicI32,
    /// Kernel stack backing; freed when the control block drops.
    kernel_stack: alloc::boxed::Box<[u128]>,
    kernel_ctx: UnsafeCell<IsrContext>,
    user_ctx: UnsafeCell<IsrContext>,
}

// SAFETY: the atomic fields are inherently shareable. The ISR contexts are
// interior-mutable by design: each is written only by the CPU currently
// running (or installing) the thread, with interrupts disabled, never
// concurrently.
unsafe impl Send for Thread {}
unsafe impl Sync for Thread {}

static TID_ALLOC: IdAlloc = IdAlloc::starting_at(1);

impl Thread {
    fn new(
        name: Option<String>,
        process: Option<Pid>,
        priority: i32,
        flags: ThreadFlags,
    ) -> Arc<Self> {
        let id = Tid::new(TID_ALLOC.next());
        let kernel_stack = vec![0u128; KERNEL_STACK_SIZE / 16].into_boxed_slice();
        let thread = Arc::new(Self {
            id,
            process,
            priority,
            name,
            flags: AtomicU32::new(flags.bits()),
            exit_code: AtomicI32::new(0),
            kernel_stack,
            kernel_ctx: UnsafeCell::new(IsrContext::zeroed_kernel()),
            user_ctx: UnsafeCell::new(IsrContext::zeroed()),
        });

        let stack_top = thread.kernel_stack_top();
        // SAFETY: the thread is not yet shared; we hold the only reference.
        unsafe {
            let kctx = &mut *thread.kernel_ctx.get();
            kctx.tid = id.as_u32();
            kctx.trap_sp = stack_top;
            kctx.regs.sp = stack_top;
            let uctx = &mut *thread.user_ctx.get();
            uctx.tid = id.as_u32();
            uctx.trap_sp = stack_top;
        }
        thread
    }

    /// Creates a suspended kernel thread that will run `entry(arg)`.
    pub fn new_kernel(
        name: Option<String>,
        entry: extern "C" fn(usize),
        arg: usize,
        priority: i32,
    ) -> Arc<Self> {
        let thread = Self::new(
            name,
            None,
            priority,
            ThreadFlags::KERNEL | ThreadFlags::PRIVILEGED,
        );
        // SAFETY: not yet shared.
        unsafe {
            let kctx = &mut *thread.kernel_ctx.get();
            kctx.regs.pc = entry as usize;
            kctx.regs.a0 = arg;
            kctx.regs.ra = kernel_thread_return as usize;
        }
        thread
    }

    /// Creates a suspended user thread for `process`, entering at the user
    /// virtual address `entry` with `arg` in `a0`.
    pub fn new_user(
        name: Option<String>,
        process: Pid,
        mem_ctx: usize,
        entry: usize,
        arg: usize,
        priority: i32,
    ) -> Arc<Self> {
        let thread = Self::new(name, Some(process), priority, ThreadFlags::empty());
        // SAFETY: not yet shared.
        unsafe {
            let uctx = &mut *thread.user_ctx.get();
            uctx.regs.pc = entry;
            uctx.regs.a0 = arg;
            uctx.mem_ctx = mem_ctx;
            let kctx = &mut *thread.kernel_ctx.get();
            kctx.mem_ctx = mem_ctx;
        }
        thread
    }

    /// Current flag snapshot.
    pub fn flags(&self) -> ThreadFlags {
        ThreadFlags::from_bits_retain(self.flags.load(Ordering::Acquire))
    }

    /// Sets `flags`, returning the previous snapshot.
    pub fn set_flags(&self, flags: ThreadFlags) -> ThreadFlags {
        ThreadFlags::from_bits_retain(self.flags.fetch_or(flags.bits(), Ordering::AcqRel))
    }

    /// Clears `flags`, returning the previous snapshot.
    pub fn clear_flags(&self, flags: ThreadFlags) -> ThreadFlags {
        ThreadFlags::from_bits_retain(self.flags.fetch_and(!flags.bits(), Ordering::AcqRel))
    }

    /// Whether all of `flags` are set.
    pub fn has_flags(&self, flags: ThreadFlags) -> bool {
        self.flags().contains(flags)
    }

    /// Exit code as set by [`set_exit_code`](Self::set_exit_code).
    pub fn exit_code(&self) -> i32 {
        self.exit_code.load(Ordering::Acquire)
    }

    /// Records the exit code.
    pub fn set_exit_code(&self, code: i32) {
        self.exit_code.store(code, Ordering::Release);
    }

    /// Top of the kernel stack (grows down).
    pub fn kernel_stack_top(&self) -> usize {
        self.kernel_stack.as_ptr() as usize + self.kernel_stack.len() * 16
    }

    /// Raw pointer to the kernel-mode ISR context.
    pub fn kernel_ctx_ptr(&self) -> *mut IsrContext {
        self.kernel_ctx.get()
    }

    /// Raw pointer to the user-mode ISR context.
    pub fn user_ctx_ptr(&self) -> *mut IsrContext {
        self.user_ctx.get()
    }

    /// Runs `f` on the kernel context.
    ///
    /// # Safety
    ///
    /// The caller must be the sole accessor: either the thread is not
    /// scheduled anywhere, or this is its own CPU with interrupts disabled.
    pub unsafe fn with_kernel_ctx<R>(&self, f: impl FnOnce(&mut IsrContext) -> R) -> R {
        // SAFETY: per contract.
        f(unsafe { &mut *self.kernel_ctx.get() })
    }

    /// Runs `f` on the user context.
    ///
    /// # Safety
    ///
    /// Same contract as [`with_kernel_ctx`](Self::with_kernel_ctx).
    pub unsafe fn with_user_ctx<R>(&self, f: impl FnOnce(&mut IsrContext) -> R) -> R {
        // SAFETY: per contract.
        f(unsafe { &mut *self.user_ctx.get() })
    }
}

/// Return path for kernel threads whose entry function returns.
extern "C" fn kernel_thread_return(_unused: usize) {
    crate::sched::exit_thread(0);
}

// ── Global thread table ─────────────────────────────────────────────

/// All live threads, sorted by id. Guarded by a shared mutex: lookups take
/// it shared, insertion and reaping take it exclusive.
static THREADS: MutexCell<alloc::vec::Vec<Arc<Thread>>> = MutexCell::new_shared(alloc::vec::Vec::new());

/// Inserts a freshly created thread into the table.
pub fn insert(thread: Arc<Thread>) -> Result<()> {
    THREADS
        .with(TIMESTAMP_MAX, WaitMode::Thread, |threads| {
            let pos = threads.partition_point(|t| t.id < thread.id);
            threads.insert(pos, thread);
        })
        .map_err(|_| Error::new(Location::Threads, Cause::Illegal))
}

/// Looks a thread up by id.
pub fn find(tid: Tid) -> Option<Arc<Thread>> {
    THREADS
        .with_shared(TIMESTAMP_MAX, WaitMode::Thread, |threads| {
            threads
                .binary_search_by_key(&tid, |t| t.id)
                .ok()
                .map(|i| threads[i].clone())
        })
        .ok()
        .flatten()
}

/// Removes a thread from the table, dropping the table's reference.
pub fn remove(tid: Tid) -> Option<Arc<Thread>> {
    THREADS
        .with(TIMESTAMP_MAX, WaitMode::Thread, |threads| {
            let i = threads.binary_search_by_key(&tid, |t| t.id).ok()?;
            Some(threads.remove(i))
        })
        .ok()
        .flatten()
}

/// Number of live threads.
#[must_use]
pub fn count() -> usize {
    THREADS
        .with_shared(TIMESTAMP_MAX, WaitMode::Thread, alloc::vec::Vec::len)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_are_atomic_bitops() {
        let t = Thread::new_kernel(None, kernel_thread_return, 0, 0);
        assert!(t.has_flags(ThreadFlags::KERNEL | ThreadFlags::PRIVILEGED));
        t.set_flags(ThreadFlags::RUNNING);
        assert!(t.has_flags(ThreadFlags::RUNNING));
        t.clear_flags(ThreadFlags::RUNNING);
        assert!(!t.has_flags(ThreadFlags::RUNNING));
    }

    #[test]
    fn kernel_entry_context_is_prepared() {
        extern "C" fn entry(_arg: usize) {}
        let t = Thread::new_kernel(Some("worker".into()), entry, 42, 2);
        // SAFETY: thread is not scheduled.
        unsafe {
            t.with_kernel_ctx(|ctx| {
                assert_eq!(ctx.regs.pc, entry as usize);
                assert_eq!(ctx.regs.a0, 42);
                assert_eq!(ctx.regs.sp, t.kernel_stack_top());
                assert!(ctx.is_kernel());
            });
        }
        assert_eq!(t.kernel_stack_top() % 16, 0);
    }

    #[test]
    fn user_thread_carries_mem_ctx() {
        let t = Thread::new_user(None, Pid::new(3), 0xdead_0000, 0x1_0000, 7, 0);
        // SAFETY: thread is not scheduled.
        unsafe {
            t.with_user_ctx(|ctx| {
                assert_eq!(ctx.regs.pc, 0x1_0000);
                assert_eq!(ctx.regs.a0, 7);
                assert_eq!(ctx.mem_ctx, 0xdead_0000);
                assert!(!ctx.is_kernel());
            });
        }
        assert_eq!(t.process, Some(Pid::new(3)));
    }

    #[test]
    fn table_is_sorted_and_searchable() {
        let a = Thread::new_kernel(None, kernel_thread_return, 0, 0);
        let b = Thread::new_kernel(None, kernel_thread_return, 0, 0);
        insert(b.clone()).unwrap();
        insert(a.clone()).unwrap();
        assert_eq!(find(a.id).unwrap().id, a.id);
        assert_eq!(find(b.id).unwrap().id, b.id);
        assert!(remove(a.id).is_some());
        assert!(find(a.id).is_none());
        remove(b.id);
    }
}
