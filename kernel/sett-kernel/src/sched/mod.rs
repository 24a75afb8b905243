//! Preemptive per-CPU scheduler.
//!
//! Strict round-robin per CPU with priority-scaled quanta. Each CPU owns a
//! runqueue it alone touches (interrupts disabled), plus an *incoming* list
//! other CPUs append to under a mutex when handing threads over. The switch
//! path drains incoming, pops the queue head, applies the
//! [`policy::decide`] verdict, and installs the winner's context as the
//! trap-exit switch target.

pub mod policy;
pub mod thread;

use alloc::collections::VecDeque;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use sett_core::clock::{self, TIMESTAMP_MAX};
use sett_core::id::{CpuId, Pid, Tid};
use sett_core::sync::{MutexCell, WaitMode};
use sett_core::{Cause, Error, Location, Result, kdebug};

use crate::percpu::MAX_CPUS;
use policy::SwitchDecision;
use thread::{Thread, ThreadFlags};

bitflags::bitflags! {
    /// Per-CPU scheduler state flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SchedFlags: u32 {
        /// The scheduler runs on this CPU.
        const RUNNING = 1 << 0;
        /// The CPU is shutting down; threads are being handed away.
        const EXITING = 1 << 1;
    }
}

/// Per-CPU scheduler state.
pub struct SchedCpu {
    flags: AtomicU32,
    /// Threads runnable on this CPU. Only its own CPU touches it, with
    /// interrupts disabled.
    queue: UnsafeCell<VecDeque<Arc<Thread>>>,
    /// Threads handed over by other CPUs, drained by the switch path.
    incoming: MutexCell<VecDeque<Arc<Thread>>>,
    /// The thread whose context is installed, if any.
    current: sett_core::sync::SpinLock<Option<Arc<Thread>>>,
    /// This CPU's idle thread; created by [`init`].
    idle: sett_core::sync::SpinLock<Option<Arc<Thread>>>,
    /// Runnable-thread estimate for handoff target choice.
    load: AtomicUsize,
}

// SAFETY: `queue` is only accessed by the owning CPU with interrupts
// disabled; every other field is internally synchronized.
unsafe impl Sync for SchedCpu {}

impl SchedCpu {
    const fn new() -> Self {
        Self {
            flags: AtomicU32::new(0),
            queue: UnsafeCell::new(VecDeque::new()),
            incoming: MutexCell::new(VecDeque::new()),
            current: sett_core::sync::SpinLock::new(None),
            idle: sett_core::sync::SpinLock::new(None),
            load: AtomicUsize::new(0),
        }
    }

    /// Flag snapshot.
    pub fn flags(&self) -> SchedFlags {
        SchedFlags::from_bits_retain(self.flags.load(Ordering::Acquire))
    }

    /// Load estimate (runnable threads).
    pub fn load(&self) -> usize {
        self.load.load(Ordering::Relaxed)
    }

    /// # Safety
    ///
    /// Caller must be this CPU with interrupts disabled (or an off-target
    /// test driving one CPU single-threaded).
    unsafe fn with_queue<R>(&self, f: impl FnOnce(&mut VecDeque<Arc<Thread>>) -> R) -> R {
        // SAFETY: per contract.
        f(unsafe { &mut *self.queue.get() })
    }
}

static SCHED_CPUS: [SchedCpu; MAX_CPUS] = [const { SchedCpu::new() }; MAX_CPUS];

/// Dead threads awaiting the housekeeper.
static DEAD_THREADS: MutexCell<Vec<Arc<Thread>>> = MutexCell::new(Vec::new());

/// The scheduler state of a CPU.
#[must_use]
pub fn cpu(cpu: CpuId) -> &'static SchedCpu {
    &SCHED_CPUS[cpu.as_usize()]
}

fn this_cpu() -> &'static SchedCpu {
    &SCHED_CPUS[crate::arch::cpu_id()]
}

// ── Initialization ──────────────────────────────────────────────────

/// Idle loop: pause until an interrupt schedules something.
extern "C" fn idle_entry(_arg: usize) {
    loop {
        crate::arch::wait_for_interrupt();
        yield_now();
    }
}

/// Global scheduler initialization: creates each CPU's idle thread.
///
/// The boot path additionally points the mutex yield hook at
/// [`yield_now`] once it is safe to context switch.
pub fn init() {
    for i in 0..crate::arch::cpu_count() {
        let idle = Thread::new_kernel(Some(String::from("idle")), idle_entry, 0, 0);
        *SCHED_CPUS[i].idle.lock() = Some(idle);
    }
}

/// Starts scheduling on the current CPU. Never returns.
///
/// The CPU's boot context must be installed as the current ISR context.
pub fn exec() -> ! {
    let sc = this_cpu();
    sc.flags.fetch_or(SchedFlags::RUNNING.bits(), Ordering::Release);
    kdebug!("scheduler running on CPU{}", crate::arch::cpu_id());

    crate::arch::irq_disable();
    request_switch_from_isr();
    // SAFETY: interrupts are disabled and the current ISR context carries
    // the switch target just set.
    unsafe { crate::arch::context_switch(crate::arch::current_isr_ctx()) };
    unreachable!("boot context resumed after scheduler start");
}

/// Flags a CPU to stop scheduling; its switch path hands every thread to
/// the remaining CPUs and parks the core.
pub fn exit(target: CpuId) {
    SCHED_CPUS[target.as_usize()]
        .flags
        .fetch_or(SchedFlags::EXITING.bits(), Ordering::Release);
}

// ── The switch path ─────────────────────────────────────────────────

/// Installs `thread`'s context as the trap-exit target and arms the
/// preemption timer with its quota.
fn set_switch(sc: &SchedCpu, thread: &Arc<Thread>) {
    // A dormant user thread being installed with signals pending detours
    // through the signal dispatcher in its kernel context. (The
    // lower-to-user path handles its own signals and must not take this
    // detour: its kernel context is live.)
    if !thread.has_flags(ThreadFlags::PRIVILEGED)
        && thread
            .process
            .is_some_and(crate::proc::signals_pending)
    {
        enter_signal_dispatch(thread);
    }
    install_thread(sc, thread);
}

/// The non-rerouting half of [`set_switch`]: records the thread as
/// current, arms its quota, and sets the trap-exit target.
fn install_thread(sc: &SchedCpu, thread: &Arc<Thread>) {
    let ctx = if thread.has_flags(ThreadFlags::PRIVILEGED) {
        thread.kernel_ctx_ptr()
    } else {
        thread.user_ctx_ptr()
    };

    *sc.current.lock() = Some(thread.clone());
    crate::time::set_next_preempt(clock::now_us() + policy::quota_for(thread.priority));
    // SAFETY: we are on this CPU with interrupts disabled; the current ISR
    // context is live.
    unsafe { (*crate::arch::current_isr_ctx()).set_switch_target(ctx) };
}

/// Redirects a user thread into the kernel-side signal dispatcher.
fn enter_signal_dispatch(thread: &Arc<Thread>) {
    thread.set_flags(ThreadFlags::PRIVILEGED);
    // SAFETY: the thread is not running anywhere; we are installing it.
    unsafe {
        thread.with_kernel_ctx(|ctx| {
            ctx.regs = crate::arch::regs::RegisterFile::zeroed();
            ctx.regs.pc = crate::proc::signal::signal_dispatch_entry as usize;
            ctx.regs.sp = thread.kernel_stack_top();
        });
    }
}

/// The scheduler switch routine, run from trap context with interrupts
/// disabled.
pub fn request_switch_from_isr() {
    let sc = this_cpu();

    // CPU shutdown: hand everything away and park.
    if sc.flags().contains(SchedFlags::EXITING) {
        hand_off_everything(sc);
        sc.flags.fetch_and(
            !(SchedFlags::RUNNING | SchedFlags::EXITING).bits(),
            Ordering::Release,
        );
        crate::arch::halt();
    }

    // Drain incoming: STARTNOW threads go to the head.
    let _ = sc.incoming.with(TIMESTAMP_MAX, WaitMode::Isr, |incoming| {
        while let Some(thread) = incoming.pop_front() {
            // SAFETY: own CPU, interrupts disabled.
            unsafe {
                sc.with_queue(|queue| {
                    if thread.clear_flags(ThreadFlags::STARTNOW).contains(ThreadFlags::STARTNOW) {
                        queue.push_front(thread);
                    } else {
                        queue.push_back(thread);
                    }
                });
            }
        }
    });

    loop {
        // SAFETY: own CPU, interrupts disabled.
        let Some(thread) = (unsafe { sc.with_queue(VecDeque::pop_front) }) else {
            break;
        };
        let proc_flags = thread.process.and_then(crate::proc::flags_of_from_isr);
        match policy::decide(thread.flags(), proc_flags) {
            SwitchDecision::Run => {
                // SAFETY: own CPU, interrupts disabled.
                let queued = unsafe {
                    sc.with_queue(|queue| {
                        queue.push_back(thread.clone());
                        queue.len()
                    })
                };
                sc.load.store(queued, Ordering::Relaxed);
                set_switch(sc, &thread);
                return;
            }
            SwitchDecision::StopForProcessExit | SwitchDecision::Suspend => {
                thread.clear_flags(ThreadFlags::RUNNING | ThreadFlags::SUSPENDING);
            }
            SwitchDecision::Reap => {
                thread.set_flags(ThreadFlags::EXITED);
                thread.clear_flags(ThreadFlags::RUNNING);
                let _ = DEAD_THREADS.with(TIMESTAMP_MAX, WaitMode::Isr, |dead| {
                    dead.push(thread.clone());
                });
            }
        }
    }

    // Nothing runnable: run idle.
    sc.load.store(0, Ordering::Relaxed);
    let idle = sc.idle.lock().clone().expect("scheduler initialized");
    *sc.current.lock() = Some(idle.clone());
    crate::time::set_next_preempt(clock::now_us() + policy::IDLE_QUOTA_US);
    // SAFETY: own CPU, interrupts disabled.
    unsafe { (*crate::arch::current_isr_ctx()).set_switch_target(idle.kernel_ctx_ptr()) };
}

/// Hands every queued thread to the other CPUs (CPU shutdown path).
fn hand_off_everything(sc: &SchedCpu) {
    let me = crate::arch::cpu_id();
    let count = crate::arch::cpu_count();
    let mut victim = me;

    let mut orphans: Vec<Arc<Thread>> = Vec::new();
    // SAFETY: own CPU, interrupts disabled.
    unsafe { sc.with_queue(|queue| orphans.extend(queue.drain(..))) };
    let _ = sc.incoming.with(TIMESTAMP_MAX, WaitMode::Isr, |incoming| {
        orphans.extend(incoming.drain(..));
    });

    for thread in orphans {
        loop {
            victim = (victim + 1) % count;
            if victim != me && hand_off(&thread, CpuId::new(victim as u32), false) {
                break;
            }
        }
    }
}

/// Appends `thread` to `target`'s incoming list.
///
/// Refused (returns false) when the target CPU is not running a scheduler,
/// unless `force` is set.
pub fn hand_off(thread: &Arc<Thread>, target: CpuId, force: bool) -> bool {
    let sc = &SCHED_CPUS[target.as_usize()];
    let flags = sc.flags();
    let accepting =
        flags.contains(SchedFlags::RUNNING) && !flags.contains(SchedFlags::EXITING);
    if accepting || force {
        let _ = sc.incoming.with(TIMESTAMP_MAX, WaitMode::Isr, |incoming| {
            incoming.push_back(thread.clone());
        });
    }
    accepting || force
}

// ── Thread lifecycle API ────────────────────────────────────────────

/// Creates a suspended kernel thread and registers it.
pub fn create_kernel_thread(
    name: Option<String>,
    entry: extern "C" fn(usize),
    arg: usize,
    priority: i32,
) -> Result<Tid> {
    let thread = Thread::new_kernel(name, entry, arg, priority);
    let tid = thread.id;
    thread::insert(thread)?;
    kdebug!("kernel thread #{tid} created");
    Ok(tid)
}

/// Creates a suspended user thread for `process` and registers it.
pub fn create_user_thread(
    name: Option<String>,
    process: Pid,
    mem_ctx: usize,
    entry: usize,
    arg: usize,
    priority: i32,
) -> Result<Tid> {
    let thread = Thread::new_user(name, process, mem_ctx, entry, arg, priority);
    let tid = thread.id;
    thread::insert(thread)?;
    Ok(tid)
}

fn not_found() -> Error {
    Error::new(Location::Threads, Cause::NotFound)
}

/// Resumes (or first-starts) a thread on the current CPU.
pub fn resume_thread(tid: Tid) -> Result<()> {
    resume_impl(tid, false)
}

/// Resumes a thread at the head of the runqueue.
pub fn resume_thread_now(tid: Tid) -> Result<()> {
    resume_impl(tid, true)
}

fn resume_impl(tid: Tid, now: bool) -> Result<()> {
    let thread = thread::find(tid).ok_or_else(not_found)?;
    let mut set = ThreadFlags::RUNNING;
    if now {
        set |= ThreadFlags::STARTNOW;
    }
    let ie = crate::arch::irq_disable();
    if !thread.set_flags(set).contains(ThreadFlags::RUNNING) {
        // Newly runnable: enter this CPU's scheduling domain.
        hand_off(&thread, crate::percpu::current_cpu(), true);
    }
    crate::arch::irq_restore(ie);
    Ok(())
}

/// Requests suspension of a user thread; it stops at its next trap
/// boundary.
pub fn suspend_thread(tid: Tid) -> Result<()> {
    let thread = thread::find(tid).ok_or_else(not_found)?;
    if thread.has_flags(ThreadFlags::KERNEL) {
        return Err(Error::new(Location::Threads, Cause::Illegal));
    }
    thread.set_flags(ThreadFlags::SUSPENDING);
    Ok(())
}

/// Marks a thread detached: once exited it is reclaimed without a join.
pub fn detach_thread(tid: Tid) -> Result<()> {
    thread::find(tid)
        .ok_or_else(not_found)?
        .set_flags(ThreadFlags::DETACHED);
    Ok(())
}

/// Whether the thread is currently schedulable.
pub fn thread_is_running(tid: Tid) -> Result<bool> {
    Ok(thread::find(tid)
        .ok_or_else(not_found)?
        .has_flags(ThreadFlags::RUNNING))
}

/// Waits for a thread to exit, then marks it for reclamation.
pub fn join_thread(tid: Tid) {
    loop {
        let Some(thread) = thread::find(tid) else {
            return;
        };
        if thread.has_flags(ThreadFlags::EXITED) {
            thread.set_flags(ThreadFlags::DETACHED);
            return;
        }
        yield_now();
    }
}

/// The thread running on the current CPU, if any.
#[must_use]
pub fn current_thread() -> Option<Arc<Thread>> {
    this_cpu().current.lock().clone()
}

/// The current thread's id, or 0 from pre-scheduler contexts.
#[must_use]
pub fn current_tid() -> u32 {
    current_thread().map_or(0, |t| t.id.as_u32())
}

/// Cooperatively yields the CPU.
pub fn yield_now() {
    crate::arch::irq_disable();
    request_switch_from_isr();
    // SAFETY: interrupts are disabled and the switch target was just set on
    // the current ISR context.
    unsafe { crate::arch::context_switch(crate::arch::current_isr_ctx()) }
}

/// Exits the current thread. Never returns.
pub fn exit_thread(code: i32) -> ! {
    crate::arch::irq_disable();
    if let Some(thread) = current_thread() {
        thread.set_exit_code(code);
        thread.set_flags(ThreadFlags::EXITING);
    }
    request_switch_from_isr();
    // SAFETY: interrupts disabled, switch target set.
    unsafe { crate::arch::context_switch(crate::arch::current_isr_ctx()) };
    unreachable!("exited thread rescheduled");
}

// ── Privilege transitions (trap pipeline hooks) ─────────────────────

/// From the trap pipeline: the current user thread performed an ecall.
/// Transitions it into its kernel context at the syscall entry with the
/// argument registers copied over.
pub fn raise_syscall_from_isr() {
    let Some(thread) = current_thread() else {
        return;
    };
    debug_assert!(!thread.has_flags(ThreadFlags::KERNEL));
    thread.set_flags(ThreadFlags::PRIVILEGED);

    // SAFETY: this is the thread's own CPU inside its trap; contexts are
    // exclusively ours while interrupts are off.
    unsafe {
        let args = thread.with_user_ctx(|uctx| uctx.regs.clone());
        thread.with_kernel_ctx(|kctx| {
            kctx.regs = crate::arch::regs::RegisterFile::zeroed();
            kctx.regs.pc = crate::syscall::syscall_entry as usize;
            kctx.regs.sp = thread.kernel_stack_top();
            kctx.regs.copy_syscall_args(&args);
        });
        (*crate::arch::current_isr_ctx()).set_switch_target(thread.kernel_ctx_ptr());
    }
}

/// Transitions the current user thread into its kernel context at an
/// arbitrary kernel entry point with `a0` as the only argument. Used by the
/// fault-to-signal path.
pub fn raise_kernel_entry_from_isr(entry: usize, a0: usize) {
    let Some(thread) = current_thread() else {
        return;
    };
    thread.set_flags(ThreadFlags::PRIVILEGED);
    // SAFETY: the thread's own CPU inside its trap, interrupts disabled.
    unsafe {
        thread.with_kernel_ctx(|kctx| {
            kctx.regs = crate::arch::regs::RegisterFile::zeroed();
            kctx.regs.pc = entry;
            kctx.regs.sp = thread.kernel_stack_top();
            kctx.regs.a0 = a0;
        });
        (*crate::arch::current_isr_ctx()).set_switch_target(thread.kernel_ctx_ptr());
    }
}

/// From the trap pipeline or a syscall return: re-enter user mode for the
/// current thread. Pending signals are delivered first — we are already on
/// the thread's kernel context, which is exactly where the dispatcher
/// runs. Never returns.
pub fn lower_to_user() -> ! {
    crate::arch::irq_disable();
    let thread = current_thread().expect("lower_to_user without current thread");
    debug_assert!(!thread.has_flags(ThreadFlags::KERNEL));

    let proc_exiting = loop {
        let flags = thread.process.and_then(crate::proc::flags_of_from_isr);
        if flags.is_some_and(|pf| pf.contains(crate::proc::ProcFlags::EXITING)) {
            break true;
        }
        if flags.is_some_and(|pf| pf.contains(crate::proc::ProcFlags::SIGPEND)) {
            if let Some(process) = thread.process.and_then(crate::proc::find) {
                // Delivery may install a handler frame or kill the
                // process; the loop re-checks either way.
                crate::proc::signal::run_one_pending(&process);
                continue;
            }
        }
        break false;
    };

    thread.clear_flags(ThreadFlags::PRIVILEGED);
    if proc_exiting {
        // The termination path reaps stopped threads; pick someone else.
        thread.clear_flags(ThreadFlags::RUNNING);
        request_switch_from_isr();
    } else {
        // A signal racing this boundary is caught at the next switch.
        install_thread(this_cpu(), &thread);
    }
    // SAFETY: interrupts disabled, switch target set.
    unsafe { crate::arch::context_switch(crate::arch::current_isr_ctx()) };
    unreachable!("kernel context resumed after lowering to user");
}

// ── Housekeeping ────────────────────────────────────────────────────

/// Collects detached, exited threads: drops their table entries (stack and
/// control block free with the last `Arc`). Runs from the housekeeping
/// thread.
pub fn collect_dead_threads() {
    let _ = DEAD_THREADS.with(TIMESTAMP_MAX, WaitMode::Thread, |dead| {
        dead.retain(|thread| {
            if thread.has_flags(ThreadFlags::DETACHED) {
                thread::remove(thread.id);
                kdebug!("reaped thread #{}", thread.id);
                false
            } else {
                true
            }
        });
    });
}
