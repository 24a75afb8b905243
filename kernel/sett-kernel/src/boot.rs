//! Boot and shutdown.
//!
//! The platform entry stub (firmware hand-off, device-tree parsing, early
//! console) is external; it calls [`kernel_init`] with the boot hart, the
//! free-RAM ranges, and the root filesystem. Init order: traps → clock →
//! physical allocator → scheduler and housekeeping → VFS → PID 1 → enter
//! the scheduler.
//!
//! Shutdown is a syscall setting [`shutdown_mode`]; the main kernel thread
//! polls it and drives userland teardown before asking the firmware to
//! power off or reboot.

use alloc::boxed::Box;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU32, Ordering};

use sett_core::id::Pid;
use sett_core::{kinfo, kwarn};
use sett_fs::Filesystem;

use crate::isr::IsrContext;
use crate::percpu::MAX_CPUS;
use crate::proc::loader::FlatLoader;
use crate::{housekeeping, proc, sched};

/// One contiguous range of free RAM handed over by the platform layer.
#[derive(Debug, Clone, Copy)]
pub struct MemRange {
    /// First usable byte.
    pub start: usize,
    /// One past the last usable byte.
    pub end: usize,
}

/// Everything the kernel needs from the platform entry stub.
pub struct BootInfo<'a> {
    /// The booting hart.
    pub hart: usize,
    /// Number of harts that will run the scheduler.
    pub cpu_count: usize,
    /// Physical address of the device tree, for the driver layer.
    pub dtb: usize,
    /// Free RAM to hand to the page allocator.
    pub memory: &'a [MemRange],
}

// ── Shutdown state ──────────────────────────────────────────────────

/// 0 = running, 1 = power off requested, 2 = reboot requested.
static SHUTDOWN_MODE: AtomicU32 = AtomicU32::new(0);

/// Current shutdown request state.
#[must_use]
pub fn shutdown_mode() -> u32 {
    SHUTDOWN_MODE.load(Ordering::Acquire)
}

/// Requests system shutdown; the main kernel thread picks it up.
pub fn request_shutdown(reboot: bool) {
    SHUTDOWN_MODE.store(if reboot { 2 } else { 1 }, Ordering::Release);
}

// ── Boot contexts ───────────────────────────────────────────────────

const BOOT_STACK_SIZE: usize = 4096;

struct BootCpu {
    ctx: UnsafeCell<IsrContext>,
    stack: UnsafeCell<[u8; BOOT_STACK_SIZE]>,
}

// SAFETY: each slot is only touched by its own hart during boot.
unsafe impl Sync for BootCpu {}

static BOOT_CPUS: [BootCpu; MAX_CPUS] = [const {
    BootCpu {
        ctx: UnsafeCell::new(IsrContext::zeroed_kernel()),
        stack: UnsafeCell::new([0; BOOT_STACK_SIZE]),
    }
}; MAX_CPUS];

/// Installs the boot ISR context for `hart`, so traps taken before the
/// first thread switch have a register save area and stack.
fn install_boot_ctx(hart: usize) {
    let slot = &BOOT_CPUS[hart];
    // SAFETY: our own hart's slot, before interrupts are enabled.
    unsafe {
        let ctx = &mut *slot.ctx.get();
        ctx.trap_sp = slot.stack.get() as usize + BOOT_STACK_SIZE;
        ctx.cpu = hart as u32;
        crate::arch::set_current_isr_ctx(slot.ctx.get());
    }
}

// ── Init ────────────────────────────────────────────────────────────

/// Early kernel initialization on the boot hart. Never returns: ends by
/// entering the scheduler.
///
/// The platform layer must have registered a log sink first; everything
/// else is set up here.
pub fn kernel_init(info: &BootInfo, root: Box<dyn Filesystem>) -> ! {
    crate::arch::set_cpu_count(info.cpu_count);
    install_boot_ctx(info.hart);
    crate::arch::init_traps();
    sett_core::clock::set_clock(crate::arch::time_us);
    kinfo!("sett starting on hart {} ({} cpus)", info.hart, info.cpu_count);

    for range in info.memory {
        // SAFETY: the platform layer promises these ranges are free RAM.
        unsafe {
            sett_mm::kalloc::init_pool(range.start, range.end)
                .expect("failed to register memory pool");
        }
    }

    sched::init();
    sett_core::sync::set_yield(sched::yield_now);
    housekeeping::init().expect("failed to start housekeeping");
    housekeeping::add_repeated(0, 1_000_000, reap_threads_task, 0);
    housekeeping::add_repeated(0, 1_000_000, crate::blockdev::housekeeping_task, 0);

    crate::fs::init(root).expect("failed to mount root filesystem");

    let main_tid = sched::create_kernel_thread(
        Some(alloc::string::String::from("kmain")),
        kernel_main_thread,
        0,
        0,
    )
    .expect("failed to create main kernel thread");
    sched::resume_thread(main_tid).expect("failed to resume main kernel thread");

    let init_pid =
        proc::create(None, "/sbin/init", &["init"]).expect("failed to create init process");
    assert_eq!(init_pid, Pid::INIT, "init must be PID 1");
    proc::start(init_pid, &FlatLoader).expect("failed to start init");

    crate::arch::enable_irq_sources();
    sched::exec()
}

/// Housekeeping task: collect dead threads.
fn reap_threads_task(_taskno: i64, _cookie: usize) {
    sched::collect_dead_threads();
}

/// The main kernel thread: polls for shutdown requests and drives
/// userland teardown.
extern "C" fn kernel_main_thread(_arg: usize) {
    loop {
        let mode = shutdown_mode();
        if mode != 0 {
            kinfo!("shutdown requested (mode {mode})");
            shutdown_userland();
            if mode == 2 {
                crate::arch::reboot();
            }
            crate::arch::poweroff();
        }
        sched::yield_now();
    }
}

/// Terminates every process, init last.
fn shutdown_userland() {
    if let Some(init) = proc::find(Pid::INIT) {
        proc::exit_process(&init, crate::abi::w_exited(0));
    }
    // Give the housekeeper time to drain the process table.
    let mut patience = 1000;
    while proc::count() > 0 && patience > 0 {
        sched::yield_now();
        patience -= 1;
    }
    if proc::count() > 0 {
        kwarn!("{} processes survived shutdown", proc::count());
    }
    if let Err(e) = crate::blockdev::flush_all() {
        kwarn!("block cache flush failed: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shutdown_mode_transitions() {
        assert_eq!(shutdown_mode(), 0);
        request_shutdown(false);
        assert_eq!(shutdown_mode(), 1);
        request_shutdown(true);
        assert_eq!(shutdown_mode(), 2);
        SHUTDOWN_MODE.store(0, core::sync::atomic::Ordering::Release);
    }
}
