//! RISC-V (RV64, S-mode) machine layer.
//!
//! Trap entry/exit stubs, CSR access, the SBI timer and reset calls, and
//! the context restore path. `sscratch` always holds the current
//! [`IsrContext`](crate::isr::IsrContext); `tp` holds the hart id while in
//! kernel mode (set by the boot path before the first trap can occur).

use core::arch::{asm, global_asm};
use core::sync::atomic::{AtomicUsize, Ordering};

use sett_core::clock::Timestamp;

use crate::isr::IsrContext;

/// Timer tick frequency the `time` CSR runs at (QEMU virt and most SBI
/// platforms: 10 MHz).
pub const TIMEBASE_HZ: u64 = 10_000_000;

const SSTATUS_SIE: usize = 1 << 1;
const SSTATUS_SUM: usize = 1 << 18;
const SIE_STIE: usize = 1 << 5;
const SIE_SEIE: usize = 1 << 9;

static CPU_COUNT: AtomicUsize = AtomicUsize::new(1);

/// The current hart id.
#[inline]
pub fn cpu_id() -> usize {
    let id: usize;
    // SAFETY: reading tp has no side effects; the boot path stores the hart
    // id there before any kernel code runs.
    unsafe { asm!("mv {}, tp", out(reg) id, options(nomem, nostack)) };
    id
}

/// Number of harts the scheduler runs on.
pub fn cpu_count() -> usize {
    CPU_COUNT.load(Ordering::Relaxed)
}

/// Records the hart count during boot.
pub fn set_cpu_count(count: usize) {
    CPU_COUNT.store(count.clamp(1, crate::percpu::MAX_CPUS), Ordering::Relaxed);
}

/// Masks interrupts, returning whether they were enabled.
#[inline]
pub fn irq_disable() -> bool {
    let prev: usize;
    // SAFETY: csrrc on sstatus.SIE only masks interrupts.
    unsafe {
        asm!("csrrc {}, sstatus, {}", out(reg) prev, in(reg) SSTATUS_SIE, options(nostack))
    };
    prev & SSTATUS_SIE != 0
}

/// Restores the interrupt-enable state returned by [`irq_disable`].
#[inline]
pub fn irq_restore(was_enabled: bool) {
    if was_enabled {
        irq_enable();
    }
}

/// Unmasks interrupts.
#[inline]
pub fn irq_enable() {
    // SAFETY: csrs on sstatus.SIE only unmasks interrupts.
    unsafe { asm!("csrs sstatus, {}", in(reg) SSTATUS_SIE, options(nostack)) };
}

/// Enables the supervisor timer and external interrupt sources.
pub fn enable_irq_sources() {
    // SAFETY: setting sie bits only unmasks interrupt delivery.
    unsafe { asm!("csrs sie, {}", in(reg) SIE_STIE | SIE_SEIE, options(nostack)) };
}

/// Pointer to the current ISR context (`sscratch`).
#[inline]
pub fn current_isr_ctx() -> *mut IsrContext {
    let ptr: usize;
    // SAFETY: reading sscratch has no side effects.
    unsafe { asm!("csrr {}, sscratch", out(reg) ptr, options(nomem, nostack)) };
    ptr as *mut IsrContext
}

/// Installs `ctx` as the current ISR context.
///
/// # Safety
///
/// `ctx` must point at a live context that stays valid until replaced.
pub unsafe fn set_current_isr_ctx(ctx: *mut IsrContext) {
    // SAFETY: per contract.
    unsafe { asm!("csrw sscratch, {}", in(reg) ctx, options(nostack)) };
}

/// Reads the trap cause register.
#[inline]
pub fn read_scause() -> usize {
    let v: usize;
    // SAFETY: CSR read, no side effects.
    unsafe { asm!("csrr {}, scause", out(reg) v, options(nomem, nostack)) };
    v
}

/// Reads the trap value register (faulting address / instruction bits).
#[inline]
pub fn read_stval() -> usize {
    let v: usize;
    // SAFETY: CSR read, no side effects.
    unsafe { asm!("csrr {}, stval", out(reg) v, options(nomem, nostack)) };
    v
}

/// Briefly opens the supervisor-user-memory window around `f`.
///
/// Required for the kernel to dereference user pointers on targets with
/// page protection active.
pub fn with_user_memory_access<R>(f: impl FnOnce() -> R) -> R {
    // SAFETY: setting and clearing sstatus.SUM around the access.
    unsafe { asm!("csrs sstatus, {}", in(reg) SSTATUS_SUM, options(nostack)) };
    let out = f();
    // SAFETY: as above.
    unsafe { asm!("csrc sstatus, {}", in(reg) SSTATUS_SUM, options(nostack)) };
    out
}

/// Monotonic microseconds from the `time` CSR.
pub fn time_us() -> Timestamp {
    let ticks: u64;
    // SAFETY: CSR read, no side effects.
    unsafe { asm!("csrr {}, time", out(reg) ticks, options(nomem, nostack)) };
    (ticks / (TIMEBASE_HZ / 1_000_000)) as Timestamp
}

/// CPU pause hint for spin loops.
#[inline]
pub fn pause() {
    core::hint::spin_loop();
}

/// Blocks until the next interrupt.
#[inline]
pub fn wait_for_interrupt() {
    // SAFETY: wfi only waits.
    unsafe { asm!("wfi", options(nomem, nostack)) };
}

/// Instruction fence after writing code pages (process start).
pub fn fence_i() {
    // SAFETY: fence.i only synchronizes the instruction stream.
    unsafe { asm!("fence.i", options(nostack)) };
}

// ── SBI calls ───────────────────────────────────────────────────────

const SBI_EXT_TIME: usize = 0x54494D45;
const SBI_EXT_SRST: usize = 0x53525354;

fn sbi_call(ext: usize, func: usize, arg0: usize, arg1: usize) -> isize {
    let error: isize;
    // SAFETY: SBI calls follow the standard calling convention; the firmware
    // owns the side effects.
    unsafe {
        asm!(
            "ecall",
            inlateout("a0") arg0 => error,
            in("a1") arg1,
            in("a6") func,
            in("a7") ext,
            options(nostack)
        );
    }
    error
}

/// Programs the one-shot CPU timer to fire at `at_us` (microseconds).
pub fn set_timer(at_us: Timestamp) {
    let ticks = if at_us >= sett_core::clock::TIMESTAMP_MAX / (TIMEBASE_HZ as Timestamp) {
        u64::MAX
    } else {
        (at_us.max(0) as u64).saturating_mul(TIMEBASE_HZ / 1_000_000)
    };
    sbi_call(SBI_EXT_TIME, 0, ticks as usize, 0);
}

/// Powers the system off through SBI system reset.
pub fn poweroff() -> ! {
    sbi_call(SBI_EXT_SRST, 0, 0, 0);
    halt()
}

/// Reboots the system through SBI system reset.
pub fn reboot() -> ! {
    sbi_call(SBI_EXT_SRST, 0, 1, 0);
    halt()
}

/// Parks the CPU forever.
pub fn halt() -> ! {
    loop {
        irq_disable();
        wait_for_interrupt();
    }
}

// ── Trap entry / context restore ────────────────────────────────────

unsafe extern "C" {
    /// Assembly trap vector; installed into `stvec`.
    pub fn sett_trap_vector();
    /// Restores the context in `a0` and returns to it. Never returns.
    pub fn sett_context_restore(ctx: *mut IsrContext) -> !;
    /// Saves the callee-saved state into `save` (resuming at the return
    /// address) and restores `restore`. Returns when `save` is resumed.
    pub fn sett_context_save_restore(save: *mut IsrContext, restore: *mut IsrContext);
}

/// Installs the trap vector.
pub fn init_traps() {
    // SAFETY: sett_trap_vector is 4-aligned and expects direct mode (low
    // bits zero).
    unsafe {
        asm!("csrw stvec, {}", in(reg) sett_trap_vector as usize, options(nostack));
    }
}

/// Performs the context switch requested on `ctx` (the current ISR
/// context): saves the caller's callee-saved state into `ctx` and restores
/// the switch target. Returns — with interrupts re-enabled by the restore
/// path — when something later switches back to `ctx`. No-op when no
/// switch target was requested.
///
/// # Safety
///
/// `ctx` must be the current ISR context and interrupts must be disabled.
pub unsafe fn context_switch(ctx: *mut IsrContext) {
    // SAFETY: per contract; mirror of the trap-exit path.
    unsafe {
        let Some(target) = (*ctx).take_switch_target() else {
            irq_enable();
            return;
        };
        (*target).cpu = cpu_id() as u32;
        crate::memprotect::install((*target).mem_ctx);
        sett_context_save_restore(ctx, target);
    }
}

// Trap entry: spill the interrupted register file into the context held in
// sscratch, switch to that context's trap stack (user traps only; kernel
// traps keep the interrupted stack), run the Rust handler, and restore
// whichever context it returns.
global_asm!(
    r#"
    .pushsection .text.sett_trap_vector, "ax"
    .global sett_trap_vector
    .global sett_context_restore
    .align 4
sett_trap_vector:
    csrrw x31, sscratch, x31    # x31 = ctx, sscratch = live t6
    sd ra, 8(x31)
    sd sp, 16(x31)
    sd gp, 24(x31)
    sd tp, 32(x31)
    sd t0, 40(x31)
    sd t1, 48(x31)
    sd t2, 56(x31)
    sd s0, 64(x31)
    sd s1, 72(x31)
    sd a0, 80(x31)
    sd a1, 88(x31)
    sd a2, 96(x31)
    sd a3, 104(x31)
    sd a4, 112(x31)
    sd a5, 120(x31)
    sd a6, 128(x31)
    sd a7, 136(x31)
    sd s2, 144(x31)
    sd s3, 152(x31)
    sd s4, 160(x31)
    sd s5, 168(x31)
    sd s6, 176(x31)
    sd s7, 184(x31)
    sd s8, 192(x31)
    sd s9, 200(x31)
    sd s10, 208(x31)
    sd s11, 216(x31)
    sd t3, 224(x31)
    sd t4, 232(x31)
    sd t5, 240(x31)
    csrrw t0, sscratch, x31     # t0 = live t6, sscratch = ctx
    sd t0, 248(x31)
    csrr t0, sepc
    sd t0, 0(x31)

    ld t1, {flags}(x31)
    andi t1, t1, 1
    bnez t1, 1f                 # kernel context: sp and tp are already ours
    ld sp, {trap_sp}(x31)
    lwu tp, {cpu}(x31)
1:
    mv a0, x31
    call sett_trap_handler
                                # a0 = context to restore, fall through

sett_context_restore:
    csrw sscratch, a0
    ld t0, 0(a0)
    csrw sepc, t0
    li t1, {spp}
    ld t0, {flags}(a0)          # bit 0: kernel mode -> sstatus.SPP
    andi t0, t0, 1
    beqz t0, 2f
    csrs sstatus, t1
    j 3f
2:
    csrc sstatus, t1
3:
    li t1, {spie}               # run the target with interrupts enabled
    csrs sstatus, t1
    ld ra, 8(a0)
    ld sp, 16(a0)
    ld gp, 24(a0)
    ld tp, 32(a0)
    ld t0, 40(a0)
    ld t1, 48(a0)
    ld t2, 56(a0)
    ld s0, 64(a0)
    ld s1, 72(a0)
    ld a1, 88(a0)
    ld a2, 96(a0)
    ld a3, 104(a0)
    ld a4, 112(a0)
    ld a5, 120(a0)
    ld a6, 128(a0)
    ld a7, 136(a0)
    ld s2, 144(a0)
    ld s3, 152(a0)
    ld s4, 160(a0)
    ld s5, 168(a0)
    ld s6, 176(a0)
    ld s7, 184(a0)
    ld s8, 192(a0)
    ld s9, 200(a0)
    ld s10, 208(a0)
    ld s11, 216(a0)
    ld t3, 224(a0)
    ld t4, 232(a0)
    ld t5, 240(a0)
    ld t6, 248(a0)
    ld a0, 80(a0)
    sret

    .global sett_context_save_restore
sett_context_save_restore:
    # a0 = context to save into, a1 = context to restore.
    # Only callee-saved state survives a call in the C ABI, so that is all
    # the cooperative path needs to capture; resumption continues at our
    # caller's return address.
    sd ra, 0(a0)
    sd ra, 8(a0)
    sd sp, 16(a0)
    sd gp, 24(a0)
    sd tp, 32(a0)
    sd s0, 64(a0)
    sd s1, 72(a0)
    sd s2, 144(a0)
    sd s3, 152(a0)
    sd s4, 160(a0)
    sd s5, 168(a0)
    sd s6, 176(a0)
    sd s7, 184(a0)
    sd s8, 192(a0)
    sd s9, 200(a0)
    sd s10, 208(a0)
    sd s11, 216(a0)
    mv a0, a1
    j sett_context_restore
    .popsection
    "#,
    trap_sp = const 264,
    cpu = const 292,
    flags = const 256,
    spp = const 0x100,
    spie = const 0x20,
);
