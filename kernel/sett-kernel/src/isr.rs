//! ISR contexts and trap dispatch.
//!
//! Each CPU's scratch register points at the *current ISR context*: the
//! register save area traps spill into, plus the bookkeeping the trap exit
//! consults — a switch-target pointer, the privilege flag, the protection
//! context to install, and the kernel stack to run the handler on.
//!
//! The classification of a trap (interrupt, syscall, user fault mapped to a
//! signal, kernel fault) is a pure function here; the machine-level entry
//! and exit stubs live in `arch`.

use crate::abi::sig;
use crate::arch::regs::RegisterFile;

/// ISR context flag: the context runs in kernel (supervisor) mode.
pub const CTX_KERNEL: usize = 1 << 0;

/// Per-thread (and per-CPU-idle) register save area and trap bookkeeping.
///
/// `repr(C)`: the assembly stubs address `regs`, `flags`, and `trap_sp` by
/// fixed offsets. Pointer-valued fields are stored as `usize` (0 = none) so
/// contexts can sit in statics and cross-thread structures.
#[repr(C)]
#[derive(Debug, Clone)]
pub struct IsrContext {
    /// Saved register file. Must stay at offset 0.
    pub regs: RegisterFile,
    /// Context flags (`CTX_KERNEL`).
    pub flags: usize,
    /// Stack the trap handler runs on when this context is interrupted.
    pub trap_sp: usize,
    /// Address of the [`IsrContext`] to install at trap exit; 0 = stay.
    pub next: usize,
    /// Address of the owning process's memory-protection context; 0 = none.
    pub mem_ctx: usize,
    /// Owning thread id; 0 for pre-thread boot contexts.
    pub tid: u32,
    /// CPU this context was last installed on.
    pub cpu: u32,
}

impl IsrContext {
    /// A zeroed user-mode context.
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            regs: RegisterFile::zeroed(),
            flags: 0,
            trap_sp: 0,
            next: 0,
            mem_ctx: 0,
            tid: 0,
            cpu: 0,
        }
    }

    /// A zeroed kernel-mode context.
    #[must_use]
    pub const fn zeroed_kernel() -> Self {
        let mut ctx = Self::zeroed();
        ctx.flags = CTX_KERNEL;
        ctx
    }

    /// Whether this context runs in kernel mode.
    #[must_use]
    pub fn is_kernel(&self) -> bool {
        self.flags & CTX_KERNEL != 0
    }

    /// Requests that the trap exit installs `target` instead of returning
    /// to this context.
    pub fn set_switch_target(&mut self, target: *mut IsrContext) {
        self.next = target as usize;
    }

    /// Takes the pending switch target, if any.
    pub fn take_switch_target(&mut self) -> Option<*mut IsrContext> {
        let next = core::mem::replace(&mut self.next, 0);
        (next != 0).then_some(next as *mut IsrContext)
    }
}

// Assembly offset contract.
#[cfg(target_pointer_width = "64")]
const _: () = {
    assert!(core::mem::offset_of!(IsrContext, regs) == 0);
    assert!(core::mem::offset_of!(IsrContext, flags) == 256);
    assert!(core::mem::offset_of!(IsrContext, trap_sp) == 264);
    assert!(core::mem::offset_of!(IsrContext, cpu) == 292);
};

// ── External interrupt dispatch ─────────────────────────────────────

/// Signature of a registered external-interrupt handler.
pub type IrqHandler = fn(usize);

static IRQ_HANDLER: core::sync::atomic::AtomicPtr<()> =
    core::sync::atomic::AtomicPtr::new(core::ptr::null_mut());

/// Registers the platform interrupt-controller dispatch function.
///
/// The trap pipeline forwards every external interrupt to it; claiming and
/// acknowledging individual sources is the controller driver's business.
pub fn set_irq_handler(handler: IrqHandler) {
    IRQ_HANDLER.store(handler as *mut (), core::sync::atomic::Ordering::Release);
}

/// Forwards an external interrupt to the registered controller handler.
pub fn dispatch_external_irq(code: usize) {
    let ptr = IRQ_HANDLER.load(core::sync::atomic::Ordering::Acquire);
    if ptr.is_null() {
        sett_core::kwarn!("unhandled external interrupt {code}");
        return;
    }
    // SAFETY: only valid `IrqHandler` pointers are stored.
    let handler: IrqHandler = unsafe { core::mem::transmute(ptr) };
    handler(code);
}

// ── Trap classification ─────────────────────────────────────────────

/// Interrupt cause codes (scause with the interrupt bit set).
pub const IRQ_SOFTWARE: usize = 1;
/// Supervisor timer interrupt.
pub const IRQ_TIMER: usize = 5;
/// Supervisor external interrupt.
pub const IRQ_EXTERNAL: usize = 9;

const EXC_INSN_MISALIGNED: usize = 0;
const EXC_INSN_ACCESS: usize = 1;
const EXC_ILLEGAL: usize = 2;
const EXC_BREAKPOINT: usize = 3;
const EXC_LOAD_MISALIGNED: usize = 4;
const EXC_LOAD_ACCESS: usize = 5;
const EXC_STORE_MISALIGNED: usize = 6;
const EXC_STORE_ACCESS: usize = 7;
const EXC_ECALL_U: usize = 8;
const EXC_INSN_PAGE: usize = 12;
const EXC_LOAD_PAGE: usize = 13;
const EXC_STORE_PAGE: usize = 15;

/// Names for the exception codes, for diagnostics.
pub const TRAP_NAMES: [&str; 16] = [
    "Instruction address misaligned",
    "Instruction access fault",
    "Illegal instruction",
    "Breakpoint",
    "Load address misaligned",
    "Load access fault",
    "Store address misaligned",
    "Store access fault",
    "ECALL from U-mode",
    "ECALL from S-mode",
    "Reserved",
    "ECALL from M-mode",
    "Instruction page fault",
    "Load page fault",
    "Reserved",
    "Store page fault",
];

/// What the trap pipeline should do with a trap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapDecision {
    /// Hardware interrupt with the given cause code.
    Interrupt(usize),
    /// Environment call from user mode.
    Syscall,
    /// Exception in user mode, converted to the given signal.
    UserFault(u8),
    /// Exception in kernel mode: dump and halt.
    KernelFault,
}

/// Classifies a trap from its cause and originating privilege level.
#[must_use]
pub fn decide_trap(scause: usize, from_kernel: bool) -> TrapDecision {
    const INTERRUPT_BIT: usize = 1 << (usize::BITS - 1);
    if scause & INTERRUPT_BIT != 0 {
        return TrapDecision::Interrupt(scause & !INTERRUPT_BIT);
    }
    if scause == EXC_ECALL_U && !from_kernel {
        return TrapDecision::Syscall;
    }
    if from_kernel {
        return TrapDecision::KernelFault;
    }
    let signum = match scause {
        EXC_INSN_ACCESS | EXC_LOAD_ACCESS | EXC_STORE_ACCESS | EXC_INSN_PAGE | EXC_LOAD_PAGE
        | EXC_STORE_PAGE => sig::SIGSEGV,
        EXC_ILLEGAL => sig::SIGILL,
        EXC_BREAKPOINT => sig::SIGTRAP,
        EXC_INSN_MISALIGNED | EXC_LOAD_MISALIGNED | EXC_STORE_MISALIGNED => sig::SIGBUS,
        _ => sig::SIGILL,
    };
    TrapDecision::UserFault(signum)
}

// ── Runtime trap handler ────────────────────────────────────────────

/// Nested-trap counter per CPU; three nested traps halt immediately.
#[cfg(target_os = "none")]
static TRAP_DEPTH: crate::percpu::CpuLocal<core::sync::atomic::AtomicU32> =
    crate::percpu::CpuLocal::new([const { core::sync::atomic::AtomicU32::new(0) }; crate::percpu::MAX_CPUS]);

/// Rust half of the trap vector.
///
/// Called by the assembly entry with the just-saved context; returns the
/// context the exit stub must restore. Interrupts stay disabled for the
/// whole call, so setting the switch target and restoring registers is one
/// atomic step as observed by other traps.
#[cfg(target_os = "none")]
#[unsafe(no_mangle)]
extern "C" fn sett_trap_handler(ctx: *mut IsrContext) -> *mut IsrContext {
    use core::sync::atomic::Ordering;

    let scause = crate::arch::read_scause();
    // SAFETY: the entry stub hands us the current context; we are the only
    // accessor while interrupts are off. The borrow is not held across the
    // dispatch calls, which reach the same context through `sscratch`.
    let from_kernel = unsafe { (*ctx).is_kernel() };
    let depth = TRAP_DEPTH.get().fetch_add(1, Ordering::Relaxed) + 1;

    match decide_trap(scause, from_kernel) {
        TrapDecision::Interrupt(IRQ_TIMER) => crate::time::on_timer_isr(),
        TrapDecision::Interrupt(code) => dispatch_external_irq(code),
        TrapDecision::Syscall => crate::sched::raise_syscall_from_isr(),
        TrapDecision::UserFault(signum) => {
            crate::proc::signal::raise_fault_from_isr(signum);
        }
        TrapDecision::KernelFault => {
            // SAFETY: as above; the fault path never returns.
            kernel_fault(unsafe { &*ctx }, scause, depth);
        }
    }

    TRAP_DEPTH.get().fetch_sub(1, Ordering::Relaxed);

    // Install the requested switch target, if any.
    // SAFETY: as above; switch targets are live thread contexts.
    match unsafe { (*ctx).take_switch_target() } {
        Some(target) => unsafe {
            (*target).cpu = crate::arch::cpu_id() as u32;
            crate::memprotect::install((*target).mem_ctx);
            target
        },
        None => ctx,
    }
}

/// Unrecoverable kernel-mode exception: dump state and halt.
#[cfg(target_os = "none")]
fn kernel_fault(ctx: &IsrContext, scause: usize, depth: u32) -> ! {
    use sett_core::{kfatal, kprintln};

    if depth >= 3 {
        kprintln!("**** TRIPLE FAULT ****");
        crate::arch::poweroff();
    }
    if depth == 2 {
        kprintln!("**** DOUBLE FAULT ****");
    }
    let name = TRAP_NAMES.get(scause).copied().unwrap_or("Unknown trap");
    let stval = crate::arch::read_stval();
    kfatal!(
        "{} at PC {:#x} (stval {:#x}) on CPU{}",
        name,
        ctx.regs.pc,
        stval,
        crate::arch::cpu_id()
    );
    crate::diag::dump_registers(&ctx.regs);
    crate::diag::backtrace_from(ctx.regs.s0);
    crate::arch::poweroff();
}

#[cfg(test)]
mod tests {
    use super::*;

    const INT: usize = 1 << (usize::BITS - 1);

    #[test]
    fn interrupts_decode() {
        assert_eq!(decide_trap(INT | 5, false), TrapDecision::Interrupt(5));
        assert_eq!(decide_trap(INT | 9, true), TrapDecision::Interrupt(9));
    }

    #[test]
    fn user_ecall_is_syscall_kernel_ecall_is_fault() {
        assert_eq!(decide_trap(8, false), TrapDecision::Syscall);
        assert_eq!(decide_trap(8, true), TrapDecision::KernelFault);
    }

    #[test]
    fn user_faults_map_to_signals() {
        assert_eq!(decide_trap(13, false), TrapDecision::UserFault(sig::SIGSEGV));
        assert_eq!(decide_trap(15, false), TrapDecision::UserFault(sig::SIGSEGV));
        assert_eq!(decide_trap(2, false), TrapDecision::UserFault(sig::SIGILL));
        assert_eq!(decide_trap(3, false), TrapDecision::UserFault(sig::SIGTRAP));
        assert_eq!(decide_trap(4, false), TrapDecision::UserFault(sig::SIGBUS));
    }

    #[test]
    fn kernel_exceptions_are_fatal() {
        assert_eq!(decide_trap(13, true), TrapDecision::KernelFault);
        assert_eq!(decide_trap(2, true), TrapDecision::KernelFault);
    }

    #[test]
    fn switch_target_handoff() {
        let mut ctx = IsrContext::zeroed_kernel();
        assert!(ctx.take_switch_target().is_none());
        let mut other = IsrContext::zeroed();
        ctx.set_switch_target(&mut other);
        assert_eq!(
            ctx.take_switch_target().unwrap(),
            core::ptr::addr_of_mut!(other)
        );
        assert!(ctx.take_switch_target().is_none());
    }
}
