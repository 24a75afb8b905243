//! Signal raising and delivery.
//!
//! Raising appends to the process's pending FIFO and sets `SIGPEND`; the
//! scheduler reroutes the next return to user mode through
//! [`signal_dispatch_entry`], which pops one signal and either terminates
//! the process (default-kill), discards (ignored), or enters the user
//! handler after pushing a register-save frame onto the user stack. The
//! trampoline installed by the user runtime returns through the
//! `SELF_SIGRET` syscall, which restores the frame.
//!
//! Hardware faults deliver synchronously through
//! [`raise_fault_from_isr`]; a fault while already inside a handler
//! terminates the process with the new signal.

use alloc::sync::Arc;

use sett_core::id::Pid;
use sett_core::{Cause, Error, Location, Result, kerr};
use sett_mm::memmap::Access;

use super::{ProcFlags, Process, SigDisposition};
use crate::abi::{SIG_COUNT, SIG_NAMES, sig, sig_default_kills, w_signalled};
use crate::sched::{self, thread::ThreadFlags};

/// Words in the user-stack register-save frame.
pub const FRAME_WORDS: usize = 20;

const FRAME_BYTES: usize = FRAME_WORDS * core::mem::size_of::<usize>();

fn proc_err(cause: Cause) -> Error {
    Error::new(Location::Process, cause)
}

/// Queues `signum` on `process`.
pub fn raise(process: &Arc<Process>, signum: u8) -> Result<()> {
    if signum == 0 || signum as usize >= SIG_COUNT {
        return Err(proc_err(Cause::Param));
    }
    process.with_inner(|inner| inner.sigpending.push_back(signum))?;
    process.set_flags(ProcFlags::SIGPEND);
    Ok(())
}

/// Queues `signum` on the process with the given PID.
pub fn raise_to(pid: Pid, signum: u8) -> Result<()> {
    let process = super::find(pid).ok_or(proc_err(Cause::NotFound))?;
    raise(&process, signum)
}

/// Pops the next pending signal, clearing `SIGPEND` on the last one.
fn pop_pending(process: &Arc<Process>) -> Option<u8> {
    process
        .with_inner(|inner| {
            let signum = inner.sigpending.pop_front();
            if inner.sigpending.is_empty() {
                process.clear_flags(ProcFlags::SIGPEND);
            }
            signum
        })
        .ok()
        .flatten()
}

/// Kernel-context entry the scheduler reroutes user returns through while
/// `SIGPEND` is set. Pops and delivers one signal, then lowers to user.
pub extern "C" fn signal_dispatch_entry(_unused: usize) {
    if let Some(process) = super::current() {
        run_one_pending(&process);
    }
    sched::lower_to_user();
}

/// Pops and delivers one pending signal, if any. Called from the thread's
/// own kernel context.
pub fn run_one_pending(process: &Arc<Process>) {
    if let Some(signum) = pop_pending(process) {
        run_sighandler(process, signum);
    }
}

/// Kernel-context entry for synchronous fault signals.
pub extern "C" fn fault_dispatch_entry(signum: usize) {
    deliver_sync(signum as u8);
}

/// Delivers a signal synchronously from the current thread's kernel
/// context, then lowers to user mode (or parks the thread if delivery
/// killed the process). Never returns.
pub fn deliver_sync(signum: u8) -> ! {
    if let Some(process) = super::current() {
        let in_handler = sched::current_thread()
            .is_some_and(|t| t.has_flags(ThreadFlags::SIGHANDLER));
        if in_handler {
            // Nested signals are not supported: the process dies with the
            // new signal number.
            kerr!(
                "process {} received {} inside a signal handler",
                process.pid,
                signal_name(signum)
            );
            fatal_signal(&process, signum);
        } else {
            run_sighandler(&process, signum);
        }
    }
    sched::lower_to_user();
}

/// From the trap pipeline: converts a user-mode fault into a signal
/// delivered before the thread can return to user code.
pub fn raise_fault_from_isr(signum: u8) {
    sched::raise_kernel_entry_from_isr(fault_dispatch_entry as usize, signum as usize);
}

fn signal_name(signum: u8) -> &'static str {
    SIG_NAMES.get(signum as usize).copied().unwrap_or("SIG?")
}

/// Applies the process's disposition for one signal.
fn run_sighandler(process: &Arc<Process>, signum: u8) {
    let disposition = process
        .with_inner_shared(|inner| inner.sighandlers[signum as usize])
        .unwrap_or_default();
    match disposition {
        SigDisposition::Default if sig_default_kills(signum) => {
            kerr!("process {} received {}", process.pid, signal_name(signum));
            fatal_signal(process, signum);
        }
        SigDisposition::Default | SigDisposition::Ignore => {}
        SigDisposition::Handler(handler) => {
            let trampoline = process
                .with_inner_shared(|inner| match inner.sighandlers[0] {
                    SigDisposition::Handler(addr) => addr,
                    _ => 0,
                })
                .unwrap_or(0);
            if !signal_enter(process, handler, trampoline, signum) {
                // Could not push the frame (stack gone): the signal is
                // fatal after all.
                kerr!(
                    "process {}: no stack for {} handler",
                    process.pid,
                    signal_name(signum)
                );
                fatal_signal(process, signum);
            }
        }
    }
}

/// Logs diagnostics and terminates the process with `W_SIGNALLED(signum)`.
fn fatal_signal(process: &Arc<Process>, signum: u8) {
    if let Some(thread) = sched::current_thread() {
        // SAFETY: our own thread's context, not installed anywhere else
        // while we run in its kernel context.
        let regs = unsafe { thread.with_user_ctx(|ctx| ctx.regs.clone()) };
        crate::diag::dump_registers(&regs);
        crate::diag::backtrace_from(regs.s0);
    }
    super::exit_process(process, w_signalled(signum));
}

/// Saved-register layout within the signal frame: indices into the
/// 20-word region, matching the userland trampoline contract.
mod frame {
    pub const T0: usize = 0;
    pub const T1: usize = 1;
    pub const T2: usize = 2;
    pub const A0: usize = 3;
    pub const A1: usize = 4;
    pub const A2: usize = 5;
    pub const A3: usize = 6;
    pub const A4: usize = 7;
    pub const A5: usize = 8;
    pub const A6: usize = 9;
    pub const A7: usize = 10;
    pub const T3: usize = 11;
    pub const T4: usize = 12;
    pub const T5: usize = 13;
    pub const T6: usize = 14;
    pub const PC: usize = 17;
    pub const S0: usize = 18;
    pub const RA: usize = 19;
}

/// Pushes the register-save frame and redirects the user context into
/// `handler` with `a0 = signum` and `ra` pointing at the trampoline.
///
/// Returns false (with the context untouched) if the process does not own
/// enough writable stack.
pub fn signal_enter(
    process: &Arc<Process>,
    handler: usize,
    trampoline: usize,
    signum: u8,
) -> bool {
    let Some(thread) = sched::current_thread() else {
        return false;
    };

    // SAFETY: the thread runs in its kernel context; its user context is
    // only touched by us.
    let entered = unsafe {
        thread.with_user_ctx(|ctx| {
            let Some(sp) = ctx.regs.sp.checked_sub(FRAME_BYTES) else {
                return false;
            };
            if !process
                .map_contains(sp, FRAME_BYTES)
                .contains(Access::RW | Access::FOUND)
            {
                return false;
            }

            let mut words = [0usize; FRAME_WORDS];
            words[frame::T0] = ctx.regs.t0;
            words[frame::T1] = ctx.regs.t1;
            words[frame::T2] = ctx.regs.t2;
            words[frame::A0] = ctx.regs.a0;
            words[frame::A1] = ctx.regs.a1;
            words[frame::A2] = ctx.regs.a2;
            words[frame::A3] = ctx.regs.a3;
            words[frame::A4] = ctx.regs.a4;
            words[frame::A5] = ctx.regs.a5;
            words[frame::A6] = ctx.regs.a6;
            words[frame::A7] = ctx.regs.a7;
            words[frame::T3] = ctx.regs.t3;
            words[frame::T4] = ctx.regs.t4;
            words[frame::T5] = ctx.regs.t5;
            words[frame::T6] = ctx.regs.t6;
            words[frame::PC] = ctx.regs.pc;
            words[frame::S0] = ctx.regs.s0;
            words[frame::RA] = ctx.regs.ra;

            // SAFETY: `words` is a live array; viewing it as bytes is fine.
            let bytes = unsafe {
                core::slice::from_raw_parts(words.as_ptr().cast::<u8>(), FRAME_BYTES)
            };
            if !super::usercopy::copy_to_user(process, sp, bytes) {
                return false;
            }

            ctx.regs.sp = sp;
            ctx.regs.s0 = sp + FRAME_BYTES;
            ctx.regs.ra = trampoline;
            ctx.regs.pc = handler;
            ctx.regs.a0 = signum as usize;
            true
        })
    };
    if entered {
        thread.set_flags(ThreadFlags::SIGHANDLER);
    }
    entered
}

/// Restores the register-save frame after the trampoline returns
/// (`SELF_SIGRET`).
///
/// Returns false if the frame is no longer accessible, in which case the
/// process cannot be resumed.
pub fn signal_exit(process: &Arc<Process>) -> bool {
    let Some(thread) = sched::current_thread() else {
        return false;
    };
    thread.clear_flags(ThreadFlags::SIGHANDLER);

    // SAFETY: as in `signal_enter`.
    unsafe {
        thread.with_user_ctx(|ctx| {
            let sp = ctx.regs.sp;
            let mut words = [0usize; FRAME_WORDS];
            {
                // SAFETY: `words` is a live array; viewing it as bytes is
                // fine.
                let bytes = unsafe {
                    core::slice::from_raw_parts_mut(words.as_mut_ptr().cast::<u8>(), FRAME_BYTES)
                };
                if !super::usercopy::copy_from_user(process, bytes, sp) {
                    return false;
                }
            }

            ctx.regs.t0 = words[frame::T0];
            ctx.regs.t1 = words[frame::T1];
            ctx.regs.t2 = words[frame::T2];
            ctx.regs.a0 = words[frame::A0];
            ctx.regs.a1 = words[frame::A1];
            ctx.regs.a2 = words[frame::A2];
            ctx.regs.a3 = words[frame::A3];
            ctx.regs.a4 = words[frame::A4];
            ctx.regs.a5 = words[frame::A5];
            ctx.regs.a6 = words[frame::A6];
            ctx.regs.a7 = words[frame::A7];
            ctx.regs.t3 = words[frame::T3];
            ctx.regs.t4 = words[frame::T4];
            ctx.regs.t5 = words[frame::T5];
            ctx.regs.t6 = words[frame::T6];
            ctx.regs.pc = words[frame::PC];
            ctx.regs.s0 = words[frame::S0];
            ctx.regs.ra = words[frame::RA];
            ctx.regs.sp = sp + FRAME_BYTES;
            true
        })
    }
}

/// Installs a new disposition for `signum`, returning the previous one.
/// Slot 0 registers the trampoline address.
pub fn set_handler(
    process: &Arc<Process>,
    signum: u8,
    disposition: SigDisposition,
) -> Result<SigDisposition> {
    if signum as usize >= SIG_COUNT {
        return Err(proc_err(Cause::Param));
    }
    if signum == sig::SIGKILL || signum == sig::SIGSTOP {
        return Err(proc_err(Cause::Illegal));
    }
    process.with_inner(|inner| {
        core::mem::replace(&mut inner.sighandlers[signum as usize], disposition)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi;
    use crate::proc::tests::{PROC_TEST_LOCK, init_test_heap};
    use crate::proc::{create, delete, find};

    #[test]
    fn raising_queues_and_sets_sigpend() {
        let _guard = PROC_TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        init_test_heap();
        let pid = create(None, "/sbin/sig", &[]).unwrap();
        let p = find(pid).unwrap();

        raise(&p, sig::SIGUSR1).unwrap();
        raise(&p, sig::SIGTERM).unwrap();
        assert!(p.flags().contains(ProcFlags::SIGPEND));
        assert!(crate::proc::signals_pending(pid));

        // FIFO order, SIGPEND clears with the last one.
        assert_eq!(pop_pending(&p), Some(sig::SIGUSR1));
        assert!(p.flags().contains(ProcFlags::SIGPEND));
        assert_eq!(pop_pending(&p), Some(sig::SIGTERM));
        assert!(!p.flags().contains(ProcFlags::SIGPEND));
        assert_eq!(pop_pending(&p), None);
        delete(pid);
    }

    #[test]
    fn invalid_signals_rejected() {
        let _guard = PROC_TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        init_test_heap();
        let pid = create(None, "/sbin/sig2", &[]).unwrap();
        let p = find(pid).unwrap();
        assert_eq!(raise(&p, 0).unwrap_err().cause, Cause::Param);
        assert_eq!(raise(&p, 32).unwrap_err().cause, Cause::Param);
        assert_eq!(
            raise_to(Pid::new(9999), sig::SIGTERM).unwrap_err().cause,
            Cause::NotFound
        );
        delete(pid);
    }

    #[test]
    fn handler_table_updates_and_protects_kill_stop() {
        let _guard = PROC_TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        init_test_heap();
        let pid = create(None, "/sbin/sig3", &[]).unwrap();
        let p = find(pid).unwrap();

        let prev = set_handler(&p, sig::SIGUSR1, SigDisposition::Handler(0x1234)).unwrap();
        assert_eq!(prev, SigDisposition::Default);
        let prev = set_handler(&p, sig::SIGUSR1, SigDisposition::Ignore).unwrap();
        assert_eq!(prev, SigDisposition::Handler(0x1234));

        assert_eq!(
            set_handler(&p, sig::SIGKILL, SigDisposition::Ignore)
                .unwrap_err()
                .cause,
            Cause::Illegal
        );
        assert_eq!(
            set_handler(&p, 40, SigDisposition::Ignore).unwrap_err().cause,
            Cause::Param
        );

        // Slot 0 takes the trampoline.
        set_handler(&p, 0, SigDisposition::Handler(0x7000)).unwrap();
        delete(pid);
    }

    #[test]
    fn wait_status_for_signal_death_matches_abi() {
        // The fatal path encodes W_SIGNALLED; spot-check the encoding the
        // parent will observe for an uncaught SIGSYS.
        let status = abi::w_signalled(sig::SIGSYS);
        assert!(abi::wifsignaled(status));
        assert!(!abi::wifexited(status));
    }
}
