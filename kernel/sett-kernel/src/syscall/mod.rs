//! Syscall entry and dispatch.
//!
//! A user-mode ecall is rerouted by the trap pipeline into the calling
//! thread's kernel context, entering at [`syscall_entry`] with the user's
//! `a0..a7` intact. The dispatcher routes by number; handlers run on the
//! thread's kernel stack and finish through [`syscall_return`], which
//! writes the return value into the saved user register file, advances the
//! PC past the ecall, and lowers back to user mode.

mod fs_calls;
mod proc_calls;
mod thread_calls;

use crate::abi::{Syscall, sig};
use crate::proc;
use crate::sched;

/// Arguments a syscall receives (`a0..a6`).
pub type SyscallArgs = [usize; 7];

/// Kernel-context syscall entry point.
///
/// The RISC-V C ABI places the eight argument registers exactly where the
/// raise path copied the user's `a0..a7`, so the signature matches the
/// machine state.
#[allow(clippy::too_many_arguments, reason = "mirrors the register file")]
pub extern "C" fn syscall_entry(
    a0: usize,
    a1: usize,
    a2: usize,
    a3: usize,
    a4: usize,
    a5: usize,
    a6: usize,
    nr: usize,
) {
    let ret = dispatch(nr, [a0, a1, a2, a3, a4, a5, a6]);
    syscall_return(ret);
}

/// Routes a syscall to its handler. Unknown numbers deliver SIGSYS.
pub fn dispatch(nr: usize, args: SyscallArgs) -> i64 {
    let Some(call) = Syscall::from_raw(nr) else {
        return unknown_syscall();
    };
    match call {
        Syscall::ThreadYield => thread_calls::sys_yield(),
        Syscall::ThreadCreate => thread_calls::sys_create(args[0], args[1], args[2]),
        Syscall::ThreadSuspend => thread_calls::sys_suspend(args[0]),
        Syscall::ThreadResume => thread_calls::sys_resume(args[0]),
        Syscall::ThreadDetach => thread_calls::sys_detach(args[0]),
        Syscall::ThreadExit => thread_calls::sys_exit(args[0]),

        Syscall::SelfExit => proc_calls::sys_self_exit(args[0]),
        Syscall::SelfSigret => proc_calls::sys_sigret(),
        Syscall::SelfSetSighandler => proc_calls::sys_set_sighandler(args[0], args[1]),
        Syscall::SelfWaitpid => proc_calls::sys_waitpid(args[0], args[1]),

        Syscall::FsOpen => fs_calls::sys_open(args[0], args[1], args[2]),
        Syscall::FsClose => fs_calls::sys_close(args[0]),
        Syscall::FsRead => fs_calls::sys_read(args[0], args[1], args[2]),
        Syscall::FsWrite => fs_calls::sys_write(args[0], args[1], args[2]),
        Syscall::FsGetdents => fs_calls::sys_getdents(args[0], args[1], args[2]),

        Syscall::ProcCreate => proc_calls::sys_pcreate(args[0], args[1], args[2]),
        Syscall::ProcStart => proc_calls::sys_pstart(args[0]),
        Syscall::ProcSendSignal => proc_calls::sys_sendsig(args[0], args[1]),

        Syscall::TempWrite => fs_calls::sys_temp_write(args[0], args[1]),
        Syscall::Shutdown => proc_calls::sys_shutdown(args[0]),
    }
}

/// SIGSYS delivery for an unrecognized syscall number.
///
/// The saved PC is advanced first so a caught SIGSYS resumes after the
/// offending ecall instead of looping on it.
fn unknown_syscall() -> i64 {
    if let Some(thread) = sched::current_thread() {
        // SAFETY: own thread, running in its kernel context.
        unsafe { thread.with_user_ctx(|ctx| ctx.regs.advance_pc()) };
    }
    proc::signal::deliver_sync(sig::SIGSYS);
}

/// Finishes a syscall: writes `value` into the user context and lowers to
/// user mode. Never returns.
pub fn syscall_return(value: i64) -> ! {
    let thread = sched::current_thread().expect("syscall return without current thread");
    // SAFETY: own thread, running in its kernel context.
    unsafe {
        thread.with_user_ctx(|ctx| {
            ctx.regs.set_syscall_ret(value);
            ctx.regs.advance_pc();
        });
    }
    sched::lower_to_user();
}

/// Maps a handler result onto the syscall return convention: payload for
/// success, negative cause for failure.
fn ret(result: sett_core::Result<i64>) -> i64 {
    match result {
        Ok(v) => v,
        Err(e) => e.as_syscall_ret() as i64,
    }
}

/// Boolean syscall convention: 1 on success, negative cause on failure.
fn ret_bool(result: sett_core::Result<()>) -> i64 {
    ret(result.map(|()| 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_reaches_handlers_without_context() {
        // Without a current thread or process, handlers fail cleanly with
        // negative causes instead of panicking.
        let no_proc = dispatch(Syscall::SelfWaitpid as usize, [0; 7]);
        assert!(no_proc < 0);
        let bad_fd = dispatch(Syscall::FsClose as usize, [42, 0, 0, 0, 0, 0, 0]);
        assert!(bad_fd < 0);
    }

    #[test]
    fn thread_calls_reject_unknown_tids() {
        let r = dispatch(Syscall::ThreadSuspend as usize, [99_999, 0, 0, 0, 0, 0, 0]);
        assert_eq!(r, sett_core::Cause::NotFound.as_syscall_ret() as i64);
        let r = dispatch(Syscall::ThreadResume as usize, [99_999, 0, 0, 0, 0, 0, 0]);
        assert_eq!(r, sett_core::Cause::NotFound.as_syscall_ret() as i64);
    }
}
