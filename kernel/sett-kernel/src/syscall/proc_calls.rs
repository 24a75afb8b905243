//! Process-management syscalls.

use alloc::vec::Vec;

use sett_core::id::Pid;
use sett_core::{Cause, Error, Location, Result};

use super::{ret, ret_bool};
use crate::abi::{self, WNOHANG};
use crate::proc::{self, SigDisposition, loader::FlatLoader, signal, usercopy};
use crate::sched;

const PATH_MAX: usize = 512;
const ARG_MAX: usize = 16;
const ARG_LEN_MAX: usize = 256;

fn current_proc() -> Result<alloc::sync::Arc<proc::Process>> {
    proc::current().ok_or(Error::new(Location::Process, Cause::State))
}

/// `SELF_EXIT(code)`: phase-1 process exit; parks the calling thread.
pub fn sys_self_exit(code: usize) -> i64 {
    proc::exit_self(abi::w_exited(code as i32));
    // Returning to user mode is refused for an exiting process; the
    // scheduler parks this thread on the way down.
    sched::lower_to_user();
}

/// `SELF_SIGRET`: return from a signal handler via the trampoline.
pub fn sys_sigret() -> i64 {
    match current_proc() {
        Ok(process) => {
            if !signal::signal_exit(&process) {
                // The frame is gone; the process corrupted its stack.
                proc::exit_process(&process, abi::w_signalled(abi::sig::SIGSEGV));
            }
            sched::lower_to_user();
        }
        Err(e) => e.as_syscall_ret() as i64,
    }
}

/// `SELF_SETSIGHANDLER(signum, handler)`: install a disposition, returning
/// the previous one. 0 = default, 1 = ignore, otherwise a handler address.
/// Slot 0 registers the sigreturn trampoline.
pub fn sys_set_sighandler(signum: usize, handler: usize) -> i64 {
    ret(current_proc().and_then(|process| {
        let disposition = match handler {
            0 => SigDisposition::Default,
            1 => SigDisposition::Ignore,
            addr => SigDisposition::Handler(addr),
        };
        let prev = signal::set_handler(&process, signum as u8, disposition)?;
        Ok(match prev {
            SigDisposition::Default => 0,
            SigDisposition::Ignore => 1,
            SigDisposition::Handler(addr) => addr as i64,
        })
    }))
}

/// `SELF_WAITPID(pid, flags)`: collect a child's exit status.
///
/// Returns `(child_pid << 32) | status`. Blocks (by yielding) unless
/// `WNOHANG`, which returns 0 when nothing changed state yet.
pub fn sys_waitpid(pid: usize, flags: usize) -> i64 {
    let which = pid as i64 as i32;
    let parent = match current_proc() {
        Ok(p) => p.pid,
        Err(e) => return e.as_syscall_ret() as i64,
    };
    loop {
        match proc::waitpid(parent, which) {
            Ok((child, status)) => {
                return (i64::from(child.as_u32()) << 32) | i64::from(status as u32);
            }
            Err(e) if e.cause == Cause::State => {
                if flags as u32 & WNOHANG != 0 {
                    return 0;
                }
                sched::yield_now();
            }
            Err(e) => return e.as_syscall_ret() as i64,
        }
    }
}

/// `PROC_PCREATE(binary, argc, argv)`: create a child in the PRESTART
/// state, returning its PID.
pub fn sys_pcreate(binary_ptr: usize, argc: usize, argv_ptr: usize) -> i64 {
    ret(current_proc().and_then(|process| {
        let binary = usercopy::str_from_user(&process, binary_ptr, PATH_MAX)
            .ok_or(Error::new(Location::Process, Cause::Param))?;
        if argc > ARG_MAX {
            return Err(Error::new(Location::Process, Cause::Range));
        }

        // argv is an array of user pointers to NUL-terminated strings.
        let mut args = Vec::with_capacity(argc);
        if argc > 0 {
            let mut ptr_bytes = alloc::vec![0u8; argc * core::mem::size_of::<usize>()];
            if !usercopy::copy_from_user(&process, &mut ptr_bytes, argv_ptr) {
                return Err(Error::new(Location::Process, Cause::Param));
            }
            for chunk in ptr_bytes.chunks_exact(core::mem::size_of::<usize>()) {
                let user_str = usize::from_le_bytes(chunk.try_into().expect("exact chunk"));
                let arg = usercopy::str_from_user(&process, user_str, ARG_LEN_MAX)
                    .ok_or(Error::new(Location::Process, Cause::Param))?;
                args.push(arg);
            }
        }
        let arg_refs: Vec<&str> = args.iter().map(alloc::string::String::as_str).collect();
        let pid = proc::create(Some(process.pid), &binary, &arg_refs)?;
        Ok(i64::from(pid.as_u32()))
    }))
}

/// `PROC_PSTART(pid)`: load and start a PRESTART child.
pub fn sys_pstart(pid: usize) -> i64 {
    ret_bool(proc::start(Pid::new(pid as u32), &FlatLoader))
}

/// `PROC_SENDSIG(pid, signum)`: queue a signal on another process.
pub fn sys_sendsig(pid: usize, signum: usize) -> i64 {
    ret_bool(signal::raise_to(Pid::new(pid as u32), signum as u8))
}

/// `SYS_SHUTDOWN(is_reboot)`: request system shutdown.
pub fn sys_shutdown(is_reboot: usize) -> i64 {
    crate::boot::request_shutdown(is_reboot != 0);
    0
}
