//! Thread-management syscalls.

use sett_core::id::Tid;
use sett_core::{Cause, Error, Location};

use super::{ret, ret_bool};
use crate::proc;
use crate::sched;

fn tid_of(raw: usize) -> Tid {
    Tid::new(raw as u32)
}

/// `THREAD_YIELD`: cooperative yield.
pub fn sys_yield() -> i64 {
    sched::yield_now();
    0
}

/// `THREAD_CREATE(entry, arg, priority)`: new running thread in the
/// calling process.
pub fn sys_create(entry: usize, arg: usize, priority: usize) -> i64 {
    ret(
        proc::current()
            .ok_or(Error::new(Location::Process, Cause::State))
            .and_then(|process| {
                let tid = proc::create_thread(&process, entry, arg, priority as i32)?;
                sched::resume_thread(tid)?;
                Ok(i64::from(tid.as_u32()))
            }),
    )
}

/// `THREAD_SUSPEND(tid)`.
pub fn sys_suspend(tid: usize) -> i64 {
    ret_bool(sched::suspend_thread(tid_of(tid)))
}

/// `THREAD_RESUME(tid)`.
pub fn sys_resume(tid: usize) -> i64 {
    ret_bool(sched::resume_thread(tid_of(tid)))
}

/// `THREAD_DETACH(tid)`.
pub fn sys_detach(tid: usize) -> i64 {
    ret_bool(sched::detach_thread(tid_of(tid)))
}

/// `THREAD_EXIT(code)`: never returns.
pub fn sys_exit(code: usize) -> i64 {
    sched::exit_thread(code as i32);
}
