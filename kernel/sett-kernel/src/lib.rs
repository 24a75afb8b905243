//! The sett kernel.
//!
//! A small preemptive multitasking kernel for RISC-V class machines:
//! per-CPU round-robin scheduling with priority-scaled quanta, processes
//! with isolated memory maps and POSIX-style signals, a trap pipeline that
//! turns faults into signals and ecalls into kernel-context syscalls, and a
//! VFS + block cache I/O stack.
//!
//! Modules that are pure logic (tables, policies, wire formats) compile and
//! test on the host; the runtime glue (trap entry, context restore, timer
//! programming) lives behind the `arch` facade and is only real on
//! `target_os = "none"`.

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

extern crate alloc;

pub mod abi;
pub mod arch;
pub mod blockdev;
pub mod boot;
pub mod diag;
pub mod fs;
pub mod housekeeping;
pub mod isr;
pub mod memprotect;
pub mod percpu;
pub mod proc;
pub mod sched;
pub mod syscall;
pub mod time;

#[cfg(target_os = "none")]
mod panic;

#[cfg(target_os = "none")]
#[global_allocator]
static KERNEL_HEAP: sett_mm::kalloc::KernelHeap = sett_mm::kalloc::KernelHeap;

#[cfg(test)]
pub(crate) mod test_support {
    //! Shared serialization for tests that drive the one host CPU: the
    //! scheduler state, the per-CPU timer, and the recorded `set_timer`
    //! value are all global.

    pub(crate) static ARCH_TEST_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
}
