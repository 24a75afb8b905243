//! Crash diagnostics: register dumps and backtraces.

use sett_core::kprintln;

use crate::arch::regs::RegisterFile;

/// Prints a register file in four columns.
pub fn dump_registers(regs: &RegisterFile) {
    kprintln!("pc  {:016x}", regs.pc);
    kprintln!(
        "ra  {:016x} sp  {:016x} gp  {:016x} tp  {:016x}",
        regs.ra,
        regs.sp,
        regs.gp,
        regs.tp
    );
    kprintln!(
        "t0  {:016x} t1  {:016x} t2  {:016x} s0  {:016x}",
        regs.t0,
        regs.t1,
        regs.t2,
        regs.s0
    );
    kprintln!(
        "s1  {:016x} a0  {:016x} a1  {:016x} a2  {:016x}",
        regs.s1,
        regs.a0,
        regs.a1,
        regs.a2
    );
    kprintln!(
        "a3  {:016x} a4  {:016x} a5  {:016x} a6  {:016x}",
        regs.a3,
        regs.a4,
        regs.a5,
        regs.a6
    );
    kprintln!(
        "a7  {:016x} s2  {:016x} s3  {:016x} s4  {:016x}",
        regs.a7,
        regs.s2,
        regs.s3,
        regs.s4
    );
    kprintln!(
        "s5  {:016x} s6  {:016x} s7  {:016x} s8  {:016x}",
        regs.s5,
        regs.s6,
        regs.s7,
        regs.s8
    );
    kprintln!(
        "s9  {:016x} s10 {:016x} s11 {:016x} t3  {:016x}",
        regs.s9,
        regs.s10,
        regs.s11,
        regs.t3
    );
    kprintln!("t4  {:016x} t5  {:016x} t6  {:016x}", regs.t4, regs.t5, regs.t6);
}

/// Walks the frame-pointer chain starting at `fp` and prints return
/// addresses.
///
/// Frame layout: `fp[-1]` is the return address, `fp[-2]` the caller's
/// frame pointer. The walk stops at a null or misaligned pointer or after
/// 32 frames.
#[cfg(target_os = "none")]
pub fn backtrace_from(mut fp: usize) {
    kprintln!("backtrace:");
    for depth in 0..32 {
        if fp == 0 || fp % core::mem::size_of::<usize>() != 0 {
            break;
        }
        // SAFETY: best-effort crash path; the frame chain is read with the
        // same access width the compiler used to write it. A bogus chain can
        // fault, but we are already on the way down.
        let (ra, prev) = unsafe {
            let base = fp as *const usize;
            (base.sub(1).read(), base.sub(2).read())
        };
        if ra == 0 {
            break;
        }
        kprintln!("  #{:02} {:#018x}", depth, ra);
        if prev <= fp {
            break;
        }
        fp = prev;
    }
}

/// Host builds have no kernel stack to walk.
#[cfg(not(target_os = "none"))]
pub fn backtrace_from(_fp: usize) {
    kprintln!("backtrace: unavailable on host");
}
