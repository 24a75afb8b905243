//! Kernel panic handler.

use core::panic::PanicInfo;

use sett_core::{kfatal, kprintln};

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    crate::arch::irq_disable();
    kprintln!();
    kfatal!("KERNEL PANIC: {}", info.message());
    if let Some(location) = info.location() {
        kfatal!("  at {}:{}", location.file(), location.line());
    }

    let fp: usize;
    // SAFETY: reading the frame pointer has no side effects.
    unsafe { core::arch::asm!("mv {}, s0", out(reg) fp, options(nomem, nostack)) };
    crate::diag::backtrace_from(fp);

    crate::arch::halt();
}
