//! Architecture facade.
//!
//! Everything the portable kernel needs from the machine goes through this
//! module: CPU identity, interrupt masking, the ISR context register, the
//! CPU timer, and the context restore path. The RISC-V implementation is
//! real; every other build gets host stubs so the portable logic compiles
//! and tests off-target.

pub mod regs;

#[cfg(all(target_os = "none", target_arch = "riscv64"))]
mod riscv;
#[cfg(all(target_os = "none", target_arch = "riscv64"))]
pub use riscv::*;

#[cfg(not(all(target_os = "none", target_arch = "riscv64")))]
mod host;
#[cfg(not(all(target_os = "none", target_arch = "riscv64")))]
pub use host::*;
