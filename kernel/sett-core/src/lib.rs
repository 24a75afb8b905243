//! Core types and synchronization primitives for the sett kernel.
//!
//! Everything in this crate is pure logic over `core` atomics: error model,
//! typed identifiers, log plumbing, the monotonic clock hook, and the two
//! locking primitives the rest of the kernel is built on. By living outside
//! the kernel crate these types compile and test on the host with plain
//! `cargo test`.

#![cfg_attr(not(test), no_std)]

pub mod clock;
pub mod error;
pub mod id;
pub mod log;
pub mod sync;

pub use error::{Cause, Error, Location, Result};
