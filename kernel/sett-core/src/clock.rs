//! Monotonic microsecond clock hook.
//!
//! The mutex, block cache, and timer subsystems all read time through
//! [`now_us`]. The backing source is a registered function so the platform
//! timer and the host test harness can both provide one; before registration
//! the clock reads 0, which callers must tolerate (it only ever makes
//! timeouts longer).

use core::sync::atomic::{AtomicPtr, Ordering};

/// Microseconds since boot. Signed so deadline arithmetic can underflow
/// safely during early boot.
pub type Timestamp = i64;

/// Saturation value used to mean "no timeout".
pub const TIMESTAMP_MAX: Timestamp = i64::MAX;

/// Signature of the registered time source.
pub type ClockFn = fn() -> Timestamp;

fn null_clock() -> Timestamp {
    0
}

static CLOCK: AtomicPtr<()> = AtomicPtr::new(null_clock as *mut ());

/// Registers the global time source. May be called again to replace an
/// early-boot source with a calibrated one.
pub fn set_clock(clock: ClockFn) {
    CLOCK.store(clock as *mut (), Ordering::Release);
}

/// Current monotonic time in microseconds. 0 before a source is registered.
#[must_use]
pub fn now_us() -> Timestamp {
    let ptr = CLOCK.load(Ordering::Acquire);
    // SAFETY: only valid `ClockFn` pointers are ever stored into CLOCK.
    let f: ClockFn = unsafe { core::mem::transmute(ptr) };
    f()
}

/// Converts a relative timeout to an absolute deadline.
///
/// A negative timeout, or one whose deadline would overflow, saturates to
/// [`TIMESTAMP_MAX`], i.e. "wait forever".
#[must_use]
pub fn deadline(timeout_us: Timestamp) -> Timestamp {
    if timeout_us < 0 {
        return TIMESTAMP_MAX;
    }
    now_us().checked_add(timeout_us).unwrap_or(TIMESTAMP_MAX)
}

#[cfg(test)]
pub(crate) mod test_clock {
    //! Host clock for unit tests, backed by `std::time::Instant`.

    use super::Timestamp;
    use std::sync::OnceLock;
    use std::time::Instant;

    static EPOCH: OnceLock<Instant> = OnceLock::new();

    /// `std`-backed monotonic clock; install with `clock::set_clock`.
    pub fn std_clock() -> Timestamp {
        let epoch = EPOCH.get_or_init(Instant::now);
        Timestamp::try_from(epoch.elapsed().as_micros()).unwrap_or(super::TIMESTAMP_MAX)
    }
}
