//! Scheduling policy: quanta and the per-thread switch decision.

use sett_core::clock::Timestamp;

use super::thread::ThreadFlags;
use crate::proc::ProcFlags;

/// Quota for priority 0.
pub const MIN_QUOTA_US: Timestamp = 5_000;

/// Additional quota per priority level.
pub const QUOTA_INCREMENT_US: Timestamp = 500;

/// Quota granted to the idle thread; any interrupt preempts it anyway.
pub const IDLE_QUOTA_US: Timestamp = 1_000_000;

/// Priority given to threads that do not ask for one.
pub const DEFAULT_PRIORITY: i32 = 0;

/// Time slice for a thread of the given priority.
///
/// Priority only scales the quota; it never reorders the round-robin.
#[must_use]
pub fn quota_for(priority: i32) -> Timestamp {
    MIN_QUOTA_US + Timestamp::from(priority.max(0)) * QUOTA_INCREMENT_US
}

/// What the switch path does with the thread at the head of the runqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchDecision {
    /// Requeue at the tail and install its context.
    Run,
    /// Its process is tearing down and it is not in the middle of kernel
    /// work: stop it (clear RUNNING and SUSPENDING, do not requeue).
    StopForProcessExit,
    /// The thread is exiting: move it to the dead pool.
    Reap,
    /// A suspension request is due: stop it (clear RUNNING and SUSPENDING,
    /// do not requeue).
    Suspend,
}

/// Decides what to do with a popped thread.
///
/// `proc_flags` is the owning process's flag snapshot, `None` for kernel
/// threads.
#[must_use]
pub fn decide(flags: ThreadFlags, proc_flags: Option<ProcFlags>) -> SwitchDecision {
    if proc_flags.is_some_and(|pf| pf.contains(ProcFlags::EXITING)) {
        if flags.contains(ThreadFlags::PRIVILEGED) && flags.contains(ThreadFlags::RUNNING) {
            // Mid-syscall kernel work finishes before the thread stops.
            return SwitchDecision::Run;
        }
        return SwitchDecision::StopForProcessExit;
    }
    if flags.contains(ThreadFlags::EXITING) {
        return SwitchDecision::Reap;
    }
    if !flags.contains(ThreadFlags::PRIVILEGED) && flags.contains(ThreadFlags::SUSPENDING) {
        return SwitchDecision::Suspend;
    }
    SwitchDecision::Run
}
