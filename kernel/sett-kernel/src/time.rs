//! CPU timer multiplexing and one-shot timer tasks.
//!
//! Each CPU has one hardware alarm serving two masters: scheduler
//! preemption and the global list of one-shot timer tasks. Whichever
//! deadline is earlier gets programmed; a per-CPU flag remembers which, so
//! the timer ISR knows whether to run the switch routine or claim and run
//! the due task. Tasks never reschedule themselves — callers re-insert.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use sett_core::clock::{self, TIMESTAMP_MAX, Timestamp};
use sett_core::sync::SpinLock;

use crate::percpu::{CpuLocal, MAX_CPUS};

/// A queued timer callback: `callback(cookie)` in timer-ISR context.
pub type TimerFn = fn(usize);

struct TimerTask {
    taskno: i64,
    at: Timestamp,
    callback: TimerFn,
    cookie: usize,
}

/// Global task list, sorted ascending by deadline. The spinlock also
/// arbitrates which CPU claims a due task.
static TASKS: SpinLock<Vec<TimerTask>> = SpinLock::new(Vec::new());
static TASKNO: AtomicI64 = AtomicI64::new(1);

struct TimeCpu {
    /// Next preemption deadline; [`TIMESTAMP_MAX`] = none pending.
    preempt_at: AtomicI64,
    /// Whether the programmed alarm is for preemption (vs a timer task).
    timer_is_preempt: AtomicBool,
}

static TIME_CPUS: CpuLocal<TimeCpu> = CpuLocal::new(
    [const {
        TimeCpu {
            preempt_at: AtomicI64::new(TIMESTAMP_MAX),
            timer_is_preempt: AtomicBool::new(true),
        }
    }; MAX_CPUS],
);

/// Reprograms this CPU's alarm to the earlier of the next task and the
/// preemption deadline.
fn eval_cpu_timer() {
    let cpu = TIME_CPUS.get();
    let preempt_at = cpu.preempt_at.load(Ordering::Relaxed);
    let next_task = TASKS.lock().first().map(|t| t.at);

    match next_task {
        Some(at) if at < preempt_at => {
            cpu.timer_is_preempt.store(false, Ordering::Relaxed);
            crate::arch::set_timer(at);
        }
        _ => {
            cpu.timer_is_preempt.store(true, Ordering::Relaxed);
            crate::arch::set_timer(preempt_at);
        }
    }
}

/// Sets the next preemption time for the current CPU. Called by the
/// scheduler when it installs a thread.
pub fn set_next_preempt(at: Timestamp) {
    TIME_CPUS.get().preempt_at.store(at, Ordering::Relaxed);
    eval_cpu_timer();
}

/// Queues `callback(cookie)` to run at `at` on whichever CPU's timer
/// claims it first. Returns the task number.
pub fn add_async(at: Timestamp, callback: TimerFn, cookie: usize) -> i64 {
    let taskno = TASKNO.fetch_add(1, Ordering::Relaxed);
    let ie = crate::arch::irq_disable();
    {
        let mut tasks = TASKS.lock();
        let pos = tasks.partition_point(|t| t.at <= at);
        tasks.insert(
            pos,
            TimerTask {
                taskno,
                at,
                callback,
                cookie,
            },
        );
    }
    eval_cpu_timer();
    crate::arch::irq_restore(ie);
    taskno
}

/// Cancels a queued task. Returns whether it was still queued.
pub fn cancel_async(taskno: i64) -> bool {
    let ie = crate::arch::irq_disable();
    let found = {
        let mut tasks = TASKS.lock();
        match tasks.iter().position(|t| t.taskno == taskno) {
            Some(pos) => {
                tasks.remove(pos);
                true
            }
            None => false,
        }
    };
    eval_cpu_timer();
    crate::arch::irq_restore(ie);
    found
}

/// Timer interrupt entry: either runs the scheduler switch or claims and
/// runs the due timer task, then re-arms the alarm.
pub fn on_timer_isr() {
    let cpu = TIME_CPUS.get();
    if cpu.timer_is_preempt.load(Ordering::Relaxed) {
        cpu.preempt_at.store(TIMESTAMP_MAX, Ordering::Relaxed);
        crate::sched::request_switch_from_isr();
    } else {
        let now = clock::now_us();
        let task = {
            let mut tasks = TASKS.lock();
            if tasks.first().is_some_and(|t| t.at <= now) {
                Some(tasks.remove(0))
            } else {
                None
            }
        };
        if let Some(task) = task {
            (task.callback)(task.cookie);
        }
    }
    eval_cpu_timer();
}

/// Number of queued timer tasks. Diagnostic.
#[must_use]
pub fn pending_tasks() -> usize {
    TASKS.lock().len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    static FIRED: AtomicUsize = AtomicUsize::new(0);
    static LAST_COOKIE: AtomicUsize = AtomicUsize::new(0);
    static NOW: AtomicI64 = AtomicI64::new(0);

    fn mock_clock() -> Timestamp {
        NOW.load(Ordering::SeqCst)
    }

    fn fire(cookie: usize) {
        FIRED.fetch_add(1, Ordering::SeqCst);
        LAST_COOKIE.store(cookie, Ordering::SeqCst);
    }

    fn setup() -> std::sync::MutexGuard<'static, ()> {
        let guard = crate::test_support::ARCH_TEST_LOCK
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        sett_core::clock::set_clock(mock_clock);
        TASKS.lock().clear();
        TIME_CPUS
            .get()
            .preempt_at
            .store(TIMESTAMP_MAX, Ordering::SeqCst);
        guard
    }

    #[test]
    fn earliest_deadline_wins_the_alarm() {
        let _guard = setup();
        NOW.store(1_000_000, Ordering::SeqCst);

        // Only preemption pending.
        set_next_preempt(2_000_000);
        assert_eq!(crate::arch::last_timer(), 2_000_000);

        // A task earlier than the preemption takes over the alarm.
        let t = add_async(1_500_000, fire, 0);
        assert_eq!(crate::arch::last_timer(), 1_500_000);

        // Cancelling it hands the alarm back to preemption.
        assert!(cancel_async(t));
        assert_eq!(crate::arch::last_timer(), 2_000_000);
        assert!(!cancel_async(t));
    }

    #[test]
    fn due_task_runs_and_alarm_rearms() {
        let _guard = setup();
        NOW.store(10_000_000, Ordering::SeqCst);
        set_next_preempt(99_000_000);
        add_async(10_500_000, fire, 77);
        add_async(11_000_000, fire, 78);
        assert_eq!(pending_tasks(), 2);

        // The ISR fires at the first deadline.
        NOW.store(10_500_000, Ordering::SeqCst);
        let before = FIRED.load(Ordering::SeqCst);
        on_timer_isr();
        assert_eq!(FIRED.load(Ordering::SeqCst) - before, 1);
        assert_eq!(LAST_COOKIE.load(Ordering::SeqCst), 77);
        assert_eq!(pending_tasks(), 1);
        // Re-armed for the second task.
        assert_eq!(crate::arch::last_timer(), 11_000_000);

        NOW.store(11_000_000, Ordering::SeqCst);
        on_timer_isr();
        assert_eq!(LAST_COOKIE.load(Ordering::SeqCst), 78);
        assert_eq!(pending_tasks(), 0);
        // Nothing left: preemption owns the alarm again.
        assert_eq!(crate::arch::last_timer(), 99_000_000);
    }

    #[test]
    fn tasks_sort_by_deadline() {
        let _guard = setup();
        NOW.store(20_000_000, Ordering::SeqCst);
        set_next_preempt(TIMESTAMP_MAX);
        add_async(23_000_000, fire, 3);
        add_async(21_000_000, fire, 1);
        add_async(22_000_000, fire, 2);

        for expect in [1usize, 2, 3] {
            NOW.store(25_000_000, Ordering::SeqCst);
            on_timer_isr();
            assert_eq!(LAST_COOKIE.load(Ordering::SeqCst), expect);
        }
        assert_eq!(pending_tasks(), 0);
    }
}
