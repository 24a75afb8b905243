//! Background housekeeping thread.
//!
//! A dedicated kernel thread drains two queues ordered by deadline: one-shot
//! tasks (process phase-2 teardown, deferred frees) and repeating tasks
//! (dead-thread collection, block cache flushing). Tasks run in kernel
//! thread context and may block.

use alloc::collections::BinaryHeap;
use core::cmp::Reverse;

use sett_core::clock::{self, Timestamp};
use sett_core::sync::SpinLock;

/// A queued task: `callback(taskno, cookie)`.
pub type HkTask = fn(i64, usize);

#[derive(PartialEq, Eq)]
struct TaskEnt {
    next_time: Timestamp,
    taskno: i64,
    interval: Option<Timestamp>,
    callback: HkTask,
    cookie: usize,
}

impl Ord for TaskEnt {
    fn cmp(&self, other: &Self) -> core::cmp::Ordering {
        self.next_time
            .cmp(&other.next_time)
            .then(self.taskno.cmp(&other.taskno))
    }
}

impl PartialOrd for TaskEnt {
    fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

struct HkState {
    queue: BinaryHeap<Reverse<TaskEnt>>,
    cancelled: alloc::vec::Vec<i64>,
    next_taskno: i64,
}

static STATE: SpinLock<HkState> = SpinLock::new(HkState {
    queue: BinaryHeap::new(),
    cancelled: alloc::vec::Vec::new(),
    next_taskno: 1,
});

/// Queues `task` to run once at `time` (microseconds, absolute; 0 = as soon
/// as possible). Returns the task number.
pub fn add_once(time: Timestamp, task: HkTask, cookie: usize) -> i64 {
    add(time, None, task, cookie)
}

/// Queues `task` to run every `interval` microseconds starting at `time`.
pub fn add_repeated(time: Timestamp, interval: Timestamp, task: HkTask, cookie: usize) -> i64 {
    add(time, Some(interval), task, cookie)
}

fn add(time: Timestamp, interval: Option<Timestamp>, task: HkTask, cookie: usize) -> i64 {
    let mut state = STATE.lock();
    let taskno = state.next_taskno;
    state.next_taskno += 1;
    state.queue.push(Reverse(TaskEnt {
        next_time: time,
        taskno,
        interval,
        callback: task,
        cookie,
    }));
    taskno
}

/// Cancels a queued task by number.
pub fn cancel(taskno: i64) {
    STATE.lock().cancelled.push(taskno);
}

/// Runs every task due at `now`, requeueing repeating ones. Returns the
/// number of callbacks run. Called by the housekeeping thread; exposed for
/// the test harness.
pub fn run_due(now: Timestamp) -> usize {
    let mut ran = 0;
    loop {
        let task = {
            let mut state = STATE.lock();
            let due = state
                .queue
                .peek()
                .is_some_and(|Reverse(t)| t.next_time <= now);
            if !due {
                break;
            }
            let Reverse(task) = state.queue.pop().expect("peeked a task");
            if let Some(pos) = state.cancelled.iter().position(|&c| c == task.taskno) {
                state.cancelled.swap_remove(pos);
                continue;
            }
            task
        };

        // Run outside the lock; tasks may queue more tasks.
        (task.callback)(task.taskno, task.cookie);
        ran += 1;

        if let Some(interval) = task.interval {
            let mut state = STATE.lock();
            state.queue.push(Reverse(TaskEnt {
                next_time: task.next_time.saturating_add(interval),
                ..task
            }));
        }
    }
    ran
}

/// The housekeeping thread body.
extern "C" fn hk_thread_entry(_arg: usize) {
    loop {
        run_due(clock::now_us());
        crate::sched::yield_now();
    }
}

/// Empties the task queue so tests see only their own tasks.
#[cfg(test)]
pub(crate) fn reset_for_tests() {
    let mut state = STATE.lock();
    state.queue.clear();
    state.cancelled.clear();
}

/// Spawns the housekeeping thread. Called once from boot, after the
/// scheduler is initialized.
pub fn init() -> sett_core::Result<()> {
    let tid = crate::sched::create_kernel_thread(
        Some(alloc::string::String::from("housekeeping")),
        hk_thread_entry,
        0,
        0,
    )?;
    crate::sched::resume_thread(tid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static ONCE_RUNS: AtomicUsize = AtomicUsize::new(0);
    static REPEAT_RUNS: AtomicUsize = AtomicUsize::new(0);

    // The task queue is global and the process tests feed it exit tasks,
    // so share their lock and start from a drained queue.
    fn setup() -> std::sync::MutexGuard<'static, ()> {
        let guard = crate::proc::tests::PROC_TEST_LOCK
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        reset_for_tests();
        guard
    }

    fn once_task(_taskno: i64, cookie: usize) {
        assert_eq!(cookie, 7);
        ONCE_RUNS.fetch_add(1, Ordering::SeqCst);
    }

    fn repeat_task(_taskno: i64, _cookie: usize) {
        REPEAT_RUNS.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn once_tasks_run_once_in_deadline_order() {
        let _guard = setup();
        let before = ONCE_RUNS.load(Ordering::SeqCst);
        add_once(2_000_000_000, once_task, 7);
        add_once(1_000_000_000, once_task, 7);

        // Nothing due yet.
        assert_eq!(run_due(500_000_000), 0);
        // First deadline due.
        assert_eq!(run_due(1_500_000_000), 1);
        // Second, and then the queue is dry.
        assert_eq!(run_due(2_500_000_000), 1);
        assert_eq!(run_due(3_000_000_000), 0);
        assert_eq!(ONCE_RUNS.load(Ordering::SeqCst) - before, 2);
    }

    #[test]
    fn repeated_tasks_requeue_and_cancel() {
        let _guard = setup();
        let before = REPEAT_RUNS.load(Ordering::SeqCst);
        let taskno = add_repeated(10_000_000_000, 1_000_000, repeat_task, 0);
        assert_eq!(run_due(10_000_000_000), 1);
        assert_eq!(run_due(10_001_000_000), 1);
        cancel(taskno);
        assert_eq!(run_due(10_002_000_000), 0);
        assert_eq!(REPEAT_RUNS.load(Ordering::SeqCst) - before, 2);
    }
}
