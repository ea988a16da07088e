//! Cooperative task scheduler.
//!
//! Two priority lanes of runnables plus a set of idle tasks consulted only
//! when no runnable is ready. `run_one` is the single pumping primitive: the
//! epoch-end wait loops on it, and worker threads in multi-threaded mode do
//! the same. The scheduler is the serialization point for handler dispatch.
//!
//! A regular runnable is re-enqueued unless it reports itself finished or
//! asks to be removed; an idle task stays installed until it asks to be
//! removed.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// What a task did when it ran, and what the queue should do with it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskResult {
    /// Did work and is complete; a runnable reporting this is not re-run.
    BusyAndFinished,
    /// Had nothing to do right now.
    Idle,
    /// Did work and wants to run again.
    BusyNotFinished,
    /// Retire this task from its queue.
    RemoveFromQueue,
}

/// Dispatch priority of a runnable. `High` drains before `Normal`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Priority {
    /// Drained first.
    High,
    /// The default lane.
    #[default]
    Normal,
}

/// A schedulable unit of work.
pub trait Runnable: Send {
    /// Runs one step and reports what happened.
    fn run(&mut self, scheduler: &Scheduler) -> TaskResult;
}

impl<F> Runnable for F
where
    F: FnMut(&Scheduler) -> TaskResult + Send,
{
    fn run(&mut self, scheduler: &Scheduler) -> TaskResult {
        self(scheduler)
    }
}

type BoxedTask = Box<dyn Runnable>;

#[derive(Default)]
struct Lanes {
    high: VecDeque<BoxedTask>,
    normal: VecDeque<BoxedTask>,
}

struct IdleSet {
    slots: Vec<Option<BoxedTask>>,
    cursor: usize,
}

/// Cooperative scheduler; single-threaded by default, safe to pump from
/// several threads when the caller configures more.
pub struct Scheduler {
    lanes: Mutex<Lanes>,
    idle: Mutex<IdleSet>,
    run_handlers: AtomicBool,
    nthreads: AtomicUsize,
}

impl Scheduler {
    /// Creates an empty scheduler with handler execution enabled.
    pub fn new() -> Self {
        Self {
            lanes: Mutex::new(Lanes::default()),
            idle: Mutex::new(IdleSet {
                slots: Vec::new(),
                cursor: 0,
            }),
            run_handlers: AtomicBool::new(true),
            nthreads: AtomicUsize::new(1),
        }
    }

    /// Enqueues a runnable on the lane for `priority`.
    pub fn add_runnable(&self, priority: Priority, task: impl Runnable + 'static) {
        let mut lanes = self.lanes.lock();
        match priority {
            Priority::High => lanes.high.push_back(Box::new(task)),
            Priority::Normal => lanes.normal.push_back(Box::new(task)),
        }
    }

    /// Installs an idle task, consulted only when no runnable is ready.
    pub fn add_idle_task(&self, task: impl Runnable + 'static) {
        self.idle.lock().slots.push(Some(Box::new(task)));
    }

    /// Runs one task: the front of the highest non-empty lane, or the next
    /// idle task when both lanes are empty. Returns what the task reported,
    /// or [`TaskResult::Idle`] when there was nothing to run at all.
    pub fn run_one(&self) -> TaskResult {
        let popped = {
            let mut lanes = self.lanes.lock();
            match lanes.high.pop_front() {
                Some(task) => Some((Priority::High, task)),
                None => lanes.normal.pop_front().map(|t| (Priority::Normal, t)),
            }
        };

        if let Some((priority, mut task)) = popped {
            let result = task.run(self);
            match result {
                TaskResult::Idle | TaskResult::BusyNotFinished => {
                    let mut lanes = self.lanes.lock();
                    match priority {
                        Priority::High => lanes.high.push_back(task),
                        Priority::Normal => lanes.normal.push_back(task),
                    }
                }
                TaskResult::BusyAndFinished | TaskResult::RemoveFromQueue => {}
            }
            return result;
        }

        self.run_idle_one()
    }

    fn run_idle_one(&self) -> TaskResult {
        let (slot_index, mut task) = {
            let mut idle = self.idle.lock();
            let count = idle.slots.len();
            if count == 0 {
                return TaskResult::Idle;
            }
            let mut found = None;
            for probe in 0..count {
                let index = (idle.cursor + probe) % count;
                if idle.slots[index].is_some() {
                    found = Some(index);
                    break;
                }
            }
            let Some(index) = found else {
                return TaskResult::Idle;
            };
            idle.cursor = (index + 1) % count;
            (index, idle.slots[index].take().expect("slot checked above"))
        };

        let result = task.run(self);
        if result != TaskResult::RemoveFromQueue {
            self.idle.lock().slots[slot_index] = Some(task);
        }
        result
    }

    /// Whether handler runnables may execute right now.
    pub fn should_run_handlers(&self) -> bool {
        self.run_handlers.load(Ordering::Acquire)
    }

    /// Gates or releases handler execution (used at shutdown).
    pub fn set_should_run_handlers(&self, run: bool) {
        self.run_handlers.store(run, Ordering::Release);
    }

    /// Number of runnables waiting in both lanes.
    pub fn pending_runnables(&self) -> usize {
        let lanes = self.lanes.lock();
        lanes.high.len() + lanes.normal.len()
    }

    /// Configured worker-thread count.
    pub fn nthreads(&self) -> usize {
        self.nthreads.load(Ordering::Relaxed)
    }

    /// Sets the worker-thread count the caller intends to pump with.
    pub fn set_nthreads(&self, n: usize) {
        debug_assert!(n >= 1);
        self.nthreads.store(n.max(1), Ordering::Relaxed);
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;
    use std::sync::Arc;

    fn record(tag: u32, log: &Arc<PlMutex<Vec<u32>>>) -> impl FnMut(&Scheduler) -> TaskResult {
        let log = Arc::clone(log);
        move |_s: &Scheduler| {
            log.lock().push(tag);
            TaskResult::BusyAndFinished
        }
    }

    #[test]
    fn high_lane_drains_before_normal() {
        let sched = Scheduler::new();
        let log = Arc::new(PlMutex::new(Vec::new()));
        sched.add_runnable(Priority::Normal, record(1, &log));
        sched.add_runnable(Priority::High, record(2, &log));
        sched.add_runnable(Priority::Normal, record(3, &log));
        while sched.pending_runnables() > 0 {
            sched.run_one();
        }
        assert_eq!(*log.lock(), vec![2, 1, 3]);
    }

    #[test]
    fn finished_runnable_runs_once() {
        let sched = Scheduler::new();
        let log = Arc::new(PlMutex::new(Vec::new()));
        sched.add_runnable(Priority::Normal, record(1, &log));
        assert_eq!(sched.run_one(), TaskResult::BusyAndFinished);
        assert_eq!(sched.run_one(), TaskResult::Idle);
        assert_eq!(*log.lock(), vec![1]);
    }

    #[test]
    fn unfinished_runnable_is_re_enqueued() {
        let sched = Scheduler::new();
        let mut remaining = 3u32;
        sched.add_runnable(Priority::Normal, move |_s: &Scheduler| {
            remaining -= 1;
            if remaining == 0 {
                TaskResult::BusyAndFinished
            } else {
                TaskResult::BusyNotFinished
            }
        });
        assert_eq!(sched.run_one(), TaskResult::BusyNotFinished);
        assert_eq!(sched.run_one(), TaskResult::BusyNotFinished);
        assert_eq!(sched.run_one(), TaskResult::BusyAndFinished);
        assert_eq!(sched.pending_runnables(), 0);
    }

    #[test]
    fn idle_task_runs_only_when_lanes_are_empty() {
        let sched = Scheduler::new();
        let log = Arc::new(PlMutex::new(Vec::new()));
        {
            let log = Arc::clone(&log);
            sched.add_idle_task(move |_s: &Scheduler| {
                log.lock().push(99);
                TaskResult::Idle
            });
        }
        sched.add_runnable(Priority::Normal, record(1, &log));
        sched.run_one();
        assert_eq!(*log.lock(), vec![1]);
        sched.run_one();
        assert_eq!(*log.lock(), vec![1, 99]);
    }

    #[test]
    fn idle_task_retires_via_remove() {
        let sched = Scheduler::new();
        let mut calls = 0u32;
        sched.add_idle_task(move |_s: &Scheduler| {
            calls += 1;
            if calls >= 2 {
                TaskResult::RemoveFromQueue
            } else {
                TaskResult::BusyAndFinished
            }
        });
        assert_eq!(sched.run_one(), TaskResult::BusyAndFinished);
        assert_eq!(sched.run_one(), TaskResult::RemoveFromQueue);
        assert_eq!(sched.run_one(), TaskResult::Idle);
    }

    #[test]
    fn idle_tasks_rotate() {
        let sched = Scheduler::new();
        let log = Arc::new(PlMutex::new(Vec::new()));
        for tag in [1u32, 2] {
            let log = Arc::clone(&log);
            sched.add_idle_task(move |_s: &Scheduler| {
                log.lock().push(tag);
                TaskResult::Idle
            });
        }
        for _ in 0..4 {
            sched.run_one();
        }
        assert_eq!(*log.lock(), vec![1, 2, 1, 2]);
    }

    #[test]
    fn handler_gate_toggles() {
        let sched = Scheduler::new();
        assert!(sched.should_run_handlers());
        sched.set_should_run_handlers(false);
        assert!(!sched.should_run_handlers());
    }
}
