//! The task executor for driving async tasks to completion.
//!
//! The executor owns every spawned task and polls them from a single thread, one batch per
//! runtime turn. Wakers only push task ids onto a lock-free ready queue, so waking from another
//! thread is cheap and never touches a task.

mod join;

pub use self::join::JoinHandle;

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::future::Future;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_queue::SegQueue;
use futures::channel::oneshot;
use metrics::{counter, gauge};
use tracing::{trace, warn};

use crate::task::Task;
use crate::waker::task_waker;

/// Id carried by the waker of the future passed to `block_on`.
pub(crate) const MAIN_TASK: usize = 0;

/// The thread-safe half of the executor, shared with every waker.
#[derive(Debug)]
pub struct ExecutorHandle {
    ready: SegQueue<usize>,
    /// Set while the runtime thread is blocked in the reactor.
    parked: AtomicBool,
    waker: Arc<mio::Waker>,
}

impl ExecutorHandle {
    pub(crate) fn new(waker: Arc<mio::Waker>) -> Self {
        Self {
            ready: SegQueue::new(),
            parked: AtomicBool::new(false),
            waker,
        }
    }

    /// Marks a task ready and interrupts the reactor if the runtime thread is parked in it.
    pub fn enqueue(&self, task_id: usize) {
        self.ready.push(task_id);
        if self.parked.swap(false, Ordering::AcqRel) {
            if let Err(err) = self.waker.wake() {
                warn!(error = %err, "failed to wake the runtime thread");
            }
        }
    }

    pub(crate) fn pop(&self) -> Option<usize> {
        self.ready.pop()
    }

    pub(crate) fn has_ready(&self) -> bool {
        !self.ready.is_empty()
    }

    /// Announces that the runtime thread is about to block.
    ///
    /// Returns `false` if a task became ready in the meantime, in which case the thread must
    /// not block.
    pub(crate) fn park(&self) -> bool {
        self.parked.store(true, Ordering::Release);
        // Recheck to avoid a lost wakeup.
        if self.has_ready() {
            self.parked.store(false, Ordering::Release);
            return false;
        }
        true
    }

    pub(crate) fn unpark(&self) {
        self.parked.store(false, Ordering::Release);
    }
}

/// What one [`Executor::tick`] did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Tick {
    /// The `block_on` future was woken and should be polled.
    pub main_woken: bool,
    /// Number of spawned tasks polled.
    pub polled: usize,
}

/// A single-threaded executor for spawned tasks.
pub struct Executor {
    pub handle: Arc<ExecutorHandle>,
    tasks: RefCell<HashMap<usize, Rc<Task>>>,
    next_id: Cell<usize>,
}

impl Executor {
    pub(crate) fn new(waker: Arc<mio::Waker>) -> Self {
        Self {
            handle: Arc::new(ExecutorHandle::new(waker)),
            tasks: RefCell::new(HashMap::new()),
            next_id: Cell::new(MAIN_TASK + 1),
        }
    }

    /// Spawns a future and schedules its first poll.
    pub(crate) fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        let id = self.next_id.get();
        self.next_id.set(id + 1);

        let (tx, rx) = oneshot::channel();
        let task = Task::new(
            id,
            Box::pin(async move {
                // The join handle may have been dropped.
                let _ = tx.send(future.await);
            }),
        );
        self.tasks.borrow_mut().insert(id, task);

        // Track total throughput of the system
        counter!("xfer_run_tasks_spawned_total").increment(1);
        gauge!("xfer_run_tasks_pending_current").increment(1.0);

        self.handle.enqueue(id);
        JoinHandle::new(rx)
    }

    /// Polls up to `budget` ready tasks.
    pub(crate) fn tick(&self, budget: usize) -> Tick {
        let mut tick = Tick::default();
        while tick.polled < budget {
            let Some(id) = self.handle.pop() else {
                break;
            };
            if id == MAIN_TASK {
                tick.main_woken = true;
                continue;
            }

            // Cloned out so the task may spawn while it is polled.
            let task = self.tasks.borrow().get(&id).cloned();
            let Some(task) = task else {
                // Woken after completion.
                continue;
            };

            let waker = task_waker(id, self.handle.clone());
            tick.polled += 1;
            if task.poll(&waker).is_ready() {
                self.tasks.borrow_mut().remove(&id);
                gauge!("xfer_run_tasks_pending_current").decrement(1.0);
                trace!(task = id, "task completed");
            }
        }
        tick
    }

    pub(crate) fn has_ready(&self) -> bool {
        self.handle.has_ready()
    }

    /// Number of spawned tasks not yet completed.
    pub(crate) fn pending(&self) -> usize {
        self.tasks.borrow().len()
    }

    /// Drops every task that has not completed; their join handles report cancellation.
    pub(crate) fn clear(&self) {
        let tasks: Vec<_> = self.tasks.borrow_mut().drain().map(|(_, task)| task).collect();
        if tasks.is_empty() {
            return;
        }
        gauge!("xfer_run_tasks_pending_current").decrement(tasks.len() as f64);
        // Futures may spawn or wake others as they drop.
        for task in tasks {
            task.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::Reactor;
    use futures::FutureExt;

    fn executor() -> (Reactor, Executor) {
        let reactor = Reactor::new(8).unwrap();
        let executor = Executor::new(reactor.waker().unwrap());
        (reactor, executor)
    }

    #[test]
    fn spawned_task_runs_on_tick() {
        let (_reactor, executor) = executor();
        let mut join = executor.spawn(async { 40 + 2 });
        assert_eq!(executor.pending(), 1);

        let tick = executor.tick(16);
        assert_eq!(tick.polled, 1);
        assert!(!tick.main_woken);
        assert_eq!(executor.pending(), 0);
        assert_eq!((&mut join).now_or_never().unwrap().unwrap(), 42);
    }

    #[test]
    fn budget_bounds_one_tick() {
        let (_reactor, executor) = executor();
        for _ in 0..5 {
            drop(executor.spawn(async {}));
        }

        assert_eq!(executor.tick(2).polled, 2);
        assert!(executor.has_ready());
        assert_eq!(executor.tick(16).polled, 3);
        assert!(!executor.has_ready());
    }

    #[test]
    fn main_wakeup_is_reported() {
        let (_reactor, executor) = executor();
        executor.handle.enqueue(MAIN_TASK);
        let tick = executor.tick(16);
        assert!(tick.main_woken);
        assert_eq!(tick.polled, 0);
    }

    #[test]
    fn clear_cancels_join_handles() {
        let (_reactor, executor) = executor();
        let join = executor.spawn(futures::future::pending::<()>());
        executor.tick(16);
        assert_eq!(executor.pending(), 1);

        executor.clear();
        let err = join.now_or_never().unwrap().unwrap_err();
        assert!(err.is_cancelled());
    }

    #[test]
    fn park_refuses_when_work_is_queued() {
        let (_reactor, executor) = executor();
        assert!(executor.handle.park());
        executor.handle.unpark();

        executor.handle.enqueue(3);
        assert!(!executor.handle.park());
    }
}
