use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

/// A pinned, heap-allocated future that produces no output.
///
/// `Pin` guarantees that the future's data will not be moved in memory, which is essential for
/// futures that contain self-referential data. Tasks never leave the runtime thread, so the
/// future does not need to be `Send`.
pub type TaskFuture = Pin<Box<dyn Future<Output = ()> + 'static>>;

/// Represents an async task managed by the executor.
pub struct Task {
    /// Unique identifier for this task, also carried by its waker.
    pub id: usize,
    /// The future, or `None` once it completed.
    future: RefCell<Option<TaskFuture>>,
}

impl Task {
    pub fn new(id: usize, future: TaskFuture) -> Rc<Self> {
        Rc::new(Self {
            id,
            future: RefCell::new(Some(future)),
        })
    }

    /// Polls the task's future once.
    ///
    /// A completed future is dropped right away; polling a completed task returns
    /// `Poll::Ready` without doing anything.
    pub fn poll(&self, waker: &Waker) -> Poll<()> {
        let mut slot = self.future.borrow_mut();
        let Some(future) = slot.as_mut() else {
            return Poll::Ready(());
        };

        let mut cx = Context::from_waker(waker);
        if future.as_mut().poll(&mut cx).is_pending() {
            return Poll::Pending;
        }

        let finished = slot.take();
        std::mem::drop(slot);
        std::mem::drop(finished);
        Poll::Ready(())
    }

    /// Drops the future without completing it.
    pub fn cancel(&self) {
        let future = self.future.borrow_mut().take();
        std::mem::drop(future);
    }

    #[cfg(test)]
    pub fn is_completed(&self) -> bool {
        self.future.borrow().is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::task::noop_waker;
    use std::cell::Cell;

    #[test]
    fn completes_once() {
        let hits = Rc::new(Cell::new(0));
        let counted = hits.clone();
        let task = Task::new(
            1,
            Box::pin(async move {
                counted.set(counted.get() + 1);
            }),
        );

        let waker = noop_waker();
        assert!(task.poll(&waker).is_ready());
        assert!(task.is_completed());
        assert!(task.poll(&waker).is_ready());
        assert_eq!(hits.get(), 1);
    }

    #[test]
    fn cancel_drops_pending_future() {
        let task = Task::new(2, Box::pin(futures::future::pending::<()>()));
        let waker = noop_waker();
        assert!(task.poll(&waker).is_pending());

        task.cancel();
        assert!(task.is_completed());
    }
}
