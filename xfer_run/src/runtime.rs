//! The async runtime combining the executor and the reactor on one thread.
//!
//! The runtime alternates between polling woken tasks and turning the reactor. It stores its
//! [`Handle`] in thread-local storage while it runs, so tasks can reach it through
//! [`current`] and [`spawn`].

use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::io;
use std::os::fd::RawFd;
use std::pin::pin;
use std::rc::Rc;
use std::task::{Context, Poll};
use std::time::Duration;

use tracing::{debug, error, info};

use crate::config::RuntimeConfig;
use crate::executor::{Executor, JoinHandle, MAIN_TASK};
use crate::reactor::Reactor;
use crate::scheduler::{Callback, Scheduler, TimerId};
use crate::waker::task_waker;

thread_local! {
    static CONTEXT: RefCell<Option<Handle>> = const { RefCell::new(None) };
}

struct Core {
    executor: Executor,
    reactor: Reactor,
    tick_budget: usize,
}

/// The single-threaded runtime.
///
/// # Examples
///
/// ```
/// let runtime = xfer_run::Runtime::new()?;
/// let answer = runtime.block_on(async {
///     xfer_run::spawn(async { 21 * 2 }).await
/// })?;
/// assert_eq!(answer, 42);
/// # Ok::<(), xfer_run::Error>(())
/// ```
pub struct Runtime {
    handle: Handle,
}

impl Runtime {
    /// Creates a runtime with the default configuration.
    pub fn new() -> io::Result<Self> {
        Self::with_config(RuntimeConfig::default())
    }

    /// Creates a runtime.
    ///
    /// If `config.metrics_addr` is set, a Prometheus exporter is installed and served on that
    /// address.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the OS poller cannot be created or the exporter cannot be
    /// installed.
    pub fn with_config(config: RuntimeConfig) -> io::Result<Self> {
        if let Some(addr) = config.metrics_addr {
            metrics_exporter_prometheus::PrometheusBuilder::new()
                .with_http_listener(addr)
                .install()
                .map_err(io::Error::other)?;
            info!(%addr, "metrics exporter listening");
        }

        let reactor = Reactor::new(config.event_capacity)?;
        let executor = Executor::new(reactor.waker()?);
        debug!(
            event_capacity = config.event_capacity,
            tick_budget = config.tick_budget,
            "runtime created"
        );

        Ok(Self {
            handle: Handle {
                core: Rc::new(Core {
                    executor,
                    reactor,
                    tick_budget: config.tick_budget,
                }),
            },
        })
    }

    pub fn handle(&self) -> Handle {
        self.handle.clone()
    }

    /// Makes this runtime the thread's current one until the guard drops.
    ///
    /// `block_on` enters on its own; entering is only needed to create runtime-bound values,
    /// such as a [`Multiplexer::current`](crate::Multiplexer::current), outside of it.
    pub fn enter(&self) -> EnterGuard {
        let previous = CONTEXT.with(|ctx| ctx.borrow_mut().replace(self.handle.clone()));
        EnterGuard { previous }
    }

    /// Spawns a future onto this runtime. It makes progress while the runtime is blocked on
    /// something.
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        self.handle.spawn(future)
    }

    /// Runs `future` to completion, driving spawned tasks and I/O while it is pending.
    ///
    /// Tasks still pending when `future` completes stay queued for the next `block_on`.
    ///
    /// # Panics
    ///
    /// Panics if the OS poller fails.
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        let _guard = self.enter();
        let core = &self.handle.core;
        let mut future = pin!(future);

        let waker = task_waker(MAIN_TASK, core.executor.handle.clone());
        let mut cx = Context::from_waker(&waker);

        let mut main_woken = true;
        loop {
            if main_woken {
                main_woken = false;
                if let Poll::Ready(output) = future.as_mut().poll(&mut cx) {
                    return output;
                }
            }

            let tick = core.executor.tick(core.tick_budget);
            main_woken |= tick.main_woken;

            let turned = if main_woken || core.executor.has_ready() {
                core.reactor.turn(Some(Duration::ZERO))
            } else if core.executor.handle.park() {
                let turned = core.reactor.turn(None);
                core.executor.handle.unpark();
                turned
            } else {
                continue;
            };

            if let Err(err) = turned {
                error!(error = %err, "reactor failed");
                panic!("xfer_run: reactor failed: {err}");
            }
        }
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        let core = &self.handle.core;
        let pending = core.executor.pending();
        if pending > 0 {
            debug!(pending, "dropping unfinished tasks");
        }
        core.executor.clear();
        core.reactor.clear();
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime").field("handle", &self.handle).finish()
    }
}

/// Restores the previously entered runtime on drop.
#[must_use = "the runtime is only current while the guard lives"]
pub struct EnterGuard {
    previous: Option<Handle>,
}

impl Drop for EnterGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CONTEXT.with(|ctx| *ctx.borrow_mut() = previous);
    }
}

/// A cheap, cloneable reference to a [`Runtime`].
///
/// The handle is the runtime's [`Scheduler`]: socket callbacks and timers registered through it
/// run on the runtime's turns.
#[derive(Clone)]
pub struct Handle {
    core: Rc<Core>,
}

impl Handle {
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        self.core.executor.spawn(future)
    }
}

impl Scheduler for Handle {
    fn on_readable(&self, fd: RawFd, callback: Callback) -> io::Result<()> {
        self.core.reactor.set_reader(fd, Some(callback))
    }

    fn on_writable(&self, fd: RawFd, callback: Callback) -> io::Result<()> {
        self.core.reactor.set_writer(fd, Some(callback))
    }

    fn remove_readable(&self, fd: RawFd) -> io::Result<()> {
        self.core.reactor.set_reader(fd, None)
    }

    fn remove_writable(&self, fd: RawFd) -> io::Result<()> {
        self.core.reactor.set_writer(fd, None)
    }

    fn arm_timer(&self, delay: Duration, callback: Callback) -> TimerId {
        self.core.reactor.arm_timer(delay, callback)
    }

    fn cancel_timer(&self, timer: TimerId) {
        self.core.reactor.cancel_timer(timer);
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("tasks", &self.core.executor.pending())
            .field("tick_budget", &self.core.tick_budget)
            .finish_non_exhaustive()
    }
}

/// Returns the handle of the runtime entered on this thread.
///
/// # Panics
///
/// Panics if called outside of a runtime context.
pub fn current() -> Handle {
    try_current().expect("xfer_run: called outside of a runtime context")
}

/// Returns the handle of the runtime entered on this thread, if any.
pub fn try_current() -> Option<Handle> {
    CONTEXT.with(|ctx| ctx.borrow().clone())
}

/// Spawns a future onto the current runtime.
///
/// # Panics
///
/// Panics if called outside of a runtime context (not within `block_on` or an
/// [`enter`](Runtime::enter) guard).
///
/// # Examples
///
/// ```ignore
/// #[xfer_run::main]
/// async fn main() {
///     xfer_run::spawn(async {
///         println!("Spawned task");
///     });
/// }
/// ```
pub fn spawn<F>(future: F) -> JoinHandle<F::Output>
where
    F: Future + 'static,
    F::Output: 'static,
{
    current().spawn(future)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::oneshot;
    use std::cell::Cell;
    use std::io::Write;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::time::Instant;

    #[test]
    fn block_on_returns_output() {
        let runtime = Runtime::new().unwrap();
        assert_eq!(runtime.block_on(async { 7 }), 7);
    }

    #[test]
    fn spawned_tasks_join() {
        let runtime = Runtime::new().unwrap();
        let total = runtime.block_on(async {
            let handles: Vec<_> = (1..=4).map(|n| spawn(async move { n * 10 })).collect();
            let mut total = 0;
            for handle in handles {
                total += handle.await.unwrap();
            }
            total
        });
        assert_eq!(total, 100);
    }

    #[test]
    fn context_is_scoped_to_block_on() {
        let runtime = Runtime::new().unwrap();
        assert!(try_current().is_none());
        runtime.block_on(async { assert!(try_current().is_some()) });
        assert!(try_current().is_none());

        let guard = runtime.enter();
        assert!(try_current().is_some());
        drop(guard);
        assert!(try_current().is_none());
    }

    #[test]
    #[should_panic(expected = "outside of a runtime context")]
    fn spawn_outside_runtime_panics() {
        drop(spawn(async {}));
    }

    #[test]
    fn timer_wakes_blocked_main() {
        let runtime = Runtime::new().unwrap();
        let handle = runtime.handle();
        let started = Instant::now();

        runtime.block_on(async move {
            let (tx, rx) = oneshot::channel();
            let tx = Cell::new(Some(tx));
            handle.arm_timer(
                Duration::from_millis(20),
                Rc::new(move || {
                    if let Some(tx) = tx.take() {
                        let _ = tx.send(());
                    }
                }),
            );
            rx.await.unwrap();
        });

        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn readable_socket_resumes_task() {
        let runtime = Runtime::new().unwrap();
        let handle = runtime.handle();
        let (mut a, b) = UnixStream::pair().unwrap();
        b.set_nonblocking(true).unwrap();
        let fd = b.as_raw_fd();

        let received = runtime.block_on(async move {
            let (tx, rx) = oneshot::channel();
            let tx = Cell::new(Some(tx));
            let unregister = handle.clone();
            handle
                .on_readable(
                    fd,
                    Rc::new(move || {
                        if let Some(tx) = tx.take() {
                            let _ = tx.send(());
                        }
                        unregister.remove_readable(fd).unwrap();
                    }),
                )
                .unwrap();

            spawn(async move { a.write_all(b"x").unwrap() }).await.unwrap();
            rx.await.is_ok()
        });
        assert!(received);
    }

    #[test]
    fn woken_from_another_thread() {
        let runtime = Runtime::new().unwrap();
        let value = runtime.block_on(async {
            let (tx, rx) = oneshot::channel();
            let worker = std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(10));
                tx.send(5).unwrap();
            });
            let value = rx.await.unwrap();
            worker.join().unwrap();
            value
        });
        assert_eq!(value, 5);
    }

    #[test]
    fn drop_cancels_unfinished_tasks() {
        let runtime = Runtime::new().unwrap();
        let join = runtime.spawn(futures::future::pending::<()>());
        runtime.block_on(async {});
        drop(runtime);

        let err = futures::executor::block_on(join).unwrap_err();
        assert!(err.is_cancelled());
    }
}
