//! The host scheduler contract used by the socket bridge.
//!
//! [`Handle`](crate::runtime::Handle) is the crate's own implementation, backed by the mio
//! reactor. Any single-threaded event loop offering reader/writer callbacks and one-shot
//! timers can drive a [`Multiplexer`](crate::Multiplexer) by implementing this trait.

use std::fmt;
use std::io;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::time::Duration;

/// A callback invoked by the scheduler on its own turn.
pub type Callback = Rc<dyn Fn()>;

/// Identifies one armed timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(pub(crate) u64);

impl TimerId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer-{}", self.0)
    }
}

/// Readiness and timer registration primitives of a cooperative event loop.
///
/// Registering a reader or writer for a socket that already has one replaces it. Removing one
/// that is not registered is a no-op.
pub trait Scheduler {
    fn on_readable(&self, fd: RawFd, callback: Callback) -> io::Result<()>;

    fn on_writable(&self, fd: RawFd, callback: Callback) -> io::Result<()>;

    fn remove_readable(&self, fd: RawFd) -> io::Result<()>;

    fn remove_writable(&self, fd: RawFd) -> io::Result<()>;

    /// Calls `callback` once after `delay`.
    fn arm_timer(&self, delay: Duration, callback: Callback) -> TimerId;

    /// Cancels a timer. Unknown or already fired timers are ignored.
    fn cancel_timer(&self, timer: TimerId);
}
