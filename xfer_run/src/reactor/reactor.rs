use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use tracing::{trace, warn};

use super::timer::TimerWheel;
use crate::scheduler::{Callback, TimerId};

/// Token reserved for the cross-thread [`mio::Waker`].
pub(crate) const WAKE_TOKEN: Token = Token(usize::MAX);

/// Reader and writer callbacks for one socket, plus the interest currently registered with
/// the OS.
#[derive(Clone, Default)]
struct Watch {
    reader: Option<Callback>,
    writer: Option<Callback>,
    registered: Option<Interest>,
}

impl Watch {
    fn wanted(&self) -> Option<Interest> {
        match (self.reader.is_some(), self.writer.is_some()) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }
}

/// Manages readiness callbacks for raw sockets and one-shot timers.
///
/// The reactor uses system-level event notification (epoll on Linux, kqueue on macOS) through
/// mio. It never runs on its own thread: the runtime calls [`turn`](Self::turn) between task
/// polls and every callback runs right there.
///
/// # Architecture
///
/// - **Poll**: one `mio::Poll`; each socket is registered under `Token(fd)`
/// - **Watches**: per-socket reader/writer callbacks; the OS interest is their union
/// - **Timers**: a [`TimerWheel`] consulted for the poll timeout and fired after I/O
pub(crate) struct Reactor {
    poll: RefCell<Poll>,
    events: RefCell<Events>,
    watches: RefCell<HashMap<RawFd, Watch>>,
    timers: RefCell<TimerWheel>,
}

impl Reactor {
    /// Creates a reactor with room for `event_capacity` events per turn.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the OS poller cannot be created.
    pub(crate) fn new(event_capacity: usize) -> io::Result<Self> {
        Ok(Self {
            poll: RefCell::new(Poll::new()?),
            events: RefCell::new(Events::with_capacity(event_capacity)),
            watches: RefCell::new(HashMap::new()),
            timers: RefCell::new(TimerWheel::new()),
        })
    }

    /// Creates the waker other threads use to interrupt a blocking [`turn`](Self::turn).
    pub(crate) fn waker(&self) -> io::Result<Arc<mio::Waker>> {
        let poll = self.poll.borrow();
        Ok(Arc::new(mio::Waker::new(poll.registry(), WAKE_TOKEN)?))
    }

    pub(crate) fn set_reader(&self, fd: RawFd, callback: Option<Callback>) -> io::Result<()> {
        self.update(fd, |watch| watch.reader = callback)
    }

    pub(crate) fn set_writer(&self, fd: RawFd, callback: Option<Callback>) -> io::Result<()> {
        self.update(fd, |watch| watch.writer = callback)
    }

    #[cfg(test)]
    pub(crate) fn is_watching(&self, fd: RawFd) -> bool {
        self.watches.borrow().contains_key(&fd)
    }

    /// Applies `change` to the socket's watch and brings the OS registration in line with it.
    ///
    /// Nothing changes if the registration fails.
    fn update(&self, fd: RawFd, change: impl FnOnce(&mut Watch)) -> io::Result<()> {
        let mut watches = self.watches.borrow_mut();
        let mut watch = watches.get(&fd).cloned().unwrap_or_default();
        change(&mut watch);
        let wanted = watch.wanted();

        let poll = self.poll.borrow();
        let registry = poll.registry();
        let token = Token(fd as usize);
        match (watch.registered, wanted) {
            (None, Some(interest)) => {
                registry.register(&mut SourceFd(&fd), token, interest)?;
            }
            (Some(old), Some(interest)) if old != interest => {
                registry.reregister(&mut SourceFd(&fd), token, interest)?;
            }
            (Some(_), None) => {
                // The socket may already be closed, in which case the OS dropped it for us.
                if let Err(err) = registry.deregister(&mut SourceFd(&fd)) {
                    trace!(fd, error = %err, "deregister of a watched socket failed");
                }
            }
            _ => {}
        }
        watch.registered = wanted;

        if wanted.is_none() {
            watches.remove(&fd);
        } else {
            watches.insert(fd, watch);
        }
        Ok(())
    }

    pub(crate) fn arm_timer(&self, delay: Duration, callback: Callback) -> TimerId {
        self.timers.borrow_mut().arm(Instant::now(), delay, callback)
    }

    pub(crate) fn cancel_timer(&self, timer: TimerId) {
        self.timers.borrow_mut().cancel(timer);
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.timers.borrow().next_deadline()
    }

    /// `true` if nothing is watched and no timer is armed.
    #[cfg(test)]
    pub(crate) fn is_idle(&self) -> bool {
        self.watches.borrow().is_empty() && self.timers.borrow().is_empty()
    }

    /// Drops every watch and timer.
    pub(crate) fn clear(&self) {
        let watches = std::mem::take(&mut *self.watches.borrow_mut());
        let timers = std::mem::take(&mut *self.timers.borrow_mut());
        let poll = self.poll.borrow();
        for (fd, watch) in &watches {
            if watch.registered.is_some() {
                let _ = poll.registry().deregister(&mut SourceFd(fd));
            }
        }
        drop(poll);
        // Callbacks may capture handles back into the runtime; drop them outside the borrows.
        drop(watches);
        drop(timers);
    }

    /// Waits for I/O for at most `timeout` (shortened to the next timer deadline), then runs
    /// the callbacks of ready sockets followed by those of expired timers.
    ///
    /// Returns the number of callbacks run.
    pub(crate) fn turn(&self, timeout: Option<Duration>) -> io::Result<usize> {
        let timeout = match (timeout, self.next_deadline()) {
            (timeout, None) => timeout,
            (None, Some(deadline)) => Some(deadline.saturating_duration_since(Instant::now())),
            (Some(timeout), Some(deadline)) => {
                Some(timeout.min(deadline.saturating_duration_since(Instant::now())))
            }
        };

        let ready = {
            let mut poll = self.poll.borrow_mut();
            let mut events = self.events.borrow_mut();
            if let Err(err) = poll.poll(&mut events, timeout) {
                if err.kind() != io::ErrorKind::Interrupted {
                    return Err(err);
                }
                events.clear();
            }

            events
                .iter()
                .filter(|event| event.token() != WAKE_TOKEN)
                .map(|event| {
                    let fd = event.token().0 as RawFd;
                    let readable =
                        event.is_readable() || event.is_read_closed() || event.is_error();
                    let writable =
                        event.is_writable() || event.is_write_closed() || event.is_error();
                    (fd, readable, writable)
                })
                .collect::<Vec<_>>()
        };

        let mut dispatched = 0;
        for (fd, readable, writable) in ready {
            // Looked up now rather than at collection time: an earlier callback in this batch
            // may have replaced or removed the watch.
            if readable {
                let reader = self.watches.borrow().get(&fd).and_then(|w| w.reader.clone());
                if let Some(reader) = reader {
                    reader();
                    dispatched += 1;
                }
            }
            if writable {
                let writer = self.watches.borrow().get(&fd).and_then(|w| w.writer.clone());
                if let Some(writer) = writer {
                    writer();
                    dispatched += 1;
                }
            }
            self.rearm(fd);
        }

        // Timers armed by the callbacks below wait for the next turn.
        let now = Instant::now();
        let horizon = self.timers.borrow().last_armed();
        loop {
            let expired = self.timers.borrow_mut().pop_expired(now, horizon);
            let Some((timer, callback)) = expired else {
                break;
            };
            trace!(%timer, "timer fired");
            callback();
            dispatched += 1;
        }

        Ok(dispatched)
    }

    /// mio is edge-triggered; re-registering a socket that is still ready makes it report
    /// again on the next poll.
    fn rearm(&self, fd: RawFd) {
        let registered = self.watches.borrow().get(&fd).and_then(|w| w.registered);
        let Some(interest) = registered else {
            return;
        };
        let poll = self.poll.borrow();
        if let Err(err) =
            poll.registry()
                .reregister(&mut SourceFd(&fd), Token(fd as usize), interest)
        {
            warn!(fd, error = %err, "failed to re-arm socket");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::io::Write;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::rc::Rc;

    fn counter() -> (Rc<Cell<usize>>, Callback) {
        let hits = Rc::new(Cell::new(0));
        let inner = hits.clone();
        (hits, Rc::new(move || inner.set(inner.get() + 1)))
    }

    #[test]
    fn readable_socket_fires_reader_until_unwatched() {
        let reactor = Reactor::new(64).unwrap();
        let (mut a, b) = UnixStream::pair().unwrap();
        b.set_nonblocking(true).unwrap();
        let fd = b.as_raw_fd();

        let (hits, reader) = counter();
        reactor.set_reader(fd, Some(reader)).unwrap();
        a.write_all(b"ping").unwrap();

        reactor.turn(Some(Duration::from_secs(1))).unwrap();
        assert_eq!(hits.get(), 1);

        // The data was never read, so level semantics report it again.
        reactor.turn(Some(Duration::from_secs(1))).unwrap();
        assert_eq!(hits.get(), 2);

        reactor.set_reader(fd, None).unwrap();
        assert!(!reactor.is_watching(fd));
        reactor.turn(Some(Duration::from_millis(10))).unwrap();
        assert_eq!(hits.get(), 2);
    }

    #[test]
    fn writer_and_reader_share_one_registration() {
        let reactor = Reactor::new(64).unwrap();
        let (a, _b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        let fd = a.as_raw_fd();

        let (reads, reader) = counter();
        let (writes, writer) = counter();
        reactor.set_reader(fd, Some(reader)).unwrap();
        reactor.set_writer(fd, Some(writer)).unwrap();

        reactor.turn(Some(Duration::from_secs(1))).unwrap();
        assert_eq!(writes.get(), 1);
        assert_eq!(reads.get(), 0);

        reactor.set_writer(fd, None).unwrap();
        assert!(reactor.is_watching(fd));
        reactor.set_reader(fd, None).unwrap();
        assert!(reactor.is_idle());
    }

    #[test]
    fn timers_fire_after_their_delay() {
        let reactor = Reactor::new(8).unwrap();
        let (hits, callback) = counter();
        let (cancelled_hits, cancelled) = counter();

        reactor.arm_timer(Duration::from_millis(5), callback);
        let doomed = reactor.arm_timer(Duration::from_millis(5), cancelled);
        reactor.cancel_timer(doomed);

        let started = Instant::now();
        while hits.get() == 0 {
            reactor.turn(None).unwrap();
        }
        assert!(started.elapsed() >= Duration::from_millis(5));
        assert_eq!(cancelled_hits.get(), 0);
        assert!(reactor.is_idle());
    }

    #[test]
    fn zero_delay_timer_armed_by_timer_waits_a_turn() {
        let reactor = Rc::new(Reactor::new(8).unwrap());
        let (hits, second) = counter();
        let chained = reactor.clone();
        reactor.arm_timer(
            Duration::ZERO,
            Rc::new(move || {
                chained.arm_timer(Duration::ZERO, second.clone());
            }),
        );

        reactor.turn(Some(Duration::ZERO)).unwrap();
        assert_eq!(hits.get(), 0);
        reactor.turn(Some(Duration::from_millis(50))).unwrap();
        assert_eq!(hits.get(), 1);
    }
}
