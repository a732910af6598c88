//! Translates the engine's watch and timer requests into scheduler registrations.

use std::collections::HashSet;
use std::os::fd::RawFd;
use std::rc::{Rc, Weak};
use std::time::Duration;

use metrics::counter;
use tracing::{trace, warn};

use crate::engine::{Bridge, Ready, SocketEvents};
use crate::error::Result;
use crate::scheduler::{Callback, Scheduler, TimerId};

/// Receives the events the bridge registered for.
///
/// Implemented by the multiplexer's shared state; the bridge only holds a weak reference so
/// a registration outliving the multiplexer fires into nothing.
pub(crate) trait Dispatch {
    fn socket_ready(self: Rc<Self>, fd: RawFd, ready: Ready);

    fn timer_fired(self: Rc<Self>);
}

pub(crate) struct SocketBridge {
    scheduler: Rc<dyn Scheduler>,
    dispatch: Weak<dyn Dispatch>,
    timer: Option<TimerId>,
    /// Sockets with at least one live registration. Read only by [`shutdown`](Self::shutdown)
    /// to release them; [`watch_socket`](Bridge::watch_socket) never consults it and always
    /// forwards the engine's latest bitmask as given.
    watched: HashSet<RawFd>,
}

impl SocketBridge {
    pub(crate) fn new(scheduler: Rc<dyn Scheduler>, dispatch: Weak<dyn Dispatch>) -> Self {
        Self {
            scheduler,
            dispatch,
            timer: None,
            watched: HashSet::new(),
        }
    }

    pub(crate) fn armed_timer(&self) -> Option<TimerId> {
        self.timer
    }

    /// Forgets the armed timer after the scheduler fired it.
    pub(crate) fn timer_consumed(&mut self) {
        self.timer = None;
    }

    fn ready_callback(&self, fd: RawFd, ready: Ready) -> Callback {
        let dispatch = self.dispatch.clone();
        Rc::new(move || {
            if let Some(dispatch) = dispatch.upgrade() {
                dispatch.socket_ready(fd, ready);
            }
        })
    }

    /// Cancels the armed timer and drops every remaining socket registration.
    pub(crate) fn shutdown(&mut self) {
        if let Some(timer) = self.timer.take() {
            self.scheduler.cancel_timer(timer);
        }
        for fd in self.watched.drain() {
            let reader = self.scheduler.remove_readable(fd);
            let writer = self.scheduler.remove_writable(fd);
            if let Err(err) = reader.and(writer) {
                warn!(fd, error = %err, "failed to release socket watch on shutdown");
            }
        }
    }
}

impl Bridge for SocketBridge {
    fn watch_socket(&mut self, fd: RawFd, events: SocketEvents) -> Result<()> {
        trace!(fd, ?events, "socket watch requested");

        if events.is_remove() {
            self.watched.remove(&fd);
            self.scheduler.remove_readable(fd)?;
            self.scheduler.remove_writable(fd)?;
            return Ok(());
        }

        // The latest bitmask is authoritative: a direction missing from it is unwatched.
        if events.contains(SocketEvents::IN) {
            let callback = self.ready_callback(fd, Ready::READABLE);
            self.scheduler.on_readable(fd, callback)?;
        } else {
            self.scheduler.remove_readable(fd)?;
        }

        if events.contains(SocketEvents::OUT) {
            let callback = self.ready_callback(fd, Ready::WRITABLE);
            self.scheduler.on_writable(fd, callback)?;
        } else {
            self.scheduler.remove_writable(fd)?;
        }

        if events == SocketEvents::NONE {
            self.watched.remove(&fd);
        } else {
            self.watched.insert(fd);
        }
        Ok(())
    }

    fn arm_timer(&mut self, timeout: Option<Duration>) -> Result<()> {
        if let Some(previous) = self.timer.take() {
            self.scheduler.cancel_timer(previous);
        }

        let Some(delay) = timeout else {
            trace!("engine timer disarmed");
            return Ok(());
        };

        let dispatch = self.dispatch.clone();
        let timer = self.scheduler.arm_timer(
            delay,
            Rc::new(move || {
                if let Some(dispatch) = dispatch.upgrade() {
                    dispatch.timer_fired();
                }
            }),
        );
        trace!(%timer, ?delay, "engine timer armed");
        counter!("xfer_run_timers_armed_total").increment(1);

        self.timer = Some(timer);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ManualScheduler, SchedulerCall};
    use std::cell::RefCell;

    #[derive(Default)]
    struct Recorder {
        events: RefCell<Vec<(Option<RawFd>, Ready)>>,
    }

    impl Dispatch for Recorder {
        fn socket_ready(self: Rc<Self>, fd: RawFd, ready: Ready) {
            self.events.borrow_mut().push((Some(fd), ready));
        }

        fn timer_fired(self: Rc<Self>) {
            self.events.borrow_mut().push((None, Ready::EMPTY));
        }
    }

    fn bridge() -> (SocketBridge, ManualScheduler, Rc<Recorder>) {
        let scheduler = ManualScheduler::new();
        let recorder = Rc::new(Recorder::default());
        let dispatch: Rc<dyn Dispatch> = recorder.clone();
        let bridge = SocketBridge::new(Rc::new(scheduler.clone()), Rc::downgrade(&dispatch));
        (bridge, scheduler, recorder)
    }

    #[test]
    fn watch_routes_readiness_to_dispatch() {
        let (mut bridge, scheduler, recorder) = bridge();

        bridge.watch_socket(5, SocketEvents::INOUT).unwrap();
        assert!(scheduler.is_reading(5));
        assert!(scheduler.is_writing(5));

        assert!(scheduler.fire_readable(5));
        assert!(scheduler.fire_writable(5));
        assert_eq!(
            *recorder.events.borrow(),
            vec![(Some(5), Ready::READABLE), (Some(5), Ready::WRITABLE)]
        );
    }

    #[test]
    fn changing_bitmask_rewatches_idempotently() {
        let (mut bridge, scheduler, _recorder) = bridge();

        bridge.watch_socket(7, SocketEvents::INOUT).unwrap();
        bridge.watch_socket(7, SocketEvents::INOUT).unwrap();
        bridge.watch_socket(7, SocketEvents::IN).unwrap();
        assert!(scheduler.is_reading(7));
        assert!(!scheduler.is_writing(7));

        bridge.watch_socket(7, SocketEvents::OUT).unwrap();
        assert!(!scheduler.is_reading(7));
        assert!(scheduler.is_writing(7));
    }

    #[test]
    fn remove_always_drops_both_directions() {
        let (mut bridge, scheduler, _recorder) = bridge();

        bridge.watch_socket(9, SocketEvents::IN).unwrap();
        scheduler.clear_calls();
        bridge.watch_socket(9, SocketEvents::REMOVE).unwrap();

        assert_eq!(
            scheduler.calls(),
            vec![
                SchedulerCall::RemoveReadable(9),
                SchedulerCall::RemoveWritable(9)
            ]
        );
        assert!(!scheduler.is_reading(9));
    }

    #[test]
    fn rearming_cancels_previous_timer_first() {
        let (mut bridge, scheduler, _recorder) = bridge();

        bridge.arm_timer(Some(Duration::from_millis(100))).unwrap();
        let first = bridge.armed_timer().unwrap();
        bridge.arm_timer(Some(Duration::from_millis(5))).unwrap();
        let second = bridge.armed_timer().unwrap();

        assert_eq!(
            scheduler.calls(),
            vec![
                SchedulerCall::ArmTimer(first, Duration::from_millis(100)),
                SchedulerCall::CancelTimer(first),
                SchedulerCall::ArmTimer(second, Duration::from_millis(5)),
            ]
        );
        assert_eq!(
            scheduler.armed_timers(),
            vec![(second, Duration::from_millis(5))]
        );
    }

    #[test]
    fn disarm_cancels_without_rearming() {
        let (mut bridge, scheduler, _recorder) = bridge();

        bridge.arm_timer(None).unwrap();
        assert!(scheduler.calls().is_empty());

        bridge.arm_timer(Some(Duration::ZERO)).unwrap();
        bridge.arm_timer(None).unwrap();
        assert!(scheduler.armed_timers().is_empty());
        assert_eq!(bridge.armed_timer(), None);
    }

    #[test]
    fn fired_timer_reaches_dispatch() {
        let (mut bridge, scheduler, recorder) = bridge();

        bridge.arm_timer(Some(Duration::from_millis(1))).unwrap();
        assert!(scheduler.fire_timer());
        assert_eq!(*recorder.events.borrow(), vec![(None, Ready::EMPTY)]);
    }

    #[test]
    fn registration_failure_propagates() {
        let (mut bridge, scheduler, _recorder) = bridge();
        scheduler.fail_registrations(true);

        let err = bridge.watch_socket(3, SocketEvents::IN).unwrap_err();
        assert!(matches!(err, crate::Error::Io(_)));
    }

    #[test]
    fn shutdown_releases_everything() {
        let (mut bridge, scheduler, _recorder) = bridge();

        bridge.watch_socket(3, SocketEvents::IN).unwrap();
        bridge.watch_socket(4, SocketEvents::OUT).unwrap();
        bridge.arm_timer(Some(Duration::from_secs(1))).unwrap();
        bridge.shutdown();

        assert!(!scheduler.is_reading(3));
        assert!(!scheduler.is_writing(4));
        assert!(scheduler.armed_timers().is_empty());
    }

    #[test]
    fn dropped_dispatch_is_ignored() {
        let (mut bridge, scheduler, recorder) = bridge();
        bridge.watch_socket(5, SocketEvents::IN).unwrap();
        drop(recorder);

        assert!(scheduler.fire_readable(5));
    }
}
