//! The multiplexer: one engine, many awaited transfers.
//!
//! The multiplexer owns the engine and a [`SocketBridge`] that the engine calls back into while
//! it runs. Scheduler events come back through the bridge as [`Dispatch`] calls and end up in
//! [`Multiplexer::socket_action`], which steps the engine and drains finished transfers into
//! their pending completions.
//!
//! A pending completion dropped before it resolved comes back through [`Abandon`] and cancels
//! its transfer.

mod bridge;

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::os::fd::RawFd;
use std::rc::{Rc, Weak};
use std::time::Duration;

use metrics::{counter, gauge};
use tracing::{debug, error, trace, warn};

use self::bridge::{Dispatch, SocketBridge};
use crate::completion::{self, Abandon, Pending, Resolver};
use crate::engine::{Engine, MultiOption, OptionValue, Ready, Rejected, Socket, TransferId};
use crate::error::{Error, Result, StateError, TransferError};
use crate::scheduler::Scheduler;
use crate::transfer::{Transfer, TransferCell, TransferState};

struct InFlight<E: Engine> {
    cell: Rc<TransferCell<E::Transfer>>,
    resolver: Resolver<Transfer<E>>,
}

/// How a transfer left the in-flight map.
enum Outcome {
    Completed,
    Failed(TransferError),
    Stopped,
    Cancelled,
}

impl Outcome {
    fn state(&self) -> TransferState {
        match self {
            Outcome::Completed => TransferState::Completed,
            Outcome::Failed(_) => TransferState::Failed,
            Outcome::Stopped => TransferState::Stopped,
            Outcome::Cancelled => TransferState::Cancelled,
        }
    }
}

struct Finished<E: Engine> {
    flight: InFlight<E>,
    /// `None` if the engine failed to hand the native transfer back.
    native: Option<E::Transfer>,
    outcome: Outcome,
}

struct Inner<E: Engine> {
    /// `None` once the multiplexer is closed.
    engine: Option<E>,
    bridge: SocketBridge,
    transfers: HashMap<TransferId, InFlight<E>>,
}

impl<E: Engine> Inner<E> {
    /// Removes `id` from the engine and from the in-flight map.
    ///
    /// The map entry is removed even if the engine refuses, so the caller always gets the
    /// flight back to resolve.
    fn remove(&mut self, id: TransferId) -> Option<(InFlight<E>, Result<E::Transfer>)> {
        let flight = self.transfers.remove(&id)?;
        let native = match self.engine.as_mut() {
            Some(engine) => engine.remove_transfer(id, &mut self.bridge),
            None => Err(Error::Closed),
        };
        Some((flight, native))
    }

    /// Pulls every completion the engine has queued, in engine order.
    fn drain(&mut self, finished: &mut Vec<Finished<E>>) {
        loop {
            let Some(completion) = self.engine.as_mut().and_then(|e| e.next_completion()) else {
                break;
            };
            let id = completion.id;

            let Some((flight, native)) = self.remove(id) else {
                warn!(%id, "engine reported completion for an unknown transfer");
                continue;
            };
            let native = native
                .inspect_err(|err| {
                    warn!(%id, error = %err, "engine failed to release a finished transfer")
                })
                .ok();

            let outcome = match completion.result {
                Ok(()) => Outcome::Completed,
                Err(err) => Outcome::Failed(err),
            };
            debug!(%id, ok = matches!(outcome, Outcome::Completed), "transfer finished");
            finished.push(Finished {
                flight,
                native,
                outcome,
            });
        }
    }

    fn report_in_flight(&self) {
        gauge!("xfer_run_transfers_in_flight").set(self.transfers.len() as f64);
    }
}

/// The last handle went away without a `close`; whatever is still in flight ends as stopped.
impl<E: Engine> Drop for Inner<E> {
    fn drop(&mut self) {
        let ids: Vec<TransferId> = self.transfers.keys().copied().collect();
        if !ids.is_empty() {
            debug!(in_flight = ids.len(), "multiplexer dropped with transfers in flight");
        }
        for id in ids {
            let Some((InFlight { cell, resolver }, native)) = self.remove(id) else {
                continue;
            };
            let native = native
                .inspect_err(|err| warn!(%id, error = %err, "engine failed to release a transfer"))
                .ok();
            cell.settle(native, TransferState::Stopped);
            counter!("xfer_run_transfers_stopped_total").increment(1);
            resolver.stop();
        }
        self.report_in_flight();
        self.bridge.shutdown();
    }
}

pub(crate) struct Shared<E: Engine> {
    inner: RefCell<Inner<E>>,
    /// Used to retry an abandon that arrived while `inner` was borrowed.
    scheduler: Rc<dyn Scheduler>,
}

impl<E: Engine + 'static> Abandon for Shared<E> {
    fn abandon(self: Rc<Self>, id: TransferId) {
        if self.inner.try_borrow_mut().is_err() {
            trace!(%id, "abandon deferred to the next turn");
            let weak = Rc::downgrade(&self);
            self.scheduler.arm_timer(
                Duration::ZERO,
                Rc::new(move || {
                    if let Some(shared) = weak.upgrade() {
                        shared.abandon(id);
                    }
                }),
            );
            return;
        }

        debug!(%id, "pending dropped before it resolved");
        if let Err(err) = (Multiplexer { shared: self }).interrupt(id, Outcome::Cancelled) {
            warn!(%id, error = %err, "engine failed to release an abandoned transfer");
        }
    }
}

impl<E: Engine + 'static> Dispatch for Shared<E> {
    fn socket_ready(self: Rc<Self>, fd: RawFd, ready: Ready) {
        Multiplexer { shared: self }.socket_action(Socket::Fd(fd), ready);
    }

    fn timer_fired(self: Rc<Self>) {
        self.inner.borrow_mut().bridge.timer_consumed();
        Multiplexer { shared: self }.socket_action(Socket::Timeout, Ready::EMPTY);
    }
}

/// Drives many transfers over one engine and hands out a [`Pending`] per transfer.
///
/// A multiplexer is a cheap clone over shared state and must stay on the thread of the
/// scheduler it was created with.
pub struct Multiplexer<E: Engine> {
    shared: Rc<Shared<E>>,
}

impl<E: Engine> Clone for Multiplexer<E> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<E: Engine> fmt::Debug for Multiplexer<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.shared.inner.borrow();
        f.debug_struct("Multiplexer")
            .field("in_flight", &inner.transfers.len())
            .field("closed", &inner.engine.is_none())
            .field("timer", &inner.bridge.armed_timer())
            .finish()
    }
}

impl<E: Engine + 'static> Multiplexer<E> {
    /// Takes ownership of `engine` and routes its socket and timer requests to `scheduler`.
    pub fn new(engine: E, scheduler: impl Scheduler + 'static) -> Self {
        Self::with_scheduler(engine, Rc::new(scheduler))
    }

    /// Like [`new`](Self::new), on the runtime entered on this thread.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a runtime context.
    pub fn current(engine: E) -> Self {
        Self::new(engine, crate::runtime::current())
    }

    pub fn with_scheduler(engine: E, scheduler: Rc<dyn Scheduler>) -> Self {
        let shared = Rc::new_cyclic(|weak: &Weak<Shared<E>>| {
            let dispatch: Weak<dyn Dispatch> = weak.clone();
            Shared {
                inner: RefCell::new(Inner {
                    engine: Some(engine),
                    bridge: SocketBridge::new(scheduler.clone(), dispatch),
                    transfers: HashMap::new(),
                }),
                scheduler,
            }
        });
        Self { shared }
    }

    /// Creates a handle for `native` that runs on this multiplexer.
    pub fn transfer(&self, native: E::Transfer) -> Transfer<E> {
        Transfer::new(self, native)
    }

    /// Number of transfers currently in flight.
    pub fn in_flight(&self) -> usize {
        self.shared.inner.borrow().transfers.len()
    }

    pub fn is_in_flight(&self, transfer: &Transfer<E>) -> bool {
        self.shared
            .inner
            .borrow()
            .transfers
            .contains_key(&transfer.id())
    }

    pub fn is_closed(&self) -> bool {
        self.shared.inner.borrow().engine.is_none()
    }

    pub fn version(&self) -> String {
        let inner = self.shared.inner.borrow();
        let engine = inner
            .engine
            .as_ref()
            .map_or_else(|| "closed".to_owned(), |e| e.version());
        format!("xfer_run/{} {}", env!("CARGO_PKG_VERSION"), engine)
    }

    /// Forwards an option to the engine.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ReservedOption`] for [`MultiOption::SocketFunction`] and
    /// [`MultiOption::TimerFunction`]; those belong to the bridge.
    pub fn set_option(&self, option: MultiOption, value: OptionValue) -> Result<()> {
        if option.is_reserved() {
            return Err(Error::ReservedOption(option));
        }
        let mut inner = self.shared.inner.borrow_mut();
        let engine = inner.engine.as_mut().ok_or(Error::Closed)?;
        engine.set_option(option, value)
    }

    /// Registers `transfer` with the engine and returns its pending completion.
    ///
    /// The engine may request socket watches or arm its timer before this returns. Dropping
    /// the returned pending before it resolves cancels the transfer.
    ///
    /// # Errors
    ///
    /// A state error if the transfer is already in flight, [`Error::Closed`] after
    /// [`close`](Self::close), or whatever the engine or scheduler reported while adding it.
    pub fn perform(&self, transfer: &Transfer<E>) -> Result<Pending<Transfer<E>>> {
        if !Rc::ptr_eq(&transfer.multiplexer().shared, &self.shared) {
            return Err(StateError::ForeignMultiplexer.into());
        }

        let mut guard = self.shared.inner.borrow_mut();
        let inner = &mut *guard;
        let id = transfer.id();

        if inner.transfers.contains_key(&id) {
            return Err(StateError::AlreadyInFlight.into());
        }
        let engine = inner.engine.as_mut().ok_or(Error::Closed)?;

        let cell = transfer.cell();
        let native = cell.submit()?;
        if let Err(Rejected { transfer, error }) =
            engine.add_transfer(id, native, &mut inner.bridge)
        {
            cell.settle(Some(transfer), TransferState::Idle);
            debug!(%id, %error, "engine rejected transfer");
            return Err(error);
        }

        let (resolver, pending) = completion::pending();
        inner.transfers.insert(
            id,
            InFlight {
                cell: cell.clone(),
                resolver,
            },
        );

        debug!(%id, in_flight = inner.transfers.len(), "transfer submitted");
        counter!("xfer_run_transfers_submitted_total").increment(1);
        inner.report_in_flight();

        let owner: Weak<dyn Abandon> = Rc::downgrade(&self.shared) as Weak<Shared<E>>;
        Ok(pending.abandon_to(owner, id))
    }

    /// Removes an in-flight transfer; its `perform()` resolves to `None`.
    ///
    /// Returns `Ok(false)` without doing anything if the transfer is not in flight, including
    /// after [`close`](Self::close).
    ///
    /// # Errors
    ///
    /// If the engine fails to remove the transfer the completion is still resolved and the
    /// transfer leaves the in-flight map, but the error is returned and the handle can no
    /// longer run.
    pub fn stop(&self, transfer: &Transfer<E>) -> Result<bool> {
        self.interrupt(transfer.id(), Outcome::Stopped)
    }

    /// Removes an in-flight transfer; its `perform()` resolves to
    /// [`Error::Cancelled`](crate::Error::Cancelled).
    ///
    /// Same no-op and error behaviour as [`stop`](Self::stop).
    pub fn cancel(&self, transfer: &Transfer<E>) -> Result<bool> {
        self.interrupt(transfer.id(), Outcome::Cancelled)
    }

    fn interrupt(&self, id: TransferId, outcome: Outcome) -> Result<bool> {
        let removed = {
            let mut inner = self.shared.inner.borrow_mut();
            let removed = inner.remove(id);
            inner.report_in_flight();
            removed
        };

        let Some((flight, native)) = removed else {
            trace!(%id, "interrupt of a transfer that is not in flight ignored");
            return Ok(false);
        };

        debug!(%id, state = ?outcome.state(), "transfer interrupted");
        let (native, result) = match native {
            Ok(native) => (Some(native), Ok(true)),
            Err(err) => (None, Err(err)),
        };
        self.resolve(Finished {
            flight,
            native,
            outcome,
        });
        result
    }

    /// Stops every in-flight transfer and releases the engine.
    ///
    /// Every outstanding `perform()` resolves to `None`. Calling `close` again does nothing.
    pub fn close(&self) {
        let ids: Vec<TransferId> = self.shared.inner.borrow().transfers.keys().copied().collect();
        for id in ids {
            if let Err(err) = self.interrupt(id, Outcome::Stopped) {
                warn!(%id, error = %err, "engine failed to release a transfer during close");
            }
        }

        let engine = {
            let mut inner = self.shared.inner.borrow_mut();
            inner.bridge.shutdown();
            inner.engine.take()
        };
        if engine.is_some() {
            debug!("multiplexer closed");
        }
        drop(engine);
    }

    /// Steps the engine for `socket` and resolves whatever it finished.
    ///
    /// Called by the bridge for every readiness and timeout event. There is no caller to
    /// report a failure to, so errors are logged and counted.
    pub(crate) fn socket_action(&self, socket: Socket, ready: Ready) {
        if let Err(err) = self.try_socket_action(socket, ready) {
            error!(?socket, error = %err, "engine step failed");
            counter!("xfer_run_step_errors_total").increment(1);
        }
    }

    fn try_socket_action(&self, socket: Socket, ready: Ready) -> Result<()> {
        let mut finished = Vec::new();
        {
            let mut guard = self.shared.inner.borrow_mut();
            let inner = &mut *guard;
            let Some(engine) = inner.engine.as_mut() else {
                trace!(?socket, "event after close ignored");
                return Ok(());
            };

            let running = engine.step(socket, ready, &mut inner.bridge)?;
            trace!(?socket, running, in_flight = inner.transfers.len(), "engine stepped");

            if running != inner.transfers.len() {
                inner.drain(&mut finished);
                inner.report_in_flight();
            }
        }

        for done in finished {
            self.resolve(done);
        }
        Ok(())
    }

    /// Settles the handle and resolves its completion. Never re-enters the engine.
    fn resolve(&self, done: Finished<E>) {
        let Finished {
            flight,
            native,
            outcome,
        } = done;
        let InFlight { cell, resolver } = flight;
        cell.settle(native, outcome.state());

        match outcome {
            Outcome::Completed => {
                counter!("xfer_run_transfers_completed_total").increment(1);
                resolver.resolve(Transfer::from_cell(cell, self.clone()));
            }
            Outcome::Failed(err) => {
                counter!("xfer_run_transfers_failed_total").increment(1);
                resolver.fail(err);
            }
            Outcome::Stopped => {
                counter!("xfer_run_transfers_stopped_total").increment(1);
                resolver.stop();
            }
            Outcome::Cancelled => {
                counter!("xfer_run_transfers_cancelled_total").increment(1);
                resolver.cancel();
            }
        }
    }
}
