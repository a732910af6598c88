//! Caller-facing transfer handles.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use crate::completion::Pending;
use crate::engine::{Engine, TransferId};
use crate::error::{Result, StateError};
use crate::multi::Multiplexer;
use crate::scheduler::Scheduler;

/// Lifecycle of a [`Transfer`] as observed through its multiplexer.
///
/// ```text
/// Idle ──perform──► Submitted ──► Completed | Failed | Stopped | Cancelled
///   ▲                                        │
///   └──────────────────reset─────────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferState {
    Idle,
    Submitted,
    Completed,
    Failed,
    Stopped,
    Cancelled,
    Closed,
}

impl TransferState {
    /// A finished transfer that must be [`reset`](Transfer::reset) before it can run again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransferState::Completed
                | TransferState::Failed
                | TransferState::Stopped
                | TransferState::Cancelled
        )
    }
}

struct Slot<T> {
    state: TransferState,
    native: Option<T>,
}

/// State shared by every clone of a handle and by the multiplexer while the transfer runs.
///
/// The native transfer lives here while the handle is idle and inside the engine while it is
/// submitted.
pub(crate) struct TransferCell<T> {
    id: TransferId,
    /// Set for transfers created with [`Transfer::standalone`]; closing any handle to them
    /// also closes their private multiplexer.
    owns_multi: bool,
    slot: RefCell<Slot<T>>,
}

impl<T> TransferCell<T> {
    fn new(native: T, owns_multi: bool) -> Rc<Self> {
        Rc::new(Self {
            id: TransferId::next(),
            owns_multi,
            slot: RefCell::new(Slot {
                state: TransferState::Idle,
                native: Some(native),
            }),
        })
    }

    pub(crate) fn id(&self) -> TransferId {
        self.id
    }

    pub(crate) fn state(&self) -> TransferState {
        self.slot.borrow().state
    }

    /// Moves the native transfer out for submission.
    pub(crate) fn submit(&self) -> Result<T, StateError> {
        let mut slot = self.slot.borrow_mut();
        match slot.state {
            TransferState::Idle => {}
            TransferState::Submitted => return Err(StateError::AlreadyInFlight),
            TransferState::Closed => return Err(StateError::Closed),
            state => return Err(StateError::NotIdle(state)),
        }
        let native = slot.native.take().ok_or(StateError::Closed)?;
        slot.state = TransferState::Submitted;
        Ok(native)
    }

    /// Hands the native transfer back and records how the submission ended.
    ///
    /// `None` means the engine kept the native transfer; the handle can no longer run.
    pub(crate) fn settle(&self, native: Option<T>, state: TransferState) {
        let mut slot = self.slot.borrow_mut();
        slot.native = native;
        slot.state = state;
    }
}

/// A single configured transfer.
///
/// A handle is a cheap clone over shared state: one task can await [`perform`](Self::perform)
/// while another holds a clone to [`stop`](Self::stop) or [`cancel`](Self::cancel) it.
pub struct Transfer<E: Engine> {
    cell: Rc<TransferCell<E::Transfer>>,
    multi: Multiplexer<E>,
}

impl<E: Engine> Clone for Transfer<E> {
    fn clone(&self) -> Self {
        Self {
            cell: self.cell.clone(),
            multi: self.multi.clone(),
        }
    }
}

impl<E: Engine> fmt::Debug for Transfer<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transfer")
            .field("id", &self.cell.id)
            .field("state", &self.cell.state())
            .finish()
    }
}

impl<E: Engine + 'static> Transfer<E> {
    /// Wraps `native` in a handle that runs on `multi`.
    pub fn new(multi: &Multiplexer<E>, native: E::Transfer) -> Self {
        Self {
            cell: TransferCell::new(native, false),
            multi: multi.clone(),
        }
    }

    /// Wraps `native` in a handle with a private multiplexer of its own.
    ///
    /// Closing the handle, or the one a finished `perform()` hands back, also closes that
    /// multiplexer.
    pub fn standalone(engine: E, scheduler: impl Scheduler + 'static, native: E::Transfer) -> Self {
        let multi = Multiplexer::new(engine, scheduler);
        Self {
            cell: TransferCell::new(native, true),
            multi,
        }
    }

    pub(crate) fn from_cell(cell: Rc<TransferCell<E::Transfer>>, multi: Multiplexer<E>) -> Self {
        Self { cell, multi }
    }

    pub(crate) fn cell(&self) -> &Rc<TransferCell<E::Transfer>> {
        &self.cell
    }

    pub fn id(&self) -> TransferId {
        self.cell.id
    }

    pub fn state(&self) -> TransferState {
        self.cell.state()
    }

    pub fn multiplexer(&self) -> &Multiplexer<E> {
        &self.multi
    }

    /// Gives `f` access to the native transfer for configuration.
    ///
    /// # Errors
    ///
    /// Fails with a [`StateError`] while the transfer is in flight or after it was closed.
    /// `f` may query the handle, but a [`perform`](Self::perform) or nested `configure` from
    /// inside it fails as if the transfer were closed.
    pub fn configure<R>(&self, f: impl FnOnce(&mut E::Transfer) -> R) -> Result<R> {
        let mut native = {
            let mut slot = self.cell.slot.borrow_mut();
            match slot.state {
                TransferState::Submitted => return Err(StateError::AlreadyInFlight.into()),
                TransferState::Closed => return Err(StateError::Closed.into()),
                _ => slot.native.take().ok_or(StateError::Closed)?,
            }
        };

        let out = f(&mut native);

        let mut slot = self.cell.slot.borrow_mut();
        if slot.state != TransferState::Closed {
            slot.native = Some(native);
        }
        Ok(out)
    }

    /// Submits the transfer and returns the suspension point to await.
    ///
    /// The pending resolves to this handle on success, to `None` if the transfer was stopped,
    /// to [`Error::Transfer`](crate::Error::Transfer) if the engine reported a failure and to
    /// [`Error::Cancelled`](crate::Error::Cancelled) if it was cancelled.
    ///
    /// # Errors
    ///
    /// Fails immediately if the handle is already in flight, finished without a
    /// [`reset`](Self::reset), closed, or if the multiplexer is closed.
    ///
    /// ```ignore
    /// match transfer.perform()?.await {
    ///     Ok(Some(done)) => println!("{done:?} finished"),
    ///     Ok(None) => println!("stopped"),
    ///     Err(err) if err.is_cancelled() => println!("cancelled"),
    ///     Err(err) => return Err(err),
    /// }
    /// ```
    pub fn perform(&self) -> Result<Pending<Transfer<E>>> {
        self.multi.perform(self)
    }

    /// Ends the transfer early; an outstanding `perform()` resolves to `None`.
    ///
    /// No-op if the transfer is not in flight.
    pub fn stop(&self) -> Result<()> {
        self.multi.stop(self).map(|_| ())
    }

    /// Ends the transfer early; an outstanding `perform()` resolves to
    /// [`Error::Cancelled`](crate::Error::Cancelled).
    ///
    /// No-op if the transfer is not in flight.
    pub fn cancel(&self) -> Result<()> {
        self.multi.cancel(self).map(|_| ())
    }

    /// Returns a finished handle to [`TransferState::Idle`] so it can be performed again.
    pub fn reset(&self) -> Result<()> {
        let mut slot = self.cell.slot.borrow_mut();
        match slot.state {
            TransferState::Idle => Ok(()),
            TransferState::Submitted => Err(StateError::AlreadyInFlight.into()),
            TransferState::Closed => Err(StateError::Closed.into()),
            _ if slot.native.is_none() => Err(StateError::Closed.into()),
            _ => {
                slot.state = TransferState::Idle;
                Ok(())
            }
        }
    }

    /// Stops the transfer if it is running and releases the native transfer for good.
    ///
    /// Never fails: a stop that the engine refuses is logged by the multiplexer.
    pub fn close(&self) {
        if let Err(err) = self.stop() {
            tracing::warn!(id = %self.id(), error = %err, "stop during close failed");
        }
        self.cell.settle(None, TransferState::Closed);
        if self.cell.owns_multi {
            self.multi.close();
        }
    }
}
