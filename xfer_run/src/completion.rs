//! Single-resolution suspension points.
//!
//! A [`Resolver`] and its [`Pending`] are created together when a transfer is submitted. The
//! resolver is kept by the multiplexer and consumed exactly once; the pending side is awaited
//! by the caller. Resolving only stores the outcome and wakes the awaiting task, which resumes
//! on a later turn of the scheduler.
//!
//! Dropping a [`Pending`] before it resolved gives up on the transfer behind it: its owner is
//! told through [`Abandon`] so the transfer leaves the engine instead of running to completion
//! for nobody.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll};

use futures::channel::oneshot;

use crate::engine::TransferId;
use crate::error::{Error, TransferError};

/// Told when the awaiting side of an unresolved suspension point goes away.
pub(crate) trait Abandon {
    fn abandon(self: Rc<Self>, id: TransferId);
}

/// How a suspension point was resolved.
#[derive(Debug)]
pub(crate) enum Resolution<T> {
    /// The transfer finished; `None` is the absent-result marker of a stopped transfer.
    Value(Option<T>),
    Failed(TransferError),
    Cancelled,
}

/// Creates a linked resolver / pending pair.
pub(crate) fn pending<T>() -> (Resolver<T>, Pending<T>) {
    let (tx, rx) = oneshot::channel();
    (
        Resolver { tx },
        Pending {
            rx,
            owner: None,
            resolved: false,
        },
    )
}

/// The resolving half of a suspension point.
#[derive(Debug)]
pub(crate) struct Resolver<T> {
    tx: oneshot::Sender<Resolution<T>>,
}

impl<T> Resolver<T> {
    pub(crate) fn resolve(self, value: T) {
        self.send(Resolution::Value(Some(value)));
    }

    pub(crate) fn stop(self) {
        self.send(Resolution::Value(None));
    }

    pub(crate) fn fail(self, error: TransferError) {
        self.send(Resolution::Failed(error));
    }

    pub(crate) fn cancel(self) {
        self.send(Resolution::Cancelled);
    }

    fn send(self, resolution: Resolution<T>) {
        // The awaiting side may already be gone; nobody is left to observe the outcome.
        let _ = self.tx.send(resolution);
    }
}

/// A suspension point that completes once its transfer is resolved.
///
/// Outputs `Ok(Some(value))` on success, `Ok(None)` if the transfer was stopped,
/// [`Error::Transfer`] if it failed and [`Error::Cancelled`] if it was cancelled. A pending
/// whose resolver was dropped without resolving also reports cancellation.
///
/// Dropping it unresolved cancels the transfer, the same as
/// [`Transfer::cancel`](crate::Transfer::cancel).
#[must_use = "a pending transfer does nothing unless awaited"]
pub struct Pending<T> {
    rx: oneshot::Receiver<Resolution<T>>,
    owner: Option<(Weak<dyn Abandon>, TransferId)>,
    resolved: bool,
}

impl<T> Pending<T> {
    /// Reports `id` to `owner` if this pending is dropped before it resolved.
    pub(crate) fn abandon_to(mut self, owner: Weak<dyn Abandon>, id: TransferId) -> Self {
        self.owner = Some((owner, id));
        self
    }
}

impl<T> fmt::Debug for Pending<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pending")
            .field("transfer", &self.owner.as_ref().map(|(_, id)| *id))
            .field("resolved", &self.resolved)
            .finish()
    }
}

impl<T> Future for Pending<T> {
    type Output = Result<Option<T>, Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let resolution = match Pin::new(&mut self.rx).poll(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(Ok(resolution)) => resolution,
            Poll::Ready(Err(oneshot::Canceled)) => Resolution::Cancelled,
        };
        self.resolved = true;

        Poll::Ready(match resolution {
            Resolution::Value(value) => Ok(value),
            Resolution::Failed(err) => Err(Error::Transfer(err)),
            Resolution::Cancelled => Err(Error::Cancelled),
        })
    }
}

impl<T> Drop for Pending<T> {
    fn drop(&mut self) {
        if self.resolved {
            return;
        }
        // Resolved but never polled: the owner has already forgotten the transfer.
        if let Ok(Some(_)) = self.rx.try_recv() {
            return;
        }
        if let Some((owner, id)) = self.owner.take() {
            if let Some(owner) = owner.upgrade() {
                owner.abandon(id);
            }
        }
    }
}
