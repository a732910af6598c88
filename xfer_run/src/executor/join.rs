use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::channel::oneshot;

use crate::error::{Error, Result};

/// An owned handle to a spawned task's output.
///
/// Dropping the handle detaches the task; it keeps running. Awaiting it yields
/// [`Error::Cancelled`] if the task was dropped before finishing, which happens when the
/// runtime shuts down.
#[must_use = "dropping a JoinHandle detaches the task"]
#[derive(Debug)]
pub struct JoinHandle<T> {
    rx: oneshot::Receiver<T>,
}

impl<T> JoinHandle<T> {
    pub(crate) fn new(rx: oneshot::Receiver<T>) -> Self {
        Self { rx }
    }
}

impl<T> Future for JoinHandle<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|out| out.map_err(|oneshot::Canceled| Error::Cancelled))
    }
}
