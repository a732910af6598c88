//! Event-driven I/O reactor.
//!
//! The reactor monitors socket readiness and timers and runs the callbacks registered for them
//! on the runtime thread.

#[allow(clippy::module_inception)]
mod reactor;
mod timer;

pub(crate) use reactor::Reactor;
