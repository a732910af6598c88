//! A single-threaded async runtime that drives a socket-multiplexing transfer engine.
//!
//! Transfer engines in the style of a "multi" interface never block: they ask their host to
//! watch sockets and to call back after a timeout, and report finished transfers when stepped.
//! This crate bridges such an engine to a cooperative scheduler and turns each submitted
//! transfer into a future. It consists of:
//!
//! - [`Multiplexer`]: owns the engine, tracks in-flight transfers and resolves their
//!   completions
//! - [`Transfer`]: a handle to one engine-native transfer and its lifecycle
//! - [`engine`]: the [`Engine`] contract and the socket/timer [`Bridge`] it calls into
//! - [`Runtime`]: a mio-backed executor and reactor implementing [`Scheduler`]
//!
//! ```ignore
//! #[xfer_run::main]
//! async fn main() -> xfer_run::Result<()> {
//!     let multi = xfer_run::Multiplexer::current(MyEngine::new());
//!     let transfer = multi.transfer(MyRequest::get("http://localhost/"));
//!     match transfer.perform()?.await? {
//!         Some(done) => println!("{} finished", done.id()),
//!         None => println!("stopped"),
//!     }
//!     Ok(())
//! }
//! ```

mod completion;
pub mod config;
pub mod engine;
pub mod error;
mod executor;
pub mod logging;
mod multi;
mod reactor;
pub mod runtime;
pub mod scheduler;
mod task;
#[cfg(any(test, feature = "test-support"))]
pub mod testing;
mod transfer;
mod waker;

pub use completion::Pending;
pub use config::{ConfigError, RuntimeConfig};
pub use engine::{
    Bridge, Completion, Engine, MultiOption, OptionValue, Ready, Rejected, Socket, SocketEvents,
    TransferId,
};
pub use error::{Error, Result, StateError, TransferError};
pub use executor::JoinHandle;
pub use multi::Multiplexer;
pub use runtime::{Handle, Runtime, spawn};
pub use scheduler::{Callback, Scheduler, TimerId};
pub use transfer::{Transfer, TransferState};

pub use xfer_run_macros::main;
