//! Error types shared by the runtime, the multiplexer and transfer handles.

use std::io;

use thiserror::Error;

use crate::config::ConfigError;
use crate::engine::MultiOption;
use crate::transfer::TransferState;

/// Convenience alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Everything that can go wrong while configuring, submitting or driving a transfer.
///
/// [`Error::Cancelled`] is reported when a suspension point was interrupted by
/// [`Transfer::cancel`](crate::Transfer::cancel) or
/// [`Multiplexer::cancel`](crate::Multiplexer::cancel), or when the work behind it was dropped
/// unfinished. Use [`Error::is_cancelled`] to tell it apart from a real failure.
#[derive(Debug, Error)]
pub enum Error {
    /// The caller tried to override one of the bridge's own engine callbacks.
    #[error("option {0:?} is reserved for the event loop")]
    ReservedOption(MultiOption),

    /// The operation is not valid in the handle's current lifecycle state.
    #[error(transparent)]
    State(#[from] StateError),

    /// The engine reported that the transfer failed.
    #[error(transparent)]
    Transfer(#[from] TransferError),

    /// The awaited transfer was cancelled.
    #[error("transfer was cancelled")]
    Cancelled,

    /// The multiplexer has already been closed.
    #[error("multiplexer is closed")]
    Closed,

    /// The engine rejected a synchronous request (add, remove, step or option).
    #[error("engine error {code}: {message}")]
    Engine { code: i32, message: String },

    /// The scheduler failed to register or deregister a watch.
    #[error("scheduler registration failed: {0}")]
    Io(#[from] io::Error),

    /// The runtime configuration could not be built.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl Error {
    /// Builds an [`Error::Engine`] from an engine-specific code and message.
    pub fn engine(code: i32, message: impl Into<String>) -> Self {
        Error::Engine {
            code,
            message: message.into(),
        }
    }

    /// Returns `true` if this error is the cancellation signal of a suspension point.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// Returns the engine failure carried by this error, if any.
    pub fn as_transfer(&self) -> Option<&TransferError> {
        match self {
            Error::Transfer(err) => Some(err),
            _ => None,
        }
    }
}

/// A transfer that the engine reported as failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("transfer failed with code {code}: {message}")]
pub struct TransferError {
    /// Engine-specific numeric error code.
    pub code: i32,
    /// Human-readable message as reported by the engine.
    pub message: String,
}

impl TransferError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Operations requested on a handle in an invalid lifecycle state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    #[error("transfer is already in flight")]
    AlreadyInFlight,

    #[error("transfer must be idle, but it is {0:?}")]
    NotIdle(TransferState),

    #[error("transfer handle is closed")]
    Closed,

    #[error("transfer belongs to a different multiplexer")]
    ForeignMultiplexer,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_is_distinguishable_from_failure() {
        assert!(Error::Cancelled.is_cancelled());

        let failed = Error::from(TransferError::new(7, "couldn't connect"));
        assert!(!failed.is_cancelled());
        assert_eq!(failed.as_transfer().map(|e| e.code), Some(7));
        assert_eq!(
            failed.to_string(),
            "transfer failed with code 7: couldn't connect"
        );
    }

    #[test]
    fn state_errors_convert() {
        let err: Error = StateError::AlreadyInFlight.into();
        assert!(matches!(err, Error::State(StateError::AlreadyInFlight)));
        assert_eq!(err.to_string(), "transfer is already in flight");
    }
}
