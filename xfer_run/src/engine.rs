//! The contract between the multiplexer and a socket-multiplexing transfer engine.
//!
//! An engine owns many transfers and drives them over many non-blocking sockets. It never
//! waits on anything itself: it tells its [`Bridge`] which sockets it wants to be watched and
//! when it wants to be woken up, and it makes progress only when [`Engine::step`] is called.
//!
//! ```text
//!   Multiplexer ──add/remove/step──► Engine
//!        ▲                              │
//!        │                     watch_socket / arm_timer
//!        │                              ▼
//!   scheduler events ◄──register── SocketBridge
//! ```

use std::fmt;
use std::ops::BitOr;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::error::{Error, Result, TransferError};

static NEXT_TRANSFER_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies one transfer towards the engine.
///
/// Ids are unique for the lifetime of the process; a [`Transfer`](crate::Transfer) keeps the
/// same id across resubmissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransferId(u64);

impl TransferId {
    pub(crate) fn next() -> Self {
        Self(NEXT_TRANSFER_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The target of a [`step`](Engine::step): a ready socket or the engine's timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Socket {
    Fd(RawFd),
    /// Pseudo-socket used when the engine's timer fired.
    Timeout,
}

/// Watch request bitmask passed by the engine to [`Bridge::watch_socket`].
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SocketEvents(u8);

impl SocketEvents {
    pub const NONE: Self = Self(0);
    pub const IN: Self = Self(0b001);
    pub const OUT: Self = Self(0b010);
    pub const INOUT: Self = Self(0b011);
    pub const REMOVE: Self = Self(0b100);

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    pub const fn is_remove(self) -> bool {
        self.contains(Self::REMOVE)
    }
}

impl BitOr for SocketEvents {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Debug for SocketEvents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            Self::NONE => "NONE",
            Self::IN => "IN",
            Self::OUT => "OUT",
            Self::INOUT => "INOUT",
            _ if self.is_remove() => "REMOVE",
            _ => return write!(f, "SocketEvents({:#05b})", self.0),
        };
        f.write_str(name)
    }
}

/// Readiness directions delivered to [`Engine::step`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ready(u8);

impl Ready {
    pub const EMPTY: Self = Self(0);
    pub const READABLE: Self = Self(0b001);
    pub const WRITABLE: Self = Self(0b010);
    pub const ERROR: Self = Self(0b100);

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn is_readable(self) -> bool {
        self.0 & Self::READABLE.0 != 0
    }

    pub const fn is_writable(self) -> bool {
        self.0 & Self::WRITABLE.0 != 0
    }

    pub const fn is_error(self) -> bool {
        self.0 & Self::ERROR.0 != 0
    }
}

impl BitOr for Ready {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// One finished transfer as reported by [`Engine::next_completion`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub id: TransferId,
    pub result: std::result::Result<(), TransferError>,
}

impl Completion {
    pub fn success(id: TransferId) -> Self {
        Self { id, result: Ok(()) }
    }

    pub fn failure(id: TransferId, code: i32, message: impl Into<String>) -> Self {
        Self {
            id,
            result: Err(TransferError::new(code, message)),
        }
    }
}

/// Multi-level engine options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MultiOption {
    MaxConnects,
    MaxHostConnections,
    MaxTotalConnections,
    MaxConcurrentStreams,
    Pipelining,
    PushFunction,
    /// Any engine option without a dedicated name.
    Raw(u32),
    /// Reserved: the bridge's socket-watch callback.
    SocketFunction,
    /// Reserved: the bridge's timer-arm callback.
    TimerFunction,
}

impl MultiOption {
    /// Options that would replace the bridge's own callbacks.
    pub const RESERVED: [MultiOption; 2] = [MultiOption::SocketFunction, MultiOption::TimerFunction];

    pub fn is_reserved(self) -> bool {
        Self::RESERVED.contains(&self)
    }
}

/// The value passed alongside a [`MultiOption`].
#[derive(Debug)]
pub enum OptionValue {
    Long(i64),
    Bool(bool),
    Text(String),
    Callback(Box<dyn std::any::Any>),
}

/// A transfer the engine refused to add, handed back to its owner.
pub struct Rejected<T> {
    pub transfer: T,
    pub error: Error,
}

impl<T> Rejected<T> {
    pub fn new(transfer: T, error: Error) -> Self {
        Self { transfer, error }
    }
}

impl<T> fmt::Debug for Rejected<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rejected")
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

/// The two requests an engine makes of its host while it runs.
///
/// Both are invoked synchronously from inside [`Engine::add_transfer`],
/// [`Engine::remove_transfer`] and [`Engine::step`]. Errors must be propagated out of the engine
/// call that triggered them.
pub trait Bridge {
    /// Watch `fd` for the directions in `events`, or stop watching it on
    /// [`SocketEvents::REMOVE`]. May be called repeatedly for the same socket.
    fn watch_socket(&mut self, fd: RawFd, events: SocketEvents) -> Result<()>;

    /// Arm the single shared timeout, replacing any armed one. `None` disarms it.
    fn arm_timer(&mut self, timeout: Option<Duration>) -> Result<()>;
}

/// A non-blocking, readiness-driven multi-transfer engine.
pub trait Engine {
    /// The engine-native per-transfer object.
    type Transfer;

    /// Starts driving `transfer` under `id`.
    ///
    /// # Errors
    ///
    /// On failure the transfer is handed back in a [`Rejected`].
    fn add_transfer(
        &mut self,
        id: TransferId,
        transfer: Self::Transfer,
        bridge: &mut dyn Bridge,
    ) -> std::result::Result<(), Rejected<Self::Transfer>>;

    /// Stops driving `id` and returns its native transfer. Safe at any time.
    fn remove_transfer(&mut self, id: TransferId, bridge: &mut dyn Bridge)
    -> Result<Self::Transfer>;

    /// Acts on `socket` becoming ready for `ready`, returning the number of transfers still
    /// running.
    fn step(&mut self, socket: Socket, ready: Ready, bridge: &mut dyn Bridge) -> Result<usize>;

    /// Pops the next finished transfer, if any.
    fn next_completion(&mut self) -> Option<Completion>;

    fn set_option(&mut self, option: MultiOption, value: OptionValue) -> Result<()>;

    fn version(&self) -> String {
        "unknown".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_events_bits() {
        assert!(SocketEvents::INOUT.contains(SocketEvents::IN));
        assert!(SocketEvents::INOUT.contains(SocketEvents::OUT));
        assert!(!SocketEvents::IN.contains(SocketEvents::OUT));
        assert!(!SocketEvents::IN.contains(SocketEvents::NONE));
        assert!(SocketEvents::REMOVE.is_remove());
        assert_eq!(SocketEvents::IN | SocketEvents::OUT, SocketEvents::INOUT);
        assert_eq!(format!("{:?}", SocketEvents::INOUT), "INOUT");
    }

    #[test]
    fn reserved_options() {
        assert!(MultiOption::SocketFunction.is_reserved());
        assert!(MultiOption::TimerFunction.is_reserved());
        assert!(!MultiOption::MaxConnects.is_reserved());
        assert!(!MultiOption::Raw(3).is_reserved());
    }

    #[test]
    fn transfer_ids_are_unique() {
        let a = TransferId::next();
        let b = TransferId::next();
        assert_ne!(a, b);
        assert!(b > a);
    }
}
