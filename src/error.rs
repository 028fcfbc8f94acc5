//! Error taxonomy surfaced at the boundary of this crate.

use thiserror::Error as ThisError;

/// Convenience type for a result with this crate's [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// The stable set of error kinds this crate ever returns.
///
/// Every suspending operation in the crate returns one of these variants rather than
/// a bare [`lapin::Error`], so callers can match on *kind* (fatal config mistake vs.
/// transient network blip vs. handler failure) without inspecting broker internals.
#[derive(Debug, ThisError)]
pub enum Error {
    /// The Chain was used in an invalid way: e.g. `subscribe` without a queue, `rpc`
    /// without a target queue, or calling a terminal operation twice on the same Chain.
    #[error("invalid chain configuration: {0}")]
    Config(String),

    /// The broker rejected a declare, almost always a passive mismatch against an
    /// already-existing exchange/queue with different properties.
    #[error("setup failed: {0}")]
    Setup(#[source] lapin::Error),

    /// The channel or connection was lost mid-operation.
    #[error("transient failure: {0}")]
    Transient(#[source] TransientSource),

    /// The user handler or a middleware layer failed.
    #[error("handler error: {0}")]
    Handler(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// An RPC call or a confirm-mode publish exceeded its deadline.
    #[error("operation timed out")]
    Timeout,

    /// The caller aborted the operation before it completed.
    #[error("operation cancelled")]
    Cancelled,

    /// The operation was attempted on an already-closed Consumer, Publisher, or
    /// Connection Manager.
    #[error("operation attempted on a closed {0}")]
    Closed(&'static str),
}

/// The underlying cause of a [`Error::Transient`] failure.
#[derive(Debug, ThisError)]
pub enum TransientSource {
    /// The underlying `lapin` call failed.
    #[error(transparent)]
    Lapin(#[from] lapin::Error),

    /// The connection manager was reconnecting and the operation was not retried
    /// because retrying was not applicable (e.g. a non-confirm publish).
    #[error("connection is reestablishing")]
    Reestablishing,

    /// The connection manager gave up: `reestablish` is disabled, or the close raced
    /// the reconnect loop and won.
    #[error("connection manager closed during the operation")]
    ManagerClosed,

    /// The broker rejected a confirm-mode publish with `basic.nack`.
    #[error("broker nacked the publish")]
    Nacked,
}

impl Error {
    /// Constructs a [`Error::Config`] from anything displayable.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Constructs a [`Error::Handler`] from any boxed error.
    pub fn handler(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Handler(Box::new(err))
    }

    /// True if this error kind represents a handler failure specifically (as opposed
    /// to a transport, setup, or timeout problem). The consumer pipeline nacks on any
    /// pipeline failure regardless of this distinction; it is exposed for middleware
    /// and handlers that want to tell the two apart themselves.
    #[must_use]
    pub fn is_handler_failure(&self) -> bool {
        matches!(self, Self::Handler(_))
    }
}

impl From<lapin::Error> for Error {
    fn from(e: lapin::Error) -> Self {
        Self::Transient(TransientSource::Lapin(e))
    }
}
