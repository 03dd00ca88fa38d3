//! Contains the `Error` and `Result` types that `procpool` uses.

use std::{io, sync::Arc};

use thiserror::Error;

/// The result type for all fallible operations in the `procpool` crate.
pub type Result<T> = std::result::Result<T, Error>;

/// An error that can occur in the `procpool` crate. The inner
/// [`ErrorKind`](enum.ErrorKind.html) is boxed to keep the type cheap to move
/// along the worker's hot paths.
#[derive(Clone, Debug, Error)]
#[error("Kind: {kind}")]
#[non_exhaustive]
pub struct Error {
    /// The type of error that occurred.
    pub kind: Box<ErrorKind>,
}

impl Error {
    pub(crate) fn new(kind: ErrorKind) -> Self {
        Self {
            kind: Box::new(kind),
        }
    }

    pub(crate) fn internal(message: impl Into<String>) -> Error {
        ErrorKind::Internal {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn invalid_argument(message: impl Into<String>) -> Error {
        ErrorKind::InvalidArgument {
            message: message.into(),
        }
        .into()
    }

    /// Creates an error for a control-channel message that violated the
    /// one-FD/fixed-payload contract.
    pub(crate) fn handoff_protocol(message: impl Into<String>) -> Error {
        ErrorKind::HandoffProtocol {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn startup_malformed(message: impl Into<String>) -> Error {
        ErrorKind::StartupMalformed {
            message: message.into(),
        }
        .into()
    }

    /// Creates an `Authentication` error with the provided reason. Available
    /// to [`SessionHooks`](crate::session::SessionHooks) implementations so
    /// their failures surface in the crate's own vocabulary.
    pub fn authentication_error(reason: impl Into<String>) -> Error {
        ErrorKind::Authentication {
            message: reason.into(),
        }
        .into()
    }

    /// Whether this error came from the operating system.
    pub fn is_io(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::Io(..))
    }

    /// Whether this error means the new client's startup packet was unusable.
    /// The worker recovers from these by looping back for another handoff.
    pub fn is_startup_malformed(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::StartupMalformed { .. })
    }

    /// Whether this error ends the worker quietly, without a client-visible
    /// protocol error: the database was dropped or evicted while pooled, or
    /// the pool's reserved headroom is exhausted.
    pub fn is_quiet_exit(&self) -> bool {
        matches!(
            self.kind.as_ref(),
            ErrorKind::DatabaseGone | ErrorKind::DatabaseEvicted | ErrorKind::PoolCapExceeded
        )
    }
}

impl<E> From<E> for Error
where
    ErrorKind: From<E>,
{
    fn from(err: E) -> Self {
        Error::new(err.into())
    }
}

impl From<io::Error> for ErrorKind {
    fn from(err: io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl From<io::ErrorKind> for ErrorKind {
    fn from(err: io::ErrorKind) -> Self {
        Self::Io(Arc::new(err.into()))
    }
}

impl From<nix::Error> for ErrorKind {
    fn from(err: nix::Error) -> Self {
        Self::Io(Arc::new(err.into()))
    }
}

/// The types of errors that can occur.
#[allow(missing_docs)]
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum ErrorKind {
    /// An invalid argument was provided.
    #[error("An invalid argument was provided: {message}")]
    #[non_exhaustive]
    InvalidArgument { message: String },

    /// Wrapper around [`std::io::Error`](https://doc.rust-lang.org/std/io/struct.Error.html).
    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),

    /// A control-channel message broke the handoff contract: wrong payload
    /// length, or anything other than exactly one descriptor in the
    /// ancillary data.
    #[error("control channel protocol violation: {message}")]
    #[non_exhaustive]
    HandoffProtocol { message: String },

    /// The client's startup packet could not be parsed.
    #[error("malformed startup packet: {message}")]
    #[non_exhaustive]
    StartupMalformed { message: String },

    /// The pool's reserved headroom is exhausted; the worker may not pool
    /// itself and must exit.
    #[error("pooled-worker reservation exhausted")]
    PoolCapExceeded,

    /// The worker's database binding was cleared by a concurrent eviction.
    #[error("database was evicted while the worker was draining")]
    DatabaseEvicted,

    /// The worker's database no longer exists in the catalog.
    #[error("database was dropped while the worker was pooled")]
    DatabaseGone,

    /// The handed-off client requested a different database than the one this
    /// worker pooled under. Indicates a routing bug; fatal to the worker.
    #[error("client requested database \"{requested}\" but worker pooled for \"{pooled}\"")]
    #[non_exhaustive]
    DatabaseMismatch { requested: String, pooled: String },

    /// A replication-style session reached a pooled worker. These must be
    /// filtered out by the supervisor's startup peek.
    #[error("replication sessions cannot be served by a pooled worker")]
    ReplicationOnPooled,

    /// Authenticating the handed-off client failed.
    #[error("{message}")]
    #[non_exhaustive]
    Authentication { message: String },

    #[error("Internal error: {message}")]
    #[non_exhaustive]
    Internal { message: String },
}
