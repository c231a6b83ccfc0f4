//! Error types for sshbind

use std::fmt;
use thiserror::Error;

/// Unified error type for all listener, session and dispatch operations.
///
/// Every variant carries a human-readable message. The set of variants is
/// closed: callers can always tell failures apart with [`SshError::kind`].
#[derive(Debug, Error)]
pub enum SshError {
    /// A resource needed for a new listener or session is exhausted.
    #[error("Allocation error: {0}")]
    Allocation(String),

    /// Unknown option, wrong value type or out-of-range value.
    #[error("Invalid option: {0}")]
    InvalidOption(String),

    /// The listening socket could not be set up.
    #[error("Bind error: {0}")]
    Bind(String),

    /// A single accept attempt failed at the transport level.
    #[error("Accept error: {0}")]
    Accept(String),

    /// A deadline expired. The listener or session is still usable.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// The transport-layer key exchange failed. Fatal to the session.
    #[error("Key exchange error: {0}")]
    KeyExchange(String),

    /// The operation is not permitted in the current state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Receiving, decoding or replying to a message failed. Fatal to the session.
    #[error("Dispatch error: {0}")]
    Dispatch(String),

    /// A registered handler reported an error.
    #[error("Handler error: {0}")]
    Handler(String),
}

/// Discriminant of [`SshError`], used to branch on failures without matching
/// on the message payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// See [`SshError::Allocation`].
    Allocation,
    /// See [`SshError::InvalidOption`].
    InvalidOption,
    /// See [`SshError::Bind`].
    Bind,
    /// See [`SshError::Accept`].
    Accept,
    /// See [`SshError::Timeout`].
    Timeout,
    /// See [`SshError::KeyExchange`].
    KeyExchange,
    /// See [`SshError::InvalidState`].
    InvalidState,
    /// See [`SshError::Dispatch`].
    Dispatch,
    /// See [`SshError::Handler`].
    Handler,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Allocation => "AllocationError",
            ErrorKind::InvalidOption => "InvalidOptionError",
            ErrorKind::Bind => "BindError",
            ErrorKind::Accept => "AcceptError",
            ErrorKind::Timeout => "TimeoutError",
            ErrorKind::KeyExchange => "KeyExchangeError",
            ErrorKind::InvalidState => "InvalidStateError",
            ErrorKind::Dispatch => "DispatchError",
            ErrorKind::Handler => "HandlerError",
        };
        f.write_str(name)
    }
}

impl SshError {
    /// Returns the kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SshError::Allocation(_) => ErrorKind::Allocation,
            SshError::InvalidOption(_) => ErrorKind::InvalidOption,
            SshError::Bind(_) => ErrorKind::Bind,
            SshError::Accept(_) => ErrorKind::Accept,
            SshError::Timeout(_) => ErrorKind::Timeout,
            SshError::KeyExchange(_) => ErrorKind::KeyExchange,
            SshError::InvalidState(_) => ErrorKind::InvalidState,
            SshError::Dispatch(_) => ErrorKind::Dispatch,
            SshError::Handler(_) => ErrorKind::Handler,
        }
    }

    /// Returns the human-readable message without the kind prefix.
    pub fn message(&self) -> &str {
        match self {
            SshError::Allocation(msg)
            | SshError::InvalidOption(msg)
            | SshError::Bind(msg)
            | SshError::Accept(msg)
            | SshError::Timeout(msg)
            | SshError::KeyExchange(msg)
            | SshError::InvalidState(msg)
            | SshError::Dispatch(msg)
            | SshError::Handler(msg) => msg,
        }
    }

    /// Whether the same call may simply be retried.
    ///
    /// Only deadline expiry qualifies; everything else needs a decision by
    /// the caller.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SshError::Timeout(_))
    }

    /// Whether the error leaves the owning session permanently failed.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SshError::KeyExchange(_) | SshError::Dispatch(_))
    }
}

/// Result type for sshbind operations
pub type SshResult<T> = Result<T, SshError>;
