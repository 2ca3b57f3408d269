//! Error types for tunnel negotiation and the live connection
//!
//! Configuration and negotiation failures are surfaced before a connection
//! exists; `DeadlineExceeded` and `Closed` are the only two error kinds
//! synthesized on a live connection. Transport errors pass through unchanged.

use std::io;

/// A `Result` alias where the `Err` case is [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced while dialing through an HTTP CONNECT relay or while
/// using the resulting connection.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The relay URL scheme is not `http` or `https`.
    #[error("unsupported proxy scheme: {0}")]
    UnsupportedScheme(String),

    /// The destination network is not in the TCP family.
    #[error("unsupported network: {0}")]
    UnsupportedNetwork(String),

    /// The relay URL has no host component.
    #[error("proxy url has no host")]
    MissingProxyHost,

    /// The relay refused to open the tunnel. The message is the reason
    /// phrase from the relay's status line, verbatim.
    #[error("{0}")]
    TunnelRejected(String),

    /// The relay's status line could not be parsed into a code and reason.
    #[error("malformed proxy response")]
    MalformedResponse,

    /// A read or write deadline elapsed. Temporary; the operation may be
    /// retried after re-arming the deadline.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// The connection was closed, either locally or while an operation was
    /// blocked. Permanent.
    #[error("closed connection")]
    Closed,

    /// A transport-level failure (DNS, connect, TLS, pipe), passed through
    /// from the underlying source or sink.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// True if this error came from a deadline expiring.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::DeadlineExceeded)
    }

    /// True if the operation may reasonably be retried on the same
    /// connection. Only deadline expiry qualifies.
    pub fn is_temporary(&self) -> bool {
        self.is_timeout()
    }

    /// True if this error came from the connection being closed.
    pub fn is_closed(&self) -> bool {
        matches!(self, Error::Closed)
    }

    /// True if the relay rejected the CONNECT request.
    pub fn is_rejected(&self) -> bool {
        matches!(self, Error::TunnelRejected(_))
    }

    /// The relay's reason phrase, if this is a rejection.
    pub fn reason(&self) -> Option<&str> {
        match self {
            Error::TunnelRejected(reason) => Some(reason),
            _ => None,
        }
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> io::Error {
        match err {
            Error::DeadlineExceeded => io::Error::new(io::ErrorKind::TimedOut, err),
            Error::Closed => io::Error::new(io::ErrorKind::ConnectionAborted, err),
            Error::Io(inner) => inner,
            other => io::Error::other(other),
        }
    }
}
