//! Error related business logic of `hermod`.
//!
//! One error type runs through the crate: an `ErrorKind` naming the
//! failing module or wire level failure, optionally carrying the
//! underlying error it grew out of as its cause. The `ResultExt`
//! extension trait stamps a kind onto a foreign `Result` at the point
//! it crosses into this crate; its lossy `simple*` methods exist for
//! error types that are not `Send`, which cannot travel between the
//! tasks of the runtime.

use std::error;
use std::fmt;
use std::io;
use std::result;

/// Wrapper result type for `std::result::Result`.
pub type Result<T> = result::Result<T, Error>;

/// The error type used throughout this crate.
///
/// The dispatcher and the runtimes select recovery behavior from the
/// `ErrorKind` alone; the cause, when present, only feeds log lines
/// and the `message` field of error envelopes.
pub struct Error {
    kind: ErrorKind,
    cause: Option<Box<dyn error::Error + Send + Sync>>,
}

impl Error {
    /// Returns an error of kind `kind`, with no underlying cause.
    pub fn simple(kind: ErrorKind) -> Self {
        Self { kind, cause: None }
    }

    /// Wraps an arbitrary error in an `Error` of kind `kind`.
    pub fn wrapped<E>(kind: ErrorKind, e: E) -> Self
    where
        E: Into<Box<dyn error::Error + Send + Sync>>,
    {
        Self {
            kind,
            cause: Some(e.into()),
        }
    }

    /// Returns a copy of the `ErrorKind` of this `Error`.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Swaps the `ErrorKind` of this `Error`, keeping its cause.
    ///
    /// Used where a generic failure takes on a more precise meaning
    /// at an outer layer, e.g. a read deadline expiring inside a
    /// handshake becomes `HandshakeTimeout`.
    pub fn swap_kind(mut self, kind: ErrorKind) -> Self {
        self.kind = kind;
        self
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.cause {
            Some(cause) => f
                .debug_tuple("Error")
                .field(&self.kind)
                .field(cause)
                .finish(),
            None => f.debug_tuple("Error").field(&self.kind).finish(),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.cause {
            Some(cause) => write!(fmt, "{:?}: {}", self.kind, cause),
            None => write!(fmt, "{:?}", self.kind),
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::wrapped(ErrorKind::Error, e)
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|cause| cause as &(dyn error::Error + 'static))
    }
}

/// Extension of the standard library's `Result` type, attaching an
/// `ErrorKind` to whatever error it holds.
///
/// `wrapped`/`wrapped_msg` keep the original error as the cause and
/// so require it to be boxable; `simple`/`simple_msg` drop it, which
/// is the only option for error types that do not implement `Send`
/// (or that carry the unsent message back, like a channel's send
/// error).
pub trait ResultExt {
    type T;
    type E;

    fn wrapped(self, kind: ErrorKind) -> Result<Self::T>
    where
        Self::E: Into<Box<dyn error::Error + Send + Sync>>;

    fn wrapped_msg(self, kind: ErrorKind, msg: &str) -> Result<Self::T>
    where
        Self::E: Into<Box<dyn error::Error + Send + Sync>>;

    fn simple(self, kind: ErrorKind) -> Result<Self::T>;

    fn simple_msg(self, kind: ErrorKind, msg: &str) -> Result<Self::T>;
}

impl<T, E> ResultExt for result::Result<T, E> {
    type T = T;
    type E = E;

    fn wrapped(self, kind: ErrorKind) -> Result<T>
    where
        E: Into<Box<dyn error::Error + Send + Sync>>,
    {
        self.map_err(|e| Error::wrapped(kind, e))
    }

    fn wrapped_msg(self, kind: ErrorKind, msg: &str) -> Result<T>
    where
        E: Into<Box<dyn error::Error + Send + Sync>>,
    {
        self.map_err(|e| Error::wrapped(kind, format!("{}: {}", msg, e.into())))
    }

    fn simple(self, kind: ErrorKind) -> Result<T> {
        self.map_err(|_| Error::simple(kind))
    }

    fn simple_msg(self, kind: ErrorKind, msg: &str) -> Result<T> {
        self.map_err(|_| Error::wrapped(kind, msg))
    }
}

/// The kinds of errors reported throughout the crate.
///
/// Roughly one variant exists per module, with a handful of finer
/// grained kinds for the failures that cross the wire, since the
/// dispatcher and the runtimes select recovery behavior based on them.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ErrorKind {
    Error,
    AsyncRuntime,
    Threadpool,
    Communication,
    CommunicationChannel,
    CommunicationFraming,
    CommunicationMessage,
    CommunicationSerialize,
    Crypto,
    Auth,
    AuthFailure,
    HandshakeTimeout,
    IdentityInvalid,
    Terminal,
    Database,
    Manager,
    ManagerRegistry,
    ServiceNotFound,
    LinkSaturated,
    RequestFailed,
    TransportLost,
    Timeout,
    ProtocolError,
    PermissionDenied,
    Client,
    Service,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_the_cause() {
        let plain = Error::simple(ErrorKind::Timeout);
        assert_eq!(plain.to_string(), "Timeout");

        let wrapped = Error::wrapped(ErrorKind::AuthFailure, "Wrong Manager password");
        assert_eq!(wrapped.to_string(), "AuthFailure: Wrong Manager password");
    }

    #[test]
    fn test_swap_kind_keeps_the_cause() {
        let e = Error::wrapped(ErrorKind::Timeout, "no reply").swap_kind(ErrorKind::HandshakeTimeout);
        assert_eq!(e.kind(), ErrorKind::HandshakeTimeout);
        assert_eq!(e.to_string(), "HandshakeTimeout: no reply");
    }

    #[test]
    fn test_source_is_exposed() {
        use std::error::Error as _;

        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        let e = Error::wrapped(ErrorKind::TransportLost, io);
        assert!(e.source().is_some());
        assert!(Error::simple(ErrorKind::Manager).source().is_none());
    }
}
