//! Error types shared across the strand crates.

use core::fmt;

/// Result type used throughout the runtime.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by reactors, sockets, channels and the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Raw OS error (positive errno).
    Io(i32),

    /// Peer closed the stream. Kept separate from `Io` so read loops can
    /// tell an orderly shutdown from a failure.
    Eof,

    /// Deadline expired or the operation was stopped.
    Cancelled,

    /// Channel or socket was already closed.
    Closed,

    /// Ring overflow, descriptor exhaustion, bind failure.
    Resource(&'static str),

    /// Wire decode failed.
    Protocol(String),

    /// Invariant violation, including fiber panics.
    Internal(String),
}

impl Error {
    /// Wrap a positive errno value.
    pub fn from_errno(errno: i32) -> Self {
        Error::Io(errno)
    }

    /// Map a non-negative-result syscall convention: negative values are
    /// `-errno`, everything else is not an error.
    pub fn from_neg_errno(res: i32) -> Self {
        Error::Io(-res)
    }

    pub fn is_eof(&self) -> bool {
        matches!(self, Error::Eof)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// The errno behind an `Io` error, if that is what this is.
    pub fn errno(&self) -> Option<i32> {
        match self {
            Error::Io(e) => Some(*e),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "io error: errno {}", e),
            Error::Eof => write!(f, "end of stream"),
            Error::Cancelled => write!(f, "operation cancelled"),
            Error::Closed => write!(f, "closed"),
            Error::Resource(what) => write!(f, "resource exhausted: {}", what),
            Error::Protocol(msg) => write!(f, "protocol error: {}", msg),
            Error::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        match e.raw_os_error() {
            Some(errno) => Error::Io(errno),
            None => Error::Internal(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", Error::Eof), "end of stream");
        assert_eq!(format!("{}", Error::Io(104)), "io error: errno 104");
    }

    #[test]
    fn test_neg_errno() {
        let e = Error::from_neg_errno(-11);
        assert_eq!(e.errno(), Some(11));
    }
}
