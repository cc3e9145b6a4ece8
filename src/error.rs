//! Failure outcomes carried by promises.
//!
//! A [`Promise`](crate::promise::Promise) settles either with a value or with
//! an [`Error`]. Settled outcomes are shared by every continuation and every
//! waiter, so [`Error`] is cheap to clone: I/O errors are kept behind an
//! [`Arc`].

use std::io;
use std::sync::Arc;

use thiserror::Error;

/// The failure side of a settled promise.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Connection refused, reset, or broken mid-stream; also file I/O while
    /// streaming a response body.
    #[error("I/O failure: {0}")]
    Io(Arc<io::Error>),

    /// The peer sent bytes that are not valid HTTP/1.x.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A handler failed while producing its response.
    #[error("handler failed: {0}")]
    Handler(String),

    /// Every handle to a pending promise was dropped, so it can never settle.
    #[error("promise abandoned before it settled")]
    Abandoned,

    /// The client was shut down before the request could be issued.
    #[error("client has been shut down")]
    Shutdown,

    /// A combinator was given no inputs to wait on.
    #[error("no promises to wait on")]
    Empty,
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(Arc::new(err))
    }
}

/// Returned when a promise that already settled is resolved or rejected again.
///
/// Settling twice is a programming error; the first outcome is kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("promise already settled")]
pub struct AlreadySettled;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_convert_and_clone() {
        let err: Error = io::Error::new(io::ErrorKind::ConnectionReset, "reset").into();
        let copy = err.clone();
        assert!(matches!(copy, Error::Io(ref e) if e.kind() == io::ErrorKind::ConnectionReset));
        assert_eq!(err.to_string(), "I/O failure: reset");
    }
}
