//! Error types.
//!
//! Two kinds of failure exist and they never mix:
//!
//! - [`Error`] — structural failures surfaced to whoever called into the
//!   pipeline: a dependency cycle found at compile time, a chain that is too
//!   long to run, or an I/O failure in the server. A failed compile leaves
//!   previously cached chains untouched.
//! - [`RequestError`] — non-fatal, handler-reported problems appended to one
//!   [`RequestContext`](crate::RequestContext). They never cross into shared
//!   registry or cache state and do not halt execution unless the handler
//!   also aborts.

use std::fmt;
use std::time::Duration;

/// The error type returned by strata's fallible operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The enabled middleware of the requested layers do not form a DAG.
    ///
    /// `members` names the middleware left over once every node that could
    /// be ordered was emitted, with nodes that merely sit downstream of the
    /// cycle pruned away.
    #[error("dependency cycle between middleware: {}", .members.join(", "))]
    DependencyCycle {
        /// Middleware participating in the cycle, in discovery order.
        members: Vec<String>,
    },

    /// The compiled chain exceeds [`MAX_CHAIN_LEN`](crate::MAX_CHAIN_LEN).
    #[error("chain of {len} handlers exceeds the maximum of {max}")]
    ChainTooLong {
        /// Number of handlers after optimization.
        len: usize,
        /// Configured maximum.
        max: usize,
    },

    /// The server address could not be parsed.
    #[error("invalid socket address `{0}`")]
    InvalidAddress(String),

    /// Binding to a port or accepting a connection failed.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// `true` for [`Error::DependencyCycle`].
    #[must_use]
    pub fn is_cycle(&self) -> bool {
        matches!(self, Self::DependencyCycle { .. })
    }
}

/// What a [`RequestError`] was reported for.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RequestErrorKind {
    /// Reported explicitly by a handler.
    Handler,
    /// A downstream handler panicked and a recovery handler caught it.
    Panic,
    /// The request ran past its deadline.
    Timeout,
}

impl fmt::Display for RequestErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Handler => "handler",
            Self::Panic => "panic",
            Self::Timeout => "timeout",
        })
    }
}

/// An error recorded on a request context by a handler.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct RequestError {
    kind: RequestErrorKind,
    message: String,
}

impl RequestError {
    /// A handler-reported error.
    pub fn new(message: impl Into<String>) -> Self {
        Self { kind: RequestErrorKind::Handler, message: message.into() }
    }

    /// A panic caught by a recovery handler.
    pub fn panic(message: impl Into<String>) -> Self {
        Self { kind: RequestErrorKind::Panic, message: message.into() }
    }

    /// A deadline overrun.
    pub fn timeout(elapsed: Duration, budget: Duration) -> Self {
        Self {
            kind: RequestErrorKind::Timeout,
            message: format!("took {elapsed:?}, budget {budget:?}"),
        }
    }

    pub fn kind(&self) -> RequestErrorKind { self.kind }
    pub fn message(&self) -> &str { &self.message }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_error_lists_members() {
        let err = Error::DependencyCycle { members: vec!["a".into(), "b".into()] };
        assert!(err.is_cycle());
        assert_eq!(err.to_string(), "dependency cycle between middleware: a, b");
    }

    #[test]
    fn request_error_display() {
        let err = RequestError::new("bad token");
        assert_eq!(err.kind(), RequestErrorKind::Handler);
        assert_eq!(err.to_string(), "handler: bad token");

        let err = RequestError::timeout(Duration::from_millis(20), Duration::from_millis(10));
        assert_eq!(err.kind(), RequestErrorKind::Timeout);
        assert!(err.message().contains("budget"));
    }
}
