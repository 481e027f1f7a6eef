//! Error types and stop reasons for the pull protocol.

use std::fmt;
use std::sync::Arc;

/// Why a stream was asked to terminate early.
///
/// The reason controls how the termination propagates to peer branches in
/// fan-outs and whether the terminated path ends quietly or with an error.
#[derive(Debug, Clone, Default)]
pub enum StopReason {
    /// Advisory detach: the requesting branch opts out, peers keep running.
    #[default]
    None,
    /// Collective quiet end: peers finish normally on their next read,
    /// after draining values already queued for them.
    Silent,
    /// Collective abort: peers fail on their next read.
    Error(Arc<Error>),
}

impl StopReason {
    /// Wrap an error into an aborting stop reason.
    pub fn error(error: Error) -> Self {
        StopReason::Error(Arc::new(error))
    }

    /// Whether this reason carries an error payload.
    pub fn is_error(&self) -> bool {
        matches!(self, StopReason::Error(_))
    }

    /// The error a stopped path must surface on its next read, if any.
    pub fn surface(&self) -> Option<Error> {
        match self {
            StopReason::Error(e) => Some((**e).clone()),
            _ => None,
        }
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::None => write!(f, "none"),
            StopReason::Silent => write!(f, "silent"),
            StopReason::Error(e) => write!(f, "error: {}", e),
        }
    }
}

/// The main error type for readers, writers and chain drivers.
#[derive(Debug, Clone)]
pub enum Error {
    /// A device or upstream stage failed while producing a value
    Read(Arc<dyn std::error::Error + Send + Sync>),

    /// A sink failed to accept or persist a value
    Write(Arc<dyn std::error::Error + Send + Sync>),

    /// Protocol misuse: write-after-end, unread beyond the last read,
    /// truncated numeric field, and friends
    Protocol(String),

    /// A writer requested early termination of the chain driving it;
    /// `pipe` inspects this variant and treats `None`/`Silent` as a
    /// graceful stop rather than a failure
    Stopped(StopReason),

    /// A custom error with a message
    Custom(String),

    /// An internal channel was closed unexpectedly
    ChannelClosed,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Read(e) => write!(f, "read error: {}", e),
            Error::Write(e) => write!(f, "write error: {}", e),
            Error::Protocol(msg) => write!(f, "protocol violation: {}", msg),
            Error::Stopped(reason) => write!(f, "stopped ({})", reason),
            Error::Custom(msg) => write!(f, "{}", msg),
            Error::ChannelClosed => write!(f, "channel was closed unexpectedly"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Read(e) | Error::Write(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

// Convenience constructors
impl Error {
    /// Create a read-side error from any error type
    pub fn read<E: std::error::Error + Send + Sync + 'static>(error: E) -> Self {
        Error::Read(Arc::new(error))
    }

    /// Create a write-side error from any error type
    pub fn write<E: std::error::Error + Send + Sync + 'static>(error: E) -> Self {
        Error::Write(Arc::new(error))
    }

    /// Create a protocol-violation error
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Error::Protocol(message.into())
    }

    /// Create a custom error with a message
    pub fn custom<S: Into<String>>(message: S) -> Self {
        Error::Custom(message.into())
    }

    /// The graceful early-stop signal a writer returns from `write` to
    /// detach the chain driving it.
    pub fn stopped(reason: StopReason) -> Self {
        Error::Stopped(reason)
    }
}

// Common conversions
impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Error::ChannelClosed
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for Error {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        Error::ChannelClosed
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(e: tokio::task::JoinError) -> Self {
        Error::Custom(format!("task failed: {}", e))
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Custom(s)
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Custom(s.to_string())
    }
}

/// Convenience type alias for Results in this crate
pub type Result<T> = std::result::Result<T, Error>;
