//! Contains the `Error` and `Result` types that `mongoreplay` uses.

use std::{fmt::Debug, sync::Arc};

use thiserror::Error;

/// The result type for all methods that can return an error in the `mongoreplay` crate.
pub type Result<T> = std::result::Result<T, Error>;

/// An error that can occur while replaying captured traffic. The inner
/// [`ErrorKind`] is boxed to keep the `Result` payload small on the hot path.
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

    /// Creates a fatal internal error with the provided message.
    pub(crate) fn internal(message: impl Into<String>) -> Error {
        ErrorKind::Internal {
            message: message.into(),
        }
        .into()
    }

    /// Creates the error an op source yields when one recorded message
    /// fails to decode.
    pub fn source_decode(message: impl Into<String>) -> Error {
        ErrorKind::SourceDecode {
            message: message.into(),
        }
        .into()
    }

    /// Creates the error an op source yields when the capture itself
    /// recorded packet loss.
    pub fn packets_dropped(message: impl Into<String>) -> Error {
        ErrorKind::PacketsDropped {
            message: message.into(),
        }
        .into()
    }

    /// Creates the error a connector returns when a session cannot be
    /// opened.
    pub fn dial(message: impl Into<String>) -> Error {
        ErrorKind::Dial {
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

    pub(crate) fn malformed_message(message: impl Into<String>) -> Error {
        ErrorKind::MalformedMessage {
            message: message.into(),
        }
        .into()
    }

    /// Whether this error indicates that the capture lost packets while the
    /// recording was made. Runs that complete despite this are reported
    /// separately from fully clean runs.
    pub fn is_packets_dropped(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::PacketsDropped { .. })
    }

    /// Whether this error came from network I/O on a live session.
    pub fn is_network_error(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::Io(..))
    }

    /// Whether this error aborts the run as opposed to degrading it.
    pub fn is_fatal(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::Internal { .. })
    }
}

impl<E> From<E> for Error
where
    ErrorKind: From<E>,
{
    fn from(err: E) -> Self {
        Self::new(err.into())
    }
}

impl From<bson::de::Error> for ErrorKind {
    fn from(err: bson::de::Error) -> Self {
        Self::MalformedMessage {
            message: err.to_string(),
        }
    }
}

impl From<bson::ser::Error> for ErrorKind {
    fn from(err: bson::ser::Error) -> Self {
        Self::MalformedMessage {
            message: err.to_string(),
        }
    }
}

impl From<bson::raw::Error> for ErrorKind {
    fn from(err: bson::raw::Error) -> Self {
        Self::MalformedMessage {
            message: err.to_string(),
        }
    }
}

impl From<std::io::Error> for ErrorKind {
    fn from(err: std::io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl From<std::io::ErrorKind> for ErrorKind {
    fn from(err: std::io::ErrorKind) -> Self {
        Self::Io(Arc::new(err.into()))
    }
}

/// The types of errors that can occur during a replay run.
#[allow(missing_docs)]
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The op source failed to decode a captured message. The op is skipped;
    /// the run continues.
    #[error("Error decoding a recorded op: {message}")]
    SourceDecode { message: String },

    /// The capture itself recorded that packets were lost. Surfaced so the
    /// embedding CLI can exit with its "completed with drops" code.
    #[error("Packets were dropped during capture: {message}")]
    PacketsDropped { message: String },

    /// A captured body could not be parsed into a typed operation.
    #[error("Unable to classify a recorded message: {message}")]
    MalformedMessage { message: String },

    /// Opening a live session failed. The owning worker enters skip mode.
    #[error("Error dialing the replay target: {message}")]
    Dial { message: String },

    /// Wraps a [`std::io::Error`] raised while executing on a live session.
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    /// An invalid configuration value was provided.
    #[error("An invalid argument was provided: {message}")]
    InvalidArgument { message: String },

    /// An internal invariant was violated; aborts the run.
    #[error("Internal error: {message}")]
    Internal { message: String },
}
