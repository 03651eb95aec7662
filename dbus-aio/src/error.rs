use crate::types::{CastError, DemarshalError};
use dbus_aio_strings::InvalidStringError;
use std::io;
use thiserror::Error as ThisError;

/// The uniform error type of this crate.
///
/// Completions carry exactly one of these; the variant is the error
/// category.
#[derive(Debug, ThisError)]
pub enum Error {
    /// Socket level failure. Fatal for the connection.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The peer violated the wire or authentication protocol, or a
    /// size ceiling was exceeded. Fatal for the in-flight operation.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A well-formed error message received as the reply to a method
    /// call. Non-fatal.
    #[error("{name}: {message}")]
    Remote {
        /// The error name, e g "org.freedesktop.DBus.Error.Failed".
        name: String,
        /// The human-readable text carried in the error body.
        message: String,
    },

    /// A caller-supplied name, path or signature failed validation.
    /// Raised synchronously at the call site.
    #[error(transparent)]
    InvalidString(#[from] InvalidStringError),

    /// A message is missing a header field its kind requires.
    #[error("invalid message: {0}")]
    InvalidMessage(&'static str),

    /// A match rule was composed out of incompatible or out-of-range
    /// parts. Raised synchronously at the call site.
    #[error("invalid match rule: {0}")]
    InvalidMatchRule(&'static str),

    /// A bus address could not be resolved or parsed.
    #[error("invalid bus address: {0}")]
    InvalidAddress(String),

    /// A codec value did not hold the requested concrete type.
    /// Raised synchronously at the call site.
    #[error(transparent)]
    Cast(#[from] CastError),

    /// The connection closed while the operation was pending. This is
    /// what every pending handler resolves to when the connection
    /// goes down.
    #[error("connection closed")]
    Disconnected,

    /// A one-shot handler is already registered under this key.
    #[error("a handler is already registered for \"{0}\"")]
    HandlerExists(String),
}

impl From<DemarshalError> for Error {
    fn from(e: DemarshalError) -> Error {
        Error::Protocol(e.to_string())
    }
}

impl Error {
    /// The remote error name, if this is a remote error.
    pub fn name(&self) -> Option<&str> {
        match self {
            Error::Remote { name, .. } => Some(name),
            _ => None,
        }
    }

    /// The remote error text, if this is a remote error.
    pub fn message(&self) -> Option<&str> {
        match self {
            Error::Remote { message, .. } => Some(message),
            _ => None,
        }
    }
}
