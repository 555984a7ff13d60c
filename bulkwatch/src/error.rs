//! Error types for the bulk-watch engine.

use crate::status::Status;
use std::time::Duration;
use thiserror::Error;

/// Boxed error produced by collaborators (storage, authorizer, encoders).
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Error type for the bulk-watch engine.
#[derive(Debug, Error)]
pub enum Error {
    /// An inbound frame could not be decoded at all.
    #[error("failed to decode frame: {0}")]
    Decode(String),

    /// A frame decoded cleanly but does not describe exactly one request variant.
    #[error("invalid request: {message}")]
    InvalidRequest {
        /// Correlation id of the offending request, when it could be read.
        request_id: Option<String>,
        /// Why the request was rejected.
        message: String,
    },

    /// An outbound message could not be encoded.
    #[error("failed to encode frame: {0}")]
    Encode(String),

    /// The underlying transport failed.
    #[error("transport error: {0}")]
    Transport(#[source] BoxError),

    /// The peer side of the stream is gone.
    #[error("stream closed")]
    StreamClosed,

    /// No frame was received or sent within the idle timeout.
    #[error("connection idle for longer than {0:?}")]
    IdleTimeout(Duration),

    /// A client connection could not be established.
    #[error("connection error: {0}")]
    Connection(String),
}

impl Error {
    /// Returns true if this error must terminate the whole session.
    ///
    /// Only [`Error::InvalidRequest`] is answered with a `Failure` response
    /// while the session keeps running.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Error::InvalidRequest { .. })
    }

    pub(crate) fn transport(source: impl Into<BoxError>) -> Self {
        Error::Transport(source.into())
    }
}

impl From<Error> for Status {
    fn from(err: Error) -> Self {
        match err {
            Error::InvalidRequest { message, .. } => Status::invalid_argument(message),
            Error::Decode(message) => Status::invalid_argument(message),
            Error::IdleTimeout(_) => Status::new(crate::Code::DeadlineExceeded, err.to_string()),
            Error::StreamClosed | Error::Transport(_) | Error::Connection(_) => {
                Status::unavailable(err.to_string())
            }
            Error::Encode(message) => Status::internal(message),
        }
    }
}

/// Result type alias for bulk-watch operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;
