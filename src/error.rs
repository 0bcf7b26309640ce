//! Error handling for the SSE client.

use thiserror::Error;

/// The result type used throughout the crate.
pub type Result<T> = std::result::Result<T, ClientError>;

/// Everything that can go wrong with an SSE connection.
///
/// Malformed SSE fields are *not* errors — the parser tolerates them per
/// the spec. Errors here are connection-level: the transport failed, the
/// server refused the stream, or the stream carried invalid UTF-8.
#[derive(Error, Debug)]
pub enum ClientError {
    /// Connect/read/write failures, TLS errors, and transport timeouts.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The server answered the stream request with a non-2xx status.
    #[error("server returned HTTP {status}")]
    UnsuccessfulResponse {
        /// The response status code.
        status: http::StatusCode,
    },

    /// The server closed an established stream cleanly.
    #[error("streaming connection closed by server")]
    EndOfStream,

    /// The stream carried bytes that are not valid UTF-8.
    #[error("invalid UTF-8 in event stream: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),

    /// Configuration rejected before any connection was attempted.
    #[error("configuration error: {message}")]
    Config {
        /// What was wrong with the configuration.
        message: String,
    },
}

impl ClientError {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// The status code of an unsuccessful response, if that is what this is.
    pub fn status(&self) -> Option<http::StatusCode> {
        match self {
            Self::UnsuccessfulResponse { status } => Some(*status),
            _ => None,
        }
    }

    /// Whether this is the clean end of an established stream.
    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, Self::EndOfStream)
    }
}
