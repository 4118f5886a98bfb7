//! Error types for the assetflow crate.

use std::fmt;

/// Result type for assetflow operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in assetflow operations.
///
/// All variants carry owned strings rather than source errors so that a
/// settled failure can be handed to every caller joined on a deduplicated
/// request.
#[derive(Debug, Clone)]
pub enum Error {
    /// HTTP request failed.
    Http {
        /// The URL that failed.
        url: String,
        /// The error message.
        message: String,
    },
    /// HTTP response had a non-success status code.
    HttpStatus {
        /// The URL that returned the error.
        url: String,
        /// The HTTP status code.
        status: u16,
    },
    /// JSON decoding failed.
    Json {
        /// Context for where the error occurred.
        context: &'static str,
        /// The error message.
        message: String,
    },
    /// Cache operation failed.
    Cache {
        /// The operation that failed.
        operation: &'static str,
        /// The error message.
        message: String,
    },
    /// A streamed fetch for the same URL is already in progress.
    ///
    /// Streamed operations cannot share chunk delivery between callers, so
    /// a concurrent identical stream is rejected instead of silently
    /// issuing a second network fetch.
    AlreadyStreaming {
        /// The URL already being streamed.
        url: String,
    },
    /// Binary mesh blob was malformed.
    Blob {
        /// Context for where the error occurred.
        context: &'static str,
        /// Description of what was invalid.
        detail: String,
    },
    /// Invalid data in response.
    InvalidData {
        /// Context for where the error occurred.
        context: &'static str,
        /// Description of what was invalid.
        detail: String,
    },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Http { url, message } => {
                write!(f, "http request to {url} failed: {message}")
            }
            Error::HttpStatus { url, status } => {
                write!(f, "http request to {url} returned status {status}")
            }
            Error::Json { context, message } => {
                write!(f, "failed to decode {context}: {message}")
            }
            Error::Cache { operation, message } => {
                write!(f, "cache {operation} failed: {message}")
            }
            Error::AlreadyStreaming { url } => {
                write!(f, "a stream for {url} is already in progress")
            }
            Error::Blob { context, detail } => {
                write!(f, "malformed mesh blob ({context}): {detail}")
            }
            Error::InvalidData { context, detail } => {
                write!(f, "invalid {context}: {detail}")
            }
        }
    }
}

impl std::error::Error for Error {}

impl Error {
    pub(crate) fn http(url: &str, e: &dyn fmt::Display) -> Self {
        Error::Http {
            url: url.to_string(),
            message: e.to_string(),
        }
    }

    pub(crate) fn json(context: &'static str, e: &dyn fmt::Display) -> Self {
        Error::Json {
            context,
            message: e.to_string(),
        }
    }
}
