//! # Error Handling
//!
//! Centralized error types for Vira core.
//! Uses `thiserror` for ergonomic error definitions.

use crate::types::ParamType;
use thiserror::Error;

/// Result type alias for Vira operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for the Vira runtime
#[derive(Error, Debug)]
pub enum Error {
    /// Server failed to bind to the specified address
    #[error("Failed to bind server to {address}: {source}")]
    BindError {
        /// The address we tried to bind to
        address: String,
        /// The underlying IO error
        #[source]
        source: std::io::Error,
    },

    /// Invalid route pattern provided at registration time
    #[error("Invalid route pattern: {pattern}: {reason}")]
    InvalidRoutePattern {
        /// The invalid pattern
        pattern: String,
        /// Reason for invalidity
        reason: String,
    },

    /// Unknown or unsupported HTTP method token
    #[error("Invalid HTTP method: {method}")]
    InvalidMethod {
        /// The rejected method token
        method: String,
    },

    /// A raw path segment does not satisfy its parameter type
    #[error("Cannot convert '{value}' to {expected}")]
    Conversion {
        /// The raw segment
        value: String,
        /// The declared parameter type
        expected: ParamType,
    },

    /// Middleware chain used outside its lifecycle
    #[error("Middleware chain misuse: {reason}")]
    ChainMisuse {
        /// What was attempted
        reason: String,
    },

    /// Failure raised by an interceptor or route handler
    #[error("Handler error: {message}")]
    Handler {
        /// Error message from application code
        message: String,
    },

    /// A startup or shutdown hook failed
    #[error("Lifecycle hook failed: {message}")]
    Lifecycle {
        /// Error message from the hook
        message: String,
    },

    /// HTTP protocol error
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Request body is not valid JSON
    #[error("Invalid JSON body: {0}")]
    JsonBody(String),

    /// Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Request payload too large
    #[error("Payload too large: limit={limit} bytes, received={actual} bytes")]
    PayloadTooLarge {
        /// Max allowed size
        limit: usize,
        /// Actual size
        actual: usize,
    },
}

impl Error {
    /// Shorthand for application-level handler failures
    pub fn handler(message: impl Into<String>) -> Self {
        Self::Handler {
            message: message.into(),
        }
    }

    /// HTTP status used when this error escapes every interceptor
    #[must_use]
    pub const fn status_code(&self) -> u16 {
        match self {
            Self::InvalidMethod { .. } => 405,
            Self::JsonBody(_) => 400,
            Self::PayloadTooLarge { .. } => 413,
            _ => 500,
        }
    }
}
