//! Error types for the DevTools agent.
//!
//! All fallible operations return [`Result<T>`] which uses [`Error`].
//!
//! Note that command timeouts are deliberately *not* errors: a command
//! sent with a wait deadline resolves to `Ok(None)` when the deadline
//! passes, because protocol commands are best-effort. The variants here
//! cover failures of the machinery itself.
//!
//! # Error Categories
//!
//! | Category | Variants |
//! |----------|----------|
//! | Connection | [`Error::Connection`], [`Error::ConnectionTimeout`], [`Error::ConnectionClosed`] |
//! | Endpoint | [`Error::NoDebugTarget`] |
//! | Protocol | [`Error::Protocol`] |
//! | External | [`Error::Io`], [`Error::Json`], [`Error::WebSocket`], [`Error::Http`] |

// ============================================================================
// Imports
// ============================================================================

use std::io::Error as IoError;
use std::result::Result as StdResult;

use thiserror::Error;
use tokio_tungstenite::tungstenite::Error as WsError;

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Connection Errors
    // ========================================================================
    /// WebSocket connection failed.
    #[error("Connection failed: {message}")]
    Connection {
        /// Description of the connection error.
        message: String,
    },

    /// Timed out waiting for the debug endpoint or WebSocket.
    #[error("Connection timeout after {timeout_ms}ms")]
    ConnectionTimeout {
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    /// Connection closed while the session was active.
    #[error("Connection closed")]
    ConnectionClosed,

    // ========================================================================
    // Endpoint Errors
    // ========================================================================
    /// The debug endpoint listed no attachable page target.
    #[error("No debuggable page target at {endpoint}")]
    NoDebugTarget {
        /// The `/json` endpoint URL that was queried.
        endpoint: String,
    },

    // ========================================================================
    // Protocol Errors
    // ========================================================================
    /// Protocol violation or unexpected message shape.
    #[error("Protocol error: {message}")]
    Protocol {
        /// Description of the protocol violation.
        message: String,
    },

    // ========================================================================
    // External Errors
    // ========================================================================
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] IoError),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    /// HTTP error talking to the debug endpoint.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Archive error while writing the response body zip.
    #[error("Archive error: {0}")]
    Archive(#[from] zip::result::ZipError),
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates a connection error.
    #[inline]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Creates a connection timeout error.
    #[inline]
    pub fn connection_timeout(timeout_ms: u64) -> Self {
        Self::ConnectionTimeout { timeout_ms }
    }

    /// Creates a protocol error.
    #[inline]
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Creates a no-debug-target error.
    #[inline]
    pub fn no_debug_target(endpoint: impl Into<String>) -> Self {
        Self::NoDebugTarget {
            endpoint: endpoint.into(),
        }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns `true` if this is a connection-level error.
    #[inline]
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. }
                | Self::ConnectionTimeout { .. }
                | Self::ConnectionClosed
                | Self::WebSocket(_)
        )
    }

    /// Returns `true` if this error may succeed on retry.
    #[inline]
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionTimeout { .. } | Self::Http(_) | Self::NoDebugTarget { .. }
        )
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::ErrorKind;

    #[test]
    fn test_error_display() {
        let err = Error::connection("failed to connect");
        assert_eq!(err.to_string(), "Connection failed: failed to connect");
    }

    #[test]
    fn test_is_connection_error() {
        assert!(Error::connection("test").is_connection_error());
        assert!(Error::ConnectionClosed.is_connection_error());
        assert!(Error::connection_timeout(1000).is_connection_error());
        assert!(!Error::protocol("test").is_connection_error());
    }

    #[test]
    fn test_is_recoverable() {
        assert!(Error::connection_timeout(1000).is_recoverable());
        assert!(Error::no_debug_target("http://localhost:9222/json").is_recoverable());
        assert!(!Error::protocol("test").is_recoverable());
    }

    #[test]
    fn test_from_io_error() {
        let io_err = IoError::new(ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }
}
