//! Error types for the OmniBridge domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error variant.
//!
//! Only resource-acquisition failures are meant to abort a turn
//! ([`BackendError::Unavailable`], [`BackendError::InvalidInput`],
//! [`ToolError::ConnectionFailed`]). Tool execution failures are folded into
//! a [`crate::ToolResult`] by the tool client and never surface here.

use thiserror::Error;

/// The top-level error type for all OmniBridge operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Backend errors ---
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    // --- Tool-protocol errors ---
    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    // --- Retrieval errors ---
    #[error("Retrieval error: {0}")]
    Retrieval(#[from] RetrievalError),

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Cancellation ---
    #[error("Session timed out after {timeout_secs}s")]
    SessionTimeout { timeout_secs: u64 },

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

#[derive(Debug, Clone, Error)]
pub enum BackendError {
    /// The model or its serving process cannot be reached.
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    /// Content the backend cannot accept (e.g. an image part for a text-only model).
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("API request failed: {message} (status: {status_code})")]
    ApiError {
        status_code: u16,
        message: String,
    },

    #[error("Rate limited by backend, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Stream interrupted: {0}")]
    StreamInterrupted(String),

    /// A local model instance is already serving another generation.
    #[error("Model instance busy: {0}")]
    Busy(String),

    #[error("Request timed out: {0}")]
    Timeout(String),
}

#[derive(Debug, Clone, Error)]
pub enum ToolError {
    /// The tool server could not be started or reached.
    #[error("Connection to tool server '{server}' failed: {reason}")]
    ConnectionFailed { server: String, reason: String },

    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("Server returned error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("Tool not found: {0}")]
    NotFound(String),

    #[error("Tool timed out: {tool_name} after {timeout_secs}s")]
    Timeout { tool_name: String, timeout_secs: u64 },

    #[error("Tool execution failed: {tool_name}: {reason}")]
    ExecutionFailed { tool_name: String, reason: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Session closed")]
    Closed,
}

#[derive(Debug, Clone, Error)]
pub enum RetrievalError {
    #[error("Vector dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Embedding generation failed: {0}")]
    EmbeddingFailed(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl BackendError {
    /// Whether this failure means the model itself could not be used, as
    /// opposed to a request-level rejection.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, BackendError::Unavailable(_) | BackendError::Timeout(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_error_displays_correctly() {
        let err = Error::Backend(BackendError::ApiError {
            status_code: 429,
            message: "Too many requests".into(),
        });
        assert!(err.to_string().contains("429"));
        assert!(err.to_string().contains("Too many requests"));
    }

    #[test]
    fn tool_error_displays_correctly() {
        let err = Error::Tool(ToolError::ConnectionFailed {
            server: "fetch".into(),
            reason: "connection refused".into(),
        });
        assert!(err.to_string().contains("fetch"));
        assert!(err.to_string().contains("refused"));
    }

    #[test]
    fn unavailable_classification() {
        assert!(BackendError::Unavailable("down".into()).is_unavailable());
        assert!(!BackendError::InvalidInput("image".into()).is_unavailable());
    }

    #[test]
    fn dimension_mismatch_reports_both_sizes() {
        let err = RetrievalError::DimensionMismatch { expected: 3, actual: 4 };
        let text = err.to_string();
        assert!(text.contains('3') && text.contains('4'));
    }
}
