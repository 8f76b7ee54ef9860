//! Error types for tether.
//!
//! Errors fall into three groups: protocol errors (bad or missing replies,
//! unknown targets), target invocation errors (whatever the invoked host
//! function reported, reduced to its string form on the wire) and
//! disposed-reference errors raised locally without a round trip.

use std::sync::Arc;
use thiserror::Error;

/// Main error type for tether operations.
#[derive(Debug, Clone, Error)]
pub enum TetherError {
    // Lookup errors
    #[error("No object with id {id}")]
    NoObject { id: String },

    #[error("No class with id {class_id}")]
    NoClass { class_id: String },

    #[error("Object has no member named {name}")]
    NoMember { name: String },

    // Lifecycle errors
    #[error("Remote object {id} has been disposed")]
    Disposed { id: String },

    #[error("RPC service has been dropped")]
    ServiceDropped,

    #[error("Channel closed")]
    ChannelClosed,

    // Invocation errors
    /// Failure reported by the peer. Displays the peer's message verbatim.
    #[error("{0}")]
    Remote(String),

    /// Failure raised by a local target. Displays the message verbatim.
    #[error("{0}")]
    Failed(String),

    #[error("Property {name} is readonly")]
    Readonly { name: String },

    #[error("Type mismatch: expected {expected}, got {actual}")]
    TypeMismatch {
        expected: &'static str,
        actual: &'static str,
    },

    // Protocol errors
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    #[error("Channel does not support {0}")]
    Unsupported(&'static str),

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<Arc<serde_json::Error>>,
    },

    // Transport errors
    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<Arc<std::io::Error>>,
    },
}

/// Result type alias for tether operations.
pub type Result<T> = std::result::Result<T, TetherError>;

impl From<std::io::Error> for TetherError {
    fn from(err: std::io::Error) -> Self {
        TetherError::Io {
            message: err.to_string(),
            source: Some(Arc::new(err)),
        }
    }
}

impl From<serde_json::Error> for TetherError {
    fn from(err: serde_json::Error) -> Self {
        TetherError::Json {
            message: err.to_string(),
            source: Some(Arc::new(err)),
        }
    }
}

impl TetherError {
    /// Shorthand for a local target failure.
    pub fn failed(message: impl Into<String>) -> Self {
        TetherError::Failed(message.into())
    }

    /// Shorthand for a protocol violation.
    pub fn protocol(message: impl Into<String>) -> Self {
        TetherError::Protocol {
            message: message.into(),
        }
    }

    /// The string carried in a failure reply.
    ///
    /// No structured metadata crosses the wire, only this message.
    pub fn to_wire_message(&self) -> String {
        self.to_string()
    }

    /// True for errors the caller could fix by obtaining a fresh reference.
    pub fn is_disposed(&self) -> bool {
        matches!(self, TetherError::Disposed { .. })
    }
}
