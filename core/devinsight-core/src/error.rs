//! Error types for the heartbeat pipeline.
//!
//! Delivery failures are not errors here: a send attempt always resolves to a
//! [`crate::delivery::DeliveryOutcome`], which the dispatcher classifies.

use std::path::PathBuf;

/// All errors that can occur inside devinsight-core.
#[derive(Debug, thiserror::Error)]
pub enum InsightError {
    // ─────────────────────────────────────────────────────────────────────
    // Capture
    // ─────────────────────────────────────────────────────────────────────
    #[error("Invalid heartbeat: {reason}")]
    InvalidHeartbeat { reason: String },

    // ─────────────────────────────────────────────────────────────────────
    // Durable queue
    // ─────────────────────────────────────────────────────────────────────
    #[error("Persistence error: {context}: {source}")]
    Persistence {
        context: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Queue lock poisoned")]
    LockPoisoned,

    // ─────────────────────────────────────────────────────────────────────
    // Configuration
    // ─────────────────────────────────────────────────────────────────────
    #[error("Configuration file malformed: {path}: {details}")]
    ConfigMalformed { path: PathBuf, details: String },

    #[error("Home directory not found")]
    HomeDirNotFound,

    #[error("HTTP client setup failed: {0}")]
    HttpClient(String),

    // ─────────────────────────────────────────────────────────────────────
    // I/O
    // ─────────────────────────────────────────────────────────────────────
    #[error("I/O error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {context}: {source}")]
    Json {
        context: String,
        #[source]
        source: serde_json::Error,
    },
}

impl InsightError {
    pub fn invalid(reason: impl Into<String>) -> Self {
        InsightError::InvalidHeartbeat {
            reason: reason.into(),
        }
    }

    pub fn persistence(context: impl Into<String>, source: rusqlite::Error) -> Self {
        InsightError::Persistence {
            context: context.into(),
            source,
        }
    }
}

/// Convenience type alias for Results using InsightError.
pub type Result<T> = std::result::Result<T, InsightError>;

impl From<InsightError> for String {
    fn from(err: InsightError) -> String {
        err.to_string()
    }
}
