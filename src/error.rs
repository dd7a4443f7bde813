//! Top-level and wire-decoding error types.

use thiserror::Error;

/// Errors that can occur while decoding bytes off the wire.
///
/// `Truncated` means "not a decoding error, just not enough data yet" and
/// callers should wait for more bytes. `Invalid` is a genuine malformed-input
/// error and is fatal to the frame being decoded, never to the connection.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DecodeError {
    #[error("truncated input at offset {offset}")]
    Truncated { offset: usize },

    #[error("invalid data at offset {offset}: {reason}")]
    Invalid { offset: usize, reason: String },
}

impl DecodeError {
    pub fn invalid(offset: usize, reason: impl Into<String>) -> Self {
        DecodeError::Invalid {
            offset,
            reason: reason.into(),
        }
    }

    pub fn is_truncated(&self) -> bool {
        matches!(self, DecodeError::Truncated { .. })
    }
}

/// Errors surfaced by the daemon's ambient stack (config, startup, signal wiring).
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("failed to bind socket at {path}: {source}")]
    Bind {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to load config file {path}: {source}")]
    ConfigFile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    ConfigParse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}
