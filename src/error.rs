//! Error taxonomy for the session client
//!
//! Transport and decode errors never cross the client boundary as panics or
//! early returns to the UI; they become state the UI observes through the
//! session snapshot. Validation errors are synchronous return values.

use thiserror::Error;

/// Transport-level failure
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("websocket handshake failed: {0}")]
    Handshake(String),

    #[error("not connected (state is {state})")]
    NotConnected { state: &'static str },

    #[error("socket error: {0}")]
    Socket(String),

    #[error("retries exhausted after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },

    #[error("invalid endpoint url: {0}")]
    InvalidEndpoint(String),
}

impl ConnectionError {
    /// Whether the retry policy applies to this error
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Handshake(_) | Self::Socket(_))
    }
}

/// A frame that could not be turned into a typed event
///
/// Never fatal: the reducer records these and skips the frame, so new server
/// event kinds cannot crash an older client.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("unknown event discriminator {tag:?}")]
    UnknownEvent { tag: String },

    #[error("malformed {tag:?} event: {detail}")]
    MalformedEvent { tag: String, detail: String },
}

impl DecodeError {
    pub fn malformed(tag: impl Into<String>, detail: impl std::fmt::Display) -> Self {
        Self::MalformedEvent {
            tag: tag.into(),
            detail: detail.to_string(),
        }
    }

    /// Discriminator of the offending frame, when one was present
    pub fn tag(&self) -> &str {
        match self {
            Self::UnknownEvent { tag } | Self::MalformedEvent { tag, .. } => tag,
        }
    }
}

/// File rejected before any I/O happened
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("extension {extension:?} is not in the allow-list")]
    UnsupportedExtension { extension: String },

    #[error("file has no extension")]
    MissingExtension,

    #[error("{size_bytes} bytes exceeds the {max_bytes} byte limit")]
    TooLarge { size_bytes: u64, max_bytes: u64 },
}

/// Post-submission failure of a single upload task
#[derive(Debug, Clone, Error)]
pub enum UploadError {
    #[error("read failed: {0}")]
    Read(String),

    #[error("timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("cancelled: {reason}")]
    Cancelled { reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(ConnectionError::Socket("reset".into()).is_retryable());
        assert!(!ConnectionError::RetriesExhausted { attempts: 5 }.is_retryable());
        assert!(!ConnectionError::NotConnected { state: "failed" }.is_retryable());
    }

    #[test]
    fn decode_error_exposes_tag() {
        let err = DecodeError::UnknownEvent {
            tag: "telemetry".into(),
        };
        assert_eq!(err.tag(), "telemetry");
    }
}
