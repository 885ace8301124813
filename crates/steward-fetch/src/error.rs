//! Error type for payload fetches.
//!
//! Timeouts and unexpected end-of-stream are distinct kinds, never
//! conflated with a refused connection; callers and operators need to
//! tell them apart.

use std::time::Duration;

/// Error type for the raw HTTP(S) payload client.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("connect to {addr} failed: {source}")]
    ConnectFailed {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("tls handshake with {host} failed: {detail}")]
    TlsFailed { host: String, detail: String },
    #[error("fallback ca bundle unusable: {0}")]
    FallbackBundle(String),
    #[error("timed out after {after:?} during {stage}")]
    Timeout { stage: &'static str, after: Duration },
    #[error("connection closed unexpectedly during {stage}")]
    UnexpectedEof { stage: &'static str },
    #[error("server returned {status} {reason}")]
    BadStatus { status: u16, reason: String },
    #[error("malformed response: {0}")]
    MalformedResponse(String),
    #[error("chunked body decode failed: {0}")]
    ChunkDecode(String),
    #[error("io error during {stage}: {source}")]
    Io {
        stage: &'static str,
        #[source]
        source: std::io::Error,
    },
}

impl FetchError {
    /// True when the failure happened before any request byte was sent.
    pub fn is_pre_request(&self) -> bool {
        matches!(
            self,
            FetchError::InvalidUrl(_)
                | FetchError::ConnectFailed { .. }
                | FetchError::TlsFailed { .. }
                | FetchError::FallbackBundle(_)
        )
    }
}
