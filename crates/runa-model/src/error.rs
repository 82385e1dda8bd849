// Copyright (c) 2024-2026 the runa authors
//
// SPDX-License-Identifier: Apache-2.0
use std::time::Duration;

/// Provider failure taxonomy.
///
/// The engine matches on these: `Transport` and `RateLimited` are retried
/// with jitter, `ContextLengthExceeded` forces one compaction and a retry,
/// everything else surfaces to the caller.
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("rate limited{}", retry_after.map(|d| format!(" (retry after {}s)", d.as_secs())).unwrap_or_default())]
    RateLimited { retry_after: Option<Duration> },

    #[error("request exceeds the model's context window")]
    ContextLengthExceeded,

    #[error("provider error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("invalid request {status}: {message}")]
    InvalidRequest { status: u16, message: String },
}

impl ModelError {
    /// Whether a retry with backoff is worthwhile.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::RateLimited { .. } | Self::Api { .. })
    }

    /// Classify an HTTP error response.
    ///
    /// 429 → rate limited (with a parsed `Retry-After` when present);
    /// a 4xx whose body names the context window → `ContextLengthExceeded`
    /// (the OpenAI-compatible servers report this as a 400 with a
    /// `context_length_exceeded` code rather than a dedicated status);
    /// other 4xx → invalid request; 5xx → provider error.
    pub fn from_status(status: u16, retry_after: Option<Duration>, body: &str) -> Self {
        if status == 429 {
            return Self::RateLimited { retry_after };
        }
        if (400..500).contains(&status) {
            if body.contains("context_length_exceeded")
                || body.contains("exceed_context_size_error")
                || body.contains("maximum context length")
            {
                return Self::ContextLengthExceeded;
            }
            return Self::InvalidRequest { status, message: body.to_string() };
        }
        Self::Api { status, message: body.to_string() }
    }
}

impl From<reqwest::Error> for ModelError {
    fn from(e: reqwest::Error) -> Self {
        Self::Transport(e.to_string())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_429_maps_to_rate_limited() {
        let e = ModelError::from_status(429, Some(Duration::from_secs(7)), "slow down");
        match e {
            ModelError::RateLimited { retry_after } => {
                assert_eq!(retry_after, Some(Duration::from_secs(7)));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn status_400_with_context_marker_maps_to_context_exceeded() {
        let body = r#"{"error":{"code":"context_length_exceeded","message":"too long"}}"#;
        assert!(matches!(
            ModelError::from_status(400, None, body),
            ModelError::ContextLengthExceeded
        ));
    }

    #[test]
    fn llama_cpp_overflow_marker_also_maps_to_context_exceeded() {
        let body = r#"{"error":{"type":"exceed_context_size_error","n_ctx":8192}}"#;
        assert!(matches!(
            ModelError::from_status(400, None, body),
            ModelError::ContextLengthExceeded
        ));
    }

    #[test]
    fn plain_400_maps_to_invalid_request() {
        assert!(matches!(
            ModelError::from_status(400, None, "bad schema"),
            ModelError::InvalidRequest { status: 400, .. }
        ));
    }

    #[test]
    fn status_500_maps_to_api_error() {
        assert!(matches!(
            ModelError::from_status(503, None, "upstream down"),
            ModelError::Api { status: 503, .. }
        ));
    }

    #[test]
    fn transience_classification() {
        assert!(ModelError::Transport("reset".into()).is_transient());
        assert!(ModelError::RateLimited { retry_after: None }.is_transient());
        assert!(ModelError::Api { status: 502, message: String::new() }.is_transient());
        assert!(!ModelError::ContextLengthExceeded.is_transient());
        assert!(!ModelError::InvalidRequest { status: 422, message: String::new() }.is_transient());
    }
}
