//! Provider adapter contract consumed by the provider worker pool.
//!
//! These traits are the pluggable boundary described in §6: the core only
//! calls through them and never constructs a concrete HTTP client itself.
//! Reference adapters live in the `jobs`/`store-client` crates and in this
//! crate's test modules.

use std::time::Duration;

use async_trait::async_trait;

use crate::types::{ChatMessage, ChatResult, OcrResult, ToolDescriptor, TtsRequest, TtsResult};

/// A typed rate-limit signal an adapter may return instead of a generic error.
///
/// The provider pool detects this variant specifically: it drives both the
/// retry loop's backoff and [`crate::rate_limiter::RateLimiter::record_429`].
#[derive(Debug, Clone)]
pub struct RateLimitError {
    /// Provider-supplied cooldown before the next request should be attempted.
    pub retry_after: Duration,
}

impl std::fmt::Display for RateLimitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "rate limited, retry after {:?}", self.retry_after)
    }
}
impl std::error::Error for RateLimitError {}

/// An adapter-level failure, distinguishing the one structured case the pool
/// treats specially from everything else (matched by message heuristics).
#[derive(Debug, Clone)]
pub enum AdapterError {
    /// Structured rate-limit response.
    RateLimited(RateLimitError),
    /// Any other failure; classified as transient-or-not by message content.
    Other(String),
}

impl std::fmt::Display for AdapterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AdapterError::RateLimited(e) => write!(f, "{e}"),
            AdapterError::Other(msg) => write!(f, "{msg}"),
        }
    }
}
impl std::error::Error for AdapterError {}

/// Fields every concrete provider adapter exposes regardless of kind.
pub trait AdapterInfo: Send + Sync {
    /// Human-readable provider name, used as the default pool name.
    fn name(&self) -> &str;
    /// Steady-state requests-per-second this provider should be throttled to.
    fn requests_per_second(&self) -> f64;
    /// Maximum concurrent in-flight requests this provider tolerates.
    fn max_concurrency(&self) -> usize;
    /// Maximum retry attempts after the first, before the pool gives up.
    fn max_retries(&self) -> u32 {
        7
    }
}

/// A chat-completion request as sent to an LLM adapter.
#[derive(Debug, Clone)]
pub struct ChatApiRequest {
    /// Conversation so far.
    pub messages: Vec<ChatMessage>,
    /// Model name hint.
    pub model: Option<String>,
}

/// Adapter contract for language-model providers.
#[async_trait]
pub trait LlmAdapter: AdapterInfo {
    /// Plain chat completion, no tool calls.
    async fn chat(&self, req: ChatApiRequest) -> Result<ChatResult, AdapterError>;

    /// Chat completion with tool descriptors attached.
    async fn chat_with_tools(
        &self,
        req: ChatApiRequest,
        tools: &[ToolDescriptor],
    ) -> Result<ChatResult, AdapterError>;

    /// Liveness probe used by the scheduler's pool-status reporting.
    async fn health_check(&self) -> Result<(), AdapterError> {
        Ok(())
    }
}

/// Adapter contract for OCR providers.
#[async_trait]
pub trait OcrAdapter: AdapterInfo {
    /// Extract text from a single page image.
    async fn process_image(&self, image_bytes: &[u8], page_num: u32) -> Result<OcrResult, AdapterError>;

    /// Liveness probe used by the scheduler's pool-status reporting.
    async fn health_check(&self) -> Result<(), AdapterError> {
        Ok(())
    }
}

/// Adapter contract for text-to-speech providers.
#[async_trait]
pub trait TtsAdapter: AdapterInfo {
    /// Synthesize audio for the given request, honoring stitching ids when present.
    async fn generate(&self, req: &TtsRequest) -> Result<TtsResult, AdapterError>;

    /// Liveness probe used by the scheduler's pool-status reporting.
    async fn health_check(&self) -> Result<(), AdapterError> {
        Ok(())
    }
}

/// Classifies an [`AdapterError`] (an exception the adapter call itself
/// raised) for the provider pool's retry loop.
///
/// A result is retriable if it carries a structured rate-limit error, or its
/// message matches a known-transient shape: HTTP 5xx, 429, "rate limit",
/// timeout/deadline-exceeded, or connection refused/reset/EOF. This broad
/// matching applies only to exception-level failures; a *result*-level llm
/// failure (reported via `ChatResult::result_error` on an otherwise
/// successful call) is classified separately by
/// [`is_result_error_retriable`], which is far narrower.
pub fn is_retriable(err: &AdapterError) -> bool {
    match err {
        AdapterError::RateLimited(_) => true,
        AdapterError::Other(msg) => {
            let lower = msg.to_lowercase();
            const TRANSIENT_NEEDLES: &[&str] = &[
                "rate limit",
                "timeout",
                "deadline exceeded",
                "connection refused",
                "connection reset",
                "eof",
            ];
            if TRANSIENT_NEEDLES.iter().any(|n| lower.contains(n)) {
                return true;
            }
            is_5xx_or_429(&lower)
        }
    }
}

fn is_5xx_or_429(lower: &str) -> bool {
    for code in ["429", "500", "502", "503", "504"] {
        if lower.contains(code) {
            return true;
        }
    }
    false
}

/// Classifies a *result*-level llm failure: one reported inside a
/// successful `chat`/`chat_with_tools` call via `ChatResult::result_error`,
/// never raised as an [`AdapterError`]. Only a structured `json_parse`
/// failure is retriable here — any other result-level failure reflects a
/// genuine request/response mismatch (bad prompt, policy rejection, ...)
/// that retrying won't fix, unlike the broad exception-level matching in
/// [`is_retriable`].
pub fn is_result_error_retriable(message: &str) -> bool {
    message.to_lowercase().contains("json_parse")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limited_is_always_retriable() {
        assert!(is_retriable(&AdapterError::RateLimited(RateLimitError {
            retry_after: Duration::from_millis(1),
        })));
    }

    #[test]
    fn known_transient_shapes_are_retriable() {
        assert!(is_retriable(&AdapterError::Other("connection reset by peer".into())));
        assert!(is_retriable(&AdapterError::Other("HTTP 503 service unavailable".into())));
    }

    #[test]
    fn exception_level_json_parse_is_not_broadly_retriable() {
        // json_parse is only retriable for a *result*-level llm failure
        // (see `is_result_error_retriable`); as a raised exception it gets
        // no special treatment.
        assert!(!is_retriable(&AdapterError::Other("json_parse: unexpected token".into())));
    }

    #[test]
    fn only_json_parse_result_errors_are_retriable() {
        assert!(is_result_error_retriable("json_parse: unexpected token at offset 12"));
        assert!(!is_result_error_retriable("timeout waiting for model response"));
        assert!(!is_result_error_retriable("content policy violation"));
    }

    #[test]
    fn validation_errors_are_not_retriable() {
        assert!(!is_retriable(&AdapterError::Other("invalid api key".into())));
        assert!(!is_retriable(&AdapterError::Other("content policy violation".into())));
    }
}
