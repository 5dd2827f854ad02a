//! The LLM client contract (spec §1 out-of-scope collaborator): a single
//! blocking text-completion call. Production wires this to a real provider;
//! the compiler and repair loop fall back to heuristics/refusal when it's
//! absent or fails.

use async_trait::async_trait;

pub type LlmResult<T> = Result<T, LlmError>;

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("request failed: {0}")]
    RequestFailed(String),
    #[error("authentication failed: {0}")]
    AuthFailed(String),
    #[error("rate limited: retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    fn name(&self) -> &str;

    /// Run one completion to full text. No streaming — callers that need
    /// structured output parse the returned string themselves.
    async fn complete(&self, prompt: &str) -> LlmResult<String>;
}

/// Always fails. Used wherever a caller has no LLM configured; downstream
/// code treats its failure as "degrade to heuristics", never as fatal.
pub struct NullLlmClient;

#[async_trait]
impl LlmClient for NullLlmClient {
    fn name(&self) -> &str {
        "null"
    }

    async fn complete(&self, _prompt: &str) -> LlmResult<String> {
        Err(LlmError::RequestFailed("no LLM client configured".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn null_client_always_fails() {
        let client = NullLlmClient;
        let err = client.complete("hello").await.unwrap_err();
        assert!(matches!(err, LlmError::RequestFailed(_)));
    }

    #[test]
    fn null_client_name() {
        assert_eq!(NullLlmClient.name(), "null");
    }
}
