//! LLM provider trait: one implementation per upstream API shape.

use crate::types::{LlmRequest, StreamDelta};
use futures::Stream;
use std::pin::Pin;
use tokio_util::sync::CancellationToken;

pub type LlmResult<T> = Result<T, LlmError>;

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("request failed: {0}")]
    RequestFailed(String),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("rate limited: retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("context overflow: {0}")]
    ContextOverflow(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("stream error: {0}")]
    StreamError(String),

    #[error("cancelled")]
    Cancelled,

    #[error("empty response")]
    Empty,

    #[error("network error: {0}")]
    NetworkError(#[from] reqwest::Error),
}

impl From<LlmError> for tarsy_core::Error {
    fn from(e: LlmError) -> Self {
        use tarsy_core::ErrorKind;
        match e {
            LlmError::Cancelled => tarsy_core::Error::cancelled("llm call cancelled"),
            LlmError::Empty => tarsy_core::Error::llm_empty("llm returned an empty response"),
            LlmError::RateLimited { retry_after_ms } => tarsy_core::Error::llm_timeout(format!(
                "llm rate limited, retry after {retry_after_ms}ms"
            )),
            other => tarsy_core::Error::new(ErrorKind::Internal, other.to_string()),
        }
    }
}

pub type LlmStream = Pin<Box<dyn Stream<Item = LlmResult<StreamDelta>> + Send>>;

/// One implementation per upstream wire format. `complete_stream` takes an
/// optional cancellation token: if it fires mid-stream, implementations drop
/// the underlying connection and the stream yields `LlmError::Cancelled`.
#[async_trait::async_trait]
pub trait LlmProvider: Send + Sync {
    fn name(&self) -> &str;
    fn models(&self) -> &[&str];

    fn supports_model(&self, model: &str) -> bool {
        self.models()
            .iter()
            .any(|m| *m == model || model.starts_with(m))
    }

    async fn complete_stream(
        &self,
        request: LlmRequest,
        cancel: Option<CancellationToken>,
    ) -> LlmResult<LlmStream>;
}
