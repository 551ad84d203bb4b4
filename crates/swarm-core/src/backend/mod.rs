//! Model backend abstraction
//!
//! A backend is an opaque chat-completion service. It either returns the full
//! text or a stream of text chunks, and classifies its failures through
//! [`BackendError`].

pub mod openai;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::error::BackendError;

pub use openai::OpenAiCompatBackend;

/// Ordered text chunks of a streamed completion
pub type ChunkStream = BoxStream<'static, Result<String, BackendError>>;

/// Sampling options forwarded to the backend
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CompletionOptions {
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for CompletionOptions {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: 1024,
        }
    }
}

/// One system + user exchange against a specific model
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub system_prompt: String,
    pub user_message: String,
    pub model_id: String,
    pub options: CompletionOptions,
}

#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// Provider name for logging
    fn provider_name(&self) -> &str;

    /// Full completion in one response
    async fn complete(&self, request: &CompletionRequest) -> Result<String, BackendError>;

    /// Open a streamed completion. Errors opening the stream are returned
    /// here; errors mid-stream arrive as stream items.
    async fn stream(&self, request: &CompletionRequest) -> Result<ChunkStream, BackendError>;
}
