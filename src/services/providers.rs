use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::utils::error::ProviderError;

/// One turn of an LLM conversation, OpenAI wire shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSearchResult {
    pub title: String,
    pub snippet: String,
    pub url: String,
}

/// Batched text embedding. Results come back in input order.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError>;

    async fn embed_one(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        let mut result = self.embed(std::slice::from_ref(&text.to_string())).await?;
        result.pop().ok_or_else(|| {
            ProviderError::new(
                crate::utils::error::ProviderErrorKind::BadResponse,
                "Empty embedding batch result",
            )
        })
    }
}

/// Chat-completion generation.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn generate(
        &self,
        messages: &[ChatMessage],
        max_tokens: usize,
        temperature: f32,
    ) -> Result<String, ProviderError>;

    /// Cheap reachability probe for `/config/test`.
    async fn test_connection(&self) -> Result<(), ProviderError>;
}

/// Second-stage relevance scoring over retrieved chunks. Returns the
/// indices of the `top_k` best chunks, best first.
#[async_trait]
pub trait RerankerProvider: Send + Sync {
    async fn rerank(
        &self,
        query: &str,
        chunks: &[String],
        top_k: usize,
    ) -> Result<Vec<usize>, ProviderError>;
}

#[async_trait]
pub trait WebSearchProvider: Send + Sync {
    async fn search(
        &self,
        query: &str,
        max_results: usize,
    ) -> Result<Vec<WebSearchResult>, ProviderError>;
}

/// Email delivery boundary. The default development implementation logs
/// the code instead of sending it and tells the handler to echo it back.
#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send_verification_code(&self, to: &str, code: &str) -> Result<(), ProviderError>;

    fn reveals_dev_code(&self) -> bool {
        false
    }
}
