use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::services::providers::{ChatMessage, LlmProvider};
use crate::utils::error::{ProviderError, ProviderErrorKind};
use crate::utils::limiters::Limiters;

const LLM_TIMEOUT: Duration = Duration::from_secs(120);
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    max_tokens: usize,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: String,
}

/// Chat-completion client over any OpenAI-compatible endpoint.
pub struct HttpLlmClient {
    client: Client,
    test_client: Client,
    base_url: String,
    model: String,
    api_key: String,
    limiters: Option<Arc<Limiters>>,
}

impl HttpLlmClient {
    pub fn new(api_key: &str, base_url: &str, model: &str, limiters: Option<Arc<Limiters>>) -> Self {
        Self {
            client: Client::builder()
                .timeout(LLM_TIMEOUT)
                .build()
                .unwrap_or_else(|_| Client::new()),
            test_client: Client::builder()
                .timeout(TEST_TIMEOUT)
                .build()
                .unwrap_or_else(|_| Client::new()),
            base_url: normalize_base_url(base_url),
            model: model.to_string(),
            api_key: api_key.to_string(),
            limiters,
        }
    }
}

#[async_trait]
impl LlmProvider for HttpLlmClient {
    async fn generate(
        &self,
        messages: &[ChatMessage],
        max_tokens: usize,
        temperature: f32,
    ) -> Result<String, ProviderError> {
        let _permit = match &self.limiters {
            Some(limiters) => Some(
                Limiters::acquire_timed(limiters.llm.clone(), limiters.acquire_timeout, "llm")
                    .await
                    .map_err(|e| ProviderError::new(ProviderErrorKind::Saturated, e.to_string()))?,
            ),
            None => None,
        };

        let exec_start = Instant::now();
        let url = format!("{}/chat/completions", self.base_url);
        let request = ChatCompletionRequest {
            model: &self.model,
            messages,
            temperature,
            max_tokens,
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| ProviderError::from_transport(&e))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ProviderError::from_transport(&e))?;

        debug!(
            exec_ms = exec_start.elapsed().as_millis() as u64,
            status = status.as_u16(),
            "LLM request complete"
        );

        if !status.is_success() {
            return Err(ProviderError::from_status(status, truncate(&body, 200)));
        }

        parse_completion_body(&body)
    }

    async fn test_connection(&self) -> Result<(), ProviderError> {
        let url = format!("{}/models", self.base_url);
        let response = self
            .test_client
            .get(&url)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| ProviderError::from_transport(&e))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(ProviderError::from_status(status, truncate(&body, 200)))
        }
    }
}

/// Strict OpenAI shape, with a `{"content": ...}` fallback for
/// non-standard gateways. HTML bodies mean a proxy page, not an answer.
fn parse_completion_body(body: &str) -> Result<String, ProviderError> {
    let trimmed = body.trim_start();
    if trimmed.starts_with("<!DOCTYPE") || trimmed.starts_with("<html") {
        return Err(ProviderError::new(
            ProviderErrorKind::BadResponse,
            "Provider returned an HTML page instead of a completion",
        ));
    }

    if let Ok(parsed) = serde_json::from_str::<ChatCompletionResponse>(body) {
        if let Some(choice) = parsed.choices.into_iter().next() {
            return Ok(choice.message.content);
        }
    }

    let value: Value = serde_json::from_str(body).map_err(|_| {
        ProviderError::new(
            ProviderErrorKind::BadResponse,
            format!("Non-JSON completion response: {}", truncate(body, 200)),
        )
    })?;

    value
        .get("content")
        .and_then(|c| c.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| {
            ProviderError::new(
                ProviderErrorKind::BadResponse,
                "Unsupported completion response format",
            )
        })
}

fn normalize_base_url(base_url: &str) -> String {
    let base = base_url.trim_end_matches('/');
    if base.ends_with("/v1") {
        base.to_string()
    } else {
        format!("{}/v1", base)
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_standard_completion() {
        let body = r#"{"choices":[{"message":{"role":"assistant","content":"hello"}}]}"#;
        assert_eq!(parse_completion_body(body).unwrap(), "hello");
    }

    #[test]
    fn parse_content_fallback() {
        let body = r#"{"content":"direct"}"#;
        assert_eq!(parse_completion_body(body).unwrap(), "direct");
    }

    #[test]
    fn html_body_is_rejected() {
        let err = parse_completion_body("<!DOCTYPE html><html></html>").unwrap_err();
        assert_eq!(err.kind, ProviderErrorKind::BadResponse);
    }

    #[test]
    fn empty_choices_is_bad_response() {
        let err = parse_completion_body(r#"{"choices":[]}"#).unwrap_err();
        assert_eq!(err.kind, ProviderErrorKind::BadResponse);
    }
}
