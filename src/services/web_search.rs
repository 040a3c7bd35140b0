use std::fmt::Write as _;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::services::providers::{WebSearchProvider, WebSearchResult};
use crate::utils::error::{ProviderError, ProviderErrorKind};

const SEARCH_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct SearchResponse {
    results: Vec<WebSearchResult>,
}

/// Web search over an HTTP JSON endpoint: query text in, a list of
/// `{title, snippet, url}` out. A failed search degrades the chat answer
/// instead of failing it, so callers treat errors as an empty result.
pub struct HttpWebSearch {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpWebSearch {
    pub fn new(endpoint: &str, api_key: Option<String>) -> Self {
        Self {
            client: Client::builder()
                .timeout(SEARCH_TIMEOUT)
                .build()
                .unwrap_or_else(|_| Client::new()),
            endpoint: endpoint.to_string(),
            api_key,
        }
    }
}

#[async_trait]
impl WebSearchProvider for HttpWebSearch {
    async fn search(
        &self,
        query: &str,
        max_results: usize,
    ) -> Result<Vec<WebSearchResult>, ProviderError> {
        let mut request = self
            .client
            .get(&self.endpoint)
            .query(&[("q", query), ("max_results", &max_results.to_string())]);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ProviderError::from_transport(&e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), "Web search failed");
            return Err(ProviderError::from_status(status, &body));
        }

        let parsed: SearchResponse = response.json().await.map_err(|_| {
            ProviderError::new(
                ProviderErrorKind::BadResponse,
                "Unsupported web search response format",
            )
        })?;

        let mut results = parsed.results;
        results.truncate(max_results);
        debug!(query, count = results.len(), "Web search complete");
        Ok(results)
    }
}

/// Render search results as a context block for the LLM.
pub fn format_search_results(results: &[WebSearchResult]) -> String {
    if results.is_empty() {
        return "No search results found.".to_string();
    }

    let mut formatted = String::from("Web Search Results:\n\n");
    for (i, result) in results.iter().enumerate() {
        let _ = write!(
            formatted,
            "{}. {}\n   {}\n   Source: {}\n\n",
            i + 1,
            result.title,
            result.snippet,
            result.url
        );
    }
    formatted
}
