use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::services::providers::RerankerProvider;
use crate::utils::error::{ProviderError, ProviderErrorKind};

const RERANK_TIMEOUT: Duration = Duration::from_secs(30);
/// Hard ceiling on reranker initialization. Exceeding it permanently
/// downgrades the user to no-rerank for the process lifetime.
pub const RERANKER_INIT_CEILING: Duration = Duration::from_secs(15);

#[derive(Debug, Serialize)]
struct RerankRequest<'a> {
    query: &'a str,
    documents: &'a [String],
    top_n: usize,
}

#[derive(Debug, Deserialize)]
struct RerankResponse {
    results: Vec<RerankResult>,
}

#[derive(Debug, Deserialize)]
struct RerankResult {
    index: usize,
    relevance_score: f32,
}

/// Remote cross-encoder reranker over a `/v1/rerank` endpoint.
pub struct HttpReranker {
    client: Client,
    base_url: String,
    api_key: String,
}

impl HttpReranker {
    /// Probe the endpoint and build the client, bounded by the init
    /// ceiling. A `None` means the caller should run without reranking.
    pub async fn initialize(api_key: &str, base_url: &str) -> Option<Self> {
        let reranker = Self {
            client: Client::builder()
                .timeout(RERANK_TIMEOUT)
                .build()
                .unwrap_or_else(|_| Client::new()),
            base_url: normalize_base_url(base_url),
            api_key: api_key.to_string(),
        };

        let probe_texts = ["ping".to_string()];
        let probe = reranker.rerank("ping", &probe_texts, 1);
        match tokio::time::timeout(RERANKER_INIT_CEILING, probe).await {
            Ok(Ok(_)) => {
                info!("Reranker initialized");
                Some(reranker)
            }
            Ok(Err(e)) => {
                warn!(kind = ?e.kind, "Reranker probe failed, continuing without rerank");
                None
            }
            Err(_) => {
                warn!(
                    ceiling_s = RERANKER_INIT_CEILING.as_secs(),
                    "Reranker init exceeded ceiling, permanently downgrading to no-rerank"
                );
                None
            }
        }
    }
}

#[async_trait]
impl RerankerProvider for HttpReranker {
    async fn rerank(
        &self,
        query: &str,
        chunks: &[String],
        top_k: usize,
    ) -> Result<Vec<usize>, ProviderError> {
        if chunks.is_empty() {
            return Ok(Vec::new());
        }

        let url = format!("{}/rerank", self.base_url);
        let request = RerankRequest {
            query,
            documents: chunks,
            top_n: top_k.min(chunks.len()),
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
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status, &body));
        }

        let parsed: RerankResponse = response.json().await.map_err(|_| {
            ProviderError::new(
                ProviderErrorKind::BadResponse,
                "Unsupported rerank response format",
            )
        })?;

        let mut scored: Vec<(usize, f32)> = parsed
            .results
            .into_iter()
            .filter(|r| r.index < chunks.len())
            .map(|r| (r.index, r.relevance_score))
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(top_k);

        debug!(candidates = chunks.len(), kept = scored.len(), "Rerank complete");
        Ok(scored.into_iter().map(|(i, _)| i).collect())
    }
}

fn normalize_base_url(base_url: &str) -> String {
    let base = base_url.trim_end_matches('/');
    if base.ends_with("/v1") {
        base.to_string()
    } else {
        format!("{}/v1", base)
    }
}
