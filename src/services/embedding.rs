use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::services::providers::EmbeddingProvider;
use crate::utils::error::{ProviderError, ProviderErrorKind};
use crate::utils::limiters::Limiters;

const EMBEDDING_TIMEOUT: Duration = Duration::from_secs(60);
const CACHE_CAPACITY: usize = 200;

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    input: &'a [String],
    model: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

/// Content-hash keyed LRU for embeddings. Capacity is small on purpose:
/// the hot set is query text repeated across a conversation, not corpora.
struct EmbeddingCache {
    map: HashMap<String, Vec<f32>>,
    order: Vec<String>,
    capacity: usize,
}

impl EmbeddingCache {
    fn new(capacity: usize) -> Self {
        Self {
            map: HashMap::new(),
            order: Vec::new(),
            capacity: capacity.max(1),
        }
    }

    fn get(&mut self, key: &str) -> Option<Vec<f32>> {
        if let Some(value) = self.map.get(key).cloned() {
            self.order.retain(|k| k != key);
            self.order.push(key.to_string());
            Some(value)
        } else {
            None
        }
    }

    fn put(&mut self, key: String, value: Vec<f32>) {
        if !self.map.contains_key(&key) && self.map.len() >= self.capacity {
            if let Some(oldest) = self.order.first().cloned() {
                self.map.remove(&oldest);
                self.order.remove(0);
            }
        }
        self.order.retain(|k| k != &key);
        self.order.push(key.clone());
        self.map.insert(key, value);
    }
}

/// Remote embedder over any OpenAI-compatible `/v1/embeddings` endpoint,
/// fronted by the LRU cache. Cache misses for one call are batched into a
/// single request; results return in input order.
pub struct HttpEmbedder {
    client: Client,
    base_url: String,
    model: String,
    api_key: String,
    cache: Mutex<EmbeddingCache>,
    limiters: Option<Arc<Limiters>>,
}

impl HttpEmbedder {
    pub fn new(api_key: &str, base_url: &str, model: &str, limiters: Option<Arc<Limiters>>) -> Self {
        Self {
            client: Client::builder()
                .timeout(EMBEDDING_TIMEOUT)
                .build()
                .unwrap_or_else(|_| Client::new()),
            base_url: normalize_base_url(base_url),
            model: model.to_string(),
            api_key: api_key.to_string(),
            cache: Mutex::new(EmbeddingCache::new(CACHE_CAPACITY)),
            limiters,
        }
    }

    async fn embed_remote(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        let _permit = match &self.limiters {
            Some(limiters) => Some(
                Limiters::acquire_timed(
                    limiters.embedding.clone(),
                    limiters.acquire_timeout,
                    "embedding",
                )
                .await
                .map_err(|e| ProviderError::new(ProviderErrorKind::Saturated, e.to_string()))?,
            ),
            None => None,
        };

        let exec_start = Instant::now();
        let url = format!("{}/embeddings", self.base_url);
        let request = EmbeddingRequest {
            input: texts,
            model: &self.model,
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
            batch = texts.len(),
            "Embedding request complete"
        );

        if !status.is_success() {
            return Err(ProviderError::from_status(status, truncate(&body, 200)));
        }

        parse_embedding_body(&body, texts.len())
    }
}

/// The strict OpenAI shape first; two known non-standard shapes accepted
/// as fallbacks; anything else is a BadResponse.
fn parse_embedding_body(body: &str, expected: usize) -> Result<Vec<Vec<f32>>, ProviderError> {
    if let Ok(parsed) = serde_json::from_str::<EmbeddingResponse>(body) {
        let embeddings: Vec<Vec<f32>> = parsed.data.into_iter().map(|d| d.embedding).collect();
        return validate_batch(embeddings, expected);
    }

    let value: Value = serde_json::from_str(body).map_err(|_| {
        ProviderError::new(
            ProviderErrorKind::BadResponse,
            format!("Non-JSON embedding response: {}", truncate(body, 200)),
        )
    })?;

    let candidate = if value.is_array() {
        Some(value.clone())
    } else {
        value.get("embeddings").cloned()
    };

    match candidate.and_then(|v| serde_json::from_value::<Vec<Vec<f32>>>(v).ok()) {
        Some(embeddings) => validate_batch(embeddings, expected),
        None => Err(ProviderError::new(
            ProviderErrorKind::BadResponse,
            "Unsupported embedding response format",
        )),
    }
}

fn validate_batch(
    embeddings: Vec<Vec<f32>>,
    expected: usize,
) -> Result<Vec<Vec<f32>>, ProviderError> {
    if embeddings.len() != expected || embeddings.iter().any(|e| e.is_empty()) {
        return Err(ProviderError::new(
            ProviderErrorKind::BadResponse,
            format!(
                "Expected {} non-empty embeddings, got {}",
                expected,
                embeddings.len()
            ),
        ));
    }
    Ok(embeddings)
}

#[async_trait]
impl EmbeddingProvider for HttpEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let keys: Vec<String> = texts.iter().map(|t| fingerprint(t)).collect();

        let mut results: Vec<Option<Vec<f32>>> = vec![None; texts.len()];
        let mut miss_indices = Vec::new();
        {
            let mut cache = self.cache.lock();
            for (i, key) in keys.iter().enumerate() {
                match cache.get(key) {
                    Some(hit) => results[i] = Some(hit),
                    None => miss_indices.push(i),
                }
            }
        }

        if !miss_indices.is_empty() {
            debug!(
                hits = texts.len() - miss_indices.len(),
                misses = miss_indices.len(),
                "Embedding cache lookup"
            );
            let miss_texts: Vec<String> =
                miss_indices.iter().map(|&i| texts[i].clone()).collect();
            let embeddings = self.embed_remote(&miss_texts).await?;

            let mut cache = self.cache.lock();
            for (&i, embedding) in miss_indices.iter().zip(embeddings.into_iter()) {
                cache.put(keys[i].clone(), embedding.clone());
                results[i] = Some(embedding);
            }
        }

        Ok(results.into_iter().map(|r| r.unwrap_or_default()).collect())
    }
}

fn fingerprint(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

/// Accept base URLs with or without the `/v1` suffix.
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
    fn base_url_normalization() {
        assert_eq!(normalize_base_url("https://p.example"), "https://p.example/v1");
        assert_eq!(normalize_base_url("https://p.example/"), "https://p.example/v1");
        assert_eq!(normalize_base_url("https://p.example/v1"), "https://p.example/v1");
    }

    #[test]
    fn parse_openai_shape() {
        let body = r#"{"data":[{"embedding":[0.1,0.2]},{"embedding":[0.3,0.4]}]}"#;
        let parsed = parse_embedding_body(body, 2).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[1], vec![0.3, 0.4]);
    }

    #[test]
    fn parse_bare_list_shape() {
        let body = r#"[[0.1,0.2],[0.3,0.4]]"#;
        assert_eq!(parse_embedding_body(body, 2).unwrap().len(), 2);
    }

    #[test]
    fn parse_embeddings_key_shape() {
        let body = r#"{"embeddings":[[1.0,0.0]]}"#;
        assert_eq!(parse_embedding_body(body, 1).unwrap().len(), 1);
    }

    #[test]
    fn unknown_shape_is_bad_response() {
        let err = parse_embedding_body(r#"{"weird":true}"#, 1).unwrap_err();
        assert_eq!(err.kind, ProviderErrorKind::BadResponse);
    }

    #[test]
    fn non_json_is_bad_response() {
        let err = parse_embedding_body("<html>oops</html>", 1).unwrap_err();
        assert_eq!(err.kind, ProviderErrorKind::BadResponse);
    }

    #[test]
    fn count_mismatch_is_bad_response() {
        let body = r#"{"data":[{"embedding":[0.1]}]}"#;
        assert!(parse_embedding_body(body, 2).is_err());
    }

    #[test]
    fn lru_cache_evicts_oldest() {
        let mut cache = EmbeddingCache::new(2);
        cache.put("a".into(), vec![1.0]);
        cache.put("b".into(), vec![2.0]);
        cache.get("a");
        cache.put("c".into(), vec![3.0]);

        assert!(cache.get("a").is_some());
        assert!(cache.get("b").is_none());
        assert!(cache.get("c").is_some());
    }
}
