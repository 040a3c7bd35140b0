use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::vector::math::cosine_similarity;

/// Estimated provider cost avoided per cache hit, in USD.
const COST_PER_CALL_USD: f64 = 0.005;

/// Vector-similarity QA cache.
///
/// A query whose embedding scores at or above the threshold against a
/// cached question is answered from the cache without touching retrieval
/// or the LLM. Empty answers are never stored.
pub struct SemanticCache {
    inner: Mutex<Inner>,
    capacity: usize,
    ttl: Duration,
}

struct Inner {
    entries: Vec<CacheEntry>,
    threshold: f32,
    hits: u64,
    misses: u64,
}

struct CacheEntry {
    question: String,
    answer: String,
    embedding: Vec<f32>,
    #[allow(dead_code)]
    metadata: Value,
    created_at: Instant,
}

#[derive(Debug, Clone)]
pub struct SemanticCacheHit {
    pub answer: String,
    pub similarity: f32,
    pub cached_question: String,
    pub response_time_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SemanticCacheStats {
    pub total_queries: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub hit_rate: f64,
    pub backend: &'static str,
    pub cache_size: usize,
    pub similarity_threshold: f32,
    pub estimated_usd_saved: f64,
}

impl SemanticCache {
    pub fn new(similarity_threshold: f32, ttl: Duration, capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: Vec::new(),
                threshold: similarity_threshold,
                hits: 0,
                misses: 0,
            }),
            capacity: capacity.max(1),
            ttl,
        }
    }

    /// Probe the cache with a query embedding. Returns the best entry at
    /// or above the threshold, or `None` on miss.
    pub fn get(&self, query_embedding: &[f32], query_text: &str) -> Option<SemanticCacheHit> {
        let start = Instant::now();
        let mut inner = self.inner.lock();
        let now = Instant::now();
        let ttl = self.ttl;

        let mut best_similarity = 0.0f32;
        let mut best: Option<usize> = None;

        for (i, entry) in inner.entries.iter().enumerate() {
            if now.duration_since(entry.created_at) > ttl {
                continue;
            }
            let similarity = cosine_similarity(&entry.embedding, query_embedding);
            if similarity > best_similarity {
                best_similarity = similarity;
                best = Some(i);
            }
        }

        if best_similarity >= inner.threshold {
            if let Some(i) = best {
                inner.hits += 1;
                let entry = &inner.entries[i];
                let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
                info!(
                    similarity = best_similarity,
                    question = %truncate(query_text, 50),
                    "Semantic cache HIT"
                );
                return Some(SemanticCacheHit {
                    answer: entry.answer.clone(),
                    similarity: best_similarity,
                    cached_question: entry.question.clone(),
                    response_time_ms: elapsed_ms,
                });
            }
        }

        inner.misses += 1;
        debug!(
            best_similarity,
            question = %truncate(query_text, 50),
            "Semantic cache MISS"
        );
        None
    }

    /// Store a QA pair. A blank answer is a no-op: the cache must never
    /// serve empty responses.
    pub fn set(&self, question_embedding: Vec<f32>, question: &str, answer: &str, metadata: Value) {
        if answer.trim().is_empty() {
            debug!("Refusing to cache empty answer");
            return;
        }

        let mut inner = self.inner.lock();
        let now = Instant::now();
        let ttl = self.ttl;

        // Drop expired entries, then make room by evicting the oldest 10%.
        inner
            .entries
            .retain(|e| now.duration_since(e.created_at) <= ttl);

        // Concurrent identical misses each produce an answer; the second
        // write replaces the first instead of duplicating the question.
        let threshold = inner.threshold;
        if let Some(existing) = inner
            .entries
            .iter_mut()
            .find(|e| cosine_similarity(&e.embedding, &question_embedding) >= threshold)
        {
            existing.question = question.to_string();
            existing.answer = answer.to_string();
            existing.embedding = question_embedding;
            existing.metadata = metadata;
            existing.created_at = now;
            debug!(question = %truncate(question, 50), "Replaced near-duplicate cache entry");
            return;
        }

        if inner.entries.len() >= self.capacity {
            let remove = (self.capacity / 10).max(1).min(inner.entries.len());
            inner.entries.drain(..remove);
        }

        inner.entries.push(CacheEntry {
            question: question.to_string(),
            answer: answer.to_string(),
            embedding: question_embedding,
            metadata,
            created_at: now,
        });
        info!(question = %truncate(question, 50), "Cached QA pair");
    }

    pub fn adjust_threshold(&self, new_threshold: f32) {
        let mut inner = self.inner.lock();
        let old = inner.threshold;
        inner.threshold = new_threshold.clamp(0.0, 1.0);
        info!(old, new = inner.threshold, "Adjusted similarity threshold");
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.hits = 0;
        inner.misses = 0;
        info!("Semantic cache cleared");
    }

    pub fn stats(&self) -> SemanticCacheStats {
        let inner = self.inner.lock();
        let total = inner.hits + inner.misses;
        let hit_rate = if total > 0 {
            inner.hits as f64 / total as f64 * 100.0
        } else {
            0.0
        };

        SemanticCacheStats {
            total_queries: total,
            cache_hits: inner.hits,
            cache_misses: inner.misses,
            hit_rate: (hit_rate * 100.0).round() / 100.0,
            backend: "memory",
            cache_size: inner.entries.len(),
            similarity_threshold: inner.threshold,
            estimated_usd_saved: inner.hits as f64 * COST_PER_CALL_USD,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> SemanticCache {
        SemanticCache::new(0.95, Duration::from_secs(3600), 10)
    }

    #[test]
    fn miss_on_empty_store() {
        let cache = cache();
        assert!(cache.get(&[1.0, 0.0], "anything").is_none());
        assert_eq!(cache.stats().cache_misses, 1);
    }

    #[test]
    fn identical_embedding_hits() {
        let cache = cache();
        cache.set(vec![1.0, 0.0], "how to configure", "set the option", Value::Null);

        let hit = cache.get(&[1.0, 0.0], "how do I configure").unwrap();
        assert_eq!(hit.answer, "set the option");
        assert_eq!(hit.cached_question, "how to configure");
        assert!(hit.similarity > 0.99);
    }

    #[test]
    fn dissimilar_embedding_misses() {
        let cache = cache();
        cache.set(vec![1.0, 0.0], "q", "a", Value::Null);
        assert!(cache.get(&[0.0, 1.0], "unrelated").is_none());
    }

    #[test]
    fn empty_answer_is_not_stored() {
        let cache = cache();
        cache.set(vec![1.0, 0.0], "q", "", Value::Null);
        cache.set(vec![1.0, 0.0], "q", "   ", Value::Null);
        assert!(cache.is_empty());
        assert!(cache.get(&[1.0, 0.0], "q").is_none());
    }

    #[test]
    fn ttl_expires_entries() {
        let cache = SemanticCache::new(0.95, Duration::from_millis(10), 10);
        cache.set(vec![1.0, 0.0], "q", "a", Value::Null);
        std::thread::sleep(Duration::from_millis(20));
        assert!(cache.get(&[1.0, 0.0], "q").is_none());
    }

    #[test]
    fn capacity_evicts_oldest_batch() {
        let cache = cache();
        for i in 0..10 {
            // Distinct directions so earlier entries cannot hit.
            let angle = i as f32 * 0.3;
            cache.set(vec![angle.cos(), angle.sin()], &format!("q{}", i), "a", Value::Null);
        }
        cache.set(vec![0.0, -1.0], "q-new", "a", Value::Null);
        assert!(cache.len() <= 10);
    }

    #[test]
    fn threshold_adjustment_changes_hit_behavior() {
        let cache = cache();
        cache.set(vec![1.0, 0.1], "q", "a", Value::Null);

        // Slightly rotated query: below 0.95 fails, drops after adjustment.
        let query = [1.0, 0.5];
        assert!(cache.get(&query, "q2").is_none());
        cache.adjust_threshold(0.8);
        assert!(cache.get(&query, "q2").is_some());
    }

    #[test]
    fn identical_questions_converge_to_one_entry() {
        let cache = cache();
        cache.set(vec![1.0, 0.0], "what is 2+2", "4", Value::Null);
        cache.set(vec![1.0, 0.0], "what is 2+2", "four", Value::Null);

        assert_eq!(cache.len(), 1);
        let hit = cache.get(&[1.0, 0.0], "what is 2+2").unwrap();
        assert_eq!(hit.answer, "four");
    }

    #[test]
    fn stats_report_savings() {
        let cache = cache();
        cache.set(vec![1.0, 0.0], "q", "a", Value::Null);
        cache.get(&[1.0, 0.0], "q");
        let stats = cache.stats();
        assert_eq!(stats.cache_hits, 1);
        assert!((stats.estimated_usd_saved - 0.005).abs() < 1e-9);
    }
}
