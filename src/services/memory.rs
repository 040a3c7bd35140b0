use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;
use sqlx::Row;
use tracing::{debug, info};

use crate::vector::math::{cosine_similarity, pack_embedding, unpack_embedding};
use crate::vector::VectorStore;

/// Only this many of the user's most recent memories are scanned per
/// recall; older material ages out of relevance.
const RECALL_CANDIDATE_LIMIT: i64 = 500;

#[derive(Debug, Clone, Serialize)]
pub struct RecalledMemory {
    pub memory_id: i64,
    pub conversation_id: i64,
    pub question: String,
    pub answer: String,
    pub similarity: f32,
    pub weighted_similarity: f32,
    pub importance: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct MemoryStats {
    pub total_memories: i64,
    pub average_importance: f64,
}

/// Cross-conversation QA recall, scoped to one tenant's store. Each
/// completed exchange is scored for importance; recall ranks by
/// similarity x importance so trivia loses to substance.
pub struct LongTermMemory {
    store: Arc<VectorStore>,
}

impl LongTermMemory {
    pub async fn attach(store: Arc<VectorStore>) -> Result<Self> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS conversation_memory (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                conversation_id INTEGER NOT NULL,
                question TEXT NOT NULL,
                answer TEXT NOT NULL,
                question_embedding BLOB NOT NULL,
                answer_embedding BLOB NOT NULL,
                importance_score REAL NOT NULL DEFAULT 1.0,
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )"#,
        )
        .execute(store.pool())
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_memory_user_created \
             ON conversation_memory(user_id, created_at DESC)",
        )
        .execute(store.pool())
        .await?;

        Ok(Self { store })
    }

    pub async fn add_memory(
        &self,
        user_id: i64,
        conversation_id: i64,
        question: &str,
        answer: &str,
        question_embedding: &[f32],
        answer_embedding: &[f32],
        importance: f32,
    ) -> Result<i64> {
        let id: i64 = sqlx::query(
            r#"INSERT INTO conversation_memory
               (user_id, conversation_id, question, answer,
                question_embedding, answer_embedding, importance_score)
               VALUES (?, ?, ?, ?, ?, ?, ?)
               RETURNING id"#,
        )
        .bind(user_id)
        .bind(conversation_id)
        .bind(question)
        .bind(answer)
        .bind(pack_embedding(question_embedding))
        .bind(pack_embedding(answer_embedding))
        .bind(importance.clamp(0.1, 1.0))
        .fetch_one(self.store.pool())
        .await?
        .get(0);

        info!(memory_id = id, user_id, conversation_id, "Memory stored");
        Ok(id)
    }

    /// Recall memories similar to the query, excluding the current
    /// conversation so a chat never recalls itself.
    pub async fn recall(
        &self,
        user_id: i64,
        query_embedding: &[f32],
        top_k: usize,
        min_similarity: f32,
        exclude_conversation: Option<i64>,
    ) -> Result<Vec<RecalledMemory>> {
        let rows = match exclude_conversation {
            Some(excluded) => {
                sqlx::query(
                    "SELECT id, conversation_id, question, answer, question_embedding, \
                            importance_score \
                     FROM conversation_memory \
                     WHERE user_id = ? AND conversation_id != ? \
                     ORDER BY created_at DESC LIMIT ?",
                )
                .bind(user_id)
                .bind(excluded)
                .bind(RECALL_CANDIDATE_LIMIT)
                .fetch_all(self.store.pool())
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT id, conversation_id, question, answer, question_embedding, \
                            importance_score \
                     FROM conversation_memory \
                     WHERE user_id = ? \
                     ORDER BY created_at DESC LIMIT ?",
                )
                .bind(user_id)
                .bind(RECALL_CANDIDATE_LIMIT)
                .fetch_all(self.store.pool())
                .await?
            }
        };

        let mut recalled: Vec<RecalledMemory> = rows
            .iter()
            .filter_map(|row| {
                let embedding = unpack_embedding(row.get::<&[u8], _>(4));
                let importance: f32 = row.get(5);
                let similarity = cosine_similarity(&embedding, query_embedding);
                let weighted = similarity * importance;
                (weighted >= min_similarity).then(|| RecalledMemory {
                    memory_id: row.get(0),
                    conversation_id: row.get(1),
                    question: row.get(2),
                    answer: row.get(3),
                    similarity,
                    weighted_similarity: weighted,
                    importance,
                })
            })
            .collect();

        recalled.sort_by(|a, b| {
            b.weighted_similarity
                .partial_cmp(&a.weighted_similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        recalled.truncate(top_k);

        debug!(
            user_id,
            candidates = rows.len(),
            recalled = recalled.len(),
            "Memory recall"
        );
        Ok(recalled)
    }

    pub async fn stats(&self, user_id: i64) -> Result<MemoryStats> {
        let row = sqlx::query(
            "SELECT COUNT(*), COALESCE(AVG(importance_score), 0) \
             FROM conversation_memory WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_one(self.store.pool())
        .await?;

        Ok(MemoryStats {
            total_memories: row.get(0),
            average_importance: row.get(1),
        })
    }
}

/// Importance heuristics: longer answers carry more knowledge, how/why
/// questions matter more, explicit feedback dominates both.
pub fn calculate_importance(question: &str, answer: &str, user_feedback: Option<&str>) -> f32 {
    let mut score = 0.5f32;

    let answer_length = answer.chars().count();
    if answer_length > 500 {
        score += 0.2;
    } else if answer_length > 200 {
        score += 0.1;
    }

    const TOPIC_KEYWORDS: &[&str] = &[
        "如何", "how to", "步骤", "step", "教程", "tutorial", "错误", "error", "问题", "problem",
        "解决", "solve", "为什么", "why", "原因", "reason", "原理", "principle",
    ];
    let question_lower = question.to_lowercase();
    if TOPIC_KEYWORDS.iter().any(|kw| question_lower.contains(kw)) {
        score += 0.15;
    }

    match user_feedback {
        Some("positive") => score += 0.2,
        Some("negative") => score -= 0.3,
        _ => {}
    }

    score.clamp(0.1, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn embedding(direction: f32) -> Vec<f32> {
        vec![direction.cos(), direction.sin()]
    }

    async fn memory() -> LongTermMemory {
        let store = Arc::new(VectorStore::open_in_memory().await.unwrap());
        LongTermMemory::attach(store).await.unwrap()
    }

    #[tokio::test]
    async fn recall_ranks_by_weighted_similarity() {
        let memory = memory().await;
        let query = embedding(0.0);

        // Same similarity, different importance: importance decides.
        memory
            .add_memory(1, 10, "trivial q", "short", &query, &query, 0.3)
            .await
            .unwrap();
        memory
            .add_memory(1, 11, "important q", "detailed answer", &query, &query, 1.0)
            .await
            .unwrap();

        let recalled = memory.recall(1, &query, 2, 0.2, None).await.unwrap();
        assert_eq!(recalled.len(), 2);
        assert_eq!(recalled[0].question, "important q");
        assert!(recalled[0].weighted_similarity > recalled[1].weighted_similarity);
    }

    #[tokio::test]
    async fn recall_is_user_scoped_and_excludes_conversation() {
        let memory = memory().await;
        let query = embedding(0.0);

        memory
            .add_memory(1, 10, "mine", "a", &query, &query, 1.0)
            .await
            .unwrap();
        memory
            .add_memory(2, 10, "other user", "a", &query, &query, 1.0)
            .await
            .unwrap();
        memory
            .add_memory(1, 99, "current conversation", "a", &query, &query, 1.0)
            .await
            .unwrap();

        let recalled = memory.recall(1, &query, 10, 0.5, Some(99)).await.unwrap();
        assert_eq!(recalled.len(), 1);
        assert_eq!(recalled[0].question, "mine");
    }

    #[tokio::test]
    async fn low_similarity_is_filtered() {
        let memory = memory().await;
        memory
            .add_memory(1, 10, "q", "a", &embedding(1.5), &embedding(1.5), 1.0)
            .await
            .unwrap();

        let recalled = memory.recall(1, &embedding(0.0), 10, 0.7, None).await.unwrap();
        assert!(recalled.is_empty());
    }

    #[test]
    fn importance_heuristics() {
        // Base score for an unremarkable exchange.
        let score = calculate_importance("hello", "hi", None);
        assert!((score - 0.5).abs() < 1e-6);

        // Long answer to a how-question.
        let long_answer = "x".repeat(600);
        let score = calculate_importance("how to deploy", &long_answer, None);
        assert!((score - 0.85).abs() < 1e-6);

        // Negative feedback floors near the minimum.
        let score = calculate_importance("hello", "hi", Some("negative"));
        assert!((score - 0.2).abs() < 1e-6);

        // Bounds hold.
        let score = calculate_importance("how to solve error", &long_answer, Some("positive"));
        assert!(score <= 1.0);
    }

    #[tokio::test]
    async fn stats_aggregate() {
        let memory = memory().await;
        let e = embedding(0.0);
        memory.add_memory(1, 10, "q1", "a1", &e, &e, 0.4).await.unwrap();
        memory.add_memory(1, 11, "q2", "a2", &e, &e, 0.8).await.unwrap();

        let stats = memory.stats(1).await.unwrap();
        assert_eq!(stats.total_memories, 2);
        assert!((stats.average_importance - 0.6).abs() < 1e-6);
    }
}
