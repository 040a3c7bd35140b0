use std::sync::Arc;

use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::cache::SemanticCache;
use crate::config::RagConfig;
use crate::database::{Repository, User};
use crate::services::memory::{calculate_importance, LongTermMemory};
use crate::services::providers::{ChatMessage, WebSearchProvider};
use crate::services::session_validator::SessionValidator;
use crate::services::web_search::format_search_results;
use crate::store::{AppStore, UserConfig};
use crate::utils::error::ApiError;
use crate::utils::limiters::Limiters;
use crate::utils::rate_limit::RateLimiter;
use crate::utils::retry::{retry_provider_call, RetryPolicy};
use crate::vector::VectorStoreManager;

const VECTOR_SEARCH_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(15);

const ANSWER_MAX_TOKENS: usize = 1024;
const ANSWER_TEMPERATURE: f32 = 0.7;
const WEB_SEARCH_RESULTS: usize = 3;
const MEMORY_RECALL_TOP_K: usize = 3;
const MEMORY_RECALL_MIN_SIM: f32 = 0.7;

/// Queries about the present need fresh information the corpus cannot
/// hold. Latin and Chinese forms.
const REAL_TIME_KEYWORDS: &[&str] = &[
    "今天", "今日", "现在", "当前", "最新", "天气", "新闻", "today", "now", "current", "latest",
    "weather", "news", "实时", "real-time", "昨天", "yesterday", "明天", "tomorrow",
];

/// The merged context is presented as anonymous reference material; the
/// model must not narrate where its answer came from.
const DEFAULT_SYSTEM_PROMPT: &str = "\
You are a professional AI assistant. Read any reference information silently and answer as if \
from your own knowledge.

Rules:
- Never mention contexts, documents, sources, reference material, or the answering process.
- Never enumerate or cite sources (no \"Context 1\", no \"according to the document\").
- Start with a direct answer to the question, then supporting detail.
- Use Markdown structure (### headings, **bold**, lists, code blocks) where it helps.
- Write like a confident expert colleague, not like a system processing inputs.";

const TITLE_PROMPT: &str = "\
Generate a concise title (at most 6 words, no quotes, no punctuation at the end) for a \
conversation that begins with the following message. Reply with the title only.";

const SUGGESTIONS_PROMPT: &str = "\
Given the question and answer below, suggest exactly 3 short follow-up questions the user \
might ask next. Reply with one question per line, no numbering.";

#[derive(Debug, Clone, Serialize)]
pub struct ChatOutcome {
    pub response: String,
    pub conversation_id: i64,
    pub suggested_questions: Vec<String>,
    pub from_cache: bool,
}

/// End-to-end answer pipeline: rate limit, session validation, semantic
/// cache probe, conversation-scoped retrieval, optional rerank and web
/// search, LLM generation, atomic persistence, cache population.
pub struct ChatService {
    repository: Arc<Repository>,
    validator: Arc<SessionValidator>,
    vector_stores: Arc<VectorStoreManager>,
    app_store: Arc<AppStore>,
    semantic_cache: Arc<SemanticCache>,
    rate_limiter: Arc<RateLimiter>,
    web_search: Option<Arc<dyn WebSearchProvider>>,
    limiters: Option<Arc<Limiters>>,
    rag: RagConfig,
    retry: RetryPolicy,
}

impl ChatService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        repository: Arc<Repository>,
        validator: Arc<SessionValidator>,
        vector_stores: Arc<VectorStoreManager>,
        app_store: Arc<AppStore>,
        semantic_cache: Arc<SemanticCache>,
        rate_limiter: Arc<RateLimiter>,
        web_search: Option<Arc<dyn WebSearchProvider>>,
        limiters: Option<Arc<Limiters>>,
        rag: RagConfig,
    ) -> Self {
        Self {
            repository,
            validator,
            vector_stores,
            app_store,
            semantic_cache,
            rate_limiter,
            web_search,
            limiters,
            rag,
            retry: RetryPolicy::default(),
        }
    }

    pub async fn chat_message(
        &self,
        user: &User,
        conversation_id: Option<i64>,
        content: &str,
        system_prompt: Option<&str>,
    ) -> Result<ChatOutcome, ApiError> {
        if content.trim().is_empty() {
            return Err(ApiError::Validation("Message cannot be empty".into()));
        }

        if let Err(retry_after) = self.rate_limiter.check(&user.username, "chat", 1) {
            return Err(ApiError::RateLimited { retry_after });
        }

        let config = self
            .app_store
            .get_config(&user.username)
            .ok_or(ApiError::ConfigMissing)?;

        let (conversation_id, is_new_conversation) = match conversation_id {
            Some(id) => {
                self.validator.validate_access(id, user.id, true).await?;
                (id, false)
            }
            None => {
                let conversation = self
                    .repository
                    .create_conversation(user.id, &fallback_title(content))
                    .await
                    .map_err(ApiError::from)?;
                (conversation.id, true)
            }
        };

        let query_embedding = {
            let embedder = config.embedder.clone();
            let query = content.to_string();
            retry_provider_call(self.retry, "embed_query", move || {
                let embedder = embedder.clone();
                let query = query.clone();
                async move { embedder.embed_one(&query).await }
            })
            .await
            .map_err(ApiError::Provider)?
        };

        // Cache hit short-circuits retrieval and generation; the exchange
        // still lands in the conversation history.
        if let Some(hit) = self.semantic_cache.get(&query_embedding, content) {
            info!(
                conversation_id,
                similarity = hit.similarity,
                "Answering from semantic cache"
            );
            self.repository
                .append_exchange(conversation_id, user.id, content, &hit.answer)
                .await
                .map_err(ApiError::from)?;
            return Ok(ChatOutcome {
                response: hit.answer,
                conversation_id,
                suggested_questions: Vec::new(),
                from_cache: true,
            });
        }

        let chunks = self
            .retrieve_chunks(user, conversation_id, content, &query_embedding, &config)
            .await?;

        let mut contexts: Vec<String> = chunks;

        if self.web_search_needed(content, &contexts) {
            if let Some(results) = self.run_web_search(content).await {
                contexts.insert(0, format_search_results(&results));
            }
        }

        if self.rag.memory_enabled {
            if let Some(block) = self
                .recall_memories(user, conversation_id, &query_embedding)
                .await
            {
                contexts.push(block);
            }
        }

        let answer = self
            .generate_answer(&config, content, &contexts, system_prompt)
            .await?;

        self.repository
            .append_exchange(conversation_id, user.id, content, &answer)
            .await
            .map_err(ApiError::from)?;

        self.semantic_cache.set(
            query_embedding.clone(),
            content,
            &answer,
            json!({ "conversation_id": conversation_id, "model": config.model }),
        );

        if self.rag.memory_enabled {
            self.store_memory(user, conversation_id, content, &answer, &query_embedding)
                .await;
        }

        if is_new_conversation {
            self.generate_title(&config, user, conversation_id, content)
                .await;
        }

        let suggested_questions = self.generate_suggestions(&config, content, &answer).await;

        Ok(ChatOutcome {
            response: answer,
            conversation_id,
            suggested_questions,
            from_cache: false,
        })
    }

    /// Conversation-scoped vector search plus optional rerank, keeping
    /// the configured handful of best chunks.
    async fn retrieve_chunks(
        &self,
        user: &User,
        conversation_id: i64,
        query: &str,
        query_embedding: &[f32],
        config: &UserConfig,
    ) -> Result<Vec<String>, ApiError> {
        let has_documents = self
            .repository
            .has_documents(user.id, conversation_id)
            .await
            .map_err(ApiError::from)?;
        if !has_documents {
            debug!(conversation_id, "No documents in conversation, skipping retrieval");
            return Ok(Vec::new());
        }

        let index = self
            .vector_stores
            .index_for(&user.username)
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))?;

        let _permit = match &self.limiters {
            Some(limiters) => Some(
                Limiters::acquire_timed(
                    limiters.vector_search.clone(),
                    limiters.acquire_timeout,
                    "vector_search",
                )
                .await
                .map_err(|e| ApiError::Internal(e.to_string()))?,
            ),
            None => None,
        };

        let search = index.search(
            query_embedding,
            self.rag.retrieval_top_k,
            Some(conversation_id),
        );
        let scored = match tokio::time::timeout(VECTOR_SEARCH_TIMEOUT, search).await {
            Ok(Ok(scored)) => scored,
            Ok(Err(e)) => {
                warn!(conversation_id, "Vector search failed: {}", e);
                return Err(ApiError::Internal(e.to_string()));
            }
            Err(_) => {
                warn!(conversation_id, "Vector search timeout");
                return Err(ApiError::Internal("Search timeout".into()));
            }
        };

        let texts: Vec<String> = scored.into_iter().map(|c| c.chunk_text).collect();
        if texts.is_empty() {
            return Ok(texts);
        }

        let kept: Vec<String> = match &config.reranker {
            Some(reranker) => {
                match reranker.rerank(query, &texts, self.rag.rerank_keep).await {
                    Ok(order) => order
                        .into_iter()
                        .filter(|i| *i < texts.len())
                        .map(|i| texts[i].clone())
                        .collect(),
                    Err(e) => {
                        // Similarity order is already reasonable.
                        warn!(kind = ?e.kind, "Rerank failed, keeping similarity order");
                        texts.into_iter().take(self.rag.rerank_keep).collect()
                    }
                }
            }
            None => texts.into_iter().take(self.rag.rerank_keep).collect(),
        };

        debug!(conversation_id, kept = kept.len(), "Retrieval complete");
        Ok(kept)
    }

    fn web_search_needed(&self, query: &str, contexts: &[String]) -> bool {
        if !self.rag.web_search_enabled || self.web_search.is_none() {
            return false;
        }

        let query_lower = query.to_lowercase();
        if let Some(keyword) = REAL_TIME_KEYWORDS
            .iter()
            .find(|kw| query_lower.contains(*kw))
        {
            info!(keyword, "Real-time keyword detected, enabling web search");
            return true;
        }

        if contexts.iter().all(|c| c.trim().is_empty()) {
            info!("No document context available, enabling web search");
            return true;
        }

        false
    }

    /// A failed web search degrades the answer, it does not fail the chat.
    async fn run_web_search(&self, query: &str) -> Option<Vec<crate::services::providers::WebSearchResult>> {
        let web_search = self.web_search.as_ref()?;
        match web_search.search(query, WEB_SEARCH_RESULTS).await {
            Ok(results) if !results.is_empty() => Some(results),
            Ok(_) => None,
            Err(e) => {
                warn!(kind = ?e.kind, "Web search failed");
                None
            }
        }
    }

    async fn recall_memories(
        &self,
        user: &User,
        conversation_id: i64,
        query_embedding: &[f32],
    ) -> Option<String> {
        let store = self.vector_stores.store_for(&user.username).await.ok()?;
        let memory = LongTermMemory::attach(store).await.ok()?;
        let recalled = memory
            .recall(
                user.id,
                query_embedding,
                MEMORY_RECALL_TOP_K,
                MEMORY_RECALL_MIN_SIM,
                Some(conversation_id),
            )
            .await
            .ok()?;

        if recalled.is_empty() {
            return None;
        }

        let mut block = String::from("Previously discussed:\n\n");
        for memory in &recalled {
            block.push_str(&format!("Q: {}\nA: {}\n\n", memory.question, memory.answer));
        }
        Some(block)
    }

    async fn store_memory(
        &self,
        user: &User,
        conversation_id: i64,
        question: &str,
        answer: &str,
        question_embedding: &[f32],
    ) {
        let config = match self.app_store.get_config(&user.username) {
            Some(config) => config,
            None => return,
        };
        let Ok(store) = self.vector_stores.store_for(&user.username).await else {
            return;
        };
        let Ok(memory) = LongTermMemory::attach(store).await else {
            return;
        };

        let answer_embedding = match config.embedder.embed_one(answer).await {
            Ok(embedding) => embedding,
            Err(e) => {
                warn!(kind = ?e.kind, "Skipping memory store, answer embedding failed");
                return;
            }
        };

        let importance = calculate_importance(question, answer, None);
        if let Err(e) = memory
            .add_memory(
                user.id,
                conversation_id,
                question,
                answer,
                question_embedding,
                &answer_embedding,
                importance,
            )
            .await
        {
            warn!("Failed to store memory: {}", e);
        }
    }

    async fn generate_answer(
        &self,
        config: &UserConfig,
        query: &str,
        contexts: &[String],
        system_prompt: Option<&str>,
    ) -> Result<String, ApiError> {
        // One seamless block: separators would invite the model to
        // enumerate its sources.
        let context_text = contexts.join(" ");

        let messages = vec![
            ChatMessage::system(system_prompt.unwrap_or(DEFAULT_SYSTEM_PROMPT)),
            ChatMessage::user(format!(
                "Reference Information:\n\n{}\n\n---\n\nUser Question: {}",
                context_text, query
            )),
        ];

        let llm = config.llm.clone();
        let answer = retry_provider_call(self.retry, "llm_generate", move || {
            let llm = llm.clone();
            let messages = messages.clone();
            async move {
                llm.generate(&messages, ANSWER_MAX_TOKENS, ANSWER_TEMPERATURE)
                    .await
            }
        })
        .await
        .map_err(ApiError::Provider)?;

        if answer.trim().is_empty() {
            return Err(ApiError::Internal("Model returned an empty answer".into()));
        }
        Ok(answer)
    }

    /// First-turn title generation. Failures fall back to a truncation of
    /// the message; the chat answer is never blocked on this.
    async fn generate_title(
        &self,
        config: &UserConfig,
        user: &User,
        conversation_id: i64,
        content: &str,
    ) {
        let messages = vec![
            ChatMessage::system(TITLE_PROMPT),
            ChatMessage::user(content.to_string()),
        ];

        let llm = config.llm.clone();
        let title = retry_provider_call(self.retry, "llm_title", move || {
            let llm = llm.clone();
            let messages = messages.clone();
            async move { llm.generate(&messages, 32, 0.3).await }
        })
        .await
        .map(|t| t.trim().trim_matches('"').to_string())
        .unwrap_or_default();

        let title = if title.is_empty() {
            fallback_title(content)
        } else {
            title
        };

        if let Err(e) = self
            .repository
            .update_conversation_title(conversation_id, user.id, &title)
            .await
        {
            warn!(conversation_id, "Failed to set conversation title: {}", e);
        }
    }

    /// Three follow-up suggestions; empty on any failure.
    async fn generate_suggestions(
        &self,
        config: &UserConfig,
        question: &str,
        answer: &str,
    ) -> Vec<String> {
        let messages = vec![
            ChatMessage::system(SUGGESTIONS_PROMPT),
            ChatMessage::user(format!("Question: {}\n\nAnswer: {}", question, answer)),
        ];

        let llm = config.llm.clone();
        let raw = retry_provider_call(self.retry, "llm_suggestions", move || {
            let llm = llm.clone();
            let messages = messages.clone();
            async move { llm.generate(&messages, 200, 0.8).await }
        })
        .await;

        match raw {
            Ok(text) => parse_suggestions(&text),
            Err(e) => {
                warn!(kind = ?e.kind, "Suggestion generation failed");
                Vec::new()
            }
        }
    }
}

fn fallback_title(content: &str) -> String {
    let title: String = content.trim().chars().take(30).collect();
    if title.is_empty() {
        "New Conversation".to_string()
    } else {
        title
    }
}

fn parse_suggestions(text: &str) -> Vec<String> {
    text.lines()
        .map(|line| {
            line.trim()
                .trim_start_matches(|c: char| c.is_ascii_digit() || c == '.' || c == ')' )
                .trim_start_matches(['-', '*', '•'])
                .trim()
                .to_string()
        })
        .filter(|line| !line.is_empty())
        .take(3)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suggestions_are_cleaned_and_capped() {
        let text = "1. First question?\n2) Second question?\n- Third question?\nFourth?";
        let parsed = parse_suggestions(text);
        assert_eq!(
            parsed,
            vec!["First question?", "Second question?", "Third question?"]
        );
    }

    #[test]
    fn fallback_title_truncates() {
        assert_eq!(fallback_title("  hi  "), "hi");
        let long = "x".repeat(100);
        assert_eq!(fallback_title(&long).chars().count(), 30);
        assert_eq!(fallback_title("   "), "New Conversation");
    }
}
