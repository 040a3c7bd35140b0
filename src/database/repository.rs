use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info};

use super::models::{Conversation, ConversationSummary, Message, User, UserDocument};
use super::DbPool;
use crate::cache::QueryCache;
use crate::utils::error::ApiError;

/// Cache TTLs for read-through queries. A brief stale read after an
/// uncached writer is tolerated; invalidation runs after every commit.
const USER_CACHE_TTL: Duration = Duration::from_secs(600);
const CONVERSATION_CACHE_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Username already taken")]
    UsernameTaken,

    #[error("Email already registered")]
    EmailTaken,

    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::UsernameTaken => ApiError::Validation("Username already taken".into()),
            StoreError::EmailTaken => ApiError::Validation("Email already registered".into()),
            StoreError::Sqlx(e) => e.into(),
        }
    }
}

type Result<T> = std::result::Result<T, StoreError>;

/// CRUD over the relational store, fronted by the query-result cache.
pub struct Repository {
    pool: DbPool,
    cache: Arc<QueryCache>,
}

impl Repository {
    pub fn new(pool: DbPool, cache: Arc<QueryCache>) -> Self {
        Self { pool, cache }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    // ===== Users =====

    pub async fn create_user(
        &self,
        username: &str,
        email: &str,
        hashed_password: &str,
    ) -> Result<User> {
        let result = sqlx::query_as::<_, User>(
            r#"INSERT INTO users (username, email, hashed_password)
               VALUES (?, ?, ?)
               RETURNING id, username, email, hashed_password, created_at, updated_at"#,
        )
        .bind(username)
        .bind(email)
        .bind(hashed_password)
        .fetch_one(self.pool.get_pool())
        .await;

        match result {
            Ok(user) => {
                info!(user_id = user.id, username, "User created");
                Ok(user)
            }
            Err(e) => Err(map_unique_violation(e)),
        }
    }

    pub async fn get_user_by_id(&self, id: i64) -> Result<Option<User>> {
        let key = format!("user:id:{}", id);
        if let Some(user) = self.cache.get::<User>(&key) {
            return Ok(Some(user));
        }

        let user = sqlx::query_as::<_, User>(
            "SELECT id, username, email, hashed_password, created_at, updated_at \
             FROM users WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(self.pool.get_pool())
        .await?;

        if let Some(ref user) = user {
            self.cache.set(&key, user, USER_CACHE_TTL);
        }
        Ok(user)
    }

    pub async fn get_user_by_username(&self, username: &str) -> Result<Option<User>> {
        let key = format!("user:name:{}", username);
        if let Some(user) = self.cache.get::<User>(&key) {
            return Ok(Some(user));
        }

        let user = sqlx::query_as::<_, User>(
            "SELECT id, username, email, hashed_password, created_at, updated_at \
             FROM users WHERE username = ?",
        )
        .bind(username)
        .fetch_optional(self.pool.get_pool())
        .await?;

        if let Some(ref user) = user {
            self.cache.set(&key, user, USER_CACHE_TTL);
        }
        Ok(user)
    }

    pub async fn get_user_by_email(&self, email: &str) -> Result<Option<User>> {
        let key = format!("user:email:{}", email);
        if let Some(user) = self.cache.get::<User>(&key) {
            return Ok(Some(user));
        }

        let user = sqlx::query_as::<_, User>(
            "SELECT id, username, email, hashed_password, created_at, updated_at \
             FROM users WHERE email = ?",
        )
        .bind(email)
        .fetch_optional(self.pool.get_pool())
        .await?;

        if let Some(ref user) = user {
            self.cache.set(&key, user, USER_CACHE_TTL);
        }
        Ok(user)
    }

    pub async fn email_exists(&self, email: &str) -> Result<bool> {
        Ok(self.get_user_by_email(email).await?.is_some())
    }

    pub async fn update_user_password(&self, email: &str, hashed_password: &str) -> Result<bool> {
        let user = self.get_user_by_email(email).await?;
        let affected = sqlx::query("UPDATE users SET hashed_password = ?, updated_at = CURRENT_TIMESTAMP WHERE email = ?")
            .bind(hashed_password)
            .bind(email)
            .execute(self.pool.get_pool())
            .await?
            .rows_affected();

        if let Some(user) = user {
            self.cache.delete(&format!("user:id:{}", user.id));
            self.cache.delete(&format!("user:name:{}", user.username));
            self.cache.delete(&format!("user:email:{}", user.email));
        }
        Ok(affected > 0)
    }

    // ===== Conversations =====

    pub async fn create_conversation(&self, user_id: i64, title: &str) -> Result<Conversation> {
        let conversation = sqlx::query_as::<_, Conversation>(
            r#"INSERT INTO conversations (user_id, title)
               VALUES (?, ?)
               RETURNING id, user_id, title, created_at, updated_at"#,
        )
        .bind(user_id)
        .bind(title)
        .fetch_one(self.pool.get_pool())
        .await?;

        self.cache.delete(&format!("conversations:{}", user_id));
        info!(
            conversation_id = conversation.id,
            user_id, "Conversation created"
        );
        Ok(conversation)
    }

    /// Load a conversation regardless of owner; the session validator
    /// performs the ownership check itself so it can report it distinctly.
    pub async fn get_conversation(&self, id: i64) -> Result<Option<Conversation>> {
        let key = format!("conversation:{}", id);
        if let Some(conversation) = self.cache.get::<Conversation>(&key) {
            return Ok(Some(conversation));
        }

        let conversation = sqlx::query_as::<_, Conversation>(
            "SELECT id, user_id, title, created_at, updated_at FROM conversations WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(self.pool.get_pool())
        .await?;

        if let Some(ref conversation) = conversation {
            self.cache.set(&key, conversation, CONVERSATION_CACHE_TTL);
        }
        Ok(conversation)
    }

    pub async fn get_user_conversations(&self, user_id: i64) -> Result<Vec<ConversationSummary>> {
        let key = format!("conversations:{}", user_id);
        if let Some(list) = self.cache.get::<Vec<ConversationSummary>>(&key) {
            return Ok(list);
        }

        let list = sqlx::query_as::<_, ConversationSummary>(
            r#"SELECT c.id, c.title, c.created_at, c.updated_at,
                      COUNT(m.id) AS message_count
               FROM conversations c
               LEFT JOIN messages m ON m.conversation_id = c.id
               WHERE c.user_id = ?
               GROUP BY c.id
               ORDER BY c.updated_at DESC"#,
        )
        .bind(user_id)
        .fetch_all(self.pool.get_pool())
        .await?;

        self.cache.set(&key, &list, CONVERSATION_CACHE_TTL);
        Ok(list)
    }

    pub async fn update_conversation_title(
        &self,
        id: i64,
        user_id: i64,
        title: &str,
    ) -> Result<bool> {
        let affected = sqlx::query(
            "UPDATE conversations SET title = ?, updated_at = CURRENT_TIMESTAMP \
             WHERE id = ? AND user_id = ?",
        )
        .bind(title)
        .bind(id)
        .bind(user_id)
        .execute(self.pool.get_pool())
        .await?
        .rows_affected();

        self.invalidate_conversation(id, user_id);
        Ok(affected > 0)
    }

    /// Delete a conversation; messages and document records cascade.
    pub async fn delete_conversation(&self, id: i64, user_id: i64) -> Result<bool> {
        let affected = sqlx::query("DELETE FROM conversations WHERE id = ? AND user_id = ?")
            .bind(id)
            .bind(user_id)
            .execute(self.pool.get_pool())
            .await?
            .rows_affected();

        self.invalidate_conversation(id, user_id);
        if affected > 0 {
            info!(conversation_id = id, user_id, "Conversation deleted");
        }
        Ok(affected > 0)
    }

    // ===== Messages =====

    /// Persist a user/assistant exchange atomically: two appends plus the
    /// conversation's `updated_at` bump share one transaction. Cache
    /// invalidation happens only after the commit.
    pub async fn append_exchange(
        &self,
        conversation_id: i64,
        user_id: i64,
        user_content: &str,
        assistant_content: &str,
    ) -> Result<(Message, Message)> {
        let mut tx = self.pool.get_pool().begin().await?;

        let user_msg = sqlx::query_as::<_, Message>(
            r#"INSERT INTO messages (conversation_id, role, content)
               VALUES (?, 'user', ?)
               RETURNING id, conversation_id, role, content, created_at"#,
        )
        .bind(conversation_id)
        .bind(user_content)
        .fetch_one(&mut *tx)
        .await?;

        let assistant_msg = sqlx::query_as::<_, Message>(
            r#"INSERT INTO messages (conversation_id, role, content)
               VALUES (?, 'assistant', ?)
               RETURNING id, conversation_id, role, content, created_at"#,
        )
        .bind(conversation_id)
        .bind(assistant_content)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query("UPDATE conversations SET updated_at = CURRENT_TIMESTAMP WHERE id = ?")
            .bind(conversation_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        self.invalidate_conversation(conversation_id, user_id);
        debug!(conversation_id, "Persisted chat exchange");
        Ok((user_msg, assistant_msg))
    }

    pub async fn get_conversation_messages(
        &self,
        conversation_id: i64,
        limit: Option<i64>,
    ) -> Result<Vec<Message>> {
        let messages = match limit {
            Some(limit) => {
                sqlx::query_as::<_, Message>(
                    "SELECT id, conversation_id, role, content, created_at FROM messages \
                     WHERE conversation_id = ? ORDER BY created_at ASC, id ASC LIMIT ?",
                )
                .bind(conversation_id)
                .bind(limit)
                .fetch_all(self.pool.get_pool())
                .await?
            }
            None => {
                sqlx::query_as::<_, Message>(
                    "SELECT id, conversation_id, role, content, created_at FROM messages \
                     WHERE conversation_id = ? ORDER BY created_at ASC, id ASC",
                )
                .bind(conversation_id)
                .fetch_all(self.pool.get_pool())
                .await?
            }
        };
        Ok(messages)
    }

    pub async fn count_messages(&self, conversation_id: i64) -> Result<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE conversation_id = ?")
                .bind(conversation_id)
                .fetch_one(self.pool.get_pool())
                .await?;
        Ok(count)
    }

    // ===== User documents =====

    pub async fn add_user_document(
        &self,
        user_id: i64,
        conversation_id: i64,
        filename: &str,
        file_path: &str,
    ) -> Result<UserDocument> {
        let document = sqlx::query_as::<_, UserDocument>(
            r#"INSERT INTO user_documents (user_id, conversation_id, filename, file_path)
               VALUES (?, ?, ?, ?)
               RETURNING id, user_id, conversation_id, filename, file_path, uploaded_at"#,
        )
        .bind(user_id)
        .bind(conversation_id)
        .bind(filename)
        .bind(file_path)
        .fetch_one(self.pool.get_pool())
        .await?;

        info!(user_id, conversation_id, filename, "Document recorded");
        Ok(document)
    }

    pub async fn get_user_documents(&self, user_id: i64) -> Result<Vec<UserDocument>> {
        let docs = sqlx::query_as::<_, UserDocument>(
            "SELECT id, user_id, conversation_id, filename, file_path, uploaded_at \
             FROM user_documents WHERE user_id = ? ORDER BY uploaded_at DESC",
        )
        .bind(user_id)
        .fetch_all(self.pool.get_pool())
        .await?;
        Ok(docs)
    }

    pub async fn has_documents(&self, user_id: i64, conversation_id: i64) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM user_documents WHERE user_id = ? AND conversation_id = ?",
        )
        .bind(user_id)
        .bind(conversation_id)
        .fetch_one(self.pool.get_pool())
        .await?;
        Ok(count > 0)
    }

    pub async fn count_documents(&self, conversation_id: i64) -> Result<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM user_documents WHERE conversation_id = ?")
                .bind(conversation_id)
                .fetch_one(self.pool.get_pool())
                .await?;
        Ok(count)
    }

    pub async fn delete_user_documents(&self, user_id: i64) -> Result<u64> {
        let affected = sqlx::query("DELETE FROM user_documents WHERE user_id = ?")
            .bind(user_id)
            .execute(self.pool.get_pool())
            .await?
            .rows_affected();
        Ok(affected)
    }

    fn invalidate_conversation(&self, conversation_id: i64, user_id: i64) {
        self.cache
            .delete(&format!("conversation:{}", conversation_id));
        self.cache.delete(&format!("conversations:{}", user_id));
    }
}

fn map_unique_violation(err: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(ref db_err) = err {
        if db_err.is_unique_violation() {
            let message = db_err.message();
            if message.contains("users.username") {
                return StoreError::UsernameTaken;
            }
            if message.contains("users.email") {
                return StoreError::EmailTaken;
            }
        }
    }
    StoreError::Sqlx(err)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn repo() -> Repository {
        let pool = DbPool::in_memory().await.unwrap();
        Repository::new(pool, Arc::new(QueryCache::new(500)))
    }

    #[tokio::test]
    async fn duplicate_username_maps_to_domain_error() {
        let repo = repo().await;
        repo.create_user("alice", "a@x", "hash").await.unwrap();

        let err = repo.create_user("alice", "b@x", "hash").await.unwrap_err();
        assert!(matches!(err, StoreError::UsernameTaken));

        let err = repo.create_user("bob", "a@x", "hash").await.unwrap_err();
        assert!(matches!(err, StoreError::EmailTaken));
    }

    #[tokio::test]
    async fn exchange_is_atomic_and_ordered() {
        let repo = repo().await;
        let user = repo.create_user("alice", "a@x", "hash").await.unwrap();
        let conv = repo.create_conversation(user.id, "chat").await.unwrap();

        repo.append_exchange(conv.id, user.id, "question", "answer")
            .await
            .unwrap();

        let messages = repo.get_conversation_messages(conv.id, None).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, "user");
        assert_eq!(messages[1].role, "assistant");
        assert!(messages[0].id < messages[1].id);
    }

    #[tokio::test]
    async fn delete_conversation_cascades() {
        let repo = repo().await;
        let user = repo.create_user("alice", "a@x", "hash").await.unwrap();
        let conv = repo.create_conversation(user.id, "chat").await.unwrap();
        repo.append_exchange(conv.id, user.id, "q", "a").await.unwrap();
        repo.add_user_document(user.id, conv.id, "doc.pdf", "/tmp/doc.pdf")
            .await
            .unwrap();

        assert!(repo.delete_conversation(conv.id, user.id).await.unwrap());
        assert_eq!(repo.count_messages(conv.id).await.unwrap(), 0);
        assert!(!repo.has_documents(user.id, conv.id).await.unwrap());
    }

    #[tokio::test]
    async fn delete_requires_owner() {
        let repo = repo().await;
        let alice = repo.create_user("alice", "a@x", "hash").await.unwrap();
        let mallory = repo.create_user("mallory", "m@x", "hash").await.unwrap();
        let conv = repo.create_conversation(alice.id, "private").await.unwrap();

        assert!(!repo.delete_conversation(conv.id, mallory.id).await.unwrap());
        assert!(repo.get_conversation(conv.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn conversations_list_reflects_mutations_through_cache() {
        let repo = repo().await;
        let user = repo.create_user("alice", "a@x", "hash").await.unwrap();

        assert!(repo.get_user_conversations(user.id).await.unwrap().is_empty());

        // The create must invalidate the cached empty list.
        let conv = repo.create_conversation(user.id, "first").await.unwrap();
        let list = repo.get_user_conversations(user.id).await.unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].id, conv.id);

        repo.append_exchange(conv.id, user.id, "q", "a").await.unwrap();
        let list = repo.get_user_conversations(user.id).await.unwrap();
        assert_eq!(list[0].message_count, 2);
    }
}
