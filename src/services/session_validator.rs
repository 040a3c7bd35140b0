use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::database::{Conversation, Repository};
use crate::utils::error::ApiError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Expiring,
    Expired,
    Invalid,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConversationHealth {
    pub exists: bool,
    pub owned_by_user: bool,
    pub is_expired: bool,
    pub message_count: i64,
    pub document_count: i64,
    pub last_activity: Option<String>,
    pub age_days: i64,
    pub health_status: HealthStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct CleanupReport {
    pub total_conversations: usize,
    pub expired_count: usize,
    pub deleted_count: usize,
    pub deleted_ids: Vec<i64>,
}

/// Ownership, expiry and lifecycle checks for conversations. Every
/// ingest or retrieval names a conversation; this is the gate in front
/// of both.
pub struct SessionValidator {
    repository: Arc<Repository>,
    expiry_days: i64,
}

impl SessionValidator {
    pub fn new(repository: Arc<Repository>, expiry_days: i64) -> Self {
        Self {
            repository,
            expiry_days: expiry_days.max(1),
        }
    }

    pub fn expiry_days(&self) -> i64 {
        self.expiry_days
    }

    /// Confirm the caller owns the conversation and, when required, that
    /// it is still active. Missing and foreign conversations report the
    /// same way so existence is not leaked.
    pub async fn validate_access(
        &self,
        conversation_id: i64,
        user_id: i64,
        require_active: bool,
    ) -> Result<Conversation, ApiError> {
        let conversation = self
            .repository
            .get_conversation(conversation_id)
            .await
            .map_err(ApiError::from)?;

        let Some(conversation) = conversation else {
            warn!(conversation_id, user_id, "Conversation not found");
            return Err(ApiError::AccessDenied(
                "Conversation not found or access denied".into(),
            ));
        };

        if conversation.user_id != user_id {
            error!(
                conversation_id,
                user_id,
                owner = conversation.user_id,
                "Ownership violation"
            );
            return Err(ApiError::AccessDenied(
                "Conversation not found or access denied".into(),
            ));
        }

        if require_active {
            if let Some(age_days) = self.expired_age_days(&conversation) {
                warn!(conversation_id, age_days, "Conversation expired");
                return Err(ApiError::ExpiredSession(format!(
                    "Conversation expired: last activity was {} days ago (max: {} days)",
                    age_days, self.expiry_days
                )));
            }
        }

        debug!(conversation_id, user_id, "Conversation validated");
        Ok(conversation)
    }

    /// Days since last activity when past the expiry threshold.
    fn expired_age_days(&self, conversation: &Conversation) -> Option<i64> {
        let age_days = self.age_days(conversation);
        (age_days > self.expiry_days).then_some(age_days)
    }

    fn age_days(&self, conversation: &Conversation) -> i64 {
        let last_activity = conversation.updated_at.max(conversation.created_at);
        (Utc::now().naive_utc() - last_activity).num_days()
    }

    pub async fn health(
        &self,
        conversation_id: i64,
        user_id: i64,
    ) -> Result<ConversationHealth, ApiError> {
        let conversation = self
            .repository
            .get_conversation(conversation_id)
            .await
            .map_err(ApiError::from)?;

        let Some(conversation) = conversation else {
            return Ok(ConversationHealth {
                exists: false,
                owned_by_user: false,
                is_expired: true,
                message_count: 0,
                document_count: 0,
                last_activity: None,
                age_days: 0,
                health_status: HealthStatus::Invalid,
            });
        };

        let owned = conversation.user_id == user_id;
        let age_days = self.age_days(&conversation);
        let is_expired = age_days > self.expiry_days;

        let message_count = self
            .repository
            .count_messages(conversation_id)
            .await
            .map_err(ApiError::from)?;
        let document_count = self
            .repository
            .count_documents(conversation_id)
            .await
            .map_err(ApiError::from)?;

        let health_status = if !owned {
            HealthStatus::Invalid
        } else if is_expired {
            HealthStatus::Expired
        } else if age_days as f64 > self.expiry_days as f64 * 0.8 {
            HealthStatus::Expiring
        } else {
            HealthStatus::Healthy
        };

        Ok(ConversationHealth {
            exists: true,
            owned_by_user: owned,
            is_expired,
            message_count,
            document_count,
            last_activity: Some(conversation.updated_at.format("%Y-%m-%d %H:%M:%S").to_string()),
            age_days,
            health_status,
        })
    }

    /// Delete the user's expired conversations; messages and document
    /// records cascade through the relational store.
    pub async fn cleanup_expired(&self, user_id: i64) -> Result<CleanupReport, ApiError> {
        let summaries = self
            .repository
            .get_user_conversations(user_id)
            .await
            .map_err(ApiError::from)?;

        let now = Utc::now().naive_utc();
        let expired: Vec<i64> = summaries
            .iter()
            .filter(|c| (now - c.updated_at.max(c.created_at)).num_days() > self.expiry_days)
            .map(|c| c.id)
            .collect();

        let mut deleted_ids = Vec::new();
        for conversation_id in &expired {
            match self.repository.delete_conversation(*conversation_id, user_id).await {
                Ok(true) => {
                    info!(conversation_id, user_id, "Deleted expired conversation");
                    deleted_ids.push(*conversation_id);
                }
                Ok(false) => {}
                Err(e) => error!(conversation_id, "Failed to delete expired conversation: {}", e),
            }
        }

        Ok(CleanupReport {
            total_conversations: summaries.len(),
            expired_count: expired.len(),
            deleted_count: deleted_ids.len(),
            deleted_ids,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::QueryCache;
    use crate::database::DbPool;

    async fn setup() -> (Arc<Repository>, SessionValidator, i64, i64) {
        let pool = DbPool::in_memory().await.unwrap();
        let repository = Arc::new(Repository::new(pool, Arc::new(QueryCache::new(500))));
        let validator = SessionValidator::new(repository.clone(), 30);

        let alice = repository.create_user("alice", "a@x", "hash").await.unwrap();
        let mallory = repository.create_user("mallory", "m@x", "hash").await.unwrap();
        (repository, validator, alice.id, mallory.id)
    }

    async fn age_conversation(repo: &Repository, conversation_id: i64, days: i64) {
        let stamp = (Utc::now().naive_utc() - chrono::Duration::days(days))
            .format("%Y-%m-%d %H:%M:%S")
            .to_string();
        sqlx::query("UPDATE conversations SET updated_at = ?, created_at = ? WHERE id = ?")
            .bind(&stamp)
            .bind(&stamp)
            .bind(conversation_id)
            .execute(repo.pool().get_pool())
            .await
            .unwrap();
        repo.get_conversation(conversation_id).await.ok();
    }

    #[tokio::test]
    async fn owner_of_fresh_conversation_passes() {
        let (repo, validator, alice, _) = setup().await;
        let conv = repo.create_conversation(alice, "chat").await.unwrap();
        assert!(validator.validate_access(conv.id, alice, true).await.is_ok());
    }

    #[tokio::test]
    async fn foreign_conversation_is_denied() {
        let (repo, validator, alice, mallory) = setup().await;
        let conv = repo.create_conversation(alice, "private").await.unwrap();

        let err = validator
            .validate_access(conv.id, mallory, true)
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::AccessDenied(_)));
    }

    #[tokio::test]
    async fn missing_conversation_is_denied() {
        let (_, validator, alice, _) = setup().await;
        let err = validator.validate_access(999, alice, true).await.unwrap_err();
        assert!(matches!(err, ApiError::AccessDenied(_)));
    }

    #[tokio::test]
    async fn stale_conversation_expires_only_when_active_required() {
        let (repo, _validator, alice, _) = setup().await;
        let conv = repo.create_conversation(alice, "old").await.unwrap();

        // Fresh copy of the repository cache for the aged row.
        let repo2 = Repository::new(repo.pool().clone(), Arc::new(QueryCache::new(500)));
        age_conversation(&repo2, conv.id, 31).await;
        let validator = SessionValidator::new(Arc::new(repo2), 30);

        let err = validator
            .validate_access(conv.id, alice, true)
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::ExpiredSession(_)));

        assert!(validator.validate_access(conv.id, alice, false).await.is_ok());
    }

    #[tokio::test]
    async fn health_statuses() {
        let (repo, _, alice, mallory) = setup().await;
        let fresh = repo.create_conversation(alice, "fresh").await.unwrap();
        let expiring = repo.create_conversation(alice, "expiring").await.unwrap();
        let expired = repo.create_conversation(alice, "expired").await.unwrap();

        let repo2 = Arc::new(Repository::new(
            repo.pool().clone(),
            Arc::new(QueryCache::new(500)),
        ));
        age_conversation(&repo2, expiring.id, 25).await;
        age_conversation(&repo2, expired.id, 40).await;
        let validator = SessionValidator::new(repo2, 30);

        let health = validator.health(fresh.id, alice).await.unwrap();
        assert_eq!(health.health_status, HealthStatus::Healthy);

        let health = validator.health(expiring.id, alice).await.unwrap();
        assert_eq!(health.health_status, HealthStatus::Expiring);

        let health = validator.health(expired.id, alice).await.unwrap();
        assert_eq!(health.health_status, HealthStatus::Expired);
        assert!(health.is_expired);

        let health = validator.health(fresh.id, mallory).await.unwrap();
        assert_eq!(health.health_status, HealthStatus::Invalid);

        let health = validator.health(999, alice).await.unwrap();
        assert!(!health.exists);
        assert_eq!(health.health_status, HealthStatus::Invalid);
    }

    #[tokio::test]
    async fn cleanup_deletes_only_expired() {
        let (repo, _, alice, _) = setup().await;
        let keep = repo.create_conversation(alice, "keep").await.unwrap();
        let drop1 = repo.create_conversation(alice, "drop1").await.unwrap();
        let drop2 = repo.create_conversation(alice, "drop2").await.unwrap();

        let repo2 = Arc::new(Repository::new(
            repo.pool().clone(),
            Arc::new(QueryCache::new(500)),
        ));
        age_conversation(&repo2, drop1.id, 45).await;
        age_conversation(&repo2, drop2.id, 60).await;
        let validator = SessionValidator::new(repo2.clone(), 30);

        let report = validator.cleanup_expired(alice).await.unwrap();
        assert_eq!(report.total_conversations, 3);
        assert_eq!(report.expired_count, 2);
        assert_eq!(report.deleted_count, 2);
        assert!(report.deleted_ids.contains(&drop1.id));
        assert!(report.deleted_ids.contains(&drop2.id));

        assert!(repo2.get_conversation(keep.id).await.unwrap().is_some());
    }
}
