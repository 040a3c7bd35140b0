use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::services::providers::{EmbeddingProvider, LlmProvider, RerankerProvider};

/// A user's saved provider configuration. Provider clients are stored as
/// trait objects so the store never needs to deep-copy them; the raw key
/// material stays in memory only and is never serialized.
#[derive(Clone)]
pub struct UserConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub embedding_model: String,
    pub reranker_key: Option<String>,
    pub reranker_base_url: Option<String>,
    pub llm: Arc<dyn LlmProvider>,
    pub embedder: Arc<dyn EmbeddingProvider>,
    pub reranker: Option<Arc<dyn RerankerProvider>>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct UserSession {
    pub documents_loaded: bool,
    pub conversations: Vec<i64>,
    pub documents: Vec<String>,
}

struct VerificationCode {
    code: String,
    created_at: Instant,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub total_users_with_config: usize,
    pub total_sessions: usize,
    pub active_verification_codes: usize,
}

/// Process-wide mutable state: user configs, user sessions and email
/// verification codes, each behind its own mutex. No lock is ever held
/// across an await point; no operation errors across the store boundary.
pub struct AppStore {
    configs: Mutex<HashMap<String, UserConfig>>,
    sessions: Mutex<HashMap<String, UserSession>>,
    verification_codes: Mutex<HashMap<String, VerificationCode>>,
    verification_ttl: Duration,
}

impl AppStore {
    pub fn new(verification_ttl: Duration) -> Self {
        info!(
            verification_ttl_s = verification_ttl.as_secs(),
            "AppStore initialized"
        );
        Self {
            configs: Mutex::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
            verification_codes: Mutex::new(HashMap::new()),
            verification_ttl,
        }
    }

    // ===== User configs =====

    /// Replace the user's config wholesale.
    pub fn set_config(&self, username: &str, config: UserConfig) {
        self.configs.lock().insert(username.to_string(), config);
        debug!(username, "Config set");
    }

    pub fn get_config(&self, username: &str) -> Option<UserConfig> {
        self.configs.lock().get(username).cloned()
    }

    pub fn has_config(&self, username: &str) -> bool {
        self.configs.lock().contains_key(username)
    }

    pub fn delete_config(&self, username: &str) -> bool {
        let removed = self.configs.lock().remove(username).is_some();
        if removed {
            info!(username, "Config deleted");
        }
        removed
    }

    pub fn list_usernames(&self) -> Vec<String> {
        self.configs.lock().keys().cloned().collect()
    }

    // ===== User sessions =====

    /// Fetch the user's session, creating it with defaults on first use.
    pub fn ensure_session(&self, username: &str) -> UserSession {
        self.sessions
            .lock()
            .entry(username.to_string())
            .or_default()
            .clone()
    }

    pub fn get_session(&self, username: &str) -> Option<UserSession> {
        self.sessions.lock().get(username).cloned()
    }

    /// Apply an in-place update to the user's session (created if absent).
    pub fn update_session<F>(&self, username: &str, update: F)
    where
        F: FnOnce(&mut UserSession),
    {
        let mut sessions = self.sessions.lock();
        let session = sessions.entry(username.to_string()).or_default();
        update(session);
        debug!(username, "Session updated");
    }

    pub fn delete_session(&self, username: &str) -> bool {
        self.sessions.lock().remove(username).is_some()
    }

    // ===== Verification codes =====

    pub fn set_verification_code(&self, email: &str, code: &str) {
        let mut codes = self.verification_codes.lock();
        Self::sweep_expired(&mut codes, self.verification_ttl);
        codes.insert(
            email.to_string(),
            VerificationCode {
                code: code.to_string(),
                created_at: Instant::now(),
            },
        );
        info!(email, "Verification code set");
    }

    /// Check a code. Consumes the stored entry on success; expired entries
    /// are evicted whether or not they matched.
    pub fn verify_code(&self, email: &str, code: &str) -> bool {
        let mut codes = self.verification_codes.lock();
        Self::sweep_expired(&mut codes, self.verification_ttl);

        match codes.get(email) {
            Some(entry) if entry.code == code => {
                codes.remove(email);
                info!(email, "Verification successful");
                true
            }
            Some(_) => {
                warn!(email, "Verification failed: incorrect code");
                false
            }
            None => {
                warn!(email, "Verification failed: no active code");
                false
            }
        }
    }

    pub fn cleanup_expired_codes(&self) -> usize {
        let mut codes = self.verification_codes.lock();
        Self::sweep_expired(&mut codes, self.verification_ttl)
    }

    fn sweep_expired(codes: &mut HashMap<String, VerificationCode>, ttl: Duration) -> usize {
        let before = codes.len();
        let now = Instant::now();
        codes.retain(|_, entry| now.duration_since(entry.created_at) <= ttl);
        let removed = before - codes.len();
        if removed > 0 {
            debug!(removed, "Swept expired verification codes");
        }
        removed
    }

    // ===== Monitoring =====

    /// Locks are taken in a fixed order (configs, sessions, codes) so this
    /// can never deadlock against the single-map operations.
    pub fn get_stats(&self) -> StoreStats {
        let configs = self.configs.lock();
        let sessions = self.sessions.lock();
        let mut codes = self.verification_codes.lock();
        Self::sweep_expired(&mut codes, self.verification_ttl);

        StoreStats {
            total_users_with_config: configs.len(),
            total_sessions: sessions.len(),
            active_verification_codes: codes.len(),
        }
    }

    #[cfg(test)]
    pub fn clear_all(&self) {
        self.configs.lock().clear();
        self.sessions.lock().clear();
        self.verification_codes.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> AppStore {
        AppStore::new(Duration::from_secs(360))
    }

    #[test]
    fn session_created_with_defaults() {
        let store = store();
        let session = store.ensure_session("alice");
        assert!(!session.documents_loaded);
        assert!(session.conversations.is_empty());

        store.update_session("alice", |s| s.documents_loaded = true);
        assert!(store.get_session("alice").unwrap().documents_loaded);
    }

    #[test]
    fn verify_code_consumes_on_success() {
        let store = store();
        store.set_verification_code("a@x", "123456");

        assert!(!store.verify_code("a@x", "000000"));
        assert!(store.verify_code("a@x", "123456"));
        // Consumed: a second attempt with the right code fails.
        assert!(!store.verify_code("a@x", "123456"));
    }

    #[test]
    fn expired_codes_are_swept() {
        let store = AppStore::new(Duration::from_millis(10));
        store.set_verification_code("a@x", "123456");
        std::thread::sleep(Duration::from_millis(20));
        assert!(!store.verify_code("a@x", "123456"));
        assert_eq!(store.get_stats().active_verification_codes, 0);
    }

    #[test]
    fn stats_count_all_maps() {
        let store = store();
        store.ensure_session("alice");
        store.set_verification_code("a@x", "111111");

        let stats = store.get_stats();
        assert_eq!(stats.total_sessions, 1);
        assert_eq!(stats.active_verification_codes, 1);
        assert_eq!(stats.total_users_with_config, 0);
    }

    #[test]
    fn missing_entries_are_none_not_errors() {
        let store = store();
        assert!(store.get_config("ghost").is_none());
        assert!(store.get_session("ghost").is_none());
        assert!(!store.delete_config("ghost"));
        assert!(!store.delete_session("ghost"));
    }
}
