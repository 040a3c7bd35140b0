use std::sync::Arc;

use crate::auth::JwtManager;
use crate::cache::{QueryCache, SemanticCache};
use crate::config::Settings;
use crate::database::Repository;
use crate::services::{ChatService, EmailSender, IngestService, SessionValidator};
use crate::store::AppStore;
use crate::utils::limiters::Limiters;
use crate::utils::rate_limit::RateLimiter;
use crate::vector::VectorStoreManager;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub settings: Settings,
    pub repository: Arc<Repository>,
    pub query_cache: Arc<QueryCache>,
    pub semantic_cache: Arc<SemanticCache>,
    pub app_store: Arc<AppStore>,
    pub rate_limiter: Arc<RateLimiter>,
    pub vector_stores: Arc<VectorStoreManager>,
    pub validator: Arc<SessionValidator>,
    pub chat_service: Arc<ChatService>,
    pub ingest_service: Arc<IngestService>,
    pub jwt: Arc<JwtManager>,
    pub limiters: Arc<Limiters>,
    pub email: Arc<dyn EmailSender>,
}
