use anyhow::Result;
use axum::{
    extract::DefaultBodyLimit,
    middleware,
    routing::{delete, get, patch, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::{
    catch_panic::CatchPanicLayer,
    cors::CorsLayer,
    trace::{DefaultMakeSpan, TraceLayer},
};
use tracing::info;

use ragchat::auth::{auth_middleware, JwtManager};
use ragchat::cache::{QueryCache, SemanticCache};
use ragchat::config::Settings;
use ragchat::database::{DbPool, Repository};
use ragchat::document::SmartChunker;
use ragchat::handlers;
use ragchat::services::{
    ChatService, DevEmailSender, HttpWebSearch, IngestService, SessionValidator, WebSearchProvider,
};
use ragchat::state::AppState;
use ragchat::store::AppStore;
use ragchat::utils::limiters::Limiters;
use ragchat::utils::rate_limit::RateLimiter;
use ragchat::vector::VectorStoreManager;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,ragchat=debug".to_string()),
        )
        .with_target(true)
        .init();

    info!("Starting RAG chat server...");

    let settings = Settings::load()?;
    info!("Configuration loaded");

    // Pool construction failure (including schema bootstrap) is fatal.
    let db_pool = DbPool::new(&settings.database).await?;
    info!("Database connection established");

    let query_cache = Arc::new(QueryCache::new(500));
    let repository = Arc::new(Repository::new(db_pool.clone(), query_cache.clone()));

    let app_store = Arc::new(AppStore::new(Duration::from_secs(
        settings.auth.verification_code_ttl_seconds,
    )));
    let rate_limiter = Arc::new(RateLimiter::new());
    let limiters = Arc::new(Limiters::new(&settings.limits));

    let semantic_cache = Arc::new(SemanticCache::new(
        settings.rag.semantic_cache_threshold,
        Duration::from_secs(settings.rag.semantic_cache_ttl_seconds),
        1000,
    ));

    let vector_stores = Arc::new(VectorStoreManager::new(
        settings.vector.data_dir.clone(),
        settings.vector.two_level_threshold,
    ));

    let validator = Arc::new(SessionValidator::new(
        repository.clone(),
        settings.rag.conversation_expiry_days,
    ));

    let web_search: Option<Arc<dyn WebSearchProvider>> =
        settings.rag.web_search_endpoint.as_ref().map(|endpoint| {
            Arc::new(HttpWebSearch::new(
                endpoint,
                settings.rag.web_search_api_key.clone(),
            )) as Arc<dyn WebSearchProvider>
        });

    let chat_service = Arc::new(ChatService::new(
        repository.clone(),
        validator.clone(),
        vector_stores.clone(),
        app_store.clone(),
        semantic_cache.clone(),
        rate_limiter.clone(),
        web_search,
        Some(limiters.clone()),
        settings.rag.clone(),
    ));

    let ingest_service = Arc::new(IngestService::new(
        repository.clone(),
        validator.clone(),
        vector_stores.clone(),
        app_store.clone(),
        rate_limiter.clone(),
        SmartChunker::new(
            settings.rag.chunk_size,
            settings.rag.chunk_overlap,
            settings.rag.min_chunk_size,
            settings.rag.max_chunk_size,
        ),
        settings.rag.embed_batch_size,
        settings.server.upload_dir.clone(),
    ));

    let jwt = Arc::new(JwtManager::new(
        &settings.auth.jwt_secret,
        settings.auth.token_expiry_seconds,
    ));

    let state = Arc::new(AppState {
        settings: settings.clone(),
        repository,
        query_cache,
        semantic_cache,
        app_store,
        rate_limiter,
        vector_stores,
        validator,
        chat_service,
        ingest_service,
        jwt,
        limiters,
        email: Arc::new(DevEmailSender),
    });

    let app = build_router(state.clone(), settings.server.max_upload_bytes);

    let addr = SocketAddr::from((
        settings.server.host.parse::<std::net::IpAddr>()?,
        settings.server.port,
    ));
    info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

fn build_router(state: Arc<AppState>, max_upload_bytes: usize) -> Router {
    let public_routes = Router::new()
        .route("/health", get(handlers::health::health_check))
        .route("/auth/send-code", post(handlers::auth::send_code))
        .route("/auth/register", post(handlers::auth::register))
        .route("/auth/login", post(handlers::auth::login))
        .route("/auth/reset-password", post(handlers::auth::reset_password));

    let protected_routes = Router::new()
        .route("/auth/me", get(handlers::auth::me))
        .route("/config", post(handlers::config::set_config))
        .route("/config", get(handlers::config::get_config))
        .route("/config/test", post(handlers::config::test_config))
        .route("/documents/upload", post(handlers::documents::upload))
        .route("/documents/status", get(handlers::documents::status))
        .route("/documents/clear", post(handlers::documents::clear))
        .route("/chat/message", post(handlers::chat::message))
        .route("/chat/conversations", get(handlers::chat::list_conversations))
        .route(
            "/chat/conversations/cleanup-expired",
            post(handlers::chat::cleanup_expired),
        )
        .route(
            "/chat/conversations/{id}",
            delete(handlers::chat::delete_conversation),
        )
        .route(
            "/chat/conversations/{id}",
            patch(handlers::chat::update_title),
        )
        .route(
            "/chat/conversations/{id}/health",
            get(handlers::chat::conversation_health),
        )
        .route("/rate-limit/quota", get(handlers::rate_limit::quota))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::default().include_headers(false)),
        )
        .layer(CatchPanicLayer::new())
        .layer(DefaultBodyLimit::max(max_upload_bytes))
}
