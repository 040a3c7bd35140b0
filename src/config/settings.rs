use anyhow::{bail, Context, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Settings {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub vector: VectorConfig,
    pub auth: AuthConfig,
    pub rag: RagConfig,
    pub limits: LimitsConfig,
    pub email: EmailConfig,
    /// Production mode enforces the master-key requirement at startup.
    pub production: bool,
    #[serde(default)]
    pub master_encryption_key: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_upload_bytes: usize,
    pub upload_dir: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DatabaseConfig {
    /// `sqlite` (default) or `postgresql`. This build is sqlite-only; a
    /// postgresql value is rejected at startup rather than half-supported.
    pub database_type: String,
    #[serde(default)]
    pub url: Option<String>,
    pub sqlite_path: String,
    pub pool_size: u32,
    pub max_overflow: u32,
    pub pool_timeout_seconds: u64,
    pub pool_recycle_seconds: u64,
    pub echo: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct VectorConfig {
    /// Directory holding the per-tenant `vector_store_<username>.db` files.
    pub data_dir: String,
    /// Tenant corpora larger than this switch to the two-level index.
    pub two_level_threshold: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AuthConfig {
    pub jwt_secret: String,
    pub token_expiry_seconds: u64,
    pub verification_code_ttl_seconds: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RagConfig {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub min_chunk_size: usize,
    pub max_chunk_size: usize,
    pub retrieval_top_k: usize,
    pub rerank_keep: usize,
    pub semantic_cache_threshold: f32,
    pub semantic_cache_ttl_seconds: u64,
    pub conversation_expiry_days: i64,
    pub web_search_enabled: bool,
    #[serde(default)]
    pub web_search_endpoint: Option<String>,
    #[serde(default)]
    pub web_search_api_key: Option<String>,
    pub memory_enabled: bool,
    pub embed_batch_size: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LimitsConfig {
    pub embedding_concurrency: usize,
    pub vector_search_concurrency: usize,
    pub llm_concurrency: usize,
    pub acquire_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct EmailConfig {
    pub sender: String,
    pub smtp_server: String,
    pub smtp_port: u16,
    #[serde(default)]
    pub password: Option<String>,
}

impl Settings {
    /// Defaults, overridden by an optional `config/settings.toml`, then by
    /// `APP__`-prefixed environment variables, then by the well-known
    /// deployment variables (`DATABASE_TYPE`, `SQLITE_PATH`, ...).
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Config::builder()
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8000i64)?
            .set_default("server.max_upload_bytes", 100i64 * 1024 * 1024)?
            .set_default("server.upload_dir", "uploads")?
            .set_default("database.database_type", "sqlite")?
            .set_default("database.sqlite_path", "ragchat.db")?
            .set_default("database.pool_size", 10i64)?
            .set_default("database.max_overflow", 0i64)?
            .set_default("database.pool_timeout_seconds", 5i64)?
            .set_default("database.pool_recycle_seconds", 1800i64)?
            .set_default("database.echo", false)?
            .set_default("vector.data_dir", ".")?
            .set_default("vector.two_level_threshold", 1000i64)?
            .set_default("auth.jwt_secret", "change-this-in-production")?
            .set_default("auth.token_expiry_seconds", 8i64 * 3600)?
            .set_default("auth.verification_code_ttl_seconds", 360i64)?
            .set_default("rag.chunk_size", 1000i64)?
            .set_default("rag.chunk_overlap", 200i64)?
            .set_default("rag.min_chunk_size", 100i64)?
            .set_default("rag.max_chunk_size", 2000i64)?
            .set_default("rag.retrieval_top_k", 10i64)?
            .set_default("rag.rerank_keep", 5i64)?
            .set_default("rag.semantic_cache_threshold", 0.95f64)?
            .set_default("rag.semantic_cache_ttl_seconds", 3600i64)?
            .set_default("rag.conversation_expiry_days", 30i64)?
            .set_default("rag.web_search_enabled", true)?
            .set_default("rag.memory_enabled", false)?
            .set_default("rag.embed_batch_size", 100i64)?
            .set_default("limits.embedding_concurrency", 4i64)?
            .set_default("limits.vector_search_concurrency", 8i64)?
            .set_default("limits.llm_concurrency", 4i64)?
            .set_default("limits.acquire_timeout_ms", 5000i64)?
            .set_default("email.sender", "noreply@ragchat.local")?
            .set_default("email.smtp_server", "localhost")?
            .set_default("email.smtp_port", 587i64)?
            .set_default("production", false)?
            .add_source(File::with_name("config/settings").required(false))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut settings: Settings = config
            .try_deserialize()
            .context("Failed to deserialize settings")?;

        settings.apply_env_overrides();
        settings.validate()?;
        Ok(settings)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("DATABASE_TYPE") {
            self.database.database_type = v;
        }
        if let Ok(v) = std::env::var("DATABASE_URL") {
            self.database.url = Some(v);
        }
        if let Ok(v) = std::env::var("SQLITE_PATH") {
            self.database.sqlite_path = v;
        }
        if let Ok(v) = std::env::var("DB_POOL_SIZE") {
            if let Ok(n) = v.parse() {
                self.database.pool_size = n;
            }
        }
        if let Ok(v) = std::env::var("DB_MAX_OVERFLOW") {
            if let Ok(n) = v.parse() {
                self.database.max_overflow = n;
            }
        }
        if let Ok(v) = std::env::var("DB_POOL_TIMEOUT") {
            if let Ok(n) = v.parse() {
                self.database.pool_timeout_seconds = n;
            }
        }
        if let Ok(v) = std::env::var("DB_POOL_RECYCLE") {
            if let Ok(n) = v.parse() {
                self.database.pool_recycle_seconds = n;
            }
        }
        if let Ok(v) = std::env::var("DB_ECHO") {
            self.database.echo = matches!(v.to_lowercase().as_str(), "1" | "true" | "yes");
        }
        if let Ok(v) = std::env::var("MASTER_ENCRYPTION_KEY") {
            self.master_encryption_key = Some(v);
        }
        if let Ok(v) = std::env::var("EMAIL_PASSWORD") {
            self.email.password = Some(v);
        }
    }

    fn validate(&self) -> Result<()> {
        match self.database.database_type.as_str() {
            "sqlite" => {}
            "postgresql" => {
                bail!(
                    "DATABASE_TYPE=postgresql is not supported by this build; \
                     use sqlite or deploy the postgres-enabled build"
                )
            }
            other => bail!("Unknown DATABASE_TYPE '{}'", other),
        }

        if self.production && self.master_encryption_key.is_none() {
            bail!("MASTER_ENCRYPTION_KEY is required in production mode");
        }

        if !(0.0..=1.0).contains(&self.rag.semantic_cache_threshold) {
            bail!(
                "rag.semantic_cache_threshold must be in [0, 1], got {}",
                self.rag.semantic_cache_threshold
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> Settings {
        Settings {
            server: ServerConfig {
                host: "127.0.0.1".into(),
                port: 8000,
                max_upload_bytes: 1024,
                upload_dir: "uploads".into(),
            },
            database: DatabaseConfig {
                database_type: "sqlite".into(),
                url: None,
                sqlite_path: "test.db".into(),
                pool_size: 10,
                max_overflow: 0,
                pool_timeout_seconds: 5,
                pool_recycle_seconds: 1800,
                echo: false,
            },
            vector: VectorConfig {
                data_dir: ".".into(),
                two_level_threshold: 1000,
            },
            auth: AuthConfig {
                jwt_secret: "secret".into(),
                token_expiry_seconds: 3600,
                verification_code_ttl_seconds: 360,
            },
            rag: RagConfig {
                chunk_size: 1000,
                chunk_overlap: 200,
                min_chunk_size: 100,
                max_chunk_size: 2000,
                retrieval_top_k: 10,
                rerank_keep: 5,
                semantic_cache_threshold: 0.95,
                semantic_cache_ttl_seconds: 3600,
                conversation_expiry_days: 30,
                web_search_enabled: true,
                web_search_endpoint: None,
                web_search_api_key: None,
                memory_enabled: false,
                embed_batch_size: 100,
            },
            limits: LimitsConfig {
                embedding_concurrency: 4,
                vector_search_concurrency: 8,
                llm_concurrency: 4,
                acquire_timeout_ms: 5000,
            },
            email: EmailConfig {
                sender: "noreply@test".into(),
                smtp_server: "localhost".into(),
                smtp_port: 587,
                password: None,
            },
            production: false,
            master_encryption_key: None,
        }
    }

    #[test]
    fn production_requires_master_key() {
        let mut settings = defaults();
        settings.production = true;
        assert!(settings.validate().is_err());

        settings.master_encryption_key = Some("key".into());
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn postgres_is_rejected() {
        let mut settings = defaults();
        settings.database.database_type = "postgresql".into();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn threshold_bounds_checked() {
        let mut settings = defaults();
        settings.rag.semantic_cache_threshold = 1.5;
        assert!(settings.validate().is_err());
    }
}
