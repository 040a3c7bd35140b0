pub mod settings;

pub use settings::{
    AuthConfig, DatabaseConfig, EmailConfig, LimitsConfig, RagConfig, ServerConfig, Settings,
    VectorConfig,
};
