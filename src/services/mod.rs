pub mod chat;
pub mod email;
pub mod embedding;
pub mod ingest;
pub mod llm;
pub mod memory;
pub mod providers;
pub mod reranker;
pub mod session_validator;
pub mod web_search;

pub use chat::{ChatOutcome, ChatService};
pub use email::DevEmailSender;
pub use embedding::HttpEmbedder;
pub use ingest::{IngestService, UploadOutcome};
pub use llm::HttpLlmClient;
pub use memory::LongTermMemory;
pub use providers::{
    ChatMessage, EmailSender, EmbeddingProvider, LlmProvider, RerankerProvider, WebSearchProvider,
    WebSearchResult,
};
pub use reranker::HttpReranker;
pub use session_validator::{CleanupReport, ConversationHealth, HealthStatus, SessionValidator};
pub use web_search::HttpWebSearch;
