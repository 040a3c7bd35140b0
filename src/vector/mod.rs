pub mod math;
pub mod store;
pub mod two_level;

pub use store::{NewDocument, ScoredChunk, VectorIndex, VectorStore, VectorStoreManager};
pub use two_level::TwoLevelIndex;
