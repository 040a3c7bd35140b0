pub mod chunker;
pub mod parser;

pub use chunker::{ChunkStrategy, SmartChunker};
pub use parser::{is_pdf, ParsedDocument, PdfExtractor};
