use anyhow::{bail, Result};
use std::path::Path;

#[derive(Debug)]
pub struct ParsedDocument {
    pub content: String,
    pub page_count: usize,
}

/// PDF text extraction boundary. Runs on a blocking worker; the pipeline
/// treats an empty extraction as an ingest failure.
pub struct PdfExtractor;

impl PdfExtractor {
    pub fn extract(file_path: &Path) -> Result<ParsedDocument> {
        use lopdf::Document;

        let doc = Document::load(file_path)?;
        let pages = doc.get_pages();
        let page_count = pages.len();

        let mut content = String::new();
        for page_num in 1..=page_count {
            match doc.extract_text(&[page_num as u32]) {
                Ok(text) if !text.trim().is_empty() => {
                    content.push_str(&text);
                    content.push('\n');
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(page = page_num, "Failed to extract page: {}", e);
                }
            }
        }

        if content.trim().is_empty() {
            bail!("No text could be extracted from PDF");
        }

        Ok(ParsedDocument {
            content,
            page_count,
        })
    }
}

/// File-type gate for uploads: the ingest path accepts PDFs only.
pub fn is_pdf(filename: &str) -> bool {
    Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("pdf"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pdf_gate_checks_extension() {
        assert!(is_pdf("report.pdf"));
        assert!(is_pdf("REPORT.PDF"));
        assert!(!is_pdf("notes.txt"));
        assert!(!is_pdf("archive.pdf.zip"));
        assert!(!is_pdf("no_extension"));
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(PdfExtractor::extract(Path::new("/no/such/file.pdf")).is_err());
    }
}
