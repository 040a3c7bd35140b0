use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use tracing::{debug, info};

/// Sentence terminators, Latin and CJK.
static SENTENCE_ENDINGS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[.。!?！？]\s*").unwrap());
static PARAGRAPH_SEPARATORS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n\s*\n+").unwrap());
static SPACE_RUNS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[ \t]+").unwrap());
static NEWLINE_RUNS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").unwrap());

const SENTENCE_END_CHARS: &[char] = &['.', '。', '!', '?', '！', '？'];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkStrategy {
    /// Pick a strategy from the text's shape.
    Auto,
    Fixed,
    Sentence,
    Paragraph,
    Hybrid,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChunkAnalysis {
    pub total_chunks: usize,
    pub avg_chunk_size: usize,
    pub min_chunk_size: usize,
    pub max_chunk_size: usize,
    pub total_chars: usize,
}

/// Strategy-selecting text segmenter. All sizes are measured in
/// characters, not bytes, so CJK text is sized the same as Latin text.
pub struct SmartChunker {
    chunk_size: usize,
    overlap: usize,
    min_chunk_size: usize,
    max_chunk_size: usize,
}

impl SmartChunker {
    pub fn new(chunk_size: usize, overlap: usize, min_chunk_size: usize, max_chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            overlap: overlap.min(chunk_size.saturating_sub(1)),
            min_chunk_size,
            max_chunk_size: max_chunk_size.max(chunk_size),
        }
    }

    pub fn chunk(&self, text: &str, strategy: ChunkStrategy) -> Vec<String> {
        if text.trim().is_empty() {
            return Vec::new();
        }

        let text = clean_text(text);

        let strategy = match strategy {
            ChunkStrategy::Auto => {
                let selected = self.select_strategy(&text);
                info!(strategy = ?selected, "Auto-selected chunking strategy");
                selected
            }
            other => other,
        };

        let chunks = match strategy {
            ChunkStrategy::Sentence => self.chunk_by_sentences(&text),
            ChunkStrategy::Paragraph => self.chunk_by_paragraphs(&text),
            ChunkStrategy::Hybrid => self.chunk_hybrid(&text),
            _ => self.chunk_fixed(&text),
        };

        let chunks = self.post_process(chunks);
        debug!(
            input_chars = text.chars().count(),
            chunks = chunks.len(),
            "Chunking complete"
        );
        chunks
    }

    /// Short text stays whole; clear paragraph structure wins; short
    /// sentences favor sentence accumulation; otherwise hybrid.
    fn select_strategy(&self, text: &str) -> ChunkStrategy {
        let text_len = text.chars().count();
        if text_len < 500 {
            return ChunkStrategy::Fixed;
        }

        let paragraphs: Vec<&str> = PARAGRAPH_SEPARATORS
            .split(text)
            .filter(|p| !p.trim().is_empty())
            .collect();
        if paragraphs.len() > 3 {
            let avg = paragraphs.iter().map(|p| p.chars().count()).sum::<usize>()
                / paragraphs.len();
            if avg > 300 && avg < 1500 {
                return ChunkStrategy::Paragraph;
            }
        }

        let sentences: Vec<&str> = SENTENCE_ENDINGS
            .split(text)
            .filter(|s| !s.trim().is_empty())
            .collect();
        if !sentences.is_empty() {
            let avg =
                sentences.iter().map(|s| s.chars().count()).sum::<usize>() / sentences.len();
            if avg < 200 {
                return ChunkStrategy::Sentence;
            }
        }

        ChunkStrategy::Hybrid
    }

    /// Fixed-size windows, preferring a break at a sentence end inside the
    /// trailing 100 chars, then a paragraph break, then a word boundary,
    /// then a hard cut. The next window starts `overlap` chars back.
    fn chunk_fixed(&self, text: &str) -> Vec<String> {
        let chars: Vec<char> = text.chars().collect();
        let total = chars.len();
        let mut chunks = Vec::new();
        let mut start = 0usize;

        while start < total {
            let mut end = (start + self.chunk_size).min(total);

            if end < total {
                let mut boundary = find_sentence_boundary(&chars, start, end);
                if boundary == end {
                    boundary = find_paragraph_boundary(&chars, start, end);
                }
                if boundary == end {
                    boundary = find_word_boundary(&chars, start, end);
                }
                end = boundary;
            }

            let chunk: String = chars[start..end].iter().collect();
            let chunk = chunk.trim().to_string();
            if chunk.chars().count() >= self.min_chunk_size {
                chunks.push(chunk);
            }

            if end >= total {
                break;
            }
            start = (end.saturating_sub(self.overlap)).max(start + 1);
        }

        chunks
    }

    /// Accumulate whole sentences up to the target size; overflow starts a
    /// new chunk seeded with trailing sentences worth ~`overlap` chars.
    fn chunk_by_sentences(&self, text: &str) -> Vec<String> {
        let sentences: Vec<String> = SENTENCE_ENDINGS
            .split(text)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let mut chunks = Vec::new();
        let mut current: Vec<String> = Vec::new();
        let mut current_size = 0usize;

        for sentence in sentences {
            let sent_len = sentence.chars().count();

            if sent_len > self.max_chunk_size {
                if !current.is_empty() {
                    chunks.push(current.join(" "));
                    current.clear();
                    current_size = 0;
                }
                chunks.extend(self.split_long_sentence(&sentence));
                continue;
            }

            if current_size + sent_len <= self.chunk_size {
                current.push(sentence);
                current_size += sent_len;
            } else {
                if !current.is_empty() {
                    chunks.push(current.join(" "));
                }
                let mut seeded = overlap_tail(&current, self.overlap);
                seeded.push(sentence);
                current_size = seeded.iter().map(|s| s.chars().count()).sum();
                current = seeded;
            }
        }

        if !current.is_empty() {
            chunks.push(current.join(" "));
        }
        chunks
    }

    /// Accumulate whole paragraphs; an oversize paragraph falls back to
    /// the sentence strategy.
    fn chunk_by_paragraphs(&self, text: &str) -> Vec<String> {
        let paragraphs: Vec<String> = PARAGRAPH_SEPARATORS
            .split(text)
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect();

        let mut chunks = Vec::new();
        let mut current: Vec<String> = Vec::new();
        let mut current_size = 0usize;

        for para in paragraphs {
            let para_len = para.chars().count();

            if para_len > self.max_chunk_size {
                if !current.is_empty() {
                    chunks.push(current.join("\n\n"));
                    current.clear();
                    current_size = 0;
                }
                chunks.extend(self.chunk_by_sentences(&para));
                continue;
            }

            if current_size + para_len <= self.chunk_size {
                current.push(para);
                current_size += para_len;
            } else {
                if !current.is_empty() {
                    chunks.push(current.join("\n\n"));
                }
                current_size = para_len;
                current = vec![para];
            }
        }

        if !current.is_empty() {
            chunks.push(current.join("\n\n"));
        }
        chunks
    }

    /// Paragraph first, sentence for the oversize, fixed for the very
    /// oversize.
    fn chunk_hybrid(&self, text: &str) -> Vec<String> {
        let paragraphs: Vec<String> = PARAGRAPH_SEPARATORS
            .split(text)
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect();

        let mut chunks = Vec::new();
        for para in paragraphs {
            let para_len = para.chars().count();
            if para_len <= self.chunk_size {
                chunks.push(para);
            } else if para_len <= self.max_chunk_size {
                chunks.extend(self.chunk_by_sentences(&para));
            } else {
                chunks.extend(self.chunk_fixed(&para));
            }
        }
        chunks
    }

    fn split_long_sentence(&self, sentence: &str) -> Vec<String> {
        let mut chunks = Vec::new();
        let mut current: Vec<&str> = Vec::new();
        let mut current_len = 0usize;

        for word in sentence.split_whitespace() {
            let word_len = word.chars().count() + 1;
            if current_len + word_len <= self.chunk_size {
                current.push(word);
                current_len += word_len;
            } else {
                if !current.is_empty() {
                    chunks.push(current.join(" "));
                }
                current_len = word_len;
                current = vec![word];
            }
        }

        if !current.is_empty() {
            chunks.push(current.join(" "));
        }
        chunks
    }

    fn post_process(&self, chunks: Vec<String>) -> Vec<String> {
        chunks
            .into_iter()
            .filter(|c| c.chars().count() >= self.min_chunk_size)
            .map(|c| {
                if c.chars().count() > self.max_chunk_size {
                    c.chars().take(self.max_chunk_size).collect()
                } else {
                    c
                }
            })
            .map(|c: String| c.trim().to_string())
            .collect()
    }

    pub fn analyze(&self, chunks: &[String]) -> Option<ChunkAnalysis> {
        if chunks.is_empty() {
            return None;
        }
        let lens: Vec<usize> = chunks.iter().map(|c| c.chars().count()).collect();
        let total: usize = lens.iter().sum();
        Some(ChunkAnalysis {
            total_chunks: chunks.len(),
            avg_chunk_size: total / chunks.len(),
            min_chunk_size: *lens.iter().min().unwrap(),
            max_chunk_size: *lens.iter().max().unwrap(),
            total_chars: total,
        })
    }
}

impl Default for SmartChunker {
    fn default() -> Self {
        Self::new(1000, 200, 100, 2000)
    }
}

/// Collapse runs of spaces and excess blank lines; paragraph breaks
/// (double newlines) survive.
fn clean_text(text: &str) -> String {
    let text = SPACE_RUNS.replace_all(text, " ");
    let text = NEWLINE_RUNS.replace_all(&text, "\n\n");
    text.trim().to_string()
}

/// Search the trailing 100 chars of [start, end) for a sentence terminator;
/// returns the position just past it, or `end` if none.
fn find_sentence_boundary(chars: &[char], start: usize, end: usize) -> usize {
    let search_start = start.max(end.saturating_sub(100));
    for i in (search_start..end).rev() {
        if SENTENCE_END_CHARS.contains(&chars[i]) {
            let mut boundary = i + 1;
            while boundary < end && chars[boundary].is_whitespace() {
                boundary += 1;
            }
            return boundary;
        }
    }
    end
}

fn find_paragraph_boundary(chars: &[char], start: usize, end: usize) -> usize {
    let search_start = start.max(end.saturating_sub(100));
    for i in (search_start..end.saturating_sub(1)).rev() {
        if chars[i] == '\n' && chars[i + 1] == '\n' {
            return i + 2;
        }
    }
    end
}

fn find_word_boundary(chars: &[char], start: usize, end: usize) -> usize {
    let search_start = start.max(end.saturating_sub(50));
    for i in (search_start..end).rev() {
        if chars[i] == ' ' || chars[i] == '\t' || chars[i] == '\n' {
            return i + 1;
        }
    }
    end
}

/// Trailing sentences totalling at most `target` chars, oldest first.
fn overlap_tail(sentences: &[String], target: usize) -> Vec<String> {
    let mut tail = Vec::new();
    let mut total = 0usize;
    for sentence in sentences.iter().rev() {
        let len = sentence.chars().count();
        if total + len > target {
            break;
        }
        tail.insert(0, sentence.clone());
        total += len;
    }
    tail
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunker() -> SmartChunker {
        SmartChunker::default()
    }

    #[test]
    fn empty_text_yields_nothing() {
        assert!(chunker().chunk("", ChunkStrategy::Auto).is_empty());
        assert!(chunker().chunk("   \n ", ChunkStrategy::Auto).is_empty());
    }

    #[test]
    fn short_text_stays_single_chunk() {
        let text = "A single short paragraph about nothing in particular. \
                    It has two sentences and sits well under the target size.";
        let chunks = chunker().chunk(text, ChunkStrategy::Auto);
        assert_eq!(chunks.len(), 1);
    }

    #[test]
    fn fixed_respects_target_size() {
        let sentence = "The quick brown fox jumps over the lazy dog. ";
        let text = sentence.repeat(100);
        let chunks = chunker().chunk(&text, ChunkStrategy::Fixed);

        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.chars().count() <= 2000);
        }
        // Prefer sentence-end breaks: every chunk should end with a period.
        for chunk in &chunks[..chunks.len() - 1] {
            assert!(chunk.ends_with('.'), "chunk ends mid-sentence: {:?}", chunk);
        }
    }

    #[test]
    fn fixed_windows_overlap() {
        let chunker = SmartChunker::new(100, 30, 10, 200);
        let text = "word ".repeat(100);
        let chunks = chunker.chunk(&text, ChunkStrategy::Fixed);
        assert!(chunks.len() > 2);

        // Consecutive chunks share text because the window backs off.
        let first_tail: String = chunks[0].chars().rev().take(15).collect();
        let reversed: String = first_tail.chars().rev().collect();
        assert!(chunks[1].contains(reversed.trim()));
    }

    #[test]
    fn sentence_strategy_keeps_sentences_whole() {
        let chunker = SmartChunker::new(120, 40, 10, 400);
        let text = "First sentence here. Second sentence follows. Third one lands. \
                    Fourth sentence appears. Fifth sentence closes. Sixth sentence extends. \
                    Seventh sentence continues. Eighth sentence concludes.";
        let chunks = chunker.chunk(text, ChunkStrategy::Sentence);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.chars().count() <= 400);
        }
    }

    #[test]
    fn paragraph_strategy_groups_paragraphs() {
        let chunker = SmartChunker::new(300, 50, 10, 600);
        let para = "This paragraph is about one topic and runs to a moderate length \
                    so that a few of them fill a chunk together.";
        let text = vec![para; 6].join("\n\n");
        let chunks = chunker.chunk(&text, ChunkStrategy::Paragraph);
        assert!(chunks.len() >= 2);
        assert!(chunks[0].contains("\n\n"));
    }

    #[test]
    fn oversize_sentence_splits_by_word() {
        let chunker = SmartChunker::new(100, 20, 10, 150);
        let long_sentence = format!("{} end.", "word ".repeat(80));
        let chunks = chunker.chunk(&long_sentence, ChunkStrategy::Sentence);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.chars().count() <= 150);
        }
    }

    #[test]
    fn post_process_drops_tiny_and_truncates_huge() {
        let chunker = SmartChunker::new(1000, 200, 100, 2000);
        let processed = chunker.post_process(vec![
            "tiny".to_string(),
            "x".repeat(2500),
            "y".repeat(500),
        ]);
        assert_eq!(processed.len(), 2);
        assert_eq!(processed[0].chars().count(), 2000);
    }

    #[test]
    fn cjk_sentences_are_recognized() {
        let chunker = SmartChunker::new(50, 10, 5, 100);
        let text = "今天天气很好。我们去公园散步。明天可能下雨。记得带伞。";
        let chunks = chunker.chunk(text, ChunkStrategy::Sentence);
        assert!(!chunks.is_empty());
    }

    #[test]
    fn auto_picks_paragraph_for_structured_text() {
        let para = "Lorem ipsum dolor sit amet, consectetur adipiscing elit, sed do \
                    eiusmod tempor incididunt ut labore et dolore magna aliqua. Ut enim \
                    ad minim veniam, quis nostrud exercitation ullamco laboris nisi ut \
                    aliquip ex ea commodo consequat. Duis aute irure dolor in nomine \
                    reprehenderit in voluptate velit esse cillum dolore eu fugiat nulla.";
        let text = vec![para; 5].join("\n\n");
        let chunker = chunker();
        assert_eq!(chunker.select_strategy(&clean_text(&text)), ChunkStrategy::Paragraph);
    }

    #[test]
    fn analyze_reports_shape() {
        let chunker = chunker();
        let chunks = vec!["a".repeat(100), "b".repeat(200)];
        let analysis = chunker.analyze(&chunks).unwrap();
        assert_eq!(analysis.total_chunks, 2);
        assert_eq!(analysis.avg_chunk_size, 150);
        assert_eq!(analysis.total_chars, 300);
    }
}
