//! Deterministic, citation-preserving chunking
//!
//! Windows are anchored on a fixed stride of `max_chunk_length - overlap`
//! characters. Inside each window the end snaps back to the last paragraph
//! (else sentence) break and the following start snaps forward to the first
//! break, but never so far that a gap opens between neighbours. Anchoring on
//! the stride keeps the chunk count a closed-form function of the length:
//!
//! ```text
//! L <= max          -> 1 chunk
//! L  > max          -> 1 + ceil((L - max) / (max - overlap)) chunks
//! ```
//!
//! Offsets are character offsets into `Document::raw_text`.

use crate::config::ChunkingConfig;
use crate::corpus::{content_hash, Document, SourceType};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// A bounded span of a document, the unit of embedding and retrieval
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub chunk_id: String,
    pub document_id: String,
    pub ordinal: usize,
    pub char_start: usize,
    pub char_end: usize,
    pub text: String,
    pub token_count: usize,
}

impl Chunk {
    /// Id derived from the document and the exact span
    pub fn make_id(document_id: &str, char_start: usize, char_end: usize) -> String {
        content_hash(&format!("{}:{}:{}", document_id, char_start, char_end))[..32].to_string()
    }

    pub fn char_len(&self) -> usize {
        self.char_end - self.char_start
    }
}

/// A chunk joined with the document fields retrieval and citations need
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourcedChunk {
    pub chunk: Chunk,
    pub ticker: String,
    pub source_type: SourceType,
    pub filing_kind: Option<String>,
    /// Explicit filing date, when the sidecar carried one
    pub filed_on: Option<NaiveDate>,
    /// Filing date, else capture date
    pub approximate_date: NaiveDate,
}

impl SourcedChunk {
    pub fn from_document(chunk: Chunk, document: &Document) -> Self {
        Self {
            chunk,
            ticker: document.ticker.clone(),
            source_type: document.source_type,
            filing_kind: document.filing_kind.clone(),
            filed_on: document.filed_on,
            approximate_date: document.approximate_date(),
        }
    }
}

/// Rough token estimate: whitespace-separated words
pub fn estimate_tokens(text: &str) -> usize {
    text.split_whitespace().count().max(1)
}

/// Splits documents into overlapping, length-bounded chunks
pub struct Chunker {
    max_len: usize,
    overlap: usize,
    min_len: usize,
}

impl Chunker {
    pub fn new(config: &ChunkingConfig) -> Self {
        let max_len = config.max_chunk_length.max(1);
        Self {
            max_len,
            overlap: config.overlap.min(max_len - 1),
            min_len: config.min_chunk_length.min(max_len),
        }
    }

    fn stride(&self) -> usize {
        self.max_len - self.overlap
    }

    /// Number of chunks a document of `len` characters produces
    pub fn expected_chunks(&self, len: usize) -> usize {
        if len == 0 {
            0
        } else if len <= self.max_len {
            1
        } else {
            1 + (len - self.max_len).div_ceil(self.stride())
        }
    }

    /// Chunk a document. Empty documents produce no chunks.
    pub fn chunk(&self, document: &Document) -> Vec<Chunk> {
        let chars: Vec<char> = document.raw_text.chars().collect();
        self.spans(&chars)
            .into_iter()
            .enumerate()
            .map(|(ordinal, (start, end))| {
                let text: String = chars[start..end].iter().collect();
                Chunk {
                    chunk_id: Chunk::make_id(&document.document_id, start, end),
                    document_id: document.document_id.clone(),
                    ordinal,
                    char_start: start,
                    char_end: end,
                    token_count: estimate_tokens(&text),
                    text,
                }
            })
            .collect()
    }

    /// Compute `[start, end)` spans over a char slice
    pub fn spans(&self, chars: &[char]) -> Vec<(usize, usize)> {
        let len = chars.len();
        if len == 0 {
            return Vec::new();
        }
        if len <= self.max_len || len <= self.min_len {
            return vec![(0, len)];
        }

        let stride = self.stride();
        let mut spans = Vec::with_capacity(self.expected_chunks(len));
        let mut start = 0usize;
        let mut i = 0usize;

        loop {
            let nominal_start = i * stride;
            let nominal_end = nominal_start + self.max_len;

            if nominal_end >= len {
                spans.push((start, len));
                break;
            }

            // The next chunk starts no earlier than (i+1)*stride, so the end
            // must stay beyond it or a gap would open.
            let floor = start.max(nominal_start + stride);
            let end = snap_back(chars, floor, nominal_end).unwrap_or(nominal_end);
            spans.push((start, end));

            i += 1;
            let next_floor = (i * stride).max(start + 1);
            start = snap_forward(chars, next_floor, end).unwrap_or(next_floor);
        }

        spans
    }
}

/// Last boundary `b` with `floor < b <= ceiling`, paragraphs preferred
fn snap_back(chars: &[char], floor: usize, ceiling: usize) -> Option<usize> {
    let paragraph = (floor + 1..=ceiling).rev().find(|&b| is_paragraph_break(chars, b));
    paragraph.or_else(|| (floor + 1..=ceiling).rev().find(|&b| is_sentence_break(chars, b)))
}

/// First boundary `b` with `floor <= b <= ceiling`, paragraphs preferred
fn snap_forward(chars: &[char], floor: usize, ceiling: usize) -> Option<usize> {
    let paragraph = (floor..=ceiling).find(|&b| is_paragraph_break(chars, b));
    paragraph.or_else(|| (floor..=ceiling).find(|&b| is_sentence_break(chars, b)))
}

/// Position right after a blank line
fn is_paragraph_break(chars: &[char], pos: usize) -> bool {
    pos >= 2 && pos < chars.len() && chars[pos - 1] == '\n' && chars[pos - 2] == '\n'
}

/// Position right after sentence punctuation and whitespace, or after a newline
fn is_sentence_break(chars: &[char], pos: usize) -> bool {
    if pos == 0 || pos >= chars.len() {
        return false;
    }
    let prev = chars[pos - 1];
    if prev == '\n' {
        return true;
    }
    pos >= 2 && prev.is_whitespace() && matches!(chars[pos - 2], '.' | '!' | '?' | ';')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::corpus::test_support::filing;

    fn chunker(max: usize, overlap: usize, min: usize) -> Chunker {
        Chunker::new(&ChunkingConfig {
            max_chunk_length: max,
            overlap,
            min_chunk_length: min,
        })
    }

    fn assert_covers(chunks: &[Chunk], len: usize, max: usize) {
        assert_eq!(chunks.first().unwrap().char_start, 0);
        assert_eq!(chunks.last().unwrap().char_end, len);
        for pair in chunks.windows(2) {
            assert!(pair[1].char_start <= pair[0].char_end, "gap between chunks");
            assert!(pair[1].char_start > pair[0].char_start);
        }
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.ordinal, i);
            assert!(chunk.char_len() <= max);
            assert_eq!(chunk.text.chars().count(), chunk.char_len());
        }
    }

    fn prose(len: usize) -> String {
        let sentence = "Revenue increased due to higher unit volumes. ";
        let mut text = String::new();
        let mut n = 0;
        while text.len() < len {
            text.push_str(sentence);
            n += 1;
            if n % 7 == 0 {
                text.push_str("\n\n");
            }
        }
        text.chars().take(len).collect()
    }

    #[test]
    fn test_fifty_thousand_char_filing() {
        let doc = filing("ACME", &prose(50_000), None);
        let chunker = chunker(2000, 200, 200);
        let chunks = chunker.chunk(&doc);

        assert_eq!(chunks.len(), 28);
        assert_eq!(chunks.len(), 50_000usize.div_ceil(2000 - 200));
        assert_eq!(chunker.expected_chunks(50_000), 28);
        assert_covers(&chunks, 50_000, 2000);
    }

    #[test]
    fn test_structureless_text_uses_fixed_windows() {
        let text = "x".repeat(5000);
        let doc = filing("ACME", &text, None);
        let chunks = chunker(1000, 100, 100).chunk(&doc);

        assert_eq!(chunks.len(), 1 + (5000 - 1000usize).div_ceil(900));
        assert_eq!((chunks[0].char_start, chunks[0].char_end), (0, 1000));
        assert_eq!((chunks[1].char_start, chunks[1].char_end), (900, 1900));
        assert_covers(&chunks, 5000, 1000);
    }

    #[test]
    fn test_boundaries_snap_to_paragraphs() {
        let para = format!("{}\n\n", "a".repeat(68));
        let text = para.repeat(10);
        let doc = filing("ACME", &text, None);
        let chunks = chunker(150, 30, 10).chunk(&doc);

        assert_covers(&chunks, text.chars().count(), 150);
        // Snap zone of the first window is (120, 150]; the break at 140 wins.
        assert_eq!(chunks[0].char_end, 140);
        assert!(chunks[0].text.ends_with("\n\n"));
        // The next start moves forward to the same paragraph break.
        assert_eq!(chunks[1].char_start, 140);
        assert!(chunks[1].text.starts_with('a'));
    }

    #[test]
    fn test_short_document_is_single_chunk() {
        let doc = filing("ACME", "Brief 8-K notice.", None);
        let chunks = chunker(2000, 200, 200).chunk(&doc);

        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].char_start, 0);
        assert_eq!(chunks[0].char_end, doc.char_len());
        assert_eq!(chunks[0].text, doc.raw_text);
    }

    #[test]
    fn test_rechunking_is_deterministic() {
        let doc = filing("ACME", &prose(12_345), None);
        let chunker = chunker(1000, 150, 100);

        let a = chunker.chunk(&doc);
        let b = chunker.chunk(&doc);
        assert_eq!(a, b);
        assert_covers(&a, 12_345, 1000);
    }

    #[test]
    fn test_lengths_across_range_keep_invariants() {
        let chunker = chunker(300, 50, 40);
        for len in [1, 39, 299, 300, 301, 550, 551, 1000, 2503] {
            let doc = filing("ACME", &prose(len), None);
            let chunks = chunker.chunk(&doc);
            assert_eq!(chunks.len(), chunker.expected_chunks(len), "len {}", len);
            assert_covers(&chunks, len, 300);
        }
    }

    #[test]
    fn test_multibyte_offsets_are_chars() {
        let text = "é".repeat(2500);
        let doc = filing("ACME", &text, None);
        let chunks = chunker(1000, 100, 100).chunk(&doc);

        assert_covers(&chunks, 2500, 1000);
        assert_eq!(chunks[0].text.chars().count(), 1000);
    }

    #[test]
    fn test_empty_document_has_no_chunks() {
        let doc = filing("ACME", "", None);
        assert!(chunker(100, 10, 10).chunk(&doc).is_empty());
    }

    #[test]
    fn test_chunk_ids_are_span_specific() {
        let a = Chunk::make_id("doc", 0, 100);
        assert_eq!(a, Chunk::make_id("doc", 0, 100));
        assert_ne!(a, Chunk::make_id("doc", 0, 101));
        assert_eq!(a.len(), 32);
    }
}
