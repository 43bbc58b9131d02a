//! Corpus documents and their normalization
//!
//! This module handles:
//! - The uniform `Document` record every downstream component reads
//! - Flattening HTML, Markdown and CSV captures into plain text
//! - Walking the on-disk corpus layout with its sidecar metadata

pub mod loader;
pub mod metrics;
pub mod normalize;

pub use loader::{CorpusLoader, LoadedTicker};
pub use metrics::FinancialContext;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Compute a stable hash for content
pub fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

/// Kind of captured source
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Filing,
    PriceSeries,
}

impl std::fmt::Display for SourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceType::Filing => write!(f, "filing"),
            SourceType::PriceSeries => write!(f, "price_series"),
        }
    }
}

impl std::str::FromStr for SourceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "filing" | "filings" => Ok(SourceType::Filing),
            "price_series" | "prices" => Ok(SourceType::PriceSeries),
            other => Err(format!("unknown source type '{}'", other)),
        }
    }
}

/// Format of the captured blob before normalization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentFormat {
    Text,
    Markdown,
    Html,
    Csv,
}

impl DocumentFormat {
    /// Guess the format from a file extension
    pub fn from_extension(ext: &str) -> Self {
        match ext.to_ascii_lowercase().as_str() {
            "htm" | "html" | "xhtml" => DocumentFormat::Html,
            "md" | "markdown" => DocumentFormat::Markdown,
            "csv" => DocumentFormat::Csv,
            _ => DocumentFormat::Text,
        }
    }
}

impl std::fmt::Display for DocumentFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DocumentFormat::Text => write!(f, "text"),
            DocumentFormat::Markdown => write!(f, "markdown"),
            DocumentFormat::Html => write!(f, "html"),
            DocumentFormat::Csv => write!(f, "csv"),
        }
    }
}

impl std::str::FromStr for DocumentFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(DocumentFormat::Text),
            "markdown" => Ok(DocumentFormat::Markdown),
            "html" => Ok(DocumentFormat::Html),
            "csv" => Ok(DocumentFormat::Csv),
            other => Err(format!("unknown document format '{}'", other)),
        }
    }
}

/// A normalized filing or price document
///
/// Immutable once stored. `raw_text` holds the normalized text every chunk
/// offset refers to; the id is derived from the ticker and that text, so a
/// re-fetch of identical content maps to the same document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub document_id: String,
    pub ticker: String,
    pub source_type: SourceType,
    /// e.g. "10-K", "10-Q", "8-K"
    pub filing_kind: Option<String>,
    pub retrieved_at: DateTime<Utc>,
    /// Filing or period date, when the sidecar provides one
    pub filed_on: Option<NaiveDate>,
    pub raw_text: String,
    pub language: String,
    pub format: DocumentFormat,
    /// Path relative to the corpus root
    pub source_path: String,
    /// Full sha256 of ticker + normalized text
    pub content_hash: String,
}

impl Document {
    /// Create a document, deriving its content hash and id
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ticker: &str,
        source_type: SourceType,
        filing_kind: Option<String>,
        retrieved_at: DateTime<Utc>,
        filed_on: Option<NaiveDate>,
        raw_text: String,
        language: &str,
        format: DocumentFormat,
        source_path: &str,
    ) -> Self {
        let content_hash = Self::hash_content(ticker, &raw_text);
        let document_id = content_hash[..32].to_string();

        Self {
            document_id,
            ticker: ticker.to_string(),
            source_type,
            filing_kind,
            retrieved_at,
            filed_on,
            raw_text,
            language: language.to_string(),
            format,
            source_path: source_path.to_string(),
            content_hash,
        }
    }

    /// Hash used for identity and deduplication
    pub fn hash_content(ticker: &str, text: &str) -> String {
        content_hash(&format!("{}\u{0}{}", ticker, text))
    }

    /// Best available date for recency and citations
    pub fn approximate_date(&self) -> NaiveDate {
        self.filed_on.unwrap_or_else(|| self.retrieved_at.date_naive())
    }

    /// Number of characters in the normalized text
    pub fn char_len(&self) -> usize {
        self.raw_text.chars().count()
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_identity() {
        let a = test_support::filing("ACME", "Revenue grew 10%.", None);
        let b = test_support::filing("ACME", "Revenue grew 10%.", Some("2024-02-01"));
        let c = test_support::filing("BETA", "Revenue grew 10%.", None);

        assert_eq!(a.document_id, b.document_id);
        assert_ne!(a.document_id, c.document_id);
        assert_eq!(a.document_id.len(), 32);
        assert_eq!(a.content_hash.len(), 64);
    }

    #[test]
    fn test_approximate_date_prefers_filing_date() {
        let dated = test_support::filing("ACME", "text", Some("2023-12-31"));
        assert_eq!(dated.approximate_date().to_string(), "2023-12-31");

        let undated = test_support::filing("ACME", "text", None);
        assert_eq!(undated.approximate_date().to_string(), "2024-03-01");
    }

    #[test]
    fn test_format_from_extension() {
        assert_eq!(DocumentFormat::from_extension("HTM"), DocumentFormat::Html);
        assert_eq!(DocumentFormat::from_extension("md"), DocumentFormat::Markdown);
        assert_eq!(DocumentFormat::from_extension("csv"), DocumentFormat::Csv);
        assert_eq!(DocumentFormat::from_extension("txt"), DocumentFormat::Text);
    }
}
