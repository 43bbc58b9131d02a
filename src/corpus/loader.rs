//! Corpus directory loader
//!
//! Expected layout:
//!
//! ```text
//! <corpus>/<TICKER>/<source_type>/<YYYY-MM-DD>/<file>
//! <corpus>/<TICKER>/<source_type>/<YYYY-MM-DD>/<file>.meta.json
//! <corpus>/<TICKER>/metrics.json            (optional)
//! ```

use super::normalize::{normalize, parse_price_rows};
use super::{Document, DocumentFormat, FinancialContext, SourceType};
use crate::error::{PipelineError, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

const SIDECAR_SUFFIX: &str = ".meta.json";
const METRICS_FILE: &str = "metrics.json";

/// Sidecar metadata captured next to every document
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct Sidecar {
    ticker: String,
    #[serde(default)]
    source_type: Option<SourceType>,
    #[serde(default)]
    filing_kind: Option<String>,
    retrieved_at: DateTime<Utc>,
    #[serde(default)]
    filed_on: Option<NaiveDate>,
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    format: Option<DocumentFormat>,
}

/// Everything loaded for one ticker
#[derive(Debug, Clone, Default)]
pub struct LoadedTicker {
    pub ticker: String,
    pub documents: Vec<Document>,
    pub context: FinancialContext,
    /// Relative paths skipped, with the reason
    pub skipped: Vec<String>,
}

/// Reads documents for tickers from a corpus root
pub struct CorpusLoader {
    root: PathBuf,
}

impl CorpusLoader {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Load every document of a ticker in sorted path order
    pub fn load_ticker(&self, ticker: &str) -> Result<LoadedTicker> {
        let ticker_dir = self.root.join(ticker);
        let mut loaded = LoadedTicker {
            ticker: ticker.to_string(),
            context: self.load_context(&ticker_dir)?,
            ..Default::default()
        };

        if !ticker_dir.is_dir() {
            tracing::warn!(ticker, path = ?ticker_dir, "no corpus directory for ticker");
            return Ok(loaded);
        }

        for entry in WalkDir::new(&ticker_dir)
            .min_depth(1)
            .sort_by_file_name()
            .into_iter()
        {
            let entry = entry.map_err(|e| PipelineError::Io(std::io::Error::other(e)))?;
            if !entry.file_type().is_file() {
                continue;
            }

            let path = entry.path();
            let name = entry.file_name().to_string_lossy();
            if name.ends_with(SIDECAR_SUFFIX) || (entry.depth() == 1 && name == METRICS_FILE) {
                continue;
            }

            let rel = self.relative(path);
            match self.load_document(ticker, path, &rel)? {
                Ok((document, raw)) => {
                    if document.source_type == SourceType::PriceSeries
                        && document.format == DocumentFormat::Csv
                    {
                        loaded.context.absorb_price_rows(&parse_price_rows(&raw));
                    }
                    loaded.documents.push(document);
                }
                Err(reason) => {
                    tracing::warn!(ticker, path = %rel, %reason, "skipping corpus file");
                    loaded.skipped.push(format!("{}: {}", rel, reason));
                }
            }
        }

        tracing::debug!(
            ticker,
            documents = loaded.documents.len(),
            skipped = loaded.skipped.len(),
            "loaded corpus"
        );

        Ok(loaded)
    }

    /// Returns the document and its raw capture, or a skip reason
    fn load_document(
        &self,
        ticker: &str,
        path: &Path,
        rel: &str,
    ) -> Result<std::result::Result<(Document, String), String>> {
        let sidecar_path = PathBuf::from(format!("{}{}", path.display(), SIDECAR_SUFFIX));
        if !sidecar_path.exists() {
            return Ok(Err("missing sidecar metadata".to_string()));
        }

        let sidecar: Sidecar = match serde_json::from_str(&std::fs::read_to_string(&sidecar_path)?)
        {
            Ok(s) => s,
            Err(e) => return Ok(Err(format!("invalid sidecar: {}", e))),
        };

        if sidecar.ticker != ticker {
            return Ok(Err(format!(
                "sidecar ticker {} does not match directory {}",
                sidecar.ticker, ticker
            )));
        }

        let source_type = sidecar
            .source_type
            .or_else(|| self.source_type_from_path(ticker, path))
            .unwrap_or(SourceType::Filing);

        let format = sidecar.format.unwrap_or_else(|| {
            DocumentFormat::from_extension(
                path.extension().and_then(|e| e.to_str()).unwrap_or_default(),
            )
        });

        let bytes = std::fs::read(path)?;
        let raw = String::from_utf8_lossy(&bytes).into_owned();
        let text = normalize(format, &raw);
        if text.trim().is_empty() {
            return Ok(Err("empty after normalization".to_string()));
        }

        let document = Document::new(
            ticker,
            source_type,
            sidecar.filing_kind,
            sidecar.retrieved_at,
            sidecar.filed_on,
            text,
            sidecar.language.as_deref().unwrap_or("en"),
            format,
            rel,
        );

        Ok(Ok((document, raw)))
    }

    fn load_context(&self, ticker_dir: &Path) -> Result<FinancialContext> {
        let path = ticker_dir.join(METRICS_FILE);
        if !path.exists() {
            return Ok(FinancialContext::default());
        }

        let content = std::fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// `<TICKER>/<source_type>/...` names the source type
    fn source_type_from_path(&self, ticker: &str, path: &Path) -> Option<SourceType> {
        path.strip_prefix(self.root.join(ticker))
            .ok()?
            .components()
            .next()?
            .as_os_str()
            .to_str()?
            .parse()
            .ok()
    }

    fn relative(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/")
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::path::Path;

    /// Write a document and its sidecar into a corpus tree
    pub fn write_doc(
        corpus: &Path,
        ticker: &str,
        source: &str,
        date: &str,
        file: &str,
        body: &str,
        sidecar: &str,
    ) {
        let dir = corpus.join(ticker).join(source).join(date);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(file), body).unwrap();
        std::fs::write(dir.join(format!("{}.meta.json", file)), sidecar).unwrap();
    }

    pub fn filing_sidecar(ticker: &str, kind: &str, filed_on: &str) -> String {
        format!(
            r#"{{"ticker":"{}","filing_kind":"{}","retrieved_at":"2024-03-01T12:00:00Z","filed_on":"{}"}}"#,
            ticker, kind, filed_on
        )
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn test_load_ticker() {
        let dir = tempfile::tempdir().unwrap();
        let corpus = dir.path();

        write_doc(
            corpus,
            "ACME",
            "filing",
            "2024-03-01",
            "10k.md",
            "# Risk Factors\n\nSupply chain disruption.",
            &filing_sidecar("ACME", "10-K", "2024-02-15"),
        );
        write_doc(
            corpus,
            "ACME",
            "price_series",
            "2024-03-01",
            "prices.csv",
            "date,close\n2024-01-02,100\n2024-02-01,120\n",
            r#"{"ticker":"ACME","retrieved_at":"2024-03-01T12:00:00Z"}"#,
        );
        std::fs::write(
            corpus.join("ACME").join("metrics.json"),
            r#"{"company_name":"Acme Corp","fiscal_year":2023,"metrics":{"revenue_growth":0.12}}"#,
        )
        .unwrap();

        let loaded = CorpusLoader::new(corpus).load_ticker("ACME").unwrap();

        assert_eq!(loaded.documents.len(), 2);
        let filing = &loaded.documents[0];
        assert_eq!(filing.source_type, SourceType::Filing);
        assert_eq!(filing.format, DocumentFormat::Markdown);
        assert_eq!(filing.raw_text, "Risk Factors\n\nSupply chain disruption.");
        assert_eq!(filing.source_path, "ACME/filing/2024-03-01/10k.md");
        assert_eq!(loaded.documents[1].source_type, SourceType::PriceSeries);

        assert_eq!(loaded.context.company_name.as_deref(), Some("Acme Corp"));
        assert_eq!(loaded.context.metric("latest_close"), Some(120.0));
        assert_eq!(loaded.context.metric("revenue_growth"), Some(0.12));
    }

    #[test]
    fn test_skips_files_without_valid_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let corpus = dir.path();

        let orphan_dir = corpus.join("ACME").join("filing").join("2024-03-01");
        std::fs::create_dir_all(&orphan_dir).unwrap();
        std::fs::write(orphan_dir.join("orphan.txt"), "no sidecar").unwrap();

        write_doc(
            corpus,
            "ACME",
            "filing",
            "2024-03-01",
            "wrong.txt",
            "text",
            &filing_sidecar("BETA", "10-K", "2024-02-15"),
        );

        let loaded = CorpusLoader::new(corpus).load_ticker("ACME").unwrap();
        assert!(loaded.documents.is_empty());
        assert_eq!(loaded.skipped.len(), 2);
    }

    #[test]
    fn test_missing_ticker_directory_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = CorpusLoader::new(dir.path()).load_ticker("NEWCO").unwrap();
        assert!(loaded.documents.is_empty());
        assert!(loaded.context.is_empty());
    }
}
