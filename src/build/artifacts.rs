//! Build artifact files under `.filinglens/builds/<build_id>/`

use crate::error::Result;
use crate::retrieve::IntentRetrieval;
use crate::storage::write_atomic;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DOCUMENTS: &str = "documents.jsonl";
pub const CHUNKS: &str = "chunks.jsonl";
pub const EMBEDDINGS: &str = "embeddings.jsonl";
pub const FINANCIAL_CONTEXT: &str = "financial_context.json";
pub const INDEX: &str = "index.json";
pub const REPORT: &str = "report.md";
pub const MANIFEST: &str = "manifest.json";

pub fn retrieval_path(ticker: &str, intent: &str) -> String {
    format!("retrieval/{}/{}.json", ticker, intent)
}

pub fn context_path(ticker: &str, intent: &str) -> String {
    format!("contexts/{}/{}.json", ticker, intent)
}

pub fn generation_path(ticker: &str, intent: &str) -> String {
    format!("generation/{}/{}.json", ticker, intent)
}

/// Persisted output of the retrieve stage for one (ticker, intent)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalLog {
    pub model_id: String,
    #[serde(flatten)]
    pub retrieval: IntentRetrieval,
}

/// Outcome of one report section
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SectionStatus {
    Generated,
    Failed,
    Skipped,
}

/// Persisted output of the generate stage for one (ticker, intent)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedSection {
    pub ticker: String,
    pub intent_label: String,
    pub status: SectionStatus,
    /// False when produced without retrieved passages
    pub grounded: bool,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

impl GeneratedSection {
    pub fn is_done(&self) -> bool {
        self.status == SectionStatus::Generated
    }
}

/// Reads and atomically writes files relative to one build directory
#[derive(Debug, Clone)]
pub struct ArtifactWriter {
    dir: PathBuf,
}

impl ArtifactWriter {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, relative: &str) -> PathBuf {
        self.dir.join(relative)
    }

    pub fn exists(&self, relative: &str) -> bool {
        self.path(relative).is_file()
    }

    pub fn write_text(&self, relative: &str, contents: &str) -> Result<String> {
        write_atomic(&self.path(relative), contents.as_bytes())?;
        Ok(relative.to_string())
    }

    /// Pretty JSON with a trailing newline
    pub fn write_json<T: Serialize>(&self, relative: &str, value: &T) -> Result<String> {
        let mut json = serde_json::to_string_pretty(value)?;
        json.push('\n');
        self.write_text(relative, &json)
    }

    /// One compact JSON object per line, in iteration order
    pub fn write_jsonl<'a, T, I>(&self, relative: &str, rows: I) -> Result<String>
    where
        T: Serialize + 'a,
        I: IntoIterator<Item = &'a T>,
    {
        let mut out = String::new();
        for row in rows {
            out.push_str(&serde_json::to_string(row)?);
            out.push('\n');
        }
        self.write_text(relative, &out)
    }

    /// `Ok(None)` when the artifact was never written
    pub fn read_json<T: DeserializeOwned>(&self, relative: &str) -> Result<Option<T>> {
        let path = self.path(relative);
        if !path.is_file() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(path)?;
        Ok(Some(serde_json::from_str(&content)?))
    }
}
