//! SQLite storage layer for filinglens
//!
//! This module handles persistent storage of:
//! - Normalized documents and the append-only ingest log
//! - Chunks and their per-model embeddings
//! - Build records, stage statuses and the per-scope latest pointer

mod schema;

pub use schema::SCHEMA;

use crate::build::{BuildRecord, BuildState, StageName, StageRecord, StageStatus};
use crate::chunk::{Chunk, SourcedChunk};
use crate::corpus::{Document, DocumentFormat, SourceType};
use crate::embed::Embedding;
use crate::error::{PipelineError, Result};
use crate::index::IndexEntry;
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

/// Database connection wrapper
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open or create a database at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;

        let db = Self { conn };
        db.initialize()?;

        Ok(db)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;

        let db = Self { conn };
        db.initialize()?;

        Ok(db)
    }

    /// Initialize the database schema
    fn initialize(&self) -> Result<()> {
        self.conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        self.conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    // ==================== Documents ====================

    /// Store a document, deduplicating by content hash.
    ///
    /// Returns the id of the stored document, which is the existing id when
    /// identical content was captured before. Every call appends a row to the
    /// ingest log; stored text is never overwritten.
    pub fn put_document(&self, document: &Document) -> Result<String> {
        let tx = self.conn.unchecked_transaction()?;

        let existing: Option<String> = tx
            .query_row(
                "SELECT document_id FROM documents WHERE content_hash = ?1",
                params![document.content_hash],
                |row| row.get(0),
            )
            .optional()?;

        let (document_id, duplicate) = match existing {
            Some(id) => {
                tracing::debug!(
                    ticker = %document.ticker,
                    document_id = %id,
                    path = %document.source_path,
                    "duplicate document content, keeping stored copy"
                );
                (id, true)
            }
            None => {
                tx.execute(
                    r#"
                    INSERT INTO documents (
                        document_id, ticker, source_type, filing_kind, retrieved_at,
                        filed_on, raw_text, language, format, source_path,
                        content_hash, stored_at
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                    "#,
                    params![
                        document.document_id,
                        document.ticker,
                        document.source_type.to_string(),
                        document.filing_kind,
                        document.retrieved_at.to_rfc3339(),
                        document.filed_on.map(|d| d.to_string()),
                        document.raw_text,
                        document.language,
                        document.format.to_string(),
                        document.source_path,
                        document.content_hash,
                        Utc::now().to_rfc3339(),
                    ],
                )?;
                (document.document_id.clone(), false)
            }
        };

        tx.execute(
            r#"
            INSERT INTO ingest_log (
                ticker, partition_date, document_id, content_hash, source_path,
                duplicate, logged_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                document.ticker,
                document.retrieved_at.date_naive().to_string(),
                document_id,
                document.content_hash,
                document.source_path,
                duplicate,
                Utc::now().to_rfc3339(),
            ],
        )?;

        tx.commit()?;
        Ok(document_id)
    }

    /// Get a document by id
    pub fn get_document(&self, document_id: &str) -> Result<Document> {
        let row = self
            .conn
            .query_row(
                &format!("{} WHERE document_id = ?1", DOCUMENT_SELECT),
                params![document_id],
                DocumentRow::from_row,
            )
            .optional()?;

        row.ok_or_else(|| PipelineError::not_found("document", document_id))?
            .into_document()
    }

    /// All documents stored for a ticker, in corpus path order
    pub fn documents_for_ticker(&self, ticker: &str) -> Result<Vec<Document>> {
        let mut stmt = self.conn.prepare(&format!(
            "{} WHERE ticker = ?1 ORDER BY source_path, document_id",
            DOCUMENT_SELECT
        ))?;

        let rows = stmt.query_map(params![ticker], DocumentRow::from_row)?;

        let mut documents = Vec::new();
        for row in rows {
            documents.push(row?.into_document()?);
        }
        Ok(documents)
    }

    /// Ingest log entries of one (ticker, retrieval date) partition
    pub fn ingest_log_for(&self, ticker: &str, partition_date: NaiveDate) -> Result<Vec<IngestLogEntry>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT ticker, partition_date, document_id, content_hash, source_path,
                   duplicate, logged_at
            FROM ingest_log
            WHERE ticker = ?1 AND partition_date = ?2
            ORDER BY id
            "#,
        )?;

        let rows = stmt.query_map(params![ticker, partition_date.to_string()], |row| {
            Ok(IngestLogEntry {
                ticker: row.get(0)?,
                partition_date: row.get(1)?,
                document_id: row.get(2)?,
                content_hash: row.get(3)?,
                source_path: row.get(4)?,
                duplicate: row.get(5)?,
                logged_at: row.get(6)?,
            })
        })?;

        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    // ==================== Chunks ====================

    /// Insert chunks keyed by chunk id; existing rows are left untouched.
    /// Returns the number of new rows.
    pub fn put_chunks(&self, chunks: &[Chunk]) -> Result<usize> {
        let tx = self.conn.unchecked_transaction()?;
        let mut inserted = 0;
        {
            let mut stmt = tx.prepare(
                r#"
                INSERT OR IGNORE INTO chunks (
                    chunk_id, document_id, ordinal, char_start, char_end, text, token_count
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
            )?;
            for chunk in chunks {
                inserted += stmt.execute(params![
                    chunk.chunk_id,
                    chunk.document_id,
                    chunk.ordinal as i64,
                    chunk.char_start as i64,
                    chunk.char_end as i64,
                    chunk.text,
                    chunk.token_count as i64,
                ])?;
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    /// Get a chunk by id
    pub fn get_chunk(&self, chunk_id: &str) -> Result<Chunk> {
        self.conn
            .query_row(
                &format!("{} WHERE chunk_id = ?1", CHUNK_SELECT),
                params![chunk_id],
                chunk_from_row,
            )
            .optional()?
            .ok_or_else(|| PipelineError::not_found("chunk", chunk_id))
    }

    /// Chunks of one document in ordinal order
    pub fn chunks_for_document(&self, document_id: &str) -> Result<Vec<Chunk>> {
        let mut stmt = self.conn.prepare(&format!(
            "{} WHERE document_id = ?1 ORDER BY ordinal",
            CHUNK_SELECT
        ))?;
        let rows = stmt.query_map(params![document_id], chunk_from_row)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    // ==================== Embeddings ====================

    /// Insert embeddings keyed by (chunk_id, model_id). Vectors already
    /// stored for a pair are never overwritten. Returns the number of new rows.
    pub fn put_embeddings(&self, embeddings: &[Embedding]) -> Result<usize> {
        let tx = self.conn.unchecked_transaction()?;
        let mut inserted = 0;
        {
            let mut stmt = tx.prepare(
                r#"
                INSERT OR IGNORE INTO embeddings (chunk_id, model_id, dimension, vector, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5)
                "#,
            )?;
            let now = Utc::now().to_rfc3339();
            for embedding in embeddings {
                inserted += stmt.execute(params![
                    embedding.chunk_id,
                    embedding.model_id,
                    embedding.vector.len() as i64,
                    vector_to_blob(&embedding.vector),
                    now,
                ])?;
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    /// Get the embedding of a chunk under a model
    pub fn get_embedding(&self, chunk_id: &str, model_id: &str) -> Result<Option<Embedding>> {
        let blob: Option<Vec<u8>> = self
            .conn
            .query_row(
                "SELECT vector FROM embeddings WHERE chunk_id = ?1 AND model_id = ?2",
                params![chunk_id, model_id],
                |row| row.get(0),
            )
            .optional()?;

        Ok(blob.map(|bytes| Embedding {
            chunk_id: chunk_id.to_string(),
            model_id: model_id.to_string(),
            vector: blob_to_vector(&bytes),
        }))
    }

    /// Subset of `chunk_ids` that already have a vector under `model_id`
    pub fn embedded_chunk_ids(&self, model_id: &str, chunk_ids: &[String]) -> Result<HashSet<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT 1 FROM embeddings WHERE chunk_id = ?1 AND model_id = ?2")?;

        let mut found = HashSet::new();
        for chunk_id in chunk_ids {
            if stmt.exists(params![chunk_id, model_id])? {
                found.insert(chunk_id.clone());
            }
        }
        Ok(found)
    }

    /// Count of vectors stored under a model
    pub fn count_embeddings(&self, model_id: &str) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM embeddings WHERE model_id = ?1",
            params![model_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    // ==================== Build Membership ====================

    /// Record which documents a build ingested
    pub fn link_build_documents(&self, build_id: &str, document_ids: &[String]) -> Result<()> {
        self.link(
            "INSERT OR IGNORE INTO build_documents (build_id, document_id) VALUES (?1, ?2)",
            build_id,
            document_ids,
        )
    }

    /// Record which chunks a build produced
    pub fn link_build_chunks(&self, build_id: &str, chunk_ids: &[String]) -> Result<()> {
        self.link(
            "INSERT OR IGNORE INTO build_chunks (build_id, chunk_id) VALUES (?1, ?2)",
            build_id,
            chunk_ids,
        )
    }

    fn link(&self, sql: &str, build_id: &str, ids: &[String]) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare(sql)?;
            for id in ids {
                stmt.execute(params![build_id, id])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Documents of a build, ordered by ticker then corpus path
    pub fn build_documents(&self, build_id: &str) -> Result<Vec<Document>> {
        let mut stmt = self.conn.prepare(&format!(
            r#"{} WHERE document_id IN (
                   SELECT document_id FROM build_documents WHERE build_id = ?1
               )
               ORDER BY ticker, source_path, document_id"#,
            DOCUMENT_SELECT
        ))?;

        let rows = stmt.query_map(params![build_id], DocumentRow::from_row)?;
        let mut documents = Vec::new();
        for row in rows {
            documents.push(row?.into_document()?);
        }
        Ok(documents)
    }

    /// Chunks of a build joined with their document metadata, ordered by
    /// ticker, document and ordinal
    pub fn build_sourced_chunks(&self, build_id: &str) -> Result<Vec<SourcedChunk>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT c.chunk_id, c.document_id, c.ordinal, c.char_start, c.char_end,
                   c.text, c.token_count,
                   d.ticker, d.source_type, d.filing_kind, d.filed_on, d.retrieved_at
            FROM build_chunks bc
            JOIN chunks c ON c.chunk_id = bc.chunk_id
            JOIN documents d ON d.document_id = c.document_id
            WHERE bc.build_id = ?1
            ORDER BY d.ticker, d.source_path, c.document_id, c.ordinal
            "#,
        )?;

        let rows = stmt.query_map(params![build_id], |row| {
            Ok((
                chunk_from_row(row)?,
                row.get::<_, String>(7)?,
                row.get::<_, String>(8)?,
                row.get::<_, Option<String>>(9)?,
                row.get::<_, Option<String>>(10)?,
                row.get::<_, String>(11)?,
            ))
        })?;

        let mut sourced = Vec::new();
        for row in rows {
            let (chunk, ticker, source_type, filing_kind, filed_on, retrieved_at) = row?;
            let filed_on = filed_on.as_deref().map(parse_date).transpose()?;
            let retrieved_at = parse_time(&retrieved_at)?;
            sourced.push(SourcedChunk {
                chunk,
                ticker,
                source_type: parse_source_type(&source_type)?,
                filing_kind,
                filed_on,
                approximate_date: filed_on.unwrap_or_else(|| retrieved_at.date_naive()),
            });
        }
        Ok(sourced)
    }

    /// Vectors of a build's chunks under a model, tagged with their ticker,
    /// in chunk id order
    pub fn build_index_entries(&self, build_id: &str, model_id: &str) -> Result<Vec<IndexEntry>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT e.chunk_id, d.ticker, e.vector
            FROM build_chunks bc
            JOIN embeddings e ON e.chunk_id = bc.chunk_id AND e.model_id = ?2
            JOIN chunks c ON c.chunk_id = bc.chunk_id
            JOIN documents d ON d.document_id = c.document_id
            WHERE bc.build_id = ?1
            ORDER BY e.chunk_id
            "#,
        )?;

        let rows = stmt.query_map(params![build_id, model_id], |row| {
            let blob: Vec<u8> = row.get(2)?;
            Ok(IndexEntry {
                chunk_id: row.get(0)?,
                ticker: row.get(1)?,
                vector: blob_to_vector(&blob),
            })
        })?;

        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    // ==================== Builds ====================

    /// Persist the current state of a build. Successfully finalized builds
    /// are immutable.
    pub fn save_build(&self, record: &BuildRecord) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        write_build(&tx, record)?;
        tx.commit()?;
        Ok(())
    }

    /// Persist a finalized build and, when it has no failed stage, point the
    /// scope's latest reference at it. Both happen in one transaction, so a
    /// reader never sees a half-written build as latest.
    pub fn finalize_build(&self, record: &BuildRecord) -> Result<bool> {
        if record.state != BuildState::Finalized {
            return Err(PipelineError::InvalidState(format!(
                "build {} is {}, not finalized",
                record.build_id, record.state
            )));
        }

        let tx = self.conn.unchecked_transaction()?;
        write_build(&tx, record)?;

        let promote = record.is_successful();
        if promote {
            tx.execute(
                r#"
                INSERT INTO latest_builds (scope, build_id, updated_at) VALUES (?1, ?2, ?3)
                ON CONFLICT(scope) DO UPDATE SET
                    build_id = excluded.build_id,
                    updated_at = excluded.updated_at
                "#,
                params![record.scope, record.build_id, Utc::now().to_rfc3339()],
            )?;
        }

        tx.commit()?;
        Ok(promote)
    }

    /// Load a build record
    pub fn load_build(&self, build_id: &str) -> Result<BuildRecord> {
        let row = self
            .conn
            .query_row(
                r#"
                SELECT build_id, scope, state, started_at, finalized_at, ticker_set,
                       config_fingerprint, abort_reason
                FROM builds WHERE build_id = ?1
                "#,
                params![build_id],
                |row| {
                    Ok(BuildRow {
                        build_id: row.get(0)?,
                        scope: row.get(1)?,
                        state: row.get(2)?,
                        started_at: row.get(3)?,
                        finalized_at: row.get(4)?,
                        ticker_set: row.get(5)?,
                        config_fingerprint: row.get(6)?,
                        abort_reason: row.get(7)?,
                    })
                },
            )
            .optional()?
            .ok_or_else(|| PipelineError::not_found("build", build_id))?;

        let mut stmt = self.conn.prepare(
            r#"
            SELECT stage, status, attempts, reason, notes, started_at, finished_at
            FROM build_stages WHERE build_id = ?1
            "#,
        )?;
        let stage_rows = stmt
            .query_map(params![build_id], |row| {
                Ok(StageRow {
                    stage: row.get(0)?,
                    status: row.get(1)?,
                    attempts: row.get(2)?,
                    reason: row.get(3)?,
                    notes: row.get(4)?,
                    started_at: row.get(5)?,
                    finished_at: row.get(6)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut stmt = self
            .conn
            .prepare("SELECT name, path FROM build_artifacts WHERE build_id = ?1")?;
        let artifacts = stmt
            .query_map(params![build_id], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<BTreeMap<String, String>, _>>()?;

        row.into_record(stage_rows, artifacts)
    }

    /// All build ids, newest first
    pub fn list_builds(&self) -> Result<Vec<BuildRecord>> {
        let mut stmt = self
            .conn
            .prepare("SELECT build_id FROM builds ORDER BY started_at DESC, build_id DESC")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        ids.iter().map(|id| self.load_build(id)).collect()
    }

    /// Id of the latest successfully finalized build of a scope
    pub fn latest_build(&self, scope: &str) -> Result<Option<String>> {
        Ok(self
            .conn
            .query_row(
                "SELECT build_id FROM latest_builds WHERE scope = ?1",
                params![scope],
                |row| row.get(0),
            )
            .optional()?)
    }

    // ==================== Statistics ====================

    /// Get database statistics
    pub fn get_stats(&self) -> Result<DatabaseStats> {
        let count = |sql: &str| -> Result<usize> {
            let n: i64 = self.conn.query_row(sql, [], |row| row.get(0))?;
            Ok(n as usize)
        };

        Ok(DatabaseStats {
            documents: count("SELECT COUNT(*) FROM documents")?,
            ingest_events: count("SELECT COUNT(*) FROM ingest_log")?,
            chunks: count("SELECT COUNT(*) FROM chunks")?,
            embeddings: count("SELECT COUNT(*) FROM embeddings")?,
            builds: count("SELECT COUNT(*) FROM builds")?,
        })
    }
}

/// Database statistics
#[derive(Debug, Clone)]
pub struct DatabaseStats {
    pub documents: usize,
    pub ingest_events: usize,
    pub chunks: usize,
    pub embeddings: usize,
    pub builds: usize,
}

/// One row of the append-only ingest log
#[derive(Debug, Clone, PartialEq)]
pub struct IngestLogEntry {
    pub ticker: String,
    pub partition_date: String,
    pub document_id: String,
    pub content_hash: String,
    pub source_path: String,
    pub duplicate: bool,
    pub logged_at: String,
}

fn write_build(tx: &Transaction<'_>, record: &BuildRecord) -> Result<()> {
    let stored: Option<String> = tx
        .query_row(
            "SELECT state FROM builds WHERE build_id = ?1",
            params![record.build_id],
            |row| row.get(0),
        )
        .optional()?;
    if stored.as_deref() == Some(BuildState::Finalized.as_str()) {
        // Only finalized builds with a failed stage may be reopened
        let failed: i64 = tx.query_row(
            "SELECT COUNT(*) FROM build_stages WHERE build_id = ?1 AND status = ?2",
            params![record.build_id, StageStatus::Failed.as_str()],
            |row| row.get(0),
        )?;
        if failed == 0 {
            return Err(PipelineError::BuildFinalized(record.build_id.clone()));
        }
    }

    tx.execute(
        r#"
        INSERT INTO builds (
            build_id, scope, state, started_at, finalized_at, ticker_set,
            config_fingerprint, abort_reason
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        ON CONFLICT(build_id) DO UPDATE SET
            state = excluded.state,
            finalized_at = excluded.finalized_at,
            abort_reason = excluded.abort_reason
        "#,
        params![
            record.build_id,
            record.scope,
            record.state.as_str(),
            record.started_at.to_rfc3339(),
            record.finalized_at.map(|t| t.to_rfc3339()),
            serde_json::to_string(&record.ticker_set)?,
            record.config_fingerprint,
            record.abort_reason,
        ],
    )?;

    for (stage, stage_record) in &record.stage_statuses {
        tx.execute(
            r#"
            INSERT INTO build_stages (
                build_id, stage, status, attempts, reason, notes, started_at, finished_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(build_id, stage) DO UPDATE SET
                status = excluded.status,
                attempts = excluded.attempts,
                reason = excluded.reason,
                notes = excluded.notes,
                started_at = excluded.started_at,
                finished_at = excluded.finished_at
            "#,
            params![
                record.build_id,
                stage.as_str(),
                stage_record.status.as_str(),
                stage_record.attempts as i64,
                stage_record.reason,
                serde_json::to_string(&stage_record.notes)?,
                stage_record.started_at.map(|t| t.to_rfc3339()),
                stage_record.finished_at.map(|t| t.to_rfc3339()),
            ],
        )?;
    }

    for (name, path) in &record.artifact_paths {
        tx.execute(
            "INSERT OR REPLACE INTO build_artifacts (build_id, name, path) VALUES (?1, ?2, ?3)",
            params![record.build_id, name, path],
        )?;
    }

    Ok(())
}

/// Write a file through a sibling temp file and a rename, so readers see
/// either the old content or the new, never a torn write
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{}.tmp", file_name));
    std::fs::write(&tmp, contents)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Encode a vector as little-endian f32 bytes
pub fn vector_to_blob(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|f| f.to_le_bytes()).collect()
}

/// Decode little-endian f32 bytes
pub fn blob_to_vector(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| PipelineError::InvalidState(format!("bad timestamp '{}': {}", s, e)))
}

fn parse_date(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|e| PipelineError::InvalidState(format!("bad date '{}': {}", s, e)))
}

fn parse_source_type(s: &str) -> Result<SourceType> {
    s.parse().map_err(PipelineError::InvalidState)
}

// Internal row types for database mapping

const DOCUMENT_SELECT: &str = r#"
    SELECT document_id, ticker, source_type, filing_kind, retrieved_at, filed_on,
           raw_text, language, format, source_path, content_hash
    FROM documents"#;

const CHUNK_SELECT: &str = r#"
    SELECT chunk_id, document_id, ordinal, char_start, char_end, text, token_count
    FROM chunks"#;

fn chunk_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Chunk> {
    Ok(Chunk {
        chunk_id: row.get(0)?,
        document_id: row.get(1)?,
        ordinal: row.get::<_, i64>(2)? as usize,
        char_start: row.get::<_, i64>(3)? as usize,
        char_end: row.get::<_, i64>(4)? as usize,
        text: row.get(5)?,
        token_count: row.get::<_, i64>(6)? as usize,
    })
}

struct DocumentRow {
    document_id: String,
    ticker: String,
    source_type: String,
    filing_kind: Option<String>,
    retrieved_at: String,
    filed_on: Option<String>,
    raw_text: String,
    language: String,
    format: String,
    source_path: String,
    content_hash: String,
}

impl DocumentRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            document_id: row.get(0)?,
            ticker: row.get(1)?,
            source_type: row.get(2)?,
            filing_kind: row.get(3)?,
            retrieved_at: row.get(4)?,
            filed_on: row.get(5)?,
            raw_text: row.get(6)?,
            language: row.get(7)?,
            format: row.get(8)?,
            source_path: row.get(9)?,
            content_hash: row.get(10)?,
        })
    }

    fn into_document(self) -> Result<Document> {
        let format: DocumentFormat = self.format.parse().map_err(PipelineError::InvalidState)?;

        Ok(Document {
            document_id: self.document_id,
            ticker: self.ticker,
            source_type: parse_source_type(&self.source_type)?,
            filing_kind: self.filing_kind,
            retrieved_at: parse_time(&self.retrieved_at)?,
            filed_on: self.filed_on.as_deref().map(parse_date).transpose()?,
            raw_text: self.raw_text,
            language: self.language,
            format,
            source_path: self.source_path,
            content_hash: self.content_hash,
        })
    }
}

struct BuildRow {
    build_id: String,
    scope: String,
    state: String,
    started_at: String,
    finalized_at: Option<String>,
    ticker_set: String,
    config_fingerprint: String,
    abort_reason: Option<String>,
}

struct StageRow {
    stage: String,
    status: String,
    attempts: i64,
    reason: Option<String>,
    notes: String,
    started_at: Option<String>,
    finished_at: Option<String>,
}

impl BuildRow {
    fn into_record(
        self,
        stages: Vec<StageRow>,
        artifact_paths: BTreeMap<String, String>,
    ) -> Result<BuildRecord> {
        let mut stage_statuses = BTreeMap::new();
        for row in stages {
            let stage: StageName = row.stage.parse()?;
            stage_statuses.insert(
                stage,
                StageRecord {
                    status: StageStatus::parse(&row.status)?,
                    attempts: row.attempts as u32,
                    reason: row.reason,
                    notes: serde_json::from_str(&row.notes)?,
                    started_at: row.started_at.as_deref().map(parse_time).transpose()?,
                    finished_at: row.finished_at.as_deref().map(parse_time).transpose()?,
                },
            );
        }

        Ok(BuildRecord {
            build_id: self.build_id,
            scope: self.scope,
            started_at: parse_time(&self.started_at)?,
            finalized_at: self.finalized_at.as_deref().map(parse_time).transpose()?,
            state: BuildState::parse(&self.state)?,
            ticker_set: serde_json::from_str(&self.ticker_set)?,
            stage_statuses,
            artifact_paths,
            config_fingerprint: self.config_fingerprint,
            abort_reason: self.abort_reason,
        })
    }
}
