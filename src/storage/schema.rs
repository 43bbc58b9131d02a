//! Database schema definition

/// SQL schema for the filinglens database
pub const SCHEMA: &str = r#"
-- Normalized documents, immutable once stored
CREATE TABLE IF NOT EXISTS documents (
    document_id TEXT PRIMARY KEY,
    ticker TEXT NOT NULL,
    source_type TEXT NOT NULL,
    filing_kind TEXT,
    retrieved_at TEXT NOT NULL,
    filed_on TEXT,
    raw_text TEXT NOT NULL,
    language TEXT NOT NULL,
    format TEXT NOT NULL,
    source_path TEXT NOT NULL,
    content_hash TEXT NOT NULL UNIQUE,
    stored_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_documents_ticker ON documents(ticker);

-- Append-only record of every put, duplicates included
CREATE TABLE IF NOT EXISTS ingest_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    ticker TEXT NOT NULL,
    partition_date TEXT NOT NULL,
    document_id TEXT NOT NULL,
    content_hash TEXT NOT NULL,
    source_path TEXT NOT NULL,
    duplicate INTEGER NOT NULL DEFAULT 0,
    logged_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_ingest_log_partition ON ingest_log(ticker, partition_date);

-- Chunks keyed by span-derived id
CREATE TABLE IF NOT EXISTS chunks (
    chunk_id TEXT PRIMARY KEY,
    document_id TEXT NOT NULL,
    ordinal INTEGER NOT NULL,
    char_start INTEGER NOT NULL,
    char_end INTEGER NOT NULL,
    text TEXT NOT NULL,
    token_count INTEGER NOT NULL,
    FOREIGN KEY (document_id) REFERENCES documents(document_id)
);

CREATE INDEX IF NOT EXISTS idx_chunks_document ON chunks(document_id, ordinal);

-- One vector per (chunk, model); a new model never overwrites an old one
CREATE TABLE IF NOT EXISTS embeddings (
    chunk_id TEXT NOT NULL,
    model_id TEXT NOT NULL,
    dimension INTEGER NOT NULL,
    vector BLOB NOT NULL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (chunk_id, model_id)
);

CREATE INDEX IF NOT EXISTS idx_embeddings_model ON embeddings(model_id);

-- Build records
CREATE TABLE IF NOT EXISTS builds (
    build_id TEXT PRIMARY KEY,
    scope TEXT NOT NULL,
    state TEXT NOT NULL,
    started_at TEXT NOT NULL,
    finalized_at TEXT,
    ticker_set TEXT NOT NULL,
    config_fingerprint TEXT NOT NULL,
    abort_reason TEXT
);

CREATE INDEX IF NOT EXISTS idx_builds_scope ON builds(scope, started_at);

CREATE TABLE IF NOT EXISTS build_stages (
    build_id TEXT NOT NULL,
    stage TEXT NOT NULL,
    status TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    reason TEXT,
    notes TEXT NOT NULL,
    started_at TEXT,
    finished_at TEXT,
    PRIMARY KEY (build_id, stage),
    FOREIGN KEY (build_id) REFERENCES builds(build_id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS build_artifacts (
    build_id TEXT NOT NULL,
    name TEXT NOT NULL,
    path TEXT NOT NULL,
    PRIMARY KEY (build_id, name),
    FOREIGN KEY (build_id) REFERENCES builds(build_id) ON DELETE CASCADE
);

-- Documents and chunks each build saw
CREATE TABLE IF NOT EXISTS build_documents (
    build_id TEXT NOT NULL,
    document_id TEXT NOT NULL,
    PRIMARY KEY (build_id, document_id)
);

CREATE TABLE IF NOT EXISTS build_chunks (
    build_id TEXT NOT NULL,
    chunk_id TEXT NOT NULL,
    PRIMARY KEY (build_id, chunk_id)
);

-- Most recent successfully finalized build per scope
CREATE TABLE IF NOT EXISTS latest_builds (
    scope TEXT PRIMARY KEY,
    build_id TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
"#;
