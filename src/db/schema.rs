/// Schema for locally persisted state.
pub const SCHEMA: &str = r#"
-- Cached form definitions
CREATE TABLE IF NOT EXISTS surveys (
    survey_id TEXT PRIMARY KEY,
    server_url TEXT NOT NULL,
    form_id TEXT NOT NULL,
    hash TEXT NOT NULL,
    form TEXT NOT NULL,
    model TEXT NOT NULL,
    manifest TEXT NOT NULL,
    media TEXT NOT NULL,
    cached_at TEXT NOT NULL
);

-- Records, including the autosave and last-saved sentinels
CREATE TABLE IF NOT EXISTS records (
    record_id TEXT PRIMARY KEY,
    survey_id TEXT NOT NULL,
    name TEXT NOT NULL,
    xml TEXT NOT NULL,
    draft INTEGER NOT NULL,
    server_url TEXT,
    ordinal INTEGER NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_records_survey ON records(survey_id, ordinal);

-- Record attachments (preserves order)
CREATE TABLE IF NOT EXISTS record_files (
    record_id TEXT NOT NULL,
    position INTEGER NOT NULL,
    name TEXT NOT NULL,
    content_type TEXT,
    data BLOB NOT NULL,
    PRIMARY KEY (record_id, position)
);

-- Intercepted response snapshots, grouped in partitions
CREATE TABLE IF NOT EXISTS cache_entries (
    partition TEXT NOT NULL,
    cache_key TEXT NOT NULL,
    survey_id TEXT,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL,
    PRIMARY KEY (partition, cache_key)
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_survey ON cache_entries(partition, survey_id);
"#;
