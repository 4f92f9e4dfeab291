/// Schema for the local store. Applied on every open.
pub const SCHEMA: &str = r#"
-- One row per cache generation; a version with no entries is still listed
CREATE TABLE IF NOT EXISTS cache_versions (
    tag TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Captured responses keyed by request identity within a generation
CREATE TABLE IF NOT EXISTS cache_entries (
    version TEXT NOT NULL,
    key_hash TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at INTEGER NOT NULL,
    seq INTEGER NOT NULL,
    PRIMARY KEY (version, key_hash)
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_version
    ON cache_entries(version, seq);

-- Small well-known values (offline queue, active version, subscription)
CREATE TABLE IF NOT EXISTS kv_store (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    revision INTEGER NOT NULL DEFAULT 0
);
"#;
