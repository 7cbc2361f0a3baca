//! Versioned layout of the local store.
//!
//! Bump `SCHEMA_VERSION` and append a migration whenever the set of
//! collections changes. Migrations only ever add structure.

pub struct Migration {
  pub version: i32,
  pub description: &'static str,
  pub sql: &'static str,
}

pub const SCHEMA_VERSION: i32 = 3;

pub const MIGRATIONS: &[Migration] = &[
  Migration {
    version: 1,
    description: "table collections",
    sql: r#"
-- Known table collections (students, workers, ...)
CREATE TABLE IF NOT EXISTS collections (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL
);

-- Cached rows, one logical collection per table name
CREATE TABLE IF NOT EXISTS rows (
    collection TEXT NOT NULL,
    row_key TEXT NOT NULL,
    position INTEGER NOT NULL,
    data BLOB NOT NULL,
    PRIMARY KEY (collection, row_key)
);

CREATE INDEX IF NOT EXISTS idx_rows_position ON rows(collection, position);

-- Freshness of each table snapshot
CREATE TABLE IF NOT EXISTS table_meta (
    collection TEXT PRIMARY KEY,
    synced_at TEXT NOT NULL,
    row_count INTEGER NOT NULL
);
"#,
  },
  Migration {
    version: 2,
    description: "mutation queue",
    sql: r#"
-- Pending writes; AUTOINCREMENT keeps ids monotonic so id order is FIFO order
CREATE TABLE IF NOT EXISTS mutations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    collection TEXT NOT NULL,
    kind TEXT NOT NULL,
    payload BLOB NOT NULL,
    created_at TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    last_attempt TEXT
);
"#,
  },
  Migration {
    version: 3,
    description: "blob store and temporary id map",
    sql: r#"
-- Files attached to queued writes
CREATE TABLE IF NOT EXISTS blobs (
    id TEXT PRIMARY KEY,
    file_name TEXT NOT NULL,
    content_type TEXT NOT NULL,
    data BLOB NOT NULL,
    created_at TEXT NOT NULL
);

-- Temporary client ids resolved to server ids after an insert replays
CREATE TABLE IF NOT EXISTS id_map (
    temp_id TEXT PRIMARY KEY,
    confirmed_id TEXT NOT NULL,
    collection TEXT NOT NULL,
    resolved_at TEXT NOT NULL
);
"#,
  },
];
