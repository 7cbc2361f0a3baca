//! Durable local store: table snapshots, queued mutations, blobs and the
//! temporary id map, all in one SQLite file.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::db;
use crate::queue::{Mutation, MutationKind, StoredPayload};
use crate::row::{Row, RowExt};

/// Freshness of a table snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableMeta {
  pub synced_at: DateTime<Utc>,
  pub row_count: usize,
}

/// A file attached to a queued write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blob {
  pub file_name: String,
  pub content_type: String,
  pub bytes: Vec<u8>,
}

/// SQLite-backed local store.
///
/// Every multi-step change runs inside one transaction while the connection
/// lock is held, so readers never observe a half-replaced table.
pub struct LocalStore {
  conn: Mutex<Connection>,
}

impl LocalStore {
  /// Open (or create) the store at `path` and register the given tables.
  pub fn open(path: &Path, tables: &[String]) -> Result<Self> {
    let store = Self {
      conn: Mutex::new(db::open(path)?),
    };
    store.register_collections(tables)?;
    info!(path = %path.display(), tables = tables.len(), "opened local store");
    Ok(store)
  }

  /// Open an empty in-memory store.
  pub fn in_memory(tables: &[String]) -> Result<Self> {
    let store = Self {
      conn: Mutex::new(db::open_in_memory()?),
    };
    store.register_collections(tables)?;
    Ok(store)
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  /// Record table names as known collections. Existing ones are left alone.
  pub fn register_collections(&self, names: &[String]) -> Result<()> {
    let mut conn = self.lock()?;
    let tx = begin(&mut conn)?;
    for name in names {
      register_in(&tx, name)?;
    }
    commit(tx)
  }

  pub fn collections(&self) -> Result<Vec<String>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT name FROM collections ORDER BY name")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;
    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list collections: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read collection: {}", e))?;
    Ok(names)
  }

  // ==========================================================================
  // Table snapshots
  // ==========================================================================

  /// All rows of a table in snapshot order. A table that was never populated
  /// is empty, not an error.
  pub fn get_table(&self, name: &str) -> Result<Vec<Row>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT data FROM rows WHERE collection = ? ORDER BY position")
      .map_err(|e| eyre!("Failed to prepare table query: {}", e))?;

    let rows: Vec<Row> = stmt
      .query_map(params![name], |row| row.get::<_, Vec<u8>>(0))
      .map_err(|e| eyre!("Failed to query table {}: {}", name, e))?
      .filter_map(|r| r.ok())
      .filter_map(|data| match serde_json::from_slice(&data) {
        Ok(row) => Some(row),
        Err(e) => {
          warn!(table = name, error = %e, "skipping undecodable cached row");
          None
        }
      })
      .collect();

    Ok(rows)
  }

  pub fn get_row(&self, name: &str, id: &str) -> Result<Option<Row>> {
    let conn = self.lock()?;
    get_row_in(&conn, name, id)
  }

  pub fn table_meta(&self, name: &str) -> Result<Option<TableMeta>> {
    let conn = self.lock()?;
    let meta: Option<(String, i64)> = conn
      .query_row(
        "SELECT synced_at, row_count FROM table_meta WHERE collection = ?",
        params![name],
        |row| Ok((row.get(0)?, row.get(1)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read table metadata: {}", e))?;

    meta
      .map(|(synced_at, row_count)| {
        Ok(TableMeta {
          synced_at: parse_datetime(&synced_at)?,
          row_count: row_count.max(0) as usize,
        })
      })
      .transpose()
  }

  /// Replace the entire contents of a table in one transaction.
  pub fn cache_table(&self, name: &str, rows: &[Row]) -> Result<()> {
    let mut conn = self.lock()?;
    let tx = begin(&mut conn)?;

    register_in(&tx, name)?;
    tx.execute("DELETE FROM rows WHERE collection = ?", params![name])
      .map_err(|e| eyre!("Failed to clear table {}: {}", name, e))?;

    let mut stored = 0usize;
    for (position, row) in rows.iter().enumerate() {
      let Some(id) = row.row_id() else {
        warn!(table = name, "skipping row without id");
        continue;
      };
      let data = serde_json::to_vec(row).map_err(|e| eyre!("Failed to serialize row: {}", e))?;
      tx.execute(
        "INSERT OR REPLACE INTO rows (collection, row_key, position, data) VALUES (?, ?, ?, ?)",
        params![name, id.key(), position as i64, data],
      )
      .map_err(|e| eyre!("Failed to store row: {}", e))?;
      stored += 1;
    }

    tx.execute(
      "INSERT OR REPLACE INTO table_meta (collection, synced_at, row_count) VALUES (?, ?, ?)",
      params![name, Utc::now().to_rfc3339(), stored as i64],
    )
    .map_err(|e| eyre!("Failed to update table metadata: {}", e))?;

    commit(tx)?;
    debug!(table = name, rows = stored, "replaced table snapshot");
    Ok(())
  }

  /// Insert or replace a single row, keeping its position if it exists.
  pub fn upsert_row(&self, name: &str, row: &Row) -> Result<()> {
    let mut conn = self.lock()?;
    let tx = begin(&mut conn)?;
    upsert_in(&tx, name, row)?;
    commit(tx)
  }

  /// Merge `fields` into an existing row. Returns the merged row, or `None`
  /// if the row is not cached.
  pub fn merge_row(&self, name: &str, id: &str, fields: &Row) -> Result<Option<Row>> {
    let mut conn = self.lock()?;
    let tx = begin(&mut conn)?;
    let Some(mut row) = get_row_in(&tx, name, id)? else {
      return Ok(None);
    };
    for (key, value) in fields {
      row.insert(key.clone(), value.clone());
    }
    upsert_in(&tx, name, &row)?;
    commit(tx)?;
    Ok(Some(row))
  }

  pub fn delete_row(&self, name: &str, id: &str) -> Result<bool> {
    let conn = self.lock()?;
    let deleted = conn
      .execute(
        "DELETE FROM rows WHERE collection = ? AND row_key = ?",
        params![name, id],
      )
      .map_err(|e| eyre!("Failed to delete row: {}", e))?;
    Ok(deleted > 0)
  }

  /// Swap a row created offline under `temp_id` for its confirmed server row,
  /// rewrite every cached reference to the temporary id, and remember the
  /// mapping for mutations still in the queue. Returns the number of other
  /// rows whose references were rewritten.
  pub fn reconcile_pending_id(&self, name: &str, temp_id: &str, confirmed: &Row) -> Result<usize> {
    let confirmed_id = confirmed
      .row_id()
      .ok_or_else(|| eyre!("Confirmed row for {} has no id", temp_id))?;
    let confirmed_value = confirmed
      .get(crate::row::ID_FIELD)
      .cloned()
      .unwrap_or(Value::Null);

    let mut conn = self.lock()?;
    let tx = begin(&mut conn)?;

    let position: Option<i64> = tx
      .query_row(
        "SELECT position FROM rows WHERE collection = ? AND row_key = ?",
        params![name, temp_id],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up pending row: {}", e))?;
    tx.execute(
      "DELETE FROM rows WHERE collection = ? AND row_key = ?",
      params![name, temp_id],
    )
    .map_err(|e| eyre!("Failed to delete pending row: {}", e))?;

    let data = serde_json::to_vec(confirmed).map_err(|e| eyre!("Failed to serialize row: {}", e))?;
    let position = match position {
      Some(p) => p,
      None => next_position(&tx, name)?,
    };
    tx.execute(
      "INSERT OR REPLACE INTO rows (collection, row_key, position, data) VALUES (?, ?, ?, ?)",
      params![name, confirmed_id.key(), position, data],
    )
    .map_err(|e| eyre!("Failed to store confirmed row: {}", e))?;

    tx.execute(
      "INSERT OR REPLACE INTO id_map (temp_id, confirmed_id, collection, resolved_at) VALUES (?, ?, ?, ?)",
      params![temp_id, confirmed_value.to_string(), name, Utc::now().to_rfc3339()],
    )
    .map_err(|e| eyre!("Failed to record id mapping: {}", e))?;

    let rewritten = rewrite_references_in(&tx, temp_id, &confirmed_value)?;
    commit(tx)?;

    info!(
      table = name,
      temp_id,
      confirmed_id = %confirmed_id,
      rewritten,
      "reconciled offline row"
    );
    Ok(rewritten)
  }

  /// Temporary ids already resolved to server ids.
  pub fn resolved_ids(&self) -> Result<HashMap<String, Value>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT temp_id, confirmed_id FROM id_map")
      .map_err(|e| eyre!("Failed to prepare id map query: {}", e))?;
    let pairs = stmt
      .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
      .map_err(|e| eyre!("Failed to read id map: {}", e))?
      .filter_map(|r| r.ok())
      .filter_map(|(temp, confirmed)| {
        serde_json::from_str(&confirmed)
          .ok()
          .map(|value| (temp, value))
      })
      .collect();
    Ok(pairs)
  }

  // ==========================================================================
  // Blobs
  // ==========================================================================

  /// Store a blob under a generated id.
  pub fn put_blob(&self, blob: &Blob) -> Result<String> {
    let conn = self.lock()?;
    let id = uuid::Uuid::new_v4().to_string();
    insert_blob_in(&conn, &id, blob)?;
    Ok(id)
  }

  pub fn get_blob(&self, id: &str) -> Result<Option<Blob>> {
    let conn = self.lock()?;
    conn
      .query_row(
        "SELECT file_name, content_type, data FROM blobs WHERE id = ?",
        params![id],
        |row| {
          Ok(Blob {
            file_name: row.get(0)?,
            content_type: row.get(1)?,
            bytes: row.get(2)?,
          })
        },
      )
      .optional()
      .map_err(|e| eyre!("Failed to read blob {}: {}", id, e))
  }

  pub fn delete_blob(&self, id: &str) -> Result<bool> {
    let conn = self.lock()?;
    let deleted = conn
      .execute("DELETE FROM blobs WHERE id = ?", params![id])
      .map_err(|e| eyre!("Failed to delete blob {}: {}", id, e))?;
    Ok(deleted > 0)
  }

  pub fn blob_count(&self) -> Result<usize> {
    let conn = self.lock()?;
    count(&conn, "SELECT COUNT(*) FROM blobs")
  }

  // ==========================================================================
  // Mutation records (written only through MutationQueue)
  // ==========================================================================

  /// Persist a mutation together with its blobs in one transaction.
  pub(crate) fn insert_mutation(
    &self,
    table: &str,
    kind: MutationKind,
    payload: &StoredPayload,
    created_at: DateTime<Utc>,
    blobs: &[(String, Blob)],
  ) -> Result<i64> {
    let data =
      serde_json::to_vec(payload).map_err(|e| eyre!("Failed to serialize payload: {}", e))?;

    let mut conn = self.lock()?;
    let tx = begin(&mut conn)?;
    for (id, blob) in blobs {
      insert_blob_in(&tx, id, blob)?;
    }
    tx.execute(
      "INSERT INTO mutations (collection, kind, payload, created_at, attempts) VALUES (?, ?, ?, ?, 0)",
      params![table, kind.as_str(), data, created_at.to_rfc3339()],
    )
    .map_err(|e| eyre!("Failed to queue mutation: {}", e))?;
    let id = tx.last_insert_rowid();
    commit(tx)?;
    Ok(id)
  }

  /// All queued mutations in creation order.
  pub(crate) fn load_mutations(&self) -> Result<Vec<Mutation>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare(&format!("{} ORDER BY id", SELECT_MUTATION))
      .map_err(|e| eyre!("Failed to prepare queue query: {}", e))?;
    let raw = stmt
      .query_map([], raw_mutation)
      .map_err(|e| eyre!("Failed to read queue: {}", e))?
      .collect::<rusqlite::Result<Vec<RawMutation>>>()
      .map_err(|e| eyre!("Failed to read queued mutation: {}", e))?;

    raw.into_iter().map(RawMutation::into_mutation).collect()
  }

  pub(crate) fn load_mutation(&self, id: i64) -> Result<Option<Mutation>> {
    let conn = self.lock()?;
    let raw = conn
      .query_row(
        &format!("{} WHERE id = ?", SELECT_MUTATION),
        params![id],
        raw_mutation,
      )
      .optional()
      .map_err(|e| eyre!("Failed to read mutation {}: {}", id, e))?;
    raw.map(RawMutation::into_mutation).transpose()
  }

  /// Delete a mutation and the blobs it references.
  pub(crate) fn delete_mutation(&self, id: i64) -> Result<bool> {
    let mut conn = self.lock()?;
    let tx = begin(&mut conn)?;

    let payload: Option<Vec<u8>> = tx
      .query_row(
        "SELECT payload FROM mutations WHERE id = ?",
        params![id],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read mutation {}: {}", id, e))?;
    let Some(payload) = payload else {
      return Ok(false);
    };

    if let Ok(payload) = serde_json::from_slice::<StoredPayload>(&payload) {
      for blob in payload.blobs.values() {
        tx.execute("DELETE FROM blobs WHERE id = ?", params![blob.blob_id])
          .map_err(|e| eyre!("Failed to delete blob {}: {}", blob.blob_id, e))?;
      }
    }
    tx.execute("DELETE FROM mutations WHERE id = ?", params![id])
      .map_err(|e| eyre!("Failed to delete mutation {}: {}", id, e))?;

    commit(tx)?;
    Ok(true)
  }

  pub(crate) fn record_mutation_failure(
    &self,
    id: i64,
    error: &str,
    at: DateTime<Utc>,
  ) -> Result<bool> {
    let conn = self.lock()?;
    let updated = conn
      .execute(
        "UPDATE mutations SET attempts = attempts + 1, last_error = ?, last_attempt = ? WHERE id = ?",
        params![error, at.to_rfc3339(), id],
      )
      .map_err(|e| eyre!("Failed to record failure for mutation {}: {}", id, e))?;
    Ok(updated > 0)
  }

  pub(crate) fn count_mutations(&self) -> Result<usize> {
    let conn = self.lock()?;
    count(&conn, "SELECT COUNT(*) FROM mutations")
  }
}

const SELECT_MUTATION: &str = "SELECT id, collection, kind, payload, created_at, attempts, last_error, last_attempt FROM mutations";

/// Mutation columns as stored, before decoding.
struct RawMutation {
  id: i64,
  table: String,
  kind: String,
  payload: Vec<u8>,
  created_at: String,
  attempts: i64,
  last_error: Option<String>,
  last_attempt: Option<String>,
}

fn raw_mutation(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawMutation> {
  Ok(RawMutation {
    id: row.get(0)?,
    table: row.get(1)?,
    kind: row.get(2)?,
    payload: row.get(3)?,
    created_at: row.get(4)?,
    attempts: row.get(5)?,
    last_error: row.get(6)?,
    last_attempt: row.get(7)?,
  })
}

impl RawMutation {
  fn into_mutation(self) -> Result<Mutation> {
    Ok(Mutation {
      id: self.id,
      kind: self.kind.parse()?,
      payload: serde_json::from_slice(&self.payload)
        .map_err(|e| eyre!("Failed to decode mutation {} payload: {}", self.id, e))?,
      created_at: parse_datetime(&self.created_at)?,
      attempts: self.attempts.max(0) as u32,
      last_error: self.last_error,
      last_attempt: self
        .last_attempt
        .as_deref()
        .map(parse_datetime)
        .transpose()?,
      table: self.table,
    })
  }
}

fn begin(conn: &mut Connection) -> Result<Transaction<'_>> {
  conn
    .transaction()
    .map_err(|e| eyre!("Failed to begin transaction: {}", e))
}

fn commit(tx: Transaction<'_>) -> Result<()> {
  tx.commit()
    .map_err(|e| eyre!("Failed to commit transaction: {}", e))
}

fn register_in(conn: &Connection, name: &str) -> Result<()> {
  conn
    .execute(
      "INSERT OR IGNORE INTO collections (name, created_at) VALUES (?, ?)",
      params![name, Utc::now().to_rfc3339()],
    )
    .map_err(|e| eyre!("Failed to register collection {}: {}", name, e))?;
  Ok(())
}

fn get_row_in(conn: &Connection, name: &str, id: &str) -> Result<Option<Row>> {
  let data: Option<Vec<u8>> = conn
    .query_row(
      "SELECT data FROM rows WHERE collection = ? AND row_key = ?",
      params![name, id],
      |row| row.get(0),
    )
    .optional()
    .map_err(|e| eyre!("Failed to read row {} of {}: {}", id, name, e))?;

  data
    .map(|d| serde_json::from_slice(&d).map_err(|e| eyre!("Failed to decode row: {}", e)))
    .transpose()
}

fn next_position(conn: &Connection, name: &str) -> Result<i64> {
  conn
    .query_row(
      "SELECT COALESCE(MAX(position) + 1, 0) FROM rows WHERE collection = ?",
      params![name],
      |row| row.get(0),
    )
    .map_err(|e| eyre!("Failed to compute row position: {}", e))
}

fn upsert_in(conn: &Connection, name: &str, row: &Row) -> Result<()> {
  let id = row
    .row_id()
    .ok_or_else(|| eyre!("Cannot store a {} row without an id", name))?;
  let data = serde_json::to_vec(row).map_err(|e| eyre!("Failed to serialize row: {}", e))?;

  let existing: Option<i64> = conn
    .query_row(
      "SELECT position FROM rows WHERE collection = ? AND row_key = ?",
      params![name, id.key()],
      |r| r.get(0),
    )
    .optional()
    .map_err(|e| eyre!("Failed to look up row: {}", e))?;
  let position = match existing {
    Some(p) => p,
    None => next_position(conn, name)?,
  };

  register_in(conn, name)?;
  conn
    .execute(
      "INSERT OR REPLACE INTO rows (collection, row_key, position, data) VALUES (?, ?, ?, ?)",
      params![name, id.key(), position, data],
    )
    .map_err(|e| eyre!("Failed to store row: {}", e))?;
  Ok(())
}

fn rewrite_references_in(conn: &Connection, temp_id: &str, confirmed: &Value) -> Result<usize> {
  let needle = temp_id.as_bytes();
  if needle.is_empty() {
    return Ok(0);
  }
  let candidates: Vec<(String, String, Vec<u8>)> = {
    let mut stmt = conn
      .prepare("SELECT collection, row_key, data FROM rows")
      .map_err(|e| eyre!("Failed to prepare reference scan: {}", e))?;
    let all = stmt
      .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
      .map_err(|e| eyre!("Failed to scan rows: {}", e))?
      .filter_map(|r| r.ok())
      .filter(|(_, _, data): &(String, String, Vec<u8>)| {
        data.windows(needle.len()).any(|w| w == needle)
      })
      .collect();
    all
  };

  let mut rewritten = 0;
  for (collection, row_key, data) in candidates {
    let Ok(mut row) = serde_json::from_slice::<Row>(&data) else {
      continue;
    };
    if !row.replace_reference(temp_id, confirmed) {
      continue;
    }
    let data = serde_json::to_vec(&row).map_err(|e| eyre!("Failed to serialize row: {}", e))?;
    conn
      .execute(
        "UPDATE rows SET data = ? WHERE collection = ? AND row_key = ?",
        params![data, collection, row_key],
      )
      .map_err(|e| eyre!("Failed to rewrite reference: {}", e))?;
    rewritten += 1;
  }
  Ok(rewritten)
}

fn insert_blob_in(conn: &Connection, id: &str, blob: &Blob) -> Result<()> {
  conn
    .execute(
      "INSERT INTO blobs (id, file_name, content_type, data, created_at) VALUES (?, ?, ?, ?, ?)",
      params![
        id,
        blob.file_name,
        blob.content_type,
        blob.bytes,
        Utc::now().to_rfc3339()
      ],
    )
    .map_err(|e| eyre!("Failed to store blob: {}", e))?;
  Ok(())
}

fn count(conn: &Connection, sql: &str) -> Result<usize> {
  let n: i64 = conn
    .query_row(sql, [], |row| row.get(0))
    .map_err(|e| eyre!("Failed to count: {}", e))?;
  Ok(n.max(0) as usize)
}

/// Parse an RFC 3339 timestamp written by this store.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
