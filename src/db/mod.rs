pub mod schema;

use color_eyre::{eyre::eyre, Result};
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};

use schema::{MIGRATIONS, SCHEMA_VERSION};

/// Open the SQLite file backing the local store.
///
/// A store at an older version is upgraded in place. A store that cannot be
/// opened or fails its integrity check is deleted and recreated empty; the
/// data loss is logged.
pub fn open(path: &Path) -> Result<Connection> {
  // Ensure parent directory exists
  if let Some(parent) = path.parent() {
    std::fs::create_dir_all(parent)
      .map_err(|e| eyre!("Failed to create store directory: {}", e))?;
  }

  match try_open(path) {
    Ok(conn) => Ok(conn),
    Err(e) => {
      error!(
        path = %path.display(),
        error = %e,
        "local store unusable, deleting and recreating it empty"
      );
      remove_store_files(path)?;
      try_open(path).map_err(|e| eyre!("Failed to recreate store at {}: {}", path.display(), e))
    }
  }
}

/// Open a fresh in-memory store.
pub fn open_in_memory() -> Result<Connection> {
  let mut conn =
    Connection::open_in_memory().map_err(|e| eyre!("Failed to open in-memory store: {}", e))?;
  migrate(&mut conn, SCHEMA_VERSION)?;
  Ok(conn)
}

/// Get the default store path.
pub fn default_path() -> Result<PathBuf> {
  let data_dir = dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .ok_or_else(|| eyre!("Could not determine data directory"))?;

  Ok(data_dir.join("schoolsync").join("store.db"))
}

fn try_open(path: &Path) -> Result<Connection> {
  let mut conn = Connection::open(path)
    .map_err(|e| eyre!("Failed to open store at {}: {}", path.display(), e))?;

  let check: String = conn
    .query_row("PRAGMA quick_check", [], |row| row.get(0))
    .map_err(|e| eyre!("Integrity check failed: {}", e))?;
  if check != "ok" {
    return Err(eyre!("Integrity check reported: {}", check));
  }

  conn
    .pragma_update(None, "journal_mode", "WAL")
    .map_err(|e| eyre!("Failed to enable WAL: {}", e))?;

  migrate(&mut conn, SCHEMA_VERSION)?;
  Ok(conn)
}

/// Current layout version of an open store.
pub fn version(conn: &Connection) -> Result<i32> {
  conn
    .query_row("PRAGMA user_version", [], |row| row.get(0))
    .map_err(|e| eyre!("Failed to read store version: {}", e))
}

/// Apply every migration above the store's version up to `target`.
pub(crate) fn migrate(conn: &mut Connection, target: i32) -> Result<()> {
  let current = version(conn)?;
  if current > SCHEMA_VERSION {
    return Err(eyre!(
      "Store version {} is newer than supported version {}",
      current,
      SCHEMA_VERSION
    ));
  }

  for migration in MIGRATIONS
    .iter()
    .filter(|m| m.version > current && m.version <= target)
  {
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin migration: {}", e))?;
    tx.execute_batch(migration.sql)
      .map_err(|e| eyre!("Migration {} failed: {}", migration.version, e))?;
    tx.pragma_update(None, "user_version", migration.version)
      .map_err(|e| eyre!("Failed to record store version: {}", e))?;
    tx.commit()
      .map_err(|e| eyre!("Failed to commit migration: {}", e))?;
    info!(
      version = migration.version,
      description = migration.description,
      "upgraded local store"
    );
  }

  debug!(from = current, to = target, "store layout up to date");
  Ok(())
}

fn remove_store_files(path: &Path) -> Result<()> {
  for suffix in ["", "-wal", "-shm", "-journal"] {
    let mut candidate = path.as_os_str().to_owned();
    candidate.push(suffix);
    let candidate = PathBuf::from(candidate);
    if candidate.exists() {
      std::fs::remove_file(&candidate)
        .map_err(|e| eyre!("Failed to delete {}: {}", candidate.display(), e))?;
    }
  }
  Ok(())
}
