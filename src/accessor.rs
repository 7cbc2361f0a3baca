//! The read/write surface used by UI collaborators. Offline is an expected
//! state here: reads fall back to the local snapshot and writes are queued.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::time::Duration;
use tracing::{debug, warn};

use crate::cache::{QueryKey, RequestCache};
use crate::connectivity::ConnectivityMonitor;
use crate::query::TableQuery;
use crate::queue::{Mutation, MutationKind, MutationQueue, QueuedHandle, WritePayload};
use crate::remote::{RemoteApi, RemoteError};
use crate::row::{Row, RowExt, RowId, ID_FIELD, PENDING_PREFIX};
use crate::store::LocalStore;

/// Where the rows of a read came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadSource {
  /// Remote, or the request cache in front of it
  Remote,
  /// The local snapshot
  Local,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReadResult {
  pub rows: Vec<Row>,
  /// False whenever the rows were not freshly confirmed by the remote
  pub is_online: bool,
  pub source: ReadSource,
  /// When the table's local snapshot was last replaced from the remote
  pub synced_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
  /// Applied by the remote; carries the confirmed row when one was returned
  Confirmed(Option<Row>),
  /// Recorded for replay once connectivity returns
  Queued(QueuedHandle),
}

#[derive(Debug, thiserror::Error)]
pub enum WriteError {
  /// The remote refused the write; it was not queued
  #[error("write rejected by remote ({status}): {message}")]
  Rejected { status: u16, message: String },
  /// The write could not be queued
  #[error("failed to queue write: {0}")]
  Queue(color_eyre::Report),
}

pub struct TableAccessor {
  remote: Arc<dyn RemoteApi>,
  store: Arc<LocalStore>,
  queue: Arc<MutationQueue>,
  monitor: Arc<ConnectivityMonitor>,
  cache: RequestCache<Vec<Row>>,
  ttl: Duration,
}

impl TableAccessor {
  pub fn new(
    remote: Arc<dyn RemoteApi>,
    store: Arc<LocalStore>,
    queue: Arc<MutationQueue>,
    monitor: Arc<ConnectivityMonitor>,
    cache: RequestCache<Vec<Row>>,
    ttl: Duration,
  ) -> Self {
    Self {
      remote,
      store,
      queue,
      monitor,
      cache,
      ttl,
    }
  }

  // ==========================================================================
  // Reads
  // ==========================================================================

  /// Rows of `table` matching `query`.
  ///
  /// Online reads go through the request cache and refresh the local
  /// snapshot. Any remote failure, or being offline, serves the local
  /// snapshot evaluated with the same query instead. Only a local store
  /// failure is an error.
  pub async fn read(&self, table: &str, query: &TableQuery) -> Result<ReadResult> {
    if self.monitor.is_online() {
      match self.read_remote(table, query).await {
        Ok(rows) => {
          return Ok(ReadResult {
            rows,
            is_online: true,
            source: ReadSource::Remote,
            synced_at: self.synced_at(table),
          })
        }
        Err(e) => warn!(
          table,
          error = %format!("{:#}", e),
          "remote read failed, serving local snapshot"
        ),
      }
    }
    self.read_local(table, query)
  }

  fn read_local(&self, table: &str, query: &TableQuery) -> Result<ReadResult> {
    let rows = query.apply(self.store.get_table(table)?);
    debug!(table, rows = rows.len(), "served local snapshot");
    Ok(ReadResult {
      rows,
      is_online: false,
      source: ReadSource::Local,
      synced_at: self.synced_at(table),
    })
  }

  async fn read_remote(&self, table: &str, query: &TableQuery) -> Result<Vec<Row>> {
    let key = QueryKey::new(table, query).cache_key();
    let remote = Arc::clone(&self.remote);
    let store = Arc::clone(&self.store);
    let queue = Arc::clone(&self.queue);
    let table = table.to_string();
    let query = query.clone();

    self
      .cache
      .cached_fetch(&key, self.ttl, move || async move {
        let rows = remote
          .fetch(&table, &query)
          .await
          .map_err(|e| eyre!("Failed to fetch {}: {}", table, e))?;
        if let Err(e) = write_through(&store, &queue, &table, &query, &rows) {
          warn!(table = %table, error = %format!("{:#}", e), "failed to refresh local snapshot");
        }
        Ok(rows)
      })
      .await
  }

  fn synced_at(&self, table: &str) -> Option<DateTime<Utc>> {
    self
      .store
      .table_meta(table)
      .ok()
      .flatten()
      .map(|meta| meta.synced_at)
  }

  // ==========================================================================
  // Writes
  // ==========================================================================

  /// Apply a write remotely when online, otherwise queue it.
  ///
  /// A write the remote could not be reached for is queued as well. A write
  /// the remote rejected is returned as an error and never queued. Writes
  /// that reference rows still waiting in the queue are queued behind them.
  pub async fn write(
    &self,
    table: &str,
    kind: MutationKind,
    payload: WritePayload,
  ) -> Result<WriteOutcome, WriteError> {
    if self.monitor.is_online() && !references_pending(&payload.data) {
      let fields = payload.data.clone();
      match self.remote.mutate(table, kind, payload.clone()).await {
        Ok(confirmed) => {
          self.apply_confirmed(table, kind, &fields, confirmed.as_ref());
          self.cache.invalidate_table(table);
          return Ok(WriteOutcome::Confirmed(confirmed));
        }
        Err(RemoteError::Rejected { status, message }) => {
          return Err(WriteError::Rejected { status, message });
        }
        Err(RemoteError::Unavailable(reason)) => {
          warn!(table, %kind, %reason, "remote write failed, queuing");
        }
      }
    }

    let handle = self
      .queue
      .enqueue(table, kind, payload)
      .map_err(WriteError::Queue)?;
    self.apply_optimistic(table, kind, &handle);
    // Cached remote reads predate the write and would hide it.
    self.cache.invalidate_table(table);
    Ok(WriteOutcome::Queued(handle))
  }

  pub async fn insert(&self, table: &str, row: Row) -> Result<WriteOutcome, WriteError> {
    self.write(table, MutationKind::Insert, row.into()).await
  }

  /// Update the fields of `row`, identified by its `id`.
  pub async fn update(&self, table: &str, row: Row) -> Result<WriteOutcome, WriteError> {
    self.write(table, MutationKind::Update, row.into()).await
  }

  pub async fn delete(&self, table: &str, id: Value) -> Result<WriteOutcome, WriteError> {
    let mut row = Row::new();
    row.insert(ID_FIELD.to_string(), id);
    self.write(table, MutationKind::Delete, row.into()).await
  }

  fn apply_confirmed(&self, table: &str, kind: MutationKind, fields: &Row, confirmed: Option<&Row>) {
    let result = match (kind, confirmed) {
      (MutationKind::Insert | MutationKind::Update, Some(row)) => self.store.upsert_row(table, row),
      (MutationKind::Insert, None) => Ok(()),
      (MutationKind::Update, None) => match fields.row_id() {
        Some(id) => self.store.merge_row(table, id.key(), fields).map(|_| ()),
        None => Ok(()),
      },
      (MutationKind::Delete, _) => match fields.row_id() {
        Some(id) => self.store.delete_row(table, id.key()).map(|_| ()),
        None => Ok(()),
      },
    };
    if let Err(e) = result {
      warn!(table, %kind, error = %format!("{:#}", e), "confirmed write not applied locally");
    }
  }

  /// Reflect a queued write in the local snapshot so it shows up in reads.
  fn apply_optimistic(&self, table: &str, kind: MutationKind, handle: &QueuedHandle) {
    let result = match (kind, &handle.row_id) {
      (MutationKind::Insert, _) => self.store.upsert_row(table, &handle.row),
      (MutationKind::Update, Some(id)) => self
        .store
        .merge_row(table, id.key(), &handle.row)
        .map(|_| ()),
      (MutationKind::Delete, Some(id)) => self.store.delete_row(table, id.key()).map(|_| ()),
      (_, None) => Ok(()),
    };
    if let Err(e) = result {
      warn!(
        table,
        mutation_id = handle.mutation_id,
        error = %format!("{:#}", e),
        "optimistic update failed"
      );
    }
  }

  // ==========================================================================
  // Status
  // ==========================================================================

  pub fn pending_count(&self) -> Result<usize> {
    self.queue.pending_count()
  }

  /// Queued mutations whose replay failed at least once.
  pub fn failed_mutations(&self) -> Result<Vec<Mutation>> {
    self.queue.failed()
  }

  pub fn is_online(&self) -> bool {
    self.monitor.is_online()
  }

  pub fn is_authenticated(&self) -> bool {
    self.remote.is_authenticated()
  }
}

fn references_pending(data: &Row) -> bool {
  data.values().any(|value| match value {
    Value::String(s) => s.starts_with(PENDING_PREFIX),
    Value::Array(items) => items
      .iter()
      .any(|item| matches!(item, Value::String(s) if s.starts_with(PENDING_PREFIX))),
    _ => false,
  })
}

/// Persist the rows of a successful remote read.
///
/// A whole-table read replaces the snapshot; narrower reads upsert what they
/// returned. Writes still in the queue stay visible either way.
fn write_through(
  store: &LocalStore,
  queue: &MutationQueue,
  table: &str,
  query: &TableQuery,
  rows: &[Row],
) -> Result<()> {
  if query.is_projected() {
    // Projected rows would clobber the fields left out.
    return Ok(());
  }

  let pending: Vec<Mutation> = queue
    .list()?
    .into_iter()
    .filter(|m| m.table == table)
    .collect();
  let mut rows = rows.to_vec();
  overlay_pending(&mut rows, &pending);

  if query.is_full_table() {
    let present: HashSet<RowId> = rows.iter().filter_map(RowExt::row_id).collect();
    let offline_rows = store.get_table(table)?.into_iter().filter(|row| {
      row
        .row_id()
        .is_some_and(|id| id.is_pending() && !present.contains(&id))
    });
    rows.extend(offline_rows);
    store.cache_table(table, &rows)
  } else {
    for row in &rows {
      store.upsert_row(table, row)?;
    }
    Ok(())
  }
}

/// Re-apply queued writes, oldest first, on top of freshly fetched rows.
/// Queued inserts the remote has not returned are added.
fn overlay_pending(rows: &mut Vec<Row>, pending: &[Mutation]) {
  for mutation in pending {
    let Some(target) = mutation.target_id() else {
      continue;
    };
    match mutation.kind {
      MutationKind::Insert => {
        match rows.iter_mut().find(|r| r.row_id().as_ref() == Some(&target)) {
          Some(row) => {
            for (key, value) in &mutation.payload.data {
              row.insert(key.clone(), value.clone());
            }
          }
          None => rows.push(mutation.payload.data.clone()),
        }
      }
      MutationKind::Update => {
        for row in rows.iter_mut().filter(|r| r.row_id().as_ref() == Some(&target)) {
          for (key, value) in &mutation.payload.data {
            row.insert(key.clone(), value.clone());
          }
        }
      }
      MutationKind::Delete => rows.retain(|r| r.row_id().as_ref() != Some(&target)),
    }
  }
}
