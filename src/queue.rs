//! Persistent queue of writes waiting for the remote.
//!
//! `enqueue`, `remove` and `record_failure` are the only operations that
//! change queued records.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};

use crate::event::{EventBus, SyncEvent};
use crate::row::{Row, RowExt, RowId, ID_FIELD};
use crate::store::{Blob, LocalStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationKind {
  Insert,
  Update,
  Delete,
}

impl MutationKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      MutationKind::Insert => "insert",
      MutationKind::Update => "update",
      MutationKind::Delete => "delete",
    }
  }
}

impl fmt::Display for MutationKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for MutationKind {
  type Err = color_eyre::Report;

  fn from_str(s: &str) -> Result<Self> {
    match s.trim().to_lowercase().as_str() {
      "insert" => Ok(MutationKind::Insert),
      "update" => Ok(MutationKind::Update),
      "delete" => Ok(MutationKind::Delete),
      other => Err(eyre!("Unknown mutation type: {}", other)),
    }
  }
}

/// Reference to a file held in the local blob store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobRef {
  pub blob_id: String,
  pub file_name: String,
  pub content_type: String,
}

/// Payload as persisted in the queue: row fields plus blob references keyed
/// by the field the file belongs to.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoredPayload {
  pub data: Row,
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub blobs: BTreeMap<String, BlobRef>,
}

/// Payload of a write as issued by callers and sent to the remote.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WritePayload {
  pub data: Row,
  /// Files to upload, keyed by the row field that should reference them
  pub files: BTreeMap<String, Blob>,
}

impl WritePayload {
  pub fn new(data: Row) -> Self {
    Self {
      data,
      files: BTreeMap::new(),
    }
  }

  pub fn with_file(mut self, field: &str, blob: Blob) -> Self {
    self.files.insert(field.to_string(), blob);
    self
  }
}

impl From<Row> for WritePayload {
  fn from(data: Row) -> Self {
    Self::new(data)
  }
}

/// A recorded pending write.
#[derive(Debug, Clone, PartialEq)]
pub struct Mutation {
  /// Queue key; ascending ids are creation order
  pub id: i64,
  pub table: String,
  pub kind: MutationKind,
  pub payload: StoredPayload,
  pub created_at: DateTime<Utc>,
  pub attempts: u32,
  pub last_error: Option<String>,
  pub last_attempt: Option<DateTime<Utc>>,
}

impl Mutation {
  /// Id of the row this mutation writes.
  pub fn target_id(&self) -> Option<RowId> {
    self.payload.data.row_id()
  }

  pub fn has_failed(&self) -> bool {
    self.attempts > 0
  }
}

/// Handle returned for a queued write, usable for optimistic UI updates.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedHandle {
  pub mutation_id: i64,
  /// Id of the affected row; `Pending` for inserts made offline
  pub row_id: Option<RowId>,
  /// Row fields as queued (blob fields excluded)
  pub row: Row,
}

pub struct MutationQueue {
  store: Arc<LocalStore>,
  bus: EventBus,
}

impl MutationQueue {
  pub fn new(store: Arc<LocalStore>, bus: EventBus) -> Self {
    Self { store, bus }
  }

  /// Record a write for later replay.
  ///
  /// Inserts without an id get a temporary `Pending` id. Attached files move
  /// into the blob store and the queued payload keeps only references.
  pub fn enqueue(
    &self,
    table: &str,
    kind: MutationKind,
    payload: WritePayload,
  ) -> Result<QueuedHandle> {
    let WritePayload { mut data, files } = payload;

    let row_id = match (kind, data.row_id()) {
      (MutationKind::Insert, None) => {
        let pending = RowId::new_pending();
        data.insert(ID_FIELD.to_string(), pending.key().into());
        Some(pending)
      }
      (_, Some(id)) => Some(id),
      (_, None) => return Err(eyre!("{} on {} requires an id", kind, table)),
    };

    let mut blobs = Vec::with_capacity(files.len());
    let mut refs = BTreeMap::new();
    for (field, blob) in files {
      data.remove(&field);
      let blob_id = uuid::Uuid::new_v4().to_string();
      refs.insert(
        field,
        BlobRef {
          blob_id: blob_id.clone(),
          file_name: blob.file_name.clone(),
          content_type: blob.content_type.clone(),
        },
      );
      blobs.push((blob_id, blob));
    }

    let stored = StoredPayload { data, blobs: refs };
    let mutation_id = self
      .store
      .insert_mutation(table, kind, &stored, Utc::now(), &blobs)?;

    info!(table, %kind, mutation_id, blobs = blobs.len(), "queued mutation");
    self.bus.publish(SyncEvent::Queued {
      mutation_id,
      table: table.to_string(),
    });

    Ok(QueuedHandle {
      mutation_id,
      row_id,
      row: stored.data,
    })
  }

  /// All pending mutations, oldest first.
  pub fn list(&self) -> Result<Vec<Mutation>> {
    self.store.load_mutations()
  }

  pub fn get(&self, mutation_id: i64) -> Result<Option<Mutation>> {
    self.store.load_mutation(mutation_id)
  }

  /// Delete a mutation after the remote confirmed it, with its blobs.
  pub fn remove(&self, mutation_id: i64) -> Result<bool> {
    self.store.delete_mutation(mutation_id)
  }

  /// Count a failed replay attempt. The mutation stays queued.
  pub fn record_failure(&self, mutation_id: i64, error: &str) -> Result<()> {
    if !self
      .store
      .record_mutation_failure(mutation_id, error, Utc::now())?
    {
      warn!(mutation_id, "failure recorded for a mutation no longer queued");
    }
    Ok(())
  }

  pub fn pending_count(&self) -> Result<usize> {
    self.store.count_mutations()
  }

  /// Mutations that failed at least one replay.
  pub fn failed(&self) -> Result<Vec<Mutation>> {
    Ok(self.list()?.into_iter().filter(Mutation::has_failed).collect())
  }

  /// Load the files referenced by a queued mutation back into a payload.
  pub fn rehydrate(&self, mutation: &Mutation) -> Result<WritePayload> {
    let mut files = BTreeMap::new();
    for (field, blob_ref) in &mutation.payload.blobs {
      let blob = self.store.get_blob(&blob_ref.blob_id)?.ok_or_else(|| {
        eyre!(
          "Blob {} for field {} of mutation {} is missing",
          blob_ref.blob_id,
          field,
          mutation.id
        )
      })?;
      files.insert(field.clone(), blob);
    }
    Ok(WritePayload {
      data: mutation.payload.data.clone(),
      files,
    })
  }
}
