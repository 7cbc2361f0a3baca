//! Boundary to the hosted data API.

mod client;

pub use client::HttpRemote;

use async_trait::async_trait;

use crate::query::TableQuery;
use crate::queue::{MutationKind, WritePayload};
use crate::row::Row;

/// Failure of a remote call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
  /// Transport failure, timeout or a server-side outage. Writes that hit this
  /// are queued for replay.
  #[error("remote unavailable: {0}")]
  Unavailable(String),
  /// The remote refused the request on its merits. Never queued.
  #[error("remote rejected request ({status}): {message}")]
  Rejected { status: u16, message: String },
}

impl RemoteError {
  /// Classify a non-2xx HTTP status.
  pub fn from_status(status: u16, message: impl Into<String>) -> Self {
    let message = message.into();
    match status {
      408 | 429 | 500..=599 => RemoteError::Unavailable(format!("HTTP {}: {}", status, message)),
      _ => RemoteError::Rejected { status, message },
    }
  }

  /// True when the failure says nothing about the request itself.
  pub fn is_connectivity(&self) -> bool {
    matches!(self, RemoteError::Unavailable(_))
  }
}

/// Generic remote data API over named tables.
#[async_trait]
pub trait RemoteApi: Send + Sync {
  /// Rows of `table` matching `query`.
  async fn fetch(&self, table: &str, query: &TableQuery) -> Result<Vec<Row>, RemoteError>;

  /// Apply a write. Returns the confirmed row for inserts and updates, and the
  /// removed row (if the remote reports it) for deletes.
  async fn mutate(
    &self,
    table: &str,
    kind: MutationKind,
    payload: WritePayload,
  ) -> Result<Option<Row>, RemoteError>;

  /// Whether a user session is attached to requests.
  fn is_authenticated(&self) -> bool {
    false
  }
}
