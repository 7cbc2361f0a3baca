//! Cache key derivation for table reads.

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::query::{Filter, OrderBy, Range, TableQuery};

/// Identity of a remote read: table plus the full query shape.
#[derive(Clone, Debug)]
pub struct QueryKey<'a> {
  table: &'a str,
  query: &'a TableQuery,
}

/// Canonical form used for hashing. Column and filter order do not change the
/// result set, so both are sorted; sort order and range do, so they are kept.
#[derive(Serialize)]
struct Canonical<'a> {
  columns: Vec<&'a str>,
  filters: Vec<String>,
  order: &'a [OrderBy],
  range: Option<Range>,
}

impl<'a> QueryKey<'a> {
  pub fn new(table: &'a str, query: &'a TableQuery) -> Self {
    Self { table, query }
  }

  /// Stable key of the form `<table>:<sha256>`. The table prefix lets write
  /// paths invalidate every cached read of a table at once.
  pub fn cache_key(&self) -> String {
    let mut columns: Vec<&str> = if self.query.is_projected() {
      self.query.columns.iter().map(|c| c.trim()).collect()
    } else {
      Vec::new()
    };
    columns.sort_unstable();
    columns.dedup();

    let mut filters: Vec<String> = self
      .query
      .filters
      .iter()
      .map(|f: &Filter| serde_json::to_string(f).unwrap_or_default())
      .collect();
    filters.sort_unstable();

    let canonical = Canonical {
      columns,
      filters,
      order: &self.query.order,
      range: self.query.range,
    };
    let input = serde_json::to_string(&canonical).unwrap_or_default();

    // SHA256 hash for stable, fixed-length keys
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    format!("{}:{}", self.table, hex::encode(hasher.finalize()))
  }
}
