//! In-memory request cache that deduplicates remote reads.

use color_eyre::{eyre::eyre, Result};
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tracing::debug;

type SharedFetch<V> = Shared<BoxFuture<'static, Result<V, String>>>;

struct Entry<V> {
  value: V,
  stored_at: Instant,
  ttl: Duration,
}

struct Inner<V> {
  entries: HashMap<String, Entry<V>>,
  in_flight: HashMap<String, SharedFetch<V>>,
}

/// TTL cache with request coalescing.
///
/// Entries live for the process lifetime only. Failures are never cached:
/// a failed fetch clears its in-flight marker so the next caller retries.
pub struct RequestCache<V> {
  inner: Arc<Mutex<Inner<V>>>,
}

impl<V: Clone + Send + Sync + 'static> RequestCache<V> {
  pub fn new() -> Self {
    Self {
      inner: Arc::new(Mutex::new(Inner {
        entries: HashMap::new(),
        in_flight: HashMap::new(),
      })),
    }
  }

  fn lock(&self) -> Result<MutexGuard<'_, Inner<V>>> {
    self
      .inner
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  /// Return a fresh cached value for `key`, join an in-flight fetch for it,
  /// or run `producer` and cache what it resolves to.
  pub async fn cached_fetch<F, Fut>(&self, key: &str, ttl: Duration, producer: F) -> Result<V>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<V>> + Send + 'static,
  {
    let fetch = {
      let mut inner = self.lock()?;

      if let Some(entry) = inner.entries.get(key) {
        if entry.stored_at.elapsed() < ttl {
          debug!(key, "request cache hit");
          return Ok(entry.value.clone());
        }
      }

      match inner.in_flight.get(key) {
        Some(pending) => {
          debug!(key, "joining in-flight request");
          pending.clone()
        }
        None => {
          let fut = producer();
          let shared = async move { fut.await.map_err(|e| format!("{:#}", e)) }
            .boxed()
            .shared();
          inner.in_flight.insert(key.to_string(), shared.clone());
          shared
        }
      }
    };

    let result = fetch.clone().await;

    let mut inner = self.lock()?;
    // An invalidation while the fetch was running drops the marker; a result
    // that is no longer current must not repopulate the cache.
    let current = inner
      .in_flight
      .get(key)
      .is_some_and(|pending| pending.ptr_eq(&fetch));
    if current {
      inner.in_flight.remove(key);
      if let Ok(value) = &result {
        inner.entries.insert(
          key.to_string(),
          Entry {
            value: value.clone(),
            stored_at: Instant::now(),
            ttl,
          },
        );
      }
    }

    result.map_err(|e| eyre!(e))
  }

  /// Remove entries whose key contains `pattern`, or everything when `None`.
  /// In-flight fetches for matching keys are detached so their results are
  /// not cached. Returns the number of cached entries removed.
  pub fn invalidate(&self, pattern: Option<&str>) -> usize {
    self.retain_keys(|key| pattern.is_some_and(|p| !key.contains(p)))
  }

  /// Remove every entry cached for `table`.
  pub fn invalidate_table(&self, table: &str) -> usize {
    let prefix = format!("{}:", table);
    self.retain_keys(|key| !key.starts_with(&prefix))
  }

  fn retain_keys(&self, keep: impl Fn(&str) -> bool) -> usize {
    let Ok(mut inner) = self.lock() else {
      return 0;
    };
    let before = inner.entries.len();
    inner.entries.retain(|key, _| keep(key));
    inner.in_flight.retain(|key, _| keep(key));
    let removed = before - inner.entries.len();
    if removed > 0 {
      debug!(removed, "invalidated request cache entries");
    }
    removed
  }

  /// Drop entries older than twice their TTL. Returns how many were dropped.
  pub fn sweep(&self) -> usize {
    let Ok(mut inner) = self.lock() else {
      return 0;
    };
    let before = inner.entries.len();
    inner
      .entries
      .retain(|_, entry| entry.stored_at.elapsed() <= entry.ttl * 2);
    before - inner.entries.len()
  }

  /// Run `sweep` every `every` until the returned task is aborted.
  pub fn spawn_sweeper(&self, every: Duration) -> JoinHandle<()> {
    let cache = self.clone();
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(every);
      ticker.tick().await;
      loop {
        ticker.tick().await;
        let swept = cache.sweep();
        if swept > 0 {
          debug!(swept, "request cache sweep");
        }
      }
    })
  }

  pub fn len(&self) -> usize {
    self.lock().map(|inner| inner.entries.len()).unwrap_or(0)
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

impl<V: Clone + Send + Sync + 'static> Default for RequestCache<V> {
  fn default() -> Self {
    Self::new()
  }
}

impl<V> Clone for RequestCache<V> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}
