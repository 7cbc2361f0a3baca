//! Replays queued mutations against the remote once connectivity is verified.

use color_eyre::{eyre::WrapErr, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::cache::RequestCache;
use crate::config::SyncConfig;
use crate::connectivity::ConnectivityMonitor;
use crate::event::{EventBus, SyncEvent, Topic};
use crate::queue::{Mutation, MutationKind, MutationQueue};
use crate::remote::RemoteApi;
use crate::row::{Row, RowExt, RowId, ID_FIELD, PENDING_PREFIX};
use crate::store::LocalStore;

/// When a regular drain gives up on a mutation for now.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryPolicy {
  /// Regular drains skip mutations that already failed this many times.
  /// `None` retries everything on every drain.
  pub max_attempts: Option<u32>,
}

impl RetryPolicy {
  pub fn from_config(config: &SyncConfig) -> Self {
    Self {
      max_attempts: config.max_attempts,
    }
  }

  pub fn should_replay(&self, mutation: &Mutation, retry_failed: bool) -> bool {
    retry_failed
      || self
        .max_attempts
        .map_or(true, |max| mutation.attempts < max)
  }
}

/// Tally of one drain pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
  pub confirmed: usize,
  pub failed: usize,
  /// Parked by the retry policy
  pub skipped: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainOutcome {
  Completed(DrainReport),
  /// Another drain held the guard; nothing was done
  AlreadyRunning,
  /// Connectivity could not be verified; nothing was done
  Offline,
}

/// Result of replaying one mutation.
#[derive(Debug)]
enum Replay {
  Confirmed,
  /// The reason recorded against the mutation
  Failed(String),
}

/// Holds the single-drain flag for the lifetime of a pass.
struct DrainGuard<'a>(&'a AtomicBool);

impl<'a> DrainGuard<'a> {
  fn acquire(flag: &'a AtomicBool) -> Option<Self> {
    flag
      .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
      .ok()
      .map(|_| DrainGuard(flag))
  }
}

impl Drop for DrainGuard<'_> {
  fn drop(&mut self) {
    self.0.store(false, Ordering::Release);
  }
}

pub struct SyncEngine {
  remote: Arc<dyn RemoteApi>,
  store: Arc<LocalStore>,
  queue: Arc<MutationQueue>,
  monitor: Arc<ConnectivityMonitor>,
  bus: EventBus,
  cache: RequestCache<Vec<Row>>,
  mutation_timeout: Duration,
  retry_interval: Duration,
  policy: RetryPolicy,
  draining: AtomicBool,
}

impl SyncEngine {
  pub fn new(
    remote: Arc<dyn RemoteApi>,
    store: Arc<LocalStore>,
    queue: Arc<MutationQueue>,
    monitor: Arc<ConnectivityMonitor>,
    bus: EventBus,
    cache: RequestCache<Vec<Row>>,
    config: &SyncConfig,
  ) -> Self {
    Self {
      remote,
      store,
      queue,
      monitor,
      bus,
      cache,
      mutation_timeout: config.mutation_timeout(),
      retry_interval: config.retry_interval(),
      policy: RetryPolicy::from_config(config),
      draining: AtomicBool::new(false),
    }
  }

  pub fn is_draining(&self) -> bool {
    self.draining.load(Ordering::Acquire)
  }

  /// Replay every pending mutation once, oldest first, one at a time.
  ///
  /// A failed mutation records the failure and the pass moves on. A store
  /// failure while recording a failure or removing a confirmed mutation
  /// aborts the pass, so a confirmed write is never replayed twice.
  pub async fn drain(&self, retry_failed: bool) -> Result<DrainOutcome> {
    let Some(_guard) = DrainGuard::acquire(&self.draining) else {
      debug!("drain already in progress");
      return Ok(DrainOutcome::AlreadyRunning);
    };

    let mutations = self.queue.list()?;
    let mut report = DrainReport::default();
    if mutations.is_empty() {
      return Ok(DrainOutcome::Completed(report));
    }
    info!(pending = mutations.len(), retry_failed, "draining mutation queue");

    for mutation in mutations {
      if !self.policy.should_replay(&mutation, retry_failed) {
        debug!(
          mutation_id = mutation.id,
          attempts = mutation.attempts,
          "mutation parked by retry policy"
        );
        report.skipped += 1;
        continue;
      }

      match self.replay(&mutation).await? {
        Replay::Confirmed => {
          report.confirmed += 1;
          self.bus.publish(SyncEvent::Synced {
            mutation_id: mutation.id,
            table: mutation.table.clone(),
          });
        }
        Replay::Failed(reason) => {
          warn!(
            mutation_id = mutation.id,
            table = %mutation.table,
            kind = %mutation.kind,
            attempts = mutation.attempts + 1,
            error = %reason,
            "mutation replay failed"
          );
          self.queue.record_failure(mutation.id, &reason)?;
          report.failed += 1;
          self.bus.publish(SyncEvent::Queued {
            mutation_id: mutation.id,
            table: mutation.table.clone(),
          });
        }
      }
    }

    info!(
      confirmed = report.confirmed,
      failed = report.failed,
      skipped = report.skipped,
      "drain finished"
    );
    Ok(DrainOutcome::Completed(report))
  }

  /// Manual "sync now": verify connectivity, then drain. With `retry_failed`
  /// mutations parked by the retry policy are replayed too.
  pub async fn force_drain(&self, retry_failed: bool) -> Result<DrainOutcome> {
    if !self.monitor.check_real_connectivity().await {
      info!("force sync requested while offline");
      return Ok(DrainOutcome::Offline);
    }
    self.drain(retry_failed).await
  }

  /// Drain on every connectivity-restored event until the returned task is
  /// aborted. The subscription is taken before this returns.
  ///
  /// Mutations queued while already online (the remote was unavailable, or
  /// the write waited behind an offline insert) get a drain one retry
  /// interval later, since no connectivity transition will announce them.
  pub fn spawn_listener(self: &Arc<Self>) -> JoinHandle<()> {
    let mut events = self
      .bus
      .subscribe_to(&[Topic::ConnectivityRestored, Topic::Queued]);
    let engine = Arc::clone(self);
    tokio::spawn(async move {
      let mut retry_at: Option<Instant> = None;
      loop {
        tokio::select! {
          event = events.next() => match event {
            Some(SyncEvent::ConnectivityRestored) => {
              retry_at = None;
              engine.spawn_drain();
            }
            Some(SyncEvent::Queued { .. }) if retry_at.is_none() && engine.monitor.is_online() => {
              debug!(after = ?engine.retry_interval, "scheduling drain for mutations queued online");
              retry_at = Some(Instant::now() + engine.retry_interval);
            }
            Some(_) => {}
            None => break,
          },
          _ = sleep_until(retry_at.unwrap_or_else(Instant::now)), if retry_at.is_some() => {
            retry_at = None;
            if engine.monitor.is_online() {
              engine.spawn_drain();
            }
          }
        }
      }
    })
  }

  fn spawn_drain(self: &Arc<Self>) {
    let engine = Arc::clone(self);
    tokio::spawn(async move {
      if let Err(e) = engine.drain(false).await {
        error!(error = %format!("{:#}", e), "drain aborted");
      }
    });
  }

  /// Replay one mutation.
  ///
  /// Remote and payload problems come back as `Replay::Failed`. A confirmed
  /// mutation that cannot be removed from the queue is an error.
  async fn replay(&self, mutation: &Mutation) -> Result<Replay> {
    let resolved = match self.store.resolved_ids() {
      Ok(resolved) => resolved,
      Err(e) => return Ok(Replay::Failed(format!("{:#}", e))),
    };

    // An insert whose temporary id is already mapped was confirmed by an
    // earlier pass that could not dequeue it.
    if let (MutationKind::Insert, Some(RowId::Pending(temp))) =
      (mutation.kind, mutation.payload.data.row_id())
    {
      if resolved.contains_key(&temp) {
        warn!(mutation_id = mutation.id, temp_id = %temp, "insert already confirmed, dequeuing");
        self.finish(mutation)?;
        return Ok(Replay::Confirmed);
      }
    }

    let mut payload = match self.queue.rehydrate(mutation) {
      Ok(payload) => payload,
      Err(e) => return Ok(Replay::Failed(format!("{:#}", e))),
    };
    resolve_references(&mut payload.data, &resolved);

    let temp_id = match (mutation.kind, payload.data.row_id()) {
      (MutationKind::Insert, Some(RowId::Pending(temp))) => {
        payload.data.remove(ID_FIELD);
        Some(temp)
      }
      (_, Some(RowId::Pending(temp))) => {
        return Ok(Replay::Failed(format!(
          "row {} has not been created remotely yet",
          temp
        )));
      }
      _ => None,
    };
    let target = payload.data.row_id();
    let fields = payload.data.clone();

    debug!(mutation_id = mutation.id, table = %mutation.table, kind = %mutation.kind, "replaying mutation");
    let call = self.remote.mutate(&mutation.table, mutation.kind, payload);
    let confirmed = match tokio::time::timeout(self.mutation_timeout, call).await {
      Ok(Ok(row)) => row,
      Ok(Err(e)) => return Ok(Replay::Failed(e.to_string())),
      Err(_) => {
        return Ok(Replay::Failed(format!(
          "timed out after {:?}",
          self.mutation_timeout
        )))
      }
    };

    if let Err(e) = self.apply_confirmed(mutation, temp_id.as_deref(), target, &fields, confirmed) {
      warn!(
        mutation_id = mutation.id,
        error = %format!("{:#}", e),
        "confirmed mutation could not be applied locally"
      );
    }
    self.finish(mutation)?;
    Ok(Replay::Confirmed)
  }

  /// Dequeue a confirmed mutation and drop cached reads of its table.
  fn finish(&self, mutation: &Mutation) -> Result<()> {
    let removed = self.queue.remove(mutation.id);
    self.cache.invalidate_table(&mutation.table);
    removed
      .map(|_| ())
      .wrap_err_with(|| format!("Confirmed mutation {} could not be dequeued", mutation.id))
  }

  /// Bring the local snapshot in line with what the remote confirmed.
  fn apply_confirmed(
    &self,
    mutation: &Mutation,
    temp_id: Option<&str>,
    target: Option<RowId>,
    fields: &Row,
    confirmed: Option<Row>,
  ) -> Result<()> {
    let table = mutation.table.as_str();
    match (mutation.kind, confirmed) {
      (MutationKind::Insert, Some(row)) => match temp_id {
        Some(temp) => {
          self.store.reconcile_pending_id(table, temp, &row)?;
        }
        None => self.store.upsert_row(table, &row)?,
      },
      (MutationKind::Insert, None) => {
        // Without the server row the placeholder can't be reconciled; the
        // next full read brings the row in.
        if let Some(temp) = temp_id {
          self.store.delete_row(table, temp)?;
        }
      }
      (MutationKind::Update, Some(row)) => self.store.upsert_row(table, &row)?,
      (MutationKind::Update, None) => {
        if let Some(id) = target {
          self.store.merge_row(table, id.key(), fields)?;
        }
      }
      (MutationKind::Delete, _) => {
        if let Some(id) = target {
          self.store.delete_row(table, id.key())?;
        }
      }
    }
    Ok(())
  }
}

/// Swap temporary ids that have since been confirmed for their server ids.
fn resolve_references(data: &mut Row, resolved: &HashMap<String, Value>) {
  if resolved.is_empty() {
    return;
  }
  let lookup = |value: &Value| match value {
    Value::String(s) if s.starts_with(PENDING_PREFIX) => resolved.get(s.as_str()).cloned(),
    _ => None,
  };
  for value in data.values_mut() {
    if let Value::Array(items) = value {
      for item in items.iter_mut() {
        if let Some(confirmed) = lookup(item) {
          *item = confirmed;
        }
      }
    } else if let Some(confirmed) = lookup(value) {
      *value = confirmed;
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::ConnectivityConfig;
  use crate::queue::WritePayload;
  use crate::remote::RemoteError;
  use crate::row::row_from_value;
  use crate::store::Blob;
  use crate::testing::{FakeProbe, FakeRemote};
  use serde_json::json;

  struct Harness {
    engine: Arc<SyncEngine>,
    remote: Arc<FakeRemote>,
    probe: Arc<FakeProbe>,
    monitor: Arc<ConnectivityMonitor>,
    store: Arc<LocalStore>,
    queue: Arc<MutationQueue>,
    bus: EventBus,
    cache: RequestCache<Vec<Row>>,
  }

  fn harness(config: SyncConfig) -> Harness {
    let tables: Vec<String> = ["students", "workers", "attendance"]
      .into_iter()
      .map(String::from)
      .collect();
    let store = Arc::new(LocalStore::in_memory(&tables).unwrap());
    let bus = EventBus::default();
    let queue = Arc::new(MutationQueue::new(store.clone(), bus.clone()));
    let remote = Arc::new(FakeRemote::new());
    let probe = Arc::new(FakeProbe::reachable());
    let monitor = Arc::new(ConnectivityMonitor::new(
      probe.clone(),
      ConnectivityConfig {
        probe_urls: vec!["https://a.example".to_string(), "https://b.example".to_string()],
        ..ConnectivityConfig::default()
      },
      bus.clone(),
    ));
    let cache = RequestCache::new();
    let engine = Arc::new(SyncEngine::new(
      remote.clone(),
      store.clone(),
      queue.clone(),
      monitor.clone(),
      bus.clone(),
      cache.clone(),
      &config,
    ));
    Harness {
      engine,
      remote,
      probe,
      monitor,
      store,
      queue,
      bus,
      cache,
    }
  }

  fn row(value: Value) -> Row {
    row_from_value(value)
  }

  fn enqueue(h: &Harness, table: &str, kind: MutationKind, value: Value) -> i64 {
    h.queue
      .enqueue(table, kind, WritePayload::new(row(value)))
      .unwrap()
      .mutation_id
  }

  fn report(outcome: DrainOutcome) -> DrainReport {
    match outcome {
      DrainOutcome::Completed(report) => report,
      other => panic!("expected a completed drain, got {:?}", other),
    }
  }

  #[tokio::test]
  async fn test_offline_insert_replays_with_server_id() {
    let h = harness(SyncConfig::default());
    let mut synced = h.bus.subscribe_to(&[Topic::Synced]);
    let before = h.store.get_table("workers").unwrap().len();

    let mutation_id = enqueue(&h, "workers", MutationKind::Insert, json!({"name": "Jane"}));
    let list = h.queue.list().unwrap();
    assert_eq!(list.len(), 1);
    assert_eq!(list[0].kind, MutationKind::Insert);
    assert_eq!(list[0].table, "workers");

    let report = report(h.engine.drain(false).await.unwrap());
    assert_eq!(report.confirmed, 1);
    assert!(h.queue.list().unwrap().is_empty());

    let workers = h.store.get_table("workers").unwrap();
    assert_eq!(workers.len(), before + 1);
    let jane = workers.iter().find(|r| r["name"] == json!("Jane")).unwrap();
    assert_eq!(jane.row_id(), Some(RowId::Confirmed("1".to_string())));

    assert_eq!(
      synced.try_next(),
      Some(SyncEvent::Synced {
        mutation_id,
        table: "workers".to_string()
      })
    );
  }

  #[tokio::test]
  async fn test_replay_is_fifo() {
    let h = harness(SyncConfig::default());
    enqueue(&h, "students", MutationKind::Insert, json!({"id": "s1", "name": "A"}));
    enqueue(&h, "students", MutationKind::Update, json!({"id": "s1", "name": "B"}));
    enqueue(&h, "students", MutationKind::Delete, json!({"id": "s1"}));

    report(h.engine.drain(false).await.unwrap());

    let kinds: Vec<_> = h.remote.mutation_calls().iter().map(|c| c.kind).collect();
    assert_eq!(
      kinds,
      vec![
        Some(MutationKind::Insert),
        Some(MutationKind::Update),
        Some(MutationKind::Delete)
      ]
    );
    assert!(h.remote.table("students").is_empty());
    assert!(h.store.get_row("students", "s1").unwrap().is_none());
  }

  #[tokio::test]
  async fn test_one_failure_does_not_block_the_rest() {
    let h = harness(SyncConfig::default());
    h.remote.seed(
      "students",
      vec![
        row(json!({"id": "s1", "grade": 1})),
        row(json!({"id": "s2", "grade": 1})),
        row(json!({"id": "s3", "grade": 1})),
      ],
    );
    h.remote
      .fail_when("id", "s2", RemoteError::Unavailable("HTTP 500: boom".to_string()));

    enqueue(&h, "students", MutationKind::Update, json!({"id": "s1", "grade": 2}));
    let second = enqueue(&h, "students", MutationKind::Update, json!({"id": "s2", "grade": 2}));
    enqueue(&h, "students", MutationKind::Update, json!({"id": "s3", "grade": 2}));
    let mut queued = h.bus.subscribe_to(&[Topic::Queued]);

    let report = report(h.engine.drain(false).await.unwrap());
    assert_eq!(report.confirmed, 2);
    assert_eq!(report.failed, 1);

    let remaining = h.queue.list().unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id, second);
    assert_eq!(remaining[0].attempts, 1);
    assert!(remaining[0].last_error.as_deref().unwrap().contains("boom"));
    assert_eq!(
      queued.try_next(),
      Some(SyncEvent::Queued {
        mutation_id: second,
        table: "students".to_string()
      })
    );
  }

  #[tokio::test]
  async fn test_failures_are_sticky_across_drains() {
    let h = harness(SyncConfig::default());
    h.remote.fail_when(
      "name",
      "",
      RemoteError::Rejected {
        status: 400,
        message: "name must not be empty".to_string(),
      },
    );
    let id = enqueue(&h, "workers", MutationKind::Insert, json!({"name": ""}));

    report(h.engine.drain(false).await.unwrap());
    assert_eq!(h.queue.get(id).unwrap().unwrap().attempts, 1);

    report(h.engine.drain(false).await.unwrap());
    let mutation = h.queue.get(id).unwrap().unwrap();
    assert_eq!(mutation.attempts, 2);
    assert!(mutation.last_error.unwrap().contains("name must not be empty"));
    assert_eq!(h.queue.failed().unwrap().len(), 1);
  }

  #[tokio::test]
  async fn test_second_drain_is_a_noop_while_running() {
    let h = harness(SyncConfig::default());
    h.remote.set_delay(Duration::from_millis(50));
    enqueue(&h, "workers", MutationKind::Insert, json!({"name": "Jane"}));

    let (a, b) = tokio::join!(h.engine.drain(false), h.engine.drain(false));
    let outcomes = [a.unwrap(), b.unwrap()];
    assert!(outcomes.contains(&DrainOutcome::AlreadyRunning));
    assert_eq!(h.remote.mutation_calls().len(), 1);
    assert!(!h.engine.is_draining());
  }

  #[tokio::test]
  async fn test_temp_ids_are_reconciled_everywhere() {
    let h = harness(SyncConfig::default());
    let handle = h
      .queue
      .enqueue(
        "students",
        MutationKind::Insert,
        WritePayload::new(row(json!({"name": "Ana"}))),
      )
      .unwrap();
    let temp = handle.row_id.clone().unwrap();
    h.store.upsert_row("students", &handle.row).unwrap();

    enqueue(
      &h,
      "attendance",
      MutationKind::Insert,
      json!({"student_id": temp.key(), "present": true}),
    );
    enqueue(
      &h,
      "students",
      MutationKind::Update,
      json!({"id": temp.key(), "grade": 5}),
    );

    let report = report(h.engine.drain(false).await.unwrap());
    assert_eq!(report.confirmed, 3);

    let calls = h.remote.mutation_calls();
    assert!(!calls[0].data.contains_key("id"));
    assert_eq!(calls[1].data["student_id"], json!(1));
    assert_eq!(calls[2].data["id"], json!(1));

    let students = h.store.get_table("students").unwrap();
    assert_eq!(students.len(), 1);
    assert_eq!(students[0]["id"], json!(1));
    assert_eq!(students[0]["grade"], json!(5));
    let attendance = h.store.get_table("attendance").unwrap();
    assert_eq!(attendance[0]["student_id"], json!(1));
    assert_eq!(
      h.store.resolved_ids().unwrap().get(temp.key()),
      Some(&json!(1))
    );
  }

  #[tokio::test]
  async fn test_update_of_unsynced_row_fails_without_remote_call() {
    let h = harness(SyncConfig::default());
    let id = enqueue(
      &h,
      "students",
      MutationKind::Update,
      json!({"id": "local:0000", "grade": 3}),
    );

    let report = report(h.engine.drain(false).await.unwrap());
    assert_eq!(report.failed, 1);
    assert!(h.remote.mutation_calls().is_empty());
    assert_eq!(h.queue.get(id).unwrap().unwrap().attempts, 1);
  }

  #[tokio::test]
  async fn test_blobs_are_uploaded_and_released() {
    let h = harness(SyncConfig::default());
    let photo = Blob {
      file_name: "jane.png".to_string(),
      content_type: "image/png".to_string(),
      bytes: vec![0x89, 0x50, 0x4E, 0x47],
    };
    h.queue
      .enqueue(
        "workers",
        MutationKind::Insert,
        WritePayload::new(row(json!({"name": "Jane"}))).with_file("photo", photo),
      )
      .unwrap();
    assert_eq!(h.store.blob_count().unwrap(), 1);

    report(h.engine.drain(false).await.unwrap());

    let calls = h.remote.mutation_calls();
    assert_eq!(calls[0].files, vec!["photo".to_string()]);
    let workers = h.store.get_table("workers").unwrap();
    assert_eq!(workers[0]["photo"], json!("workers/jane.png"));
    assert_eq!(h.store.blob_count().unwrap(), 0);
  }

  #[tokio::test]
  async fn test_retry_policy_parks_until_forced() {
    let h = harness(SyncConfig {
      max_attempts: Some(1),
      ..SyncConfig::default()
    });
    h.remote.set_online(false);
    let id = enqueue(&h, "workers", MutationKind::Insert, json!({"name": "Jane"}));

    assert_eq!(report(h.engine.drain(false).await.unwrap()).failed, 1);
    h.remote.set_online(true);

    let parked = report(h.engine.drain(false).await.unwrap());
    assert_eq!(parked.skipped, 1);
    assert!(h.remote.mutation_calls().is_empty());
    assert!(h.queue.get(id).unwrap().is_some());

    let forced = report(h.engine.force_drain(true).await.unwrap());
    assert_eq!(forced.confirmed, 1);
    assert!(h.queue.list().unwrap().is_empty());
  }

  #[tokio::test(start_paused = true)]
  async fn test_hung_mutation_times_out() {
    let h = harness(SyncConfig {
      mutation_timeout_secs: Some(2),
      ..SyncConfig::default()
    });
    h.remote.hang_when("name", "slow");
    let slow = enqueue(&h, "workers", MutationKind::Insert, json!({"name": "slow"}));
    enqueue(&h, "workers", MutationKind::Insert, json!({"name": "fast"}));

    let report = report(h.engine.drain(false).await.unwrap());
    assert_eq!(report.failed, 1);
    assert_eq!(report.confirmed, 1);
    let mutation = h.queue.get(slow).unwrap().unwrap();
    assert!(mutation.last_error.unwrap().contains("timed out"));
  }

  #[tokio::test]
  async fn test_force_drain_requires_connectivity() {
    let h = harness(SyncConfig::default());
    h.probe.set_reachable(false);
    enqueue(&h, "workers", MutationKind::Insert, json!({"name": "Jane"}));

    assert_eq!(
      h.engine.force_drain(false).await.unwrap(),
      DrainOutcome::Offline
    );
    assert_eq!(h.queue.pending_count().unwrap(), 1);
    assert!(h.remote.mutation_calls().is_empty());
  }

  #[tokio::test]
  async fn test_confirmed_mutation_invalidates_cached_reads() {
    let h = harness(SyncConfig::default());
    h.cache
      .cached_fetch("students:abc", Duration::from_secs(30), || async {
        Ok(Vec::new())
      })
      .await
      .unwrap();
    h.cache
      .cached_fetch("workers:abc", Duration::from_secs(30), || async {
        Ok(Vec::new())
      })
      .await
      .unwrap();

    enqueue(&h, "students", MutationKind::Insert, json!({"name": "Ana"}));
    report(h.engine.drain(false).await.unwrap());

    assert_eq!(h.cache.len(), 1);
  }

  #[tokio::test]
  async fn test_listener_drains_on_connectivity_restored() {
    let h = harness(SyncConfig::default());
    let task = h.engine.spawn_listener();

    enqueue(&h, "workers", MutationKind::Insert, json!({"name": "Jane"}));
    let mut synced = h.bus.subscribe_to(&[Topic::Synced]);
    h.bus.publish(SyncEvent::ConnectivityRestored);

    let event = tokio::time::timeout(Duration::from_secs(5), synced.next())
      .await
      .unwrap();
    assert!(matches!(event, Some(SyncEvent::Synced { .. })));
    assert!(h.queue.list().unwrap().is_empty());

    task.abort();
  }

  #[tokio::test(start_paused = true)]
  async fn test_listener_retries_mutations_queued_while_online() {
    let h = harness(SyncConfig {
      retry_interval_secs: Some(10),
      ..SyncConfig::default()
    });
    assert!(h.monitor.check_real_connectivity().await);
    let task = h.engine.spawn_listener();
    let mut synced = h.bus.subscribe_to(&[Topic::Synced]);

    // Queued after a direct write hit an unavailable remote; no transition follows.
    enqueue(&h, "workers", MutationKind::Insert, json!({"name": "Jane"}));
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(h.queue.pending_count().unwrap(), 1);

    let event = tokio::time::timeout(Duration::from_secs(30), synced.next())
      .await
      .unwrap();
    assert!(matches!(event, Some(SyncEvent::Synced { .. })));
    assert!(h.queue.list().unwrap().is_empty());
    assert_eq!(h.remote.table("workers").len(), 1);

    task.abort();
  }

  #[tokio::test(start_paused = true)]
  async fn test_listener_ignores_mutations_queued_offline() {
    let h = harness(SyncConfig {
      retry_interval_secs: Some(10),
      ..SyncConfig::default()
    });
    let task = h.engine.spawn_listener();

    enqueue(&h, "workers", MutationKind::Insert, json!({"name": "Jane"}));
    tokio::time::sleep(Duration::from_secs(60)).await;

    assert_eq!(h.queue.pending_count().unwrap(), 1);
    assert!(h.remote.mutation_calls().is_empty());

    task.abort();
  }

  #[tokio::test]
  async fn test_confirmed_insert_still_queued_is_not_sent_again() {
    let h = harness(SyncConfig::default());
    let handle = h
      .queue
      .enqueue(
        "workers",
        MutationKind::Insert,
        WritePayload::new(row(json!({"name": "Jane"}))),
      )
      .unwrap();
    let temp = handle.row_id.clone().unwrap();
    h.store.upsert_row("workers", &handle.row).unwrap();
    // Confirmed and mapped by an earlier pass that stopped before dequeuing.
    h.store
      .reconcile_pending_id("workers", temp.key(), &row(json!({"id": 41, "name": "Jane"})))
      .unwrap();

    let report = report(h.engine.drain(false).await.unwrap());
    assert_eq!(report.confirmed, 1);
    assert!(h.remote.mutation_calls().is_empty());
    assert!(h.queue.list().unwrap().is_empty());

    let workers = h.store.get_table("workers").unwrap();
    assert_eq!(workers.len(), 1);
    assert_eq!(workers[0]["id"], json!(41));
  }

  #[test]
  fn test_resolve_references_only_touches_pending_ids() {
    let mut data = row(json!({
      "student_id": "local:a",
      "members": ["local:a", "local:b", "x"],
      "note": "local:a is new"
    }));
    let resolved = HashMap::from([("local:a".to_string(), json!(7))]);
    resolve_references(&mut data, &resolved);
    assert_eq!(data["student_id"], json!(7));
    assert_eq!(data["members"], json!([7, "local:b", "x"]));
    assert_eq!(data["note"], json!("local:a is new"));
  }
}
