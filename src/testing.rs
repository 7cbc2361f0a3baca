//! In-process fakes for the remote API and connectivity probes.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::connectivity::Probe;
use crate::query::TableQuery;
use crate::queue::{MutationKind, WritePayload};
use crate::remote::{RemoteApi, RemoteError};
use crate::row::{Row, RowExt, RowId, ID_FIELD};

/// A call received by `FakeRemote`. Fetches have no kind.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteCall {
  pub table: String,
  pub kind: Option<MutationKind>,
  pub data: Row,
  pub files: Vec<String>,
}

enum Reaction {
  Fail(RemoteError),
  Hang,
}

struct Rule {
  field: String,
  value: Value,
  reaction: Reaction,
}

/// Remote API backed by in-memory tables, assigning numeric server ids.
pub struct FakeRemote {
  tables: Mutex<HashMap<String, Vec<Row>>>,
  next_id: AtomicI64,
  calls: Mutex<Vec<RemoteCall>>,
  online: AtomicBool,
  rules: Mutex<Vec<Rule>>,
  delay: Mutex<Option<Duration>>,
  authenticated: bool,
}

impl Default for FakeRemote {
  fn default() -> Self {
    Self::new()
  }
}

impl FakeRemote {
  pub fn new() -> Self {
    Self {
      tables: Mutex::new(HashMap::new()),
      next_id: AtomicI64::new(1),
      calls: Mutex::new(Vec::new()),
      online: AtomicBool::new(true),
      rules: Mutex::new(Vec::new()),
      delay: Mutex::new(None),
      authenticated: false,
    }
  }

  pub fn authenticated() -> Self {
    Self {
      authenticated: true,
      ..Self::new()
    }
  }

  pub fn seed(&self, table: &str, rows: Vec<Row>) {
    self.tables.lock().unwrap().insert(table.to_string(), rows);
  }

  pub fn table(&self, table: &str) -> Vec<Row> {
    self
      .tables
      .lock()
      .unwrap()
      .get(table)
      .cloned()
      .unwrap_or_default()
  }

  pub fn calls(&self) -> Vec<RemoteCall> {
    self.calls.lock().unwrap().clone()
  }

  pub fn mutation_calls(&self) -> Vec<RemoteCall> {
    self
      .calls()
      .into_iter()
      .filter(|c| c.kind.is_some())
      .collect()
  }

  pub fn fetch_count(&self) -> usize {
    self.calls().iter().filter(|c| c.kind.is_none()).count()
  }

  pub fn set_online(&self, online: bool) {
    self.online.store(online, Ordering::SeqCst);
  }

  pub fn set_delay(&self, delay: Duration) {
    *self.delay.lock().unwrap() = Some(delay);
  }

  /// Fail writes whose payload has `field == value`.
  pub fn fail_when(&self, field: &str, value: impl Into<Value>, error: RemoteError) {
    self.rules.lock().unwrap().push(Rule {
      field: field.to_string(),
      value: value.into(),
      reaction: Reaction::Fail(error),
    });
  }

  /// Never answer writes whose payload has `field == value`.
  pub fn hang_when(&self, field: &str, value: impl Into<Value>) {
    self.rules.lock().unwrap().push(Rule {
      field: field.to_string(),
      value: value.into(),
      reaction: Reaction::Hang,
    });
  }

  async fn enter(&self, call: RemoteCall) -> Result<(), RemoteError> {
    let delay = *self.delay.lock().unwrap();
    if let Some(delay) = delay {
      tokio::time::sleep(delay).await;
    }
    if !self.online.load(Ordering::SeqCst) {
      return Err(RemoteError::Unavailable("connection refused".to_string()));
    }

    let reaction = self
      .rules
      .lock()
      .unwrap()
      .iter()
      .find(|r| call.data.get(&r.field) == Some(&r.value))
      .map(|r| match &r.reaction {
        Reaction::Fail(e) => Some(e.clone()),
        Reaction::Hang => None,
      });
    self.calls.lock().unwrap().push(call);

    match reaction {
      Some(Some(error)) => Err(error),
      Some(None) => std::future::pending().await,
      None => Ok(()),
    }
  }
}

fn same_id(row: &Row, id: &RowId) -> bool {
  row.row_id().as_ref() == Some(id)
}

#[async_trait]
impl RemoteApi for FakeRemote {
  async fn fetch(&self, table: &str, query: &TableQuery) -> Result<Vec<Row>, RemoteError> {
    self
      .enter(RemoteCall {
        table: table.to_string(),
        kind: None,
        data: Row::new(),
        files: Vec::new(),
      })
      .await?;
    Ok(query.apply(self.table(table)))
  }

  async fn mutate(
    &self,
    table: &str,
    kind: MutationKind,
    payload: WritePayload,
  ) -> Result<Option<Row>, RemoteError> {
    let WritePayload { mut data, files } = payload;
    self
      .enter(RemoteCall {
        table: table.to_string(),
        kind: Some(kind),
        data: data.clone(),
        files: files.keys().cloned().collect(),
      })
      .await?;

    for (field, blob) in files {
      data.insert(field, Value::String(format!("{}/{}", table, blob.file_name)));
    }

    let mut tables = self.tables.lock().unwrap();
    let rows = tables.entry(table.to_string()).or_default();
    match kind {
      MutationKind::Insert => {
        match data.row_id() {
          Some(RowId::Pending(id)) => {
            return Err(RemoteError::Rejected {
              status: 400,
              message: format!("invalid input syntax for id: {}", id),
            })
          }
          Some(_) => {}
          None => {
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            data.insert(ID_FIELD.to_string(), Value::from(id));
          }
        }
        rows.push(data.clone());
        Ok(Some(data))
      }
      MutationKind::Update => {
        let id = data.row_id().ok_or_else(|| RemoteError::Rejected {
          status: 400,
          message: "missing id".to_string(),
        })?;
        let row = rows
          .iter_mut()
          .find(|r| same_id(r, &id))
          .ok_or_else(|| RemoteError::Rejected {
            status: 404,
            message: format!("no row {}", id),
          })?;
        for (key, value) in data {
          row.insert(key, value);
        }
        Ok(Some(row.clone()))
      }
      MutationKind::Delete => {
        let id = data.row_id().ok_or_else(|| RemoteError::Rejected {
          status: 400,
          message: "missing id".to_string(),
        })?;
        let removed = rows
          .iter()
          .position(|r| same_id(r, &id))
          .map(|index| rows.remove(index));
        Ok(removed)
      }
    }
  }

  fn is_authenticated(&self) -> bool {
    self.authenticated
  }
}

enum ProbeBehavior {
  Fail,
  Hang,
}

/// Probe whose reachability is set by the test.
pub struct FakeProbe {
  reachable: AtomicBool,
  overrides: Mutex<HashMap<String, ProbeBehavior>>,
  delay: Option<Duration>,
  calls: AtomicUsize,
}

impl FakeProbe {
  pub fn reachable() -> Self {
    Self {
      reachable: AtomicBool::new(true),
      overrides: Mutex::new(HashMap::new()),
      delay: None,
      calls: AtomicUsize::new(0),
    }
  }

  pub fn unreachable() -> Self {
    let probe = Self::reachable();
    probe.set_reachable(false);
    probe
  }

  pub fn with_delay(mut self, delay: Duration) -> Self {
    self.delay = Some(delay);
    self
  }

  pub fn set_reachable(&self, reachable: bool) {
    self.reachable.store(reachable, Ordering::SeqCst);
  }

  pub fn fail(&self, target: &str) {
    self
      .overrides
      .lock()
      .unwrap()
      .insert(target.to_string(), ProbeBehavior::Fail);
  }

  pub fn hang(&self, target: &str) {
    self
      .overrides
      .lock()
      .unwrap()
      .insert(target.to_string(), ProbeBehavior::Hang);
  }

  /// Number of individual probe requests issued.
  pub fn calls(&self) -> usize {
    self.calls.load(Ordering::SeqCst)
  }
}

#[async_trait]
impl Probe for FakeProbe {
  async fn probe(&self, target: &str) -> Result<(), String> {
    self.calls.fetch_add(1, Ordering::SeqCst);
    if let Some(delay) = self.delay {
      tokio::time::sleep(delay).await;
    }

    let hang = match self.overrides.lock().unwrap().get(target) {
      Some(ProbeBehavior::Fail) => return Err("connection reset".to_string()),
      Some(ProbeBehavior::Hang) => true,
      None => false,
    };
    if hang {
      std::future::pending::<()>().await;
    }

    if self.reachable.load(Ordering::SeqCst) {
      Ok(())
    } else {
      Err("network unreachable".to_string())
    }
  }
}
