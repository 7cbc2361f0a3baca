use crate::accessor::TableAccessor;
use crate::cache::RequestCache;
use crate::config::Config;
use crate::connectivity::{ConnectivityMonitor, Hint, HttpProbe, Probe};
use crate::event::{EventBus, Subscription, Topic};
use crate::queue::MutationQueue;
use crate::remote::{HttpRemote, RemoteApi};
use crate::row::Row;
use crate::store::LocalStore;
use crate::sync::SyncEngine;
use color_eyre::Result;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// The sync core wired together, plus its background tasks.
pub struct App {
  config: Config,
  bus: EventBus,
  store: Arc<LocalStore>,
  queue: Arc<MutationQueue>,
  monitor: Arc<ConnectivityMonitor>,
  engine: Arc<SyncEngine>,
  accessor: Arc<TableAccessor>,
  cache: RequestCache<Vec<Row>>,
  tasks: Vec<JoinHandle<()>>,
}

impl App {
  pub fn new(config: Config) -> Result<Self> {
    let remote = Arc::new(HttpRemote::new(&config.remote)?);
    let probe = Arc::new(HttpProbe::new(config.connectivity.probe_timeout())?);
    let store = Arc::new(LocalStore::open(&config.store_path()?, &config.tables)?);
    Ok(Self::with_parts(config, remote, probe, store))
  }

  /// Wire the core around explicit collaborators.
  pub fn with_parts(
    config: Config,
    remote: Arc<dyn RemoteApi>,
    probe: Arc<dyn Probe>,
    store: Arc<LocalStore>,
  ) -> Self {
    let bus = EventBus::default();
    let cache = RequestCache::new();
    let queue = Arc::new(MutationQueue::new(Arc::clone(&store), bus.clone()));
    let monitor = Arc::new(ConnectivityMonitor::new(
      probe,
      config.connectivity.clone(),
      bus.clone(),
    ));
    let engine = Arc::new(SyncEngine::new(
      Arc::clone(&remote),
      Arc::clone(&store),
      Arc::clone(&queue),
      Arc::clone(&monitor),
      bus.clone(),
      cache.clone(),
      &config.sync,
    ));
    let accessor = Arc::new(TableAccessor::new(
      remote,
      Arc::clone(&store),
      Arc::clone(&queue),
      Arc::clone(&monitor),
      cache.clone(),
      config.cache.ttl(),
    ));

    Self {
      config,
      bus,
      store,
      queue,
      monitor,
      engine,
      accessor,
      cache,
      tasks: Vec::new(),
    }
  }

  /// Spawn the background tasks: sync listener, connectivity loop, cache
  /// sweeper and an initial connectivity check. Calling it twice is a no-op.
  pub fn start(&mut self) {
    if !self.tasks.is_empty() {
      return;
    }

    // Subscribe before the first check can announce connectivity.
    self.tasks.push(self.engine.spawn_listener());
    self
      .tasks
      .push(tokio::spawn(Arc::clone(&self.monitor).run()));
    self
      .tasks
      .push(self.cache.spawn_sweeper(self.config.cache.sweep_interval()));

    let monitor = Arc::clone(&self.monitor);
    self.tasks.push(tokio::spawn(async move {
      let online = monitor.check_real_connectivity().await;
      debug!(online, "initial connectivity check");
    }));

    info!(tasks = self.tasks.len(), "background tasks started");
  }

  /// Verify connectivity now, for one-shot callers that skip `start`.
  pub async fn connect(&self) -> bool {
    self.monitor.check_real_connectivity().await
  }

  pub fn shutdown(&mut self) {
    for task in self.tasks.drain(..) {
      task.abort();
    }
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  pub fn accessor(&self) -> &TableAccessor {
    &self.accessor
  }

  pub fn engine(&self) -> &SyncEngine {
    &self.engine
  }

  pub fn monitor(&self) -> &ConnectivityMonitor {
    &self.monitor
  }

  pub fn store(&self) -> &LocalStore {
    &self.store
  }

  pub fn queue(&self) -> &MutationQueue {
    &self.queue
  }

  /// Channel for link and visibility hints from the embedding application.
  pub fn hints(&self) -> mpsc::UnboundedSender<Hint> {
    self.monitor.hint_sender()
  }

  pub fn subscribe(&self, topics: &[Topic]) -> Subscription {
    if topics.is_empty() {
      self.bus.subscribe()
    } else {
      self.bus.subscribe_to(topics)
    }
  }
}

impl Drop for App {
  fn drop(&mut self) {
    self.shutdown();
  }
}
