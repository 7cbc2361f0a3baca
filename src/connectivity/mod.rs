//! Verified internet reachability.
//!
//! Link-layer signals are hints: "link down" is trusted immediately, "link
//! up" only ever leads to a probe. The online flag flips to true solely after
//! a successful round-trip to an external endpoint.

mod probe;

pub use probe::{HttpProbe, Probe};

use chrono::{DateTime, Utc};
use futures::future::{self, FutureExt};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::ConnectivityConfig;
use crate::event::{EventBus, SyncEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectivityState {
  pub is_online: bool,
  pub last_changed: DateTime<Utc>,
}

/// Environment signals fed to the monitor by the embedding application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hint {
  /// The network interface came up
  LinkUp,
  /// The network interface went down
  LinkDown,
  /// The user-facing view was hidden
  Hidden,
  /// The user-facing view became visible again
  Visible,
}

/// Result of a connectivity check request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckOutcome {
  /// Probes ran; carries the verified reachability
  Probed(bool),
  /// Rate-limited; carries the unchanged current state
  Debounced(bool),
}

impl CheckOutcome {
  pub fn is_online(self) -> bool {
    match self {
      CheckOutcome::Probed(online) | CheckOutcome::Debounced(online) => online,
    }
  }
}

struct CheckGate {
  in_flight: bool,
  last_checked: Option<Instant>,
}

/// Clears the in-flight flag when a check finishes or is cancelled.
struct InFlight<'a>(&'a Mutex<CheckGate>);

impl Drop for InFlight<'_> {
  fn drop(&mut self) {
    lock(self.0).in_flight = false;
  }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct ConnectivityMonitor {
  probe: Arc<dyn Probe>,
  config: ConnectivityConfig,
  bus: EventBus,
  state: Mutex<ConnectivityState>,
  gate: Mutex<CheckGate>,
  hidden_since: Mutex<Option<Instant>>,
  hints_tx: mpsc::UnboundedSender<Hint>,
  hints_rx: Mutex<Option<mpsc::UnboundedReceiver<Hint>>>,
}

impl ConnectivityMonitor {
  /// Create a monitor. It starts offline until the first probe succeeds.
  pub fn new(probe: Arc<dyn Probe>, config: ConnectivityConfig, bus: EventBus) -> Self {
    let (hints_tx, hints_rx) = mpsc::unbounded_channel();
    Self {
      probe,
      config,
      bus,
      state: Mutex::new(ConnectivityState {
        is_online: false,
        last_changed: Utc::now(),
      }),
      gate: Mutex::new(CheckGate {
        in_flight: false,
        last_checked: None,
      }),
      hidden_since: Mutex::new(None),
      hints_tx,
      hints_rx: Mutex::new(Some(hints_rx)),
    }
  }

  pub fn state(&self) -> ConnectivityState {
    *lock(&self.state)
  }

  pub fn is_online(&self) -> bool {
    lock(&self.state).is_online
  }

  /// Sender for feeding hints into a running monitor.
  pub fn hint_sender(&self) -> mpsc::UnboundedSender<Hint> {
    self.hints_tx.clone()
  }

  pub fn send_hint(&self, hint: Hint) {
    let _ = self.hints_tx.send(hint);
  }

  /// Verify reachability, probing at most once per check window.
  pub async fn check_real_connectivity(&self) -> bool {
    self.check().await.is_online()
  }

  /// Like `check_real_connectivity`, reporting whether probes actually ran.
  pub async fn check(&self) -> CheckOutcome {
    let Some(_in_flight) = self.begin_check() else {
      return CheckOutcome::Debounced(self.is_online());
    };
    let reachable = self.probe_all().await;
    self.set_online(reachable, "probe");
    CheckOutcome::Probed(reachable)
  }

  fn begin_check(&self) -> Option<InFlight<'_>> {
    let mut gate = lock(&self.gate);
    let recent = gate
      .last_checked
      .is_some_and(|at| at.elapsed() < self.config.min_check_interval());
    if gate.in_flight || recent {
      debug!(in_flight = gate.in_flight, "connectivity check debounced");
      return None;
    }
    gate.in_flight = true;
    gate.last_checked = Some(Instant::now());
    Some(InFlight(&self.gate))
  }

  /// When the next check will be allowed to probe.
  pub fn next_check_allowed(&self) -> Option<Instant> {
    lock(&self.gate)
      .last_checked
      .map(|at| at + self.config.min_check_interval())
  }

  /// Probe every configured target in parallel; any success means reachable.
  async fn probe_all(&self) -> bool {
    let targets = &self.config.probe_urls;
    if targets.is_empty() {
      warn!("no connectivity probe targets configured");
      return false;
    }

    let timeout = self.config.probe_timeout();
    let attempts = targets.iter().map(|target| {
      let probe = Arc::clone(&self.probe);
      let target = target.clone();
      async move {
        match tokio::time::timeout(timeout, probe.probe(&target)).await {
          Ok(Ok(())) => Ok(target),
          Ok(Err(e)) => Err(format!("{}: {}", target, e)),
          Err(_) => Err(format!("{}: timed out after {:?}", target, timeout)),
        }
      }
      .boxed()
    });

    match future::select_ok(attempts).await {
      Ok((target, _)) => {
        debug!(%target, "connectivity probe succeeded");
        true
      }
      Err(last_error) => {
        debug!(error = %last_error, "all connectivity probes failed");
        false
      }
    }
  }

  /// Update the state, publishing an event on a transition.
  fn set_online(&self, online: bool, reason: &str) -> bool {
    let changed = {
      let mut state = lock(&self.state);
      if state.is_online == online {
        false
      } else {
        state.is_online = online;
        state.last_changed = Utc::now();
        true
      }
    };

    if changed {
      if online {
        info!(reason, "connectivity restored");
        self.bus.publish(SyncEvent::ConnectivityRestored);
      } else {
        info!(reason, "connectivity lost");
        self.bus.publish(SyncEvent::ConnectivityLost);
      }
    }
    changed
  }

  /// React to an environment hint. Returns the check outcome if one was requested.
  pub async fn handle_hint(&self, hint: Hint) -> Option<CheckOutcome> {
    match hint {
      Hint::LinkDown => {
        self.set_online(false, "link down");
        None
      }
      Hint::LinkUp => Some(self.check().await),
      Hint::Hidden => {
        *lock(&self.hidden_since) = Some(Instant::now());
        None
      }
      Hint::Visible => {
        let hidden_since = lock(&self.hidden_since).take();
        match hidden_since {
          Some(at) if at.elapsed() >= self.config.hidden_threshold() => Some(self.check().await),
          _ => {
            debug!("view shown after a short absence, skipping check");
            None
          }
        }
      }
    }
  }

  /// Interval of the periodic check for the current state.
  pub fn poll_interval(&self) -> Duration {
    if self.is_online() {
      self.config.online_poll()
    } else {
      self.config.offline_poll()
    }
  }

  /// Process hints and run periodic checks until the task is aborted.
  pub async fn run(self: Arc<Self>) {
    let Some(mut hints) = lock(&self.hints_rx).take() else {
      warn!("connectivity monitor is already running");
      return;
    };

    let mut next_poll = Instant::now() + self.poll_interval();
    let mut recheck: Option<Instant> = None;

    loop {
      tokio::select! {
        hint = hints.recv() => {
          let Some(hint) = hint else { break };
          match self.handle_hint(hint).await {
            // A link-up hint arrived inside the check window: verify once it reopens.
            Some(CheckOutcome::Debounced(false)) => recheck = self.next_check_allowed(),
            Some(_) => next_poll = Instant::now() + self.poll_interval(),
            None if hint == Hint::LinkDown => next_poll = Instant::now() + self.poll_interval(),
            None => {}
          }
        }
        _ = sleep_until(next_poll) => {
          self.check().await;
          next_poll = Instant::now() + self.poll_interval();
        }
        _ = sleep_until(recheck.unwrap_or(next_poll)), if recheck.is_some() => {
          recheck = None;
          self.check().await;
          next_poll = Instant::now() + self.poll_interval();
        }
      }
    }
  }
}
