use std::fmt;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Notifications published by the sync core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
  /// Reachability verified after being offline
  ConnectivityRestored,
  /// Reachability lost
  ConnectivityLost,
  /// A queued mutation was confirmed by the remote and removed
  Synced { mutation_id: i64, table: String },
  /// A mutation is waiting in the queue (newly queued or failed this pass)
  Queued { mutation_id: i64, table: String },
}

impl SyncEvent {
  pub fn topic(&self) -> Topic {
    match self {
      SyncEvent::ConnectivityRestored => Topic::ConnectivityRestored,
      SyncEvent::ConnectivityLost => Topic::ConnectivityLost,
      SyncEvent::Synced { .. } => Topic::Synced,
      SyncEvent::Queued { .. } => Topic::Queued,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
  ConnectivityRestored,
  ConnectivityLost,
  Synced,
  Queued,
}

impl Topic {
  pub fn as_str(&self) -> &'static str {
    match self {
      Topic::ConnectivityRestored => "connectivity-restored",
      Topic::ConnectivityLost => "connectivity-lost",
      Topic::Synced => "synced",
      Topic::Queued => "queued",
    }
  }
}

impl fmt::Display for Topic {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// In-process publish/subscribe bus backed by a broadcast channel.
#[derive(Clone)]
pub struct EventBus {
  tx: broadcast::Sender<SyncEvent>,
}

impl EventBus {
  pub fn new(capacity: usize) -> Self {
    let (tx, _rx) = broadcast::channel(capacity.max(1));
    Self { tx }
  }

  /// Publish an event. Having no subscribers is not an error.
  pub fn publish(&self, event: SyncEvent) {
    debug!(topic = %event.topic(), ?event, "publish");
    let _ = self.tx.send(event);
  }

  /// Subscribe to every topic.
  pub fn subscribe(&self) -> Subscription {
    Subscription {
      rx: self.tx.subscribe(),
      topics: None,
    }
  }

  /// Subscribe to the given topics only.
  pub fn subscribe_to(&self, topics: &[Topic]) -> Subscription {
    Subscription {
      rx: self.tx.subscribe(),
      topics: Some(topics.to_vec()),
    }
  }
}

impl Default for EventBus {
  fn default() -> Self {
    Self::new(64)
  }
}

/// Receiving end of a bus subscription.
pub struct Subscription {
  rx: broadcast::Receiver<SyncEvent>,
  topics: Option<Vec<Topic>>,
}

impl Subscription {
  fn wants(&self, event: &SyncEvent) -> bool {
    self
      .topics
      .as_ref()
      .map_or(true, |topics| topics.contains(&event.topic()))
  }

  /// Receive the next matching event. Returns `None` once the bus is gone.
  pub async fn next(&mut self) -> Option<SyncEvent> {
    loop {
      match self.rx.recv().await {
        Ok(event) if self.wants(&event) => return Some(event),
        Ok(_) => continue,
        Err(broadcast::error::RecvError::Lagged(skipped)) => {
          warn!(skipped, "event subscriber lagged");
        }
        Err(broadcast::error::RecvError::Closed) => return None,
      }
    }
  }

  /// Receive a matching event that is already buffered, without waiting.
  pub fn try_next(&mut self) -> Option<SyncEvent> {
    loop {
      match self.rx.try_recv() {
        Ok(event) if self.wants(&event) => return Some(event),
        Ok(_) => continue,
        Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
          warn!(skipped, "event subscriber lagged");
        }
        Err(_) => return None,
      }
    }
  }

  /// Drain every buffered matching event.
  pub fn drain(&mut self) -> Vec<SyncEvent> {
    std::iter::from_fn(|| self.try_next()).collect()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_subscribe_to_filters_topics() {
    let bus = EventBus::default();
    let mut all = bus.subscribe();
    let mut restored = bus.subscribe_to(&[Topic::ConnectivityRestored]);

    bus.publish(SyncEvent::ConnectivityLost);
    bus.publish(SyncEvent::ConnectivityRestored);

    assert_eq!(all.next().await, Some(SyncEvent::ConnectivityLost));
    assert_eq!(all.next().await, Some(SyncEvent::ConnectivityRestored));
    assert_eq!(restored.next().await, Some(SyncEvent::ConnectivityRestored));
    assert_eq!(restored.try_next(), None);
  }

  #[test]
  fn test_publish_without_subscribers_is_fine() {
    let bus = EventBus::new(4);
    bus.publish(SyncEvent::Synced {
      mutation_id: 1,
      table: "students".to_string(),
    });
  }

  #[test]
  fn test_topic_names() {
    assert_eq!(Topic::ConnectivityRestored.to_string(), "connectivity-restored");
    assert_eq!(Topic::ConnectivityLost.to_string(), "connectivity-lost");
    assert_eq!(Topic::Synced.to_string(), "synced");
    assert_eq!(Topic::Queued.to_string(), "queued");
  }
}
