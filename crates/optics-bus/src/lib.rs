//! In-process pub/sub of "path changed at version V".
//!
//! Every dataset mutation publishes a [`PathEvent`] here; the lens engine
//! and system listings subscribe. Delivery is best-effort: subscribers
//! that fall behind lose the oldest events (tokio broadcast semantics)
//! and nothing blocks the publisher. The bus is single-process by design.

use std::collections::HashMap;

use optics_types::DatasetPath;
use tokio::sync::broadcast;
use tracing::debug;

/// One update notification.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PathEvent {
    /// The dataset (or virtual system collection) that changed.
    pub path: DatasetPath,
    /// The version the path reached. Zero for system collection events.
    pub version: u64,
}

/// Receiver half of a subscription.
pub type EventStream = broadcast::Receiver<PathEvent>;

/// The process-wide update bus.
#[derive(Clone)]
pub struct UpdateBus {
    tx: broadcast::Sender<PathEvent>,
}

impl UpdateBus {
    /// Create a bus with the given per-subscriber buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to every future event.
    pub fn subscribe(&self) -> EventStream {
        self.tx.subscribe()
    }

    /// Publish one path-updated event.
    pub fn path_updated(&self, path: DatasetPath, version: u64) {
        debug!(path = %path, version, "path updated");
        // No receivers is fine; events are best-effort.
        let _ = self.tx.send(PathEvent { path, version });
    }

    /// Publish a batch, coalesced by path to the highest version, so one
    /// mutation burst wakes each listener at most once per path.
    pub fn emit_coalesced(&self, events: Vec<PathEvent>) {
        let mut latest: HashMap<DatasetPath, u64> = HashMap::new();
        let mut order: Vec<DatasetPath> = Vec::new();
        for event in events {
            match latest.get_mut(&event.path) {
                Some(version) => *version = (*version).max(event.version),
                None => {
                    latest.insert(event.path.clone(), event.version);
                    order.push(event.path);
                }
            }
        }
        for path in order {
            let version = latest[&path];
            self.path_updated(path, version);
        }
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for UpdateBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl std::fmt::Debug for UpdateBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use optics_types::Source;

    use super::*;

    fn path(name: &str) -> DatasetPath {
        DatasetPath::dataset(Source::Datasets, "u", name)
    }

    #[test]
    fn subscribers_receive_events() {
        let bus = UpdateBus::default();
        let mut stream = bus.subscribe();
        bus.path_updated(path("songs"), 3);

        let event = stream.try_recv().unwrap();
        assert_eq!(event.path, path("songs"));
        assert_eq!(event.version, 3);
    }

    #[test]
    fn emit_without_subscribers_is_fine() {
        let bus = UpdateBus::default();
        bus.path_updated(path("nobody"), 1);
    }

    #[test]
    fn coalescing_keeps_max_version_per_path() {
        let bus = UpdateBus::default();
        let mut stream = bus.subscribe();
        bus.emit_coalesced(vec![
            PathEvent { path: path("a"), version: 1 },
            PathEvent { path: path("b"), version: 5 },
            PathEvent { path: path("a"), version: 4 },
        ]);

        let first = stream.try_recv().unwrap();
        assert_eq!((first.path, first.version), (path("a"), 4));
        let second = stream.try_recv().unwrap();
        assert_eq!((second.path, second.version), (path("b"), 5));
        assert!(stream.try_recv().is_err());
    }

    #[test]
    fn each_subscriber_gets_every_event() {
        let bus = UpdateBus::default();
        let mut one = bus.subscribe();
        let mut two = bus.subscribe();
        bus.path_updated(path("shared"), 7);

        assert_eq!(one.try_recv().unwrap().version, 7);
        assert_eq!(two.try_recv().unwrap().version, 7);
    }

    #[test]
    fn subscriber_count_tracks_drops() {
        let bus = UpdateBus::default();
        assert_eq!(bus.subscriber_count(), 0);
        let stream = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);
        drop(stream);
        assert_eq!(bus.subscriber_count(), 0);
    }
}
