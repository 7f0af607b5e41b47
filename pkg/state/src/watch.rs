use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{Mutex, broadcast};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::{Stream, StreamExt};

use pkg_constants::state::WATCH_CHANNEL_CAPACITY;

/// Type of event in the watch stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    Put,
    Delete,
}

/// A single watch event representing a state change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchEvent {
    pub seq: u64,
    pub event_type: EventType,
    pub key: String,
    #[serde(default)]
    pub value: Option<Vec<u8>>,
}

impl WatchEvent {
    /// Decode the carried value as `T`. `None` for deletes or foreign payloads.
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Option<T> {
        self.value
            .as_deref()
            .and_then(|v| serde_json::from_slice(v).ok())
    }
}

/// What a watch subscriber observes.
#[derive(Debug, Clone)]
pub enum WatchItem {
    Event(WatchEvent),
    /// The subscriber fell behind and missed this many events; it must relist.
    Lagged(u64),
}

/// In-memory event log that stamps every state mutation with a monotonic
/// sequence number and fans it out to subscribers filtered by key prefix.
#[derive(Clone)]
pub struct EventLog {
    seq: Arc<Mutex<u64>>,
    sender: broadcast::Sender<WatchEvent>,
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLog {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(WATCH_CHANNEL_CAPACITY);
        Self {
            seq: Arc::new(Mutex::new(0)),
            sender,
        }
    }

    /// Record a new event. Called internally by StateStore on put/delete.
    pub async fn emit(&self, event_type: EventType, key: String, value: Option<Vec<u8>>) -> u64 {
        // Held across send so subscribers see events in sequence order.
        let mut seq = self.seq.lock().await;
        *seq += 1;
        let event = WatchEvent {
            seq: *seq,
            event_type,
            key,
            value,
        };
        // No receivers is fine: nobody is watching yet.
        let _ = self.sender.send(event);
        *seq
    }

    /// Subscribe to receive new events as they are emitted.
    pub fn subscribe(&self) -> broadcast::Receiver<WatchEvent> {
        self.sender.subscribe()
    }

    /// Live stream of events whose key starts with any of `prefixes`.
    ///
    /// An empty prefix list matches everything. Lag is surfaced as
    /// [`WatchItem::Lagged`] instead of being silently dropped.
    pub fn watch(&self, prefixes: Vec<String>) -> impl Stream<Item = WatchItem> + Send + 'static {
        BroadcastStream::new(self.subscribe()).filter_map(move |result| match result {
            Ok(event) => {
                if prefixes.is_empty() || prefixes.iter().any(|p| event.key.starts_with(p)) {
                    Some(WatchItem::Event(event))
                } else {
                    None
                }
            }
            Err(BroadcastStreamRecvError::Lagged(missed)) => Some(WatchItem::Lagged(missed)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sequence_numbers_are_monotonic() {
        let log = EventLog::new();
        let mut stream = Box::pin(log.watch(vec![]));
        let a = log.emit(EventType::Put, "/a".to_string(), None).await;
        let b = log.emit(EventType::Delete, "/a".to_string(), None).await;
        assert!(b > a);
        for expected in [a, b] {
            match stream.next().await {
                Some(WatchItem::Event(e)) => assert_eq!(e.seq, expected),
                other => panic!("unexpected watch item {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn slow_subscriber_sees_lag() {
        let log = EventLog::new();
        let mut stream = Box::pin(log.watch(vec![]));
        for i in 0..(WATCH_CHANNEL_CAPACITY + 5) {
            log.emit(EventType::Put, format!("/k/{}", i), None).await;
        }
        match stream.next().await {
            Some(WatchItem::Lagged(missed)) => assert_eq!(missed, 5),
            other => panic!("expected lag, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn watch_filters_by_prefix() {
        let log = EventLog::new();
        let mut stream = Box::pin(log.watch(vec!["/registry/migrations/".to_string()]));
        log.emit(EventType::Put, "/registry/pods/ns/p".to_string(), None)
            .await;
        log.emit(EventType::Put, "/registry/migrations/ns/m".to_string(), None)
            .await;
        match stream.next().await {
            Some(WatchItem::Event(e)) => assert_eq!(e.key, "/registry/migrations/ns/m"),
            other => panic!("unexpected watch item {:?}", other),
        }
    }
}
