use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;

/// Identity of a migration: what the queue deduplicates on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MigrationKey {
    pub namespace: String,
    pub name: String,
}

impl MigrationKey {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

impl fmt::Display for MigrationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Default)]
struct QueueState {
    order: VecDeque<MigrationKey>,
    queued: HashSet<MigrationKey>,
    processing: HashSet<MigrationKey>,
    /// Re-added while being processed; requeued by `done`.
    dirty: HashSet<MigrationKey>,
    shutting_down: bool,
}

/// Deduplicating work queue.
///
/// A key sits in the queue at most once, so a burst of events for the same
/// migration collapses into one evaluation. A key handed out by `get` is not
/// handed out again until `done` is called for it; adds in the meantime mark
/// it dirty and it is queued once more when processing finishes.
#[derive(Default)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add(&self, key: MigrationKey) {
        let mut state = self.state();
        if state.shutting_down {
            return;
        }
        if state.processing.contains(&key) {
            state.dirty.insert(key);
            return;
        }
        if state.queued.insert(key.clone()) {
            state.order.push_back(key);
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Add `key` once `delay` has passed.
    pub fn add_after(self: &Arc<Self>, key: MigrationKey, delay: Duration) {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Wait for the next key. `None` once the queue is shut down.
    pub async fn get(&self) -> Option<MigrationKey> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.state();
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.order.pop_front() {
                    state.queued.remove(&key);
                    state.processing.insert(key.clone());
                    let more = !state.order.is_empty();
                    drop(state);
                    if more {
                        self.notify.notify_one();
                    }
                    return Some(key);
                }
            }
            notified.await;
        }
    }

    /// Mark `key` finished; requeue it if it was re-added meanwhile.
    pub fn done(&self, key: &MigrationKey) {
        let mut state = self.state();
        state.processing.remove(key);
        if state.dirty.remove(key) && !state.shutting_down && state.queued.insert(key.clone()) {
            state.order.push_back(key.clone());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Keys waiting to be handed out.
    pub fn len(&self) -> usize {
        self.state().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn shutdown(&self) {
        self.state().shutting_down = true;
        self.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &str) -> MigrationKey {
        MigrationKey::new("ns", name)
    }

    #[tokio::test]
    async fn duplicate_adds_coalesce() {
        let queue = WorkQueue::new();
        queue.add(key("a"));
        queue.add(key("b"));
        queue.add(key("a"));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.get().await, Some(key("a")));
        assert_eq!(queue.get().await, Some(key("b")));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn key_in_flight_is_not_handed_out_twice() {
        let queue = WorkQueue::new();
        queue.add(key("a"));
        let first = queue.get().await.unwrap();
        queue.add(key("a"));
        queue.add(key("a"));
        assert!(queue.is_empty());

        queue.done(&first);
        assert_eq!(queue.len(), 1);
        let second = queue.get().await.unwrap();
        assert_eq!(second, key("a"));
        queue.done(&second);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn waiting_worker_is_woken() {
        let queue = Arc::new(WorkQueue::new());
        let worker = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.get().await })
        };
        tokio::task::yield_now().await;
        queue.add(key("late"));
        assert_eq!(worker.await.unwrap(), Some(key("late")));
    }

    #[tokio::test]
    async fn shutdown_releases_waiters() {
        let queue = Arc::new(WorkQueue::new());
        let worker = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.get().await })
        };
        tokio::task::yield_now().await;
        queue.shutdown();
        assert_eq!(worker.await.unwrap(), None);
        queue.add(key("ignored"));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn add_after_delays() {
        let queue = Arc::new(WorkQueue::new());
        queue.add_after(key("a"), Duration::from_millis(200));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(queue.is_empty());
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn key_display() {
        assert_eq!(key("m").to_string(), "ns/m");
    }
}
