//! Deduplicating work queue.
//!
//! A key is handed to at most one worker at a time. Adding a key that is in
//! flight marks it dirty; it is queued again when the worker calls
//! [`WorkQueue::done`].

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use droidfarm_id::ObjectKey;
use tokio::sync::{Mutex, Notify};

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<ObjectKey>,
    queued: HashSet<ObjectKey>,
    in_flight: HashSet<ObjectKey>,
    dirty: HashSet<ObjectKey>,
}

#[derive(Debug, Default)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    ready: Notify,
}

impl WorkQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn add(&self, key: ObjectKey) {
        let mut state = self.state.lock().await;
        if state.in_flight.contains(&key) {
            state.dirty.insert(key);
            return;
        }
        if state.queued.insert(key.clone()) {
            state.pending.push_back(key);
            self.ready.notify_one();
        }
    }

    /// Adds `key` once `delay` has passed.
    pub fn add_after(self: &Arc<Self>, key: ObjectKey, delay: Duration) {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key).await;
        });
    }

    /// Waits for the next key and marks it in flight.
    pub async fn next(&self) -> ObjectKey {
        loop {
            {
                let mut state = self.state.lock().await;
                if let Some(key) = state.pending.pop_front() {
                    state.queued.remove(&key);
                    state.in_flight.insert(key.clone());
                    if !state.pending.is_empty() {
                        self.ready.notify_one();
                    }
                    return key;
                }
            }
            self.ready.notified().await;
        }
    }

    /// Releases `key`, queueing it again if it was added while in flight.
    pub async fn done(&self, key: &ObjectKey) {
        let mut state = self.state.lock().await;
        state.in_flight.remove(key);
        if state.dirty.remove(key) && state.queued.insert(key.clone()) {
            state.pending.push_back(key.clone());
            self.ready.notify_one();
        }
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    pub async fn is_in_flight(&self, key: &ObjectKey) -> bool {
        self.state.lock().await.in_flight.contains(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &str) -> ObjectKey {
        ObjectKey::new("ns", name)
    }

    #[tokio::test]
    async fn duplicate_adds_collapse() {
        let queue = WorkQueue::new();
        queue.add(key("a")).await;
        queue.add(key("a")).await;
        queue.add(key("b")).await;
        assert_eq!(queue.len().await, 2);
        assert_eq!(queue.next().await, key("a"));
        assert_eq!(queue.next().await, key("b"));
    }

    #[tokio::test]
    async fn in_flight_key_is_not_handed_out_twice() {
        let queue = WorkQueue::new();
        queue.add(key("a")).await;
        let first = queue.next().await;
        assert!(queue.is_in_flight(&first).await);

        queue.add(key("a")).await;
        assert_eq!(queue.len().await, 0);

        queue.done(&first).await;
        assert_eq!(queue.len().await, 1);
        assert_eq!(queue.next().await, key("a"));
    }

    #[tokio::test]
    async fn done_without_new_events_does_not_requeue() {
        let queue = WorkQueue::new();
        queue.add(key("a")).await;
        let first = queue.next().await;
        queue.done(&first).await;
        assert_eq!(queue.len().await, 0);
        assert!(!queue.is_in_flight(&first).await);
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_add_arrives_after_delay() {
        let queue = WorkQueue::new();
        queue.add_after(key("a"), Duration::from_secs(5));
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(queue.len().await, 0);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(queue.next().await, key("a"));
    }
}
