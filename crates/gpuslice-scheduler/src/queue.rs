//! Deduplicating work queue with at most one in-flight pass per key

use std::collections::{HashSet, VecDeque};
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};

struct QueueState<K> {
    /// Keys waiting for a worker, in arrival order
    pending: VecDeque<K>,
    /// Mirror of `pending` for deduplication
    queued: HashSet<K>,
    /// Keys a worker currently holds
    processing: HashSet<K>,
    /// Keys re-added while processing; requeued on `done`
    dirty: HashSet<K>,
}

/// Work queue keyed by object identity.
///
/// A key added several times before a worker picks it up is handed out once.
/// A key added while a worker holds it is handed out again only after that
/// worker calls [`WorkQueue::done`], so passes for one key never overlap.
pub struct WorkQueue<K> {
    state: Mutex<QueueState<K>>,
    notify: Notify,
    shutdown: AtomicBool,
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
{
    /// Create an empty queue
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                pending: VecDeque::new(),
                queued: HashSet::new(),
                processing: HashSet::new(),
                dirty: HashSet::new(),
            }),
            notify: Notify::new(),
            shutdown: AtomicBool::new(false),
        }
    }

    /// Enqueue a key
    pub async fn add(&self, key: K) {
        if self.shutdown.load(Ordering::SeqCst) {
            return;
        }
        let mut state = self.state.lock().await;
        if state.processing.contains(&key) {
            state.dirty.insert(key);
            return;
        }
        if state.queued.insert(key.clone()) {
            state.pending.push_back(key);
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Enqueue a key once `delay` has passed
    pub fn add_after(self: &Arc<Self>, key: K, delay: Duration) {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key).await;
        });
    }

    /// Wait for the next key. Returns `None` once the queue is shut down.
    pub async fn next(&self) -> Option<K> {
        loop {
            // Register before checking so a shutdown in between is not missed
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.shutdown.load(Ordering::SeqCst) {
                return None;
            }
            {
                let mut state = self.state.lock().await;
                if let Some(key) = state.pending.pop_front() {
                    state.queued.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
            }
            notified.await;
        }
    }

    /// Release a key handed out by [`WorkQueue::next`]
    pub async fn done(&self, key: &K) {
        let mut state = self.state.lock().await;
        state.processing.remove(key);
        if state.dirty.remove(key) && state.queued.insert(key.clone()) {
            state.pending.push_back(key.clone());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Number of keys waiting for a worker
    pub async fn len(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    /// Whether no key is waiting
    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.pending.is_empty()
    }

    /// Stop handing out keys and wake every waiting worker
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }
}

impl<K> Default for WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
