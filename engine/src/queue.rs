//! The per-persister write queue.
//!
//! Every persister owns one [`WriteQueue`]: a strict FIFO that serializes its
//! mutations into the persisted store with exactly one in-flight write at a
//! time. Enqueueing is synchronous and never blocks the caller; a dedicated
//! worker task drains the queue in enqueue order.
//!
//! # Failure policy
//!
//! A failed write is retried with exponential backoff up to
//! [`RetryPolicy::max_attempts`]; once the attempts are exhausted the item is
//! dropped with an error log and draining advances to the next item. The
//! queue never stalls permanently on a poisoned head. The current phase is
//! observable through [`WriteQueue::state_changes`]: `Idle` when empty,
//! `Draining` while writing, `Stalled` while backing off after a failure.
//!
//! # Shutdown
//!
//! [`WriteQueue::shutdown`] stops the worker before it picks up the next
//! item. An in-flight write runs to completion; everything still queued is
//! abandoned. This is an at-most-once guarantee - callers that need every
//! write on disk call [`WriteQueue::flush`] first.

use crate::error::Error;
use crate::store::PersistedStore;
use crate::{ChangeKind, DocId, PersistedEntry};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};

/// What a queued item does to the store.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueOp {
    /// Write a document or tombstone under the item's id
    Set(PersistedEntry),
    /// Delete the entry under the item's id
    Remove,
}

/// One queued write, exclusively owned by the queue until written.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueItem {
    pub id: DocId,
    pub op: QueueOp,
    pub kind: ChangeKind,
}

/// Drain phase of a write queue.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueState {
    /// Nothing queued
    Idle,
    /// Writing the head item
    Draining,
    /// Backing off after a failed write; the head has not been popped
    Stalled(Error),
}

/// Retry configuration for failed writes.
///
/// Attempt `n` sleeps `base_delay * 2^n` before retrying. After
/// `max_attempts` failures the item is dropped and draining advances.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(50),
        }
    }
}

impl RetryPolicy {
    fn delay(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt)
    }
}

enum Command {
    Write(QueueItem),
    Flush(oneshot::Sender<()>),
}

/// A FIFO of pending store writes with a single-worker drain loop.
pub struct WriteQueue {
    tx: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<QueueState>,
    shutdown: watch::Sender<bool>,
}

impl WriteQueue {
    /// Create a queue draining into `store`.
    ///
    /// Spawns the worker task, so this must be called from within a tokio
    /// runtime.
    pub fn new(store: Arc<dyn PersistedStore>, policy: RetryPolicy) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(QueueState::Idle);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        tokio::spawn(run_worker(store, policy, rx, state_tx, shutdown_rx));

        Self {
            tx,
            state: state_rx,
            shutdown: shutdown_tx,
        }
    }

    /// Append an item to the tail. Never blocks.
    ///
    /// Items enqueued after [`shutdown`](Self::shutdown) are dropped.
    pub fn enqueue(&self, item: QueueItem) {
        if self.tx.send(Command::Write(item)).is_err() {
            tracing::debug!("write enqueued after shutdown; dropping");
        }
    }

    /// Wait until every previously enqueued item has been written (or
    /// dropped by the retry policy). Returns immediately on a shut-down
    /// queue.
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(Command::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }

    /// Stop the worker before the next item. The in-flight write completes;
    /// queued-but-unwritten items are abandoned.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Current drain phase.
    pub fn state(&self) -> QueueState {
        self.state.borrow().clone()
    }

    /// Watch drain phase transitions.
    pub fn state_changes(&self) -> watch::Receiver<QueueState> {
        self.state.clone()
    }
}

async fn run_worker(
    store: Arc<dyn PersistedStore>,
    policy: RetryPolicy,
    mut rx: mpsc::UnboundedReceiver<Command>,
    state: watch::Sender<QueueState>,
    mut shutdown: watch::Receiver<bool>,
) {
    'outer: loop {
        let first = tokio::select! {
            biased;
            _ = shutdown.changed() => break 'outer,
            command = rx.recv() => match command {
                Some(command) => command,
                None => break 'outer,
            },
        };

        let mut next = Some(first);
        while let Some(command) = next.take() {
            if *shutdown.borrow() {
                break 'outer;
            }
            match command {
                Command::Write(item) => {
                    state.send_replace(QueueState::Draining);
                    write_with_retry(store.as_ref(), &item, &policy, &state).await;
                }
                Command::Flush(ack) => {
                    let _ = ack.send(());
                }
            }
            next = rx.try_recv().ok();
        }
        state.send_replace(QueueState::Idle);
    }
    state.send_replace(QueueState::Idle);
}

async fn write_with_retry(
    store: &dyn PersistedStore,
    item: &QueueItem,
    policy: &RetryPolicy,
    state: &watch::Sender<QueueState>,
) {
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        let result = match &item.op {
            QueueOp::Set(entry) => store.set(&item.id, entry.clone()).await,
            QueueOp::Remove => store.remove(&item.id).await,
        };
        match result {
            Ok(()) => {
                if attempt > 0 {
                    state.send_replace(QueueState::Draining);
                }
                return;
            }
            Err(err) => {
                attempt += 1;
                if attempt >= max_attempts {
                    tracing::error!(
                        id = %item.id,
                        kind = ?item.kind,
                        attempts = attempt,
                        error = %err,
                        "dropping persisted write, advancing queue"
                    );
                    state.send_replace(QueueState::Draining);
                    return;
                }
                tracing::warn!(
                    id = %item.id,
                    kind = ?item.kind,
                    attempt,
                    error = %err,
                    "persisted write failed, backing off"
                );
                state.send_replace(QueueState::Stalled(err));
                tokio::time::sleep(policy.delay(attempt - 1)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::store::MemoryStore;
    use crate::Document;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use tokio::sync::Semaphore;

    fn set_item(id: &str, title: &str) -> QueueItem {
        QueueItem {
            id: id.to_string(),
            op: QueueOp::Set(PersistedEntry::doc(&Document::new(
                id,
                json!({"title": title}),
            ))),
            kind: ChangeKind::Inserted,
        }
    }

    fn remove_item(id: &str) -> QueueItem {
        QueueItem {
            id: id.to_string(),
            op: QueueOp::Remove,
            kind: ChangeKind::Removed,
        }
    }

    /// Delegates to a MemoryStore while logging the order of mutating calls.
    #[derive(Default)]
    struct RecordingStore {
        inner: MemoryStore,
        log: Mutex<Vec<String>>,
    }

    impl RecordingStore {
        fn log(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PersistedStore for RecordingStore {
        async fn get(&self, id: &str) -> Result<Option<PersistedEntry>> {
            self.inner.get(id).await
        }

        async fn get_all(&self) -> Result<HashMap<DocId, PersistedEntry>> {
            self.inner.get_all().await
        }

        async fn set(&self, id: &str, entry: PersistedEntry) -> Result<()> {
            self.log.lock().unwrap().push(format!("set {id}"));
            self.inner.set(id, entry).await
        }

        async fn set_all(&self, entries: HashMap<DocId, PersistedEntry>) -> Result<()> {
            self.inner.set_all(entries).await
        }

        async fn remove(&self, id: &str) -> Result<()> {
            self.log.lock().unwrap().push(format!("remove {id}"));
            self.inner.remove(id).await
        }

        async fn remove_all(&self, ids: &[DocId]) -> Result<()> {
            self.inner.remove_all(ids).await
        }

        async fn clear(&self) -> Result<()> {
            self.inner.clear().await
        }
    }

    /// Fails the first `failures` mutating calls, then succeeds.
    struct FlakyStore {
        inner: MemoryStore,
        failures: AtomicU32,
        attempts: AtomicU32,
    }

    impl FlakyStore {
        fn failing(failures: u32) -> Self {
            Self {
                inner: MemoryStore::new(),
                failures: AtomicU32::new(failures),
                attempts: AtomicU32::new(0),
            }
        }

        fn fail_next(&self) -> bool {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            self.failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| {
                    left.checked_sub(1)
                })
                .is_ok()
        }
    }

    #[async_trait]
    impl PersistedStore for FlakyStore {
        async fn get(&self, id: &str) -> Result<Option<PersistedEntry>> {
            self.inner.get(id).await
        }

        async fn get_all(&self) -> Result<HashMap<DocId, PersistedEntry>> {
            self.inner.get_all().await
        }

        async fn set(&self, id: &str, entry: PersistedEntry) -> Result<()> {
            if self.fail_next() {
                return Err(Error::Storage("injected set failure".into()));
            }
            self.inner.set(id, entry).await
        }

        async fn set_all(&self, entries: HashMap<DocId, PersistedEntry>) -> Result<()> {
            self.inner.set_all(entries).await
        }

        async fn remove(&self, id: &str) -> Result<()> {
            if self.fail_next() {
                return Err(Error::Storage("injected remove failure".into()));
            }
            self.inner.remove(id).await
        }

        async fn remove_all(&self, ids: &[DocId]) -> Result<()> {
            self.inner.remove_all(ids).await
        }

        async fn clear(&self) -> Result<()> {
            self.inner.clear().await
        }
    }

    /// Blocks each mutating call on a semaphore permit.
    struct GatedStore {
        inner: RecordingStore,
        permits: Semaphore,
    }

    impl GatedStore {
        fn new() -> Self {
            Self {
                inner: RecordingStore::default(),
                permits: Semaphore::new(0),
            }
        }
    }

    #[async_trait]
    impl PersistedStore for GatedStore {
        async fn get(&self, id: &str) -> Result<Option<PersistedEntry>> {
            self.inner.get(id).await
        }

        async fn get_all(&self) -> Result<HashMap<DocId, PersistedEntry>> {
            self.inner.get_all().await
        }

        async fn set(&self, id: &str, entry: PersistedEntry) -> Result<()> {
            let permit = self.permits.acquire().await.unwrap();
            permit.forget();
            self.inner.set(id, entry).await
        }

        async fn set_all(&self, entries: HashMap<DocId, PersistedEntry>) -> Result<()> {
            self.inner.set_all(entries).await
        }

        async fn remove(&self, id: &str) -> Result<()> {
            self.inner.remove(id).await
        }

        async fn remove_all(&self, ids: &[DocId]) -> Result<()> {
            self.inner.remove_all(ids).await
        }

        async fn clear(&self) -> Result<()> {
            self.inner.clear().await
        }
    }

    #[tokio::test]
    async fn drains_in_enqueue_order() {
        let store = Arc::new(RecordingStore::default());
        let queue = WriteQueue::new(store.clone(), RetryPolicy::default());

        queue.enqueue(set_item("a", "one"));
        queue.enqueue(set_item("b", "two"));
        queue.enqueue(remove_item("a"));
        queue.flush().await;

        assert_eq!(store.log(), vec!["set a", "set b", "remove a"]);
        assert!(store.get("a").await.unwrap().is_none());
        assert!(store.get("b").await.unwrap().is_some());
        assert_eq!(queue.state(), QueueState::Idle);
    }

    #[tokio::test]
    async fn last_write_per_id_wins() {
        let store = Arc::new(MemoryStore::new());
        let queue = WriteQueue::new(store.clone(), RetryPolicy::default());

        queue.enqueue(set_item("a", "one"));
        queue.enqueue(set_item("a", "two"));
        queue.flush().await;

        let entry = store.get("a").await.unwrap().unwrap();
        assert_eq!(entry.as_doc().unwrap().fields["title"], json!("two"));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_then_succeeds() {
        let store = Arc::new(FlakyStore::failing(2));
        let queue = WriteQueue::new(store.clone(), RetryPolicy::default());

        queue.enqueue(set_item("a", "one"));
        queue.flush().await;

        assert_eq!(store.attempts.load(Ordering::SeqCst), 3);
        assert!(store.get("a").await.unwrap().is_some());
        assert_eq!(queue.state(), QueueState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn drops_and_advances_after_exhausted_retries() {
        // Every set for the first item fails; the second lands anyway.
        let store = Arc::new(FlakyStore::failing(3));
        let queue = WriteQueue::new(store.clone(), RetryPolicy::default());

        queue.enqueue(set_item("a", "one"));
        queue.enqueue(set_item("b", "two"));
        queue.flush().await;

        assert!(store.get("a").await.unwrap().is_none());
        assert!(store.get("b").await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn stalls_while_backing_off() {
        let store = Arc::new(FlakyStore::failing(u32::MAX));
        let policy = RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_secs(60),
        };
        let queue = WriteQueue::new(store, policy);
        let mut states = queue.state_changes();

        queue.enqueue(set_item("a", "one"));

        let stalled = states
            .wait_for(|state| matches!(state, QueueState::Stalled(_)))
            .await
            .unwrap();
        assert!(matches!(&*stalled, QueueState::Stalled(Error::Storage(_))));
        drop(stalled);

        // The retry also fails, the item is dropped, the queue goes idle.
        queue.flush().await;
        assert_eq!(queue.state(), QueueState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_abandons_queued_items() {
        let store = Arc::new(GatedStore::new());
        let queue = WriteQueue::new(store.clone(), RetryPolicy::default());

        queue.enqueue(set_item("a", "one"));
        queue.enqueue(set_item("b", "two"));
        queue.enqueue(set_item("c", "three"));

        // Let the first write land; the worker then blocks inside the second.
        store.permits.add_permits(1);
        tokio::time::sleep(Duration::from_millis(10)).await;

        queue.shutdown();
        store.permits.add_permits(10);
        tokio::time::sleep(Duration::from_millis(10)).await;

        // The store holds a prefix of the enqueued writes: the in-flight
        // write completes, the rest is abandoned.
        let written = store.inner.log();
        assert!(written == vec!["set a"] || written == vec!["set a", "set b"]);
        assert!(store.get("c").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn enqueue_after_shutdown_is_dropped() {
        let store = Arc::new(MemoryStore::new());
        let queue = WriteQueue::new(store.clone(), RetryPolicy::default());

        queue.shutdown();
        tokio::task::yield_now().await;
        queue.enqueue(set_item("a", "one"));
        queue.flush().await;

        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn flush_on_idle_queue_returns() {
        let queue = WriteQueue::new(Arc::new(MemoryStore::new()), RetryPolicy::default());
        queue.flush().await;
        assert_eq!(queue.state(), QueueState::Idle);
    }

    #[tokio::test]
    async fn single_write_in_flight() {
        struct OverlapStore {
            inner: MemoryStore,
            in_flight: AtomicU32,
            max_seen: AtomicU32,
        }

        #[async_trait]
        impl PersistedStore for OverlapStore {
            async fn get(&self, id: &str) -> Result<Option<PersistedEntry>> {
                self.inner.get(id).await
            }

            async fn get_all(&self) -> Result<HashMap<DocId, PersistedEntry>> {
                self.inner.get_all().await
            }

            async fn set(&self, id: &str, entry: PersistedEntry) -> Result<()> {
                let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                self.max_seen.fetch_max(current, Ordering::SeqCst);
                tokio::task::yield_now().await;
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
                self.inner.set(id, entry).await
            }

            async fn set_all(&self, entries: HashMap<DocId, PersistedEntry>) -> Result<()> {
                self.inner.set_all(entries).await
            }

            async fn remove(&self, id: &str) -> Result<()> {
                self.inner.remove(id).await
            }

            async fn remove_all(&self, ids: &[DocId]) -> Result<()> {
                self.inner.remove_all(ids).await
            }

            async fn clear(&self) -> Result<()> {
                self.inner.clear().await
            }
        }

        let store = Arc::new(OverlapStore {
            inner: MemoryStore::new(),
            in_flight: AtomicU32::new(0),
            max_seen: AtomicU32::new(0),
        });
        let queue = WriteQueue::new(store.clone(), RetryPolicy::default());

        for i in 0..20 {
            queue.enqueue(set_item(&format!("doc-{i}"), "x"));
        }
        queue.flush().await;

        assert_eq!(store.max_seen.load(Ordering::SeqCst), 1);
        assert_eq!(store.inner.len(), 20);
    }
}
