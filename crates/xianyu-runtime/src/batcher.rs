//! Conversation Batcher
//!
//! Groups bursts of messages per conversation so downstream processing runs
//! once per burst. A batch is handed off by exactly one of two triggers:
//!
//! - size: the message that brings the batch to `max_batch_size`
//! - debounce: a watcher that finds no new message for `max_wait_time`
//!
//! The open batches, their watchers and the in-flight hand-offs live in one
//! table behind one lock. Claiming a batch is a remove from that table, so
//! whichever trigger removes it first owns the hand-off.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use xianyu_core::{BatchingConfig, LiveResult};

// ----------------------------------------------------------------------------
// Batch Sink
// ----------------------------------------------------------------------------

/// Downstream processing of completed batches
#[async_trait]
pub trait BatchSink<M>: Send + Sync {
    /// Process one batch; `messages` are in arrival order
    async fn handle(&self, conversation_id: &str, messages: Vec<M>) -> LiveResult<()>;
}

/// What `add` did with the message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// Batching is disabled; the message was handed off alone
    Dispatched,
    /// The message joined an open batch of `size` messages
    Buffered { size: usize },
    /// The message completed a batch of `size` messages, now handed off
    Flushed { size: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    Unbatched,
    Size,
    Debounce,
    Cleanup,
}

impl Trigger {
    fn as_str(self) -> &'static str {
        match self {
            Trigger::Unbatched => "unbatched",
            Trigger::Size => "size",
            Trigger::Debounce => "debounce",
            Trigger::Cleanup => "cleanup",
        }
    }
}

// ----------------------------------------------------------------------------
// Batch Table
// ----------------------------------------------------------------------------

struct OpenBatch<M> {
    id: u64,
    messages: Vec<M>,
    first_received: Instant,
    last_received: Instant,
}

impl<M> OpenBatch<M> {
    fn new(id: u64, now: Instant) -> Self {
        Self {
            id,
            messages: Vec::new(),
            first_received: now,
            last_received: now,
        }
    }

    fn push(&mut self, message: M, now: Instant) -> usize {
        self.messages.push(message);
        self.last_received = now;
        self.messages.len()
    }
}

struct BatchTable<M> {
    batches: HashMap<String, OpenBatch<M>>,
    /// Debounce watcher per conversation, tagged with the batch it watches
    watchers: HashMap<String, (u64, JoinHandle<()>)>,
    handoffs: HashMap<u64, JoinHandle<()>>,
    next_id: u64,
}

impl<M> BatchTable<M> {
    fn new() -> Self {
        Self {
            batches: HashMap::new(),
            watchers: HashMap::new(),
            handoffs: HashMap::new(),
            next_id: 0,
        }
    }

    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Cancel the watcher of `conversation_id`
    fn abort_watcher(&mut self, conversation_id: &str) {
        if let Some((_, watcher)) = self.watchers.remove(conversation_id) {
            watcher.abort();
        }
    }

    /// Forget a watcher that is exiting on its own
    fn release_watcher(&mut self, conversation_id: &str, batch_id: u64) {
        if matches!(self.watchers.get(conversation_id), Some((id, _)) if *id == batch_id) {
            self.watchers.remove(conversation_id);
        }
    }
}

/// Snapshot for status reporting
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatcherStatus {
    pub enabled: bool,
    pub max_batch_size: usize,
    pub max_wait_time_ms: u64,
    pub open_batches: usize,
    pub pending_messages: usize,
    pub active_watchers: usize,
    pub inflight_handoffs: usize,
    pub delivered_batches: u64,
    pub failed_handoffs: u64,
    /// Age of the oldest open batch
    pub oldest_batch_age_ms: Option<u64>,
}

/// Result of [`ConversationBatcher::cleanup`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub flushed_batches: usize,
    pub aborted_handoffs: usize,
}

// ----------------------------------------------------------------------------
// Conversation Batcher
// ----------------------------------------------------------------------------

struct BatcherInner<M> {
    config: BatchingConfig,
    sink: Arc<dyn BatchSink<M>>,
    table: Mutex<BatchTable<M>>,
    delivered: AtomicU64,
    failed: AtomicU64,
}

impl<M: Send + 'static> BatcherInner<M> {
    /// Spawn the hand-off of a claimed batch and track it in `table`.
    ///
    /// The task is never cancelled except by `cleanup` after its grace period.
    fn spawn_handoff(
        self: &Arc<Self>,
        table: &mut BatchTable<M>,
        conversation_id: String,
        messages: Vec<M>,
        trigger: Trigger,
    ) {
        let id = table.allocate_id();
        let inner = self.clone();
        let handle = tokio::spawn(async move {
            let size = messages.len();
            debug!(conversation = %conversation_id, size, trigger = trigger.as_str(), "Handing off batch");
            // a panicking sink must still release its hand-off entry
            let outcome = AssertUnwindSafe(inner.sink.handle(&conversation_id, messages))
                .catch_unwind()
                .await;
            match outcome {
                Ok(Ok(())) => {
                    inner.delivered.fetch_add(1, Ordering::Relaxed);
                }
                Ok(Err(e)) => {
                    inner.failed.fetch_add(1, Ordering::Relaxed);
                    warn!(conversation = %conversation_id, size, "Batch hand-off failed: {}", e);
                }
                Err(_) => {
                    inner.failed.fetch_add(1, Ordering::Relaxed);
                    error!(conversation = %conversation_id, size, "Batch hand-off panicked");
                }
            }
            inner.table.lock().await.handoffs.remove(&id);
        });
        table.handoffs.insert(id, handle);
    }

    fn spawn_watcher(self: &Arc<Self>, conversation_id: String, batch_id: u64) -> JoinHandle<()> {
        tokio::spawn(self.clone().watch(conversation_id, batch_id))
    }

    /// Debounce watcher of one batch instance
    async fn watch(self: Arc<Self>, conversation_id: String, batch_id: u64) {
        let poll = self.config.poll_interval();
        let window = self.config.max_wait_time();
        loop {
            tokio::time::sleep(poll).await;

            let mut table = self.table.lock().await;
            let quiet = match table.batches.get(&conversation_id) {
                Some(batch) if batch.id == batch_id => {
                    // the size trigger owns full batches
                    if batch.messages.len() >= self.config.max_batch_size {
                        table.release_watcher(&conversation_id, batch_id);
                        return;
                    }
                    batch.last_received.elapsed() >= window
                }
                _ => {
                    table.release_watcher(&conversation_id, batch_id);
                    return;
                }
            };
            if quiet {
                table.release_watcher(&conversation_id, batch_id);
                if let Some(batch) = table.batches.remove(&conversation_id) {
                    debug!(
                        conversation = %conversation_id,
                        size = batch.messages.len(),
                        age_ms = batch.first_received.elapsed().as_millis() as u64,
                        "Debounce window elapsed"
                    );
                    self.spawn_handoff(&mut table, conversation_id, batch.messages, Trigger::Debounce);
                }
                return;
            }
        }
    }
}

/// Per-conversation buffering with a size trigger and a debounce trigger
pub struct ConversationBatcher<M> {
    inner: Arc<BatcherInner<M>>,
}

impl<M> Clone for ConversationBatcher<M> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<M: Send + 'static> ConversationBatcher<M> {
    pub fn new(config: &BatchingConfig, sink: Arc<dyn BatchSink<M>>) -> Self {
        Self {
            inner: Arc::new(BatcherInner {
                config: config.clone(),
                sink,
                table: Mutex::new(BatchTable::new()),
                delivered: AtomicU64::new(0),
                failed: AtomicU64::new(0),
            }),
        }
    }

    /// Add `message` to the open batch of `conversation_id`.
    ///
    /// Never waits for downstream processing; hand-offs run as background
    /// tasks.
    pub async fn add(&self, message: M, conversation_id: &str) -> AddOutcome {
        let config = &self.inner.config;
        let mut table = self.inner.table.lock().await;

        if !config.enabled {
            self.inner.spawn_handoff(
                &mut table,
                conversation_id.to_string(),
                vec![message],
                Trigger::Unbatched,
            );
            return AddOutcome::Dispatched;
        }

        let now = Instant::now();
        let mut batch = match table.batches.remove(conversation_id) {
            Some(batch) => batch,
            None => {
                let id = table.allocate_id();
                let watcher = self.inner.spawn_watcher(conversation_id.to_string(), id);
                table.watchers.insert(conversation_id.to_string(), (id, watcher));
                debug!(conversation = %conversation_id, "Opened batch");
                OpenBatch::new(id, now)
            }
        };

        let size = batch.push(message, now);
        if size >= config.max_batch_size {
            table.abort_watcher(conversation_id);
            info!(conversation = %conversation_id, size, "Batch full");
            self.inner.spawn_handoff(
                &mut table,
                conversation_id.to_string(),
                batch.messages,
                Trigger::Size,
            );
            return AddOutcome::Flushed { size };
        }

        table.batches.insert(conversation_id.to_string(), batch);
        AddOutcome::Buffered { size }
    }

    /// Hand off every open batch, then give in-flight hand-offs `grace` to
    /// finish before cancelling them. Safe with nothing open.
    pub async fn cleanup(&self, grace: std::time::Duration) -> CleanupReport {
        let (flushed_batches, mut handles) = {
            let mut table = self.inner.table.lock().await;

            let watched: Vec<String> = table.watchers.keys().cloned().collect();
            for conversation_id in watched {
                table.abort_watcher(&conversation_id);
            }

            let open: Vec<(String, OpenBatch<M>)> = table.batches.drain().collect();
            let flushed_batches = open.len();
            for (conversation_id, batch) in open {
                self.inner
                    .spawn_handoff(&mut table, conversation_id, batch.messages, Trigger::Cleanup);
            }
            if flushed_batches > 0 {
                info!(batches = flushed_batches, "Flushed open batches");
            }

            let handles: Vec<JoinHandle<()>> =
                table.handoffs.drain().map(|(_, handle)| handle).collect();
            (flushed_batches, handles)
        };

        let pending = handles.len();
        if tokio::time::timeout(grace, join_all(handles.iter_mut()))
            .await
            .is_err()
        {
            warn!(pending, grace_ms = grace.as_millis() as u64, "Hand-offs still running after grace period");
        }

        let mut report = CleanupReport {
            flushed_batches,
            aborted_handoffs: 0,
        };
        for handle in handles {
            if !handle.is_finished() {
                handle.abort();
                report.aborted_handoffs += 1;
            }
        }
        report
    }

    pub async fn status(&self) -> BatcherStatus {
        let config = &self.inner.config;
        let table = self.inner.table.lock().await;
        BatcherStatus {
            enabled: config.enabled,
            max_batch_size: config.max_batch_size,
            max_wait_time_ms: config.max_wait_time_ms,
            open_batches: table.batches.len(),
            pending_messages: table.batches.values().map(|b| b.messages.len()).sum(),
            active_watchers: table.watchers.len(),
            inflight_handoffs: table.handoffs.len(),
            delivered_batches: self.inner.delivered.load(Ordering::Relaxed),
            failed_handoffs: self.inner.failed.load(Ordering::Relaxed),
            oldest_batch_age_ms: table
                .batches
                .values()
                .map(|b| b.first_received.elapsed().as_millis() as u64)
                .max(),
        }
    }
}
