//! Durable unique queues
//!
//! Items are JSON-serialized and keyed by the hash of that serialization,
//! so pushing an item equal to one still enqueued (or being worked on) is
//! a no-op. Workers lease due items in batches, delete them on success and
//! reschedule them with exponential backoff on failure.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use rand::Rng;
use serde::Serialize;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;

use crate::config::QueueConfig;
use crate::data::{QueueRecord, QueueStore};
use crate::error::Result;
use crate::metrics::{QUEUE_ITEMS_HANDLED_TOTAL, QUEUE_PUSHES_TOTAL};

/// Processes one dequeued item; an error reschedules it.
#[async_trait]
pub trait QueueHandler<T>: Send + Sync + 'static {
    async fn handle(&self, item: &T) -> Result<()>;
}

pub struct UniqueQueue<T> {
    name: &'static str,
    store: Arc<dyn QueueStore>,
    notify: Arc<Notify>,
    _item: PhantomData<fn() -> T>,
}

impl<T> Clone for UniqueQueue<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            store: self.store.clone(),
            notify: self.notify.clone(),
            _item: PhantomData,
        }
    }
}

impl<T> UniqueQueue<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(name: &'static str, store: Arc<dyn QueueStore>) -> Self {
        Self {
            name,
            store,
            notify: Arc::new(Notify::new()),
            _item: PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Enqueue `item` unless an equal item is already waiting.
    ///
    /// Returns whether a new entry was written.
    pub async fn push(&self, item: &T) -> Result<bool> {
        let payload = serde_json::to_string(item)?;
        let key = unique_key(&payload);

        let inserted = self
            .store
            .enqueue(self.name, &key, &payload, now_ms())
            .await?;

        let result = if inserted { "queued" } else { "duplicate" };
        QUEUE_PUSHES_TOTAL
            .with_label_values(&[self.name, result])
            .inc();
        if inserted {
            tracing::debug!(queue = self.name, %key, "Item queued");
            self.notify.notify_one();
        } else {
            tracing::debug!(queue = self.name, %key, "Equal item already queued");
        }

        Ok(inserted)
    }

    pub async fn len(&self) -> Result<i64> {
        self.store.queue_len(self.name).await
    }

    /// Spawn `count` workers running `handler` until `shutdown` flips to true.
    pub fn start_workers(
        &self,
        count: usize,
        handler: Arc<dyn QueueHandler<T>>,
        settings: QueueConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        (0..count)
            .map(|worker| {
                let queue = self.clone();
                let handler = handler.clone();
                let settings = settings.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    queue.run_loop(worker, handler, settings, shutdown).await;
                })
            })
            .collect()
    }

    async fn run_loop(
        &self,
        worker: usize,
        handler: Arc<dyn QueueHandler<T>>,
        settings: QueueConfig,
        mut shutdown: watch::Receiver<bool>,
    ) {
        tracing::info!(queue = self.name, worker, "Queue worker started");
        let tick = Duration::from_millis(settings.poll_interval_ms);

        loop {
            if *shutdown.borrow() {
                break;
            }

            let handled = match self.process_batch(handler.as_ref(), &settings).await {
                Ok(handled) => handled,
                Err(e) => {
                    tracing::warn!(queue = self.name, worker, error = %e, "Failed to claim queue items");
                    0
                }
            };

            if handled == 0 {
                tokio::select! {
                    _ = self.notify.notified() => {}
                    _ = tokio::time::sleep(tick) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }

        tracing::info!(queue = self.name, worker, "Queue worker stopped");
    }

    async fn process_batch(
        &self,
        handler: &dyn QueueHandler<T>,
        settings: &QueueConfig,
    ) -> Result<usize> {
        let records = self
            .store
            .claim_due(
                self.name,
                settings.batch_size,
                now_ms(),
                settings.lease_secs * 1000,
            )
            .await?;

        let count = records.len();
        for record in records {
            self.process_record(handler, settings, record).await?;
        }
        Ok(count)
    }

    async fn process_record(
        &self,
        handler: &dyn QueueHandler<T>,
        settings: &QueueConfig,
        record: QueueRecord,
    ) -> Result<()> {
        let item: T = match serde_json::from_str(&record.payload) {
            Ok(item) => item,
            Err(e) => {
                tracing::error!(queue = self.name, id = record.id, error = %e, "Dropping undecodable queue item");
                self.record_outcome("dropped");
                return self.store.complete(record.id).await;
            }
        };

        match handler.handle(&item).await {
            Ok(()) => {
                self.record_outcome("success");
                self.store.complete(record.id).await
            }
            Err(e) => {
                let attempt = u32::try_from(record.attempts + 1).unwrap_or(u32::MAX);
                if settings.max_attempts > 0 && attempt >= settings.max_attempts {
                    tracing::error!(
                        queue = self.name,
                        id = record.id,
                        attempt,
                        error = %e,
                        "Giving up on queue item"
                    );
                    self.record_outcome("dropped");
                    return self.store.complete(record.id).await;
                }

                let delay = next_backoff(
                    attempt,
                    settings.base_backoff_secs,
                    settings.max_backoff_secs,
                )
                .max(Duration::from_millis(settings.poll_interval_ms));
                tracing::warn!(
                    queue = self.name,
                    id = record.id,
                    attempt,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %e,
                    "Queue item failed"
                );
                self.record_outcome("retry");
                self.store
                    .reschedule(record.id, now_ms() + delay.as_millis() as i64, &e.to_string())
                    .await
            }
        }
    }

    fn record_outcome(&self, outcome: &str) {
        QUEUE_ITEMS_HANDLED_TOTAL
            .with_label_values(&[self.name, outcome])
            .inc();
    }
}

/// Base64 SHA-256 of the serialized item.
pub fn unique_key(payload: &str) -> String {
    BASE64.encode(Sha256::digest(payload.as_bytes()))
}

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// `base * 2^(attempt-1)` capped at `max`, plus up to a second of jitter.
fn next_backoff(attempt: u32, base_secs: u64, max_secs: u64) -> Duration {
    let pow = attempt.saturating_sub(1).min(20);
    let secs = base_secs.saturating_mul(1u64 << pow).min(max_secs);
    if secs == 0 {
        return Duration::ZERO;
    }
    let jitter_ms = rand::thread_rng().gen_range(0..1000);
    Duration::from_secs(secs) + Duration::from_millis(jitter_ms)
}
