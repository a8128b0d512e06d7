//! Long-running consumer-group readers.
//!
//! [`subscribe`] starts one task per (stream, group, consumer). The task reads
//! batches, hands each decoded message to a [`StreamHandler`] and acknowledges
//! it on success. A failed entry stays pending and is retried through the
//! claim pass:
//!
//! 1. On start the consumer re-reads its own pending entries.
//! 2. Every `reclaim_idle` it claims pending entries of the whole group that
//!    have been idle that long (its own included) and redelivers them.
//! 3. An entry delivered more than `max_deliveries` times, or whose payload
//!    does not decode, is copied to the dead-letter stream and acknowledged.
//!
//! Cancellation is cooperative. The shutdown signal is observed between
//! entries and while waiting on a read, never inside a handler call.

use crate::event_log::{EntryId, EventLog, LogError, StreamEntry};
use async_trait::async_trait;
use podium_protocol::{decode_record, ProtocolError};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Boxed error returned by handlers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Processes messages read from a stream.
#[async_trait]
pub trait StreamHandler: Send + Sync + 'static {
    /// Decoded message type.
    type Message: DeserializeOwned + Send;

    /// Handle one message. An error leaves the entry pending.
    async fn handle(&self, message: Self::Message) -> Result<(), BoxError>;
}

/// Failure to process one entry.
#[derive(Debug, Error)]
pub enum ConsumerError {
    /// The payload is not a valid record.
    #[error("Entry {id} could not be decoded: {source}")]
    Decode {
        /// Entry id.
        id: EntryId,
        /// Decode failure.
        source: ProtocolError,
    },

    /// The handler returned an error.
    #[error("Handler failed on entry {id}: {source}")]
    Handler {
        /// Entry id.
        id: EntryId,
        /// Handler failure.
        source: BoxError,
    },
}

/// Consumer loop settings.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Entries read per call.
    pub batch_size: usize,
    /// How long one read waits for new entries.
    pub block: Duration,
    /// Pending entries idle this long are claimed and retried.
    pub reclaim_idle: Duration,
    /// Deliveries allowed before an entry is dead-lettered.
    pub max_deliveries: u32,
    /// Appended to the stream name to form the dead-letter stream.
    pub dead_letter_suffix: String,
    /// Pause after a failed read.
    pub retry_backoff: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            batch_size: 16,
            block: Duration::from_secs(5),
            reclaim_idle: Duration::from_secs(30),
            max_deliveries: 5,
            dead_letter_suffix: ":dead-letter".to_string(),
            retry_backoff: Duration::from_secs(1),
        }
    }
}

/// Handle to a running consumer loop.
///
/// Dropping the handle also stops the loop at its next cancellation point.
#[derive(Debug)]
pub struct Subscription {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Subscription {
    /// Whether the loop has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Signal the loop to stop and wait for it. A handler call in progress
    /// runs to completion first.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            error!(error = %e, "Consumer task panicked");
        }
    }
}

/// Start consuming `stream` as `consumer` within `group`.
///
/// The group is created at the stream tail if missing.
///
/// # Errors
///
/// Returns an error if the group cannot be created.
pub async fn subscribe<H: StreamHandler>(
    log: Arc<dyn EventLog>,
    stream: impl Into<String>,
    group: impl Into<String>,
    consumer: impl Into<String>,
    handler: Arc<H>,
    config: ConsumerConfig,
) -> Result<Subscription, LogError> {
    let stream = stream.into();
    let group = group.into();
    log.ensure_group(&stream, &group).await?;

    let worker = Worker {
        dead_letter: format!("{stream}{}", config.dead_letter_suffix),
        log,
        stream,
        group,
        consumer: consumer.into(),
        handler,
        config,
    };

    let (tx, rx) = watch::channel(false);
    let task = tokio::spawn(worker.run(rx));
    Ok(Subscription { shutdown: tx, task })
}

struct Worker<H> {
    log: Arc<dyn EventLog>,
    stream: String,
    group: String,
    consumer: String,
    dead_letter: String,
    handler: Arc<H>,
    config: ConsumerConfig,
}

impl<H: StreamHandler> Worker<H> {
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            stream = %self.stream,
            group = %self.group,
            consumer = %self.consumer,
            "Consumer started"
        );

        match self
            .log
            .read_pending(&self.stream, &self.group, &self.consumer, usize::MAX)
            .await
        {
            Ok(entries) => {
                if !entries.is_empty() {
                    info!(consumer = %self.consumer, count = entries.len(), "Recovering pending entries");
                }
                self.process(entries, &shutdown).await;
            }
            Err(e) => warn!(error = %e, "Failed to read pending entries"),
        }

        let mut last_claim = Instant::now();

        loop {
            if *shutdown.borrow() {
                break;
            }

            if last_claim.elapsed() >= self.config.reclaim_idle {
                last_claim = Instant::now();
                match self
                    .log
                    .auto_claim(
                        &self.stream,
                        &self.group,
                        &self.consumer,
                        self.config.reclaim_idle,
                        self.config.batch_size,
                    )
                    .await
                {
                    Ok(entries) => self.process(entries, &shutdown).await,
                    Err(e) => warn!(error = %e, "Failed to claim idle entries"),
                }
                continue;
            }

            let read = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                read = self.log.read_group(
                    &self.stream,
                    &self.group,
                    &self.consumer,
                    self.config.batch_size,
                    Some(self.config.block),
                ) => read,
            };

            match read {
                Ok(entries) => self.process(entries, &shutdown).await,
                Err(e) => {
                    warn!(stream = %self.stream, error = %e, "Read failed");
                    tokio::select! {
                        biased;
                        _ = shutdown.changed() => break,
                        () = tokio::time::sleep(self.config.retry_backoff) => {}
                    }
                }
            }
        }

        info!(consumer = %self.consumer, "Consumer stopped");
    }

    async fn process(&self, entries: Vec<StreamEntry>, shutdown: &watch::Receiver<bool>) {
        for entry in entries {
            if *shutdown.borrow() {
                // the rest stays pending and is recovered on restart
                break;
            }
            self.process_one(entry).await;
        }
    }

    async fn process_one(&self, entry: StreamEntry) {
        if entry.delivery_count > self.config.max_deliveries {
            warn!(
                id = %entry.id,
                deliveries = entry.delivery_count,
                "Delivery limit exceeded"
            );
            self.dead_letter(&entry).await;
            return;
        }

        let message = match decode_record::<H::Message>(&entry.payload) {
            Ok(message) => message,
            Err(source) => {
                let err = ConsumerError::Decode {
                    id: entry.id,
                    source,
                };
                error!(error = %err, "Dropping undecodable entry");
                self.dead_letter(&entry).await;
                return;
            }
        };

        match self.handler.handle(message).await {
            Ok(()) => self.ack(entry.id).await,
            Err(source) => {
                let err = ConsumerError::Handler {
                    id: entry.id,
                    source,
                };
                warn!(
                    error = %err,
                    deliveries = entry.delivery_count,
                    "Entry left pending"
                );
            }
        }
    }

    async fn ack(&self, id: EntryId) {
        match self.log.ack(&self.stream, &self.group, &[id]).await {
            Ok(_) => debug!(id = %id, "Entry acknowledged"),
            Err(e) => warn!(id = %id, error = %e, "Ack failed"),
        }
    }

    async fn dead_letter(&self, entry: &StreamEntry) {
        match self
            .log
            .append(&self.dead_letter, entry.payload.clone())
            .await
        {
            Ok(dead_id) => {
                warn!(id = %entry.id, dead_letter = %self.dead_letter, dead_id = %dead_id, "Entry dead-lettered");
                self.ack(entry.id).await;
            }
            Err(e) => error!(id = %entry.id, error = %e, "Dead-letter append failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_log::{EventLogExt, MemoryEventLog};
    use bytes::Bytes;
    use parking_lot::Mutex;
    use podium_protocol::ScoreEvent;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    const STREAM: &str = "updates";
    const GROUP: &str = "history";

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<ScoreEvent>>,
        failures_left: AtomicU32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl StreamHandler for Recorder {
        type Message = ScoreEvent;

        async fn handle(&self, message: ScoreEvent) -> Result<(), BoxError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err("transient".into());
            }
            self.seen.lock().push(message);
            Ok(())
        }
    }

    fn fast_config() -> ConsumerConfig {
        ConsumerConfig {
            batch_size: 8,
            block: Duration::from_millis(100),
            reclaim_idle: Duration::from_secs(1),
            max_deliveries: 3,
            retry_backoff: Duration::from_millis(100),
            ..ConsumerConfig::default()
        }
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..1000 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test(start_paused = true)]
    async fn test_handles_and_acks() {
        let log = Arc::new(MemoryEventLog::new());
        let handler = Arc::new(Recorder::default());
        let sub = subscribe(log.clone(), STREAM, GROUP, "c1", handler.clone(), fast_config())
            .await
            .unwrap();

        log.publish(STREAM, &ScoreEvent::new("b1", "p1", 10.0))
            .await
            .unwrap();
        log.publish(STREAM, &ScoreEvent::new("b1", "p2", 20.0))
            .await
            .unwrap();

        wait_until(|| handler.seen.lock().len() == 2).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(log.pending(STREAM, GROUP).await.unwrap().is_empty());

        sub.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_entry_is_reclaimed() {
        let log = Arc::new(MemoryEventLog::new());
        let handler = Arc::new(Recorder {
            failures_left: AtomicU32::new(1),
            ..Recorder::default()
        });
        let sub = subscribe(log.clone(), STREAM, GROUP, "c1", handler.clone(), fast_config())
            .await
            .unwrap();

        log.publish(STREAM, &ScoreEvent::new("b1", "p1", 10.0))
            .await
            .unwrap();

        wait_until(|| handler.seen.lock().len() == 1).await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);

        sub.shutdown().await;
        assert!(log.pending(STREAM, GROUP).await.unwrap().is_empty());
        assert_eq!(log.len("updates:dead-letter").await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dead_letter_after_max_deliveries() {
        let log = Arc::new(MemoryEventLog::new());
        let handler = Arc::new(Recorder {
            failures_left: AtomicU32::new(u32::MAX),
            ..Recorder::default()
        });
        let sub = subscribe(log.clone(), STREAM, GROUP, "c1", handler.clone(), fast_config())
            .await
            .unwrap();

        log.publish(STREAM, &ScoreEvent::new("b1", "p1", 10.0))
            .await
            .unwrap();

        let mut dead = 0;
        for _ in 0..200 {
            dead = log.len("updates:dead-letter").await.unwrap();
            if dead == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert_eq!(dead, 1);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        assert!(log.pending(STREAM, GROUP).await.unwrap().is_empty());

        sub.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_poison_entry_dead_lettered_immediately() {
        let log = Arc::new(MemoryEventLog::new());
        let handler = Arc::new(Recorder::default());
        let sub = subscribe(log.clone(), STREAM, GROUP, "c1", handler.clone(), fast_config())
            .await
            .unwrap();

        log.append(STREAM, Bytes::from_static(b"\xc1garbage"))
            .await
            .unwrap();

        let mut dead = 0;
        for _ in 0..20 {
            dead = log.len("updates:dead-letter").await.unwrap();
            if dead == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(dead, 1);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);

        sub.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_own_pending_on_start() {
        let log = Arc::new(MemoryEventLog::new());
        log.ensure_group(STREAM, GROUP).await.unwrap();
        log.publish(STREAM, &ScoreEvent::new("b1", "p1", 10.0))
            .await
            .unwrap();
        // delivered to c1 before a crash, never acked
        log.read_group(STREAM, GROUP, "c1", 1, Some(Duration::ZERO))
            .await
            .unwrap();

        let handler = Arc::new(Recorder::default());
        let sub = subscribe(log.clone(), STREAM, GROUP, "c1", handler.clone(), fast_config())
            .await
            .unwrap();

        wait_until(|| handler.seen.lock().len() == 1).await;
        sub.shutdown().await;
        assert!(log.pending(STREAM, GROUP).await.unwrap().is_empty());
    }

    struct Slow {
        started: AtomicBool,
        finished: AtomicBool,
    }

    #[async_trait]
    impl StreamHandler for Slow {
        type Message = ScoreEvent;

        async fn handle(&self, _message: ScoreEvent) -> Result<(), BoxError> {
            self.started.store(true, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(2)).await;
            self.finished.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_waits_for_running_handler() {
        let log = Arc::new(MemoryEventLog::new());
        let handler = Arc::new(Slow {
            started: AtomicBool::new(false),
            finished: AtomicBool::new(false),
        });
        let sub = subscribe(log.clone(), STREAM, GROUP, "c1", handler.clone(), fast_config())
            .await
            .unwrap();

        log.publish(STREAM, &ScoreEvent::new("b1", "p1", 10.0))
            .await
            .unwrap();
        wait_until(|| handler.started.load(Ordering::SeqCst)).await;

        sub.shutdown().await;
        assert!(handler.finished.load(Ordering::SeqCst));
        assert!(log.pending(STREAM, GROUP).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_while_blocked() {
        let log = Arc::new(MemoryEventLog::new());
        let config = ConsumerConfig {
            block: Duration::from_secs(3600),
            ..ConsumerConfig::default()
        };
        let sub = subscribe(log, STREAM, GROUP, "c1", Arc::new(Recorder::default()), config)
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(1), sub.shutdown())
            .await
            .unwrap();
    }
}
