//! Bounded in-process outbox for events whose publication failed.
//!
//! A score write and its event append are two separate calls. When the
//! append fails after the write succeeded, the encoded event is parked here
//! and a background flusher appends it once the log is reachable again.
//! Parked events are retried in their original order, and the service flushes
//! them before appending anything new, so the stream keeps submission order.
//! When the outbox is full the oldest event is discarded.

use crate::event_log::{EventLog, LogError};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const MIN_FLUSH_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone)]
struct Parked {
    seq: u64,
    stream: String,
    payload: Bytes,
}

#[derive(Debug, Default)]
struct Queue {
    items: VecDeque<Parked>,
    next_seq: u64,
    discarded: u64,
}

/// Events waiting to be appended.
#[derive(Debug)]
pub struct Outbox {
    queue: Mutex<Queue>,
    capacity: usize,
    flushing: tokio::sync::Mutex<()>,
}

impl Outbox {
    /// Create an outbox holding at most `capacity` events.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(Queue::default()),
            capacity: capacity.max(1),
            flushing: tokio::sync::Mutex::new(()),
        }
    }

    /// Park an event.
    pub fn push(&self, stream: &str, payload: Bytes) {
        let mut queue = self.queue.lock();
        if queue.items.len() >= self.capacity {
            if let Some(lost) = queue.items.pop_front() {
                queue.discarded += 1;
                error!(
                    stream = %lost.stream,
                    capacity = self.capacity,
                    "Outbox full, discarding oldest event"
                );
            }
        }
        let seq = queue.next_seq;
        queue.next_seq += 1;
        queue.items.push_back(Parked {
            seq,
            stream: stream.to_owned(),
            payload,
        });
        debug!(stream = %stream, parked = queue.items.len(), "Event parked in outbox");
    }

    /// Number of parked events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.lock().items.len()
    }

    /// Whether nothing is parked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Events discarded because the outbox was full.
    #[must_use]
    pub fn discarded(&self) -> u64 {
        self.queue.lock().discarded
    }

    /// Append parked events in order until the outbox is empty or an append
    /// fails. Returns how many were appended.
    ///
    /// # Errors
    ///
    /// Returns the first append failure. The failed event stays parked.
    pub async fn flush(&self, log: &dyn EventLog) -> Result<usize, LogError> {
        let _guard = self.flushing.lock().await;
        let mut flushed = 0;

        loop {
            let Some(next) = self.queue.lock().items.front().cloned() else {
                break;
            };
            log.append(&next.stream, next.payload).await?;

            let mut queue = self.queue.lock();
            // the event may have been discarded by an overflow meanwhile
            if queue.items.front().is_some_and(|p| p.seq == next.seq) {
                queue.items.pop_front();
            }
            flushed += 1;
        }

        if flushed > 0 {
            info!(flushed, "Outbox flushed");
        }
        Ok(flushed)
    }

    /// Periodically flush into `log` until shut down. A final flush runs on
    /// shutdown. A zero period is raised to one millisecond.
    #[must_use]
    pub fn spawn_flusher(self: Arc<Self>, log: Arc<dyn EventLog>, every: Duration) -> Flusher {
        let every = every.max(MIN_FLUSH_INTERVAL);
        let (tx, mut rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = rx.changed() => break,
                    _ = ticker.tick() => {}
                }
                if self.is_empty() {
                    continue;
                }
                if let Err(e) = self.flush(log.as_ref()).await {
                    warn!(error = %e, parked = self.len(), "Outbox flush failed");
                }
            }

            if let Err(e) = self.flush(log.as_ref()).await {
                error!(error = %e, parked = self.len(), "Final outbox flush failed");
            }
        });
        Flusher { shutdown: tx, task }
    }
}

/// Handle to a running outbox flusher.
#[derive(Debug)]
pub struct Flusher {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Flusher {
    /// Stop the flusher after a last flush attempt.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            error!(error = %e, "Outbox flusher panicked");
        }
    }
}
