//! Live event fan-out
//!
//! Each in-flight run owns a `watch` channel carrying only its latest
//! sequence number. Subscribers never receive events through the channel:
//! they always read them from the [`EventLog`] and use the channel as a
//! wake-up signal. Backfill and live delivery therefore go through the same
//! code path, so the seam between them has no gaps and no duplicates, and
//! every subscriber keeps its own cursor.

use crate::events::{EventLog, RunEvent};
use crate::models::RunId;
use futures_util::stream::{self, BoxStream, StreamExt};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tracing::{debug, warn};

pub type EventStream = BoxStream<'static, RunEvent>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Progress {
    last_seq: u64,
    closed: bool,
}

/// Registry of per-run notification channels.
pub struct StreamBroadcaster {
    log: Arc<dyn EventLog>,
    channels: RwLock<HashMap<RunId, watch::Sender<Progress>>>,
}

impl StreamBroadcaster {
    pub fn new(log: Arc<dyn EventLog>) -> Self {
        Self {
            log,
            channels: RwLock::new(HashMap::new()),
        }
    }

    /// Register a channel for `run_id`. Returns false if one was already open.
    pub async fn open(&self, run_id: &str) -> bool {
        let mut channels = self.channels.write().await;
        if channels.contains_key(run_id) {
            return false;
        }
        let (tx, _rx) = watch::channel(Progress::default());
        channels.insert(run_id.to_string(), tx);
        true
    }

    /// Wake subscribers after `seq` was appended.
    pub async fn publish(&self, run_id: &str, seq: u64) {
        let channels = self.channels.read().await;
        if let Some(tx) = channels.get(run_id) {
            tx.send_modify(|progress| progress.last_seq = progress.last_seq.max(seq));
        }
    }

    /// Mark the run's stream finished and drop its channel.
    pub async fn close(&self, run_id: &str) {
        let removed = self.channels.write().await.remove(run_id);
        if let Some(tx) = removed {
            tx.send_modify(|progress| progress.closed = true);
            debug!(run_id, "Stream closed");
        }
    }

    #[cfg(test)]
    pub async fn is_open(&self, run_id: &str) -> bool {
        self.channels.read().await.contains_key(run_id)
    }

    /// Events of `run_id` from `from_seq` (inclusive): backfill, then live,
    /// ending after the terminal event or once the run's channel closes.
    pub async fn subscribe(&self, run_id: &str, from_seq: u64) -> EventStream {
        let rx = self
            .channels
            .read()
            .await
            .get(run_id)
            .map(watch::Sender::subscribe);

        let subscription = Subscription {
            log: self.log.clone(),
            run_id: run_id.to_string(),
            next_seq: from_seq.max(1),
            rx,
            buffer: VecDeque::new(),
            done: false,
        };

        stream::unfold(subscription, |mut sub| async move {
            sub.next_event().await.map(|event| (event, sub))
        })
        .boxed()
    }
}

/// One subscriber's private cursor.
struct Subscription {
    log: Arc<dyn EventLog>,
    run_id: RunId,
    next_seq: u64,
    rx: Option<watch::Receiver<Progress>>,
    buffer: VecDeque<RunEvent>,
    done: bool,
}

impl Subscription {
    async fn next_event(&mut self) -> Option<RunEvent> {
        loop {
            if let Some(event) = self.buffer.pop_front() {
                self.next_seq = event.seq + 1;
                if event.body.is_terminal() {
                    self.done = true;
                    self.buffer.clear();
                }
                return Some(event);
            }

            if self.done {
                return None;
            }

            // mark the current version seen before reading, so an append
            // racing with the read still wakes us
            let closed = match self.rx.as_mut() {
                Some(rx) => rx.borrow_and_update().closed,
                None => true,
            };

            if self.fill().await? {
                continue;
            }

            if closed {
                return None;
            }

            let rx = self.rx.as_mut()?;
            if rx.changed().await.is_err() {
                // sender dropped; one last read picks up anything published before
                self.rx = None;
            }
        }
    }

    /// Read everything from `next_seq`. `None` ends the stream on log failure.
    async fn fill(&mut self) -> Option<bool> {
        match self.log.read_from(&self.run_id, self.next_seq).await {
            Ok(events) => {
                let found = !events.is_empty();
                self.buffer.extend(events);
                Some(found)
            }
            Err(e) => {
                warn!(
                    run_id = %self.run_id,
                    seq = self.next_seq,
                    error = %e,
                    "Event log read failed, ending stream",
                );
                None
            }
        }
    }
}
