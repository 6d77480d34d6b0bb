//! Call event buffer
//!
//! Submissions only touch memory; delivery to the detector happens on a
//! periodic flush or, past the high watermark, an immediate asynchronous
//! one. Overflow drops the oldest unflushed events and counts them instead
//! of ever blocking the upstream signalling path. Ringing/active events are
//! also fanned out on a low-latency side channel unless the buffer is
//! already under pressure.

use acm_core::Counter;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify};

use crate::models::CallEvent;

const BATCH_CHANNEL_CAPACITY: usize = 8;
const FAST_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub struct BufferConfig {
    pub capacity: usize,
    pub high_watermark: usize,
    pub flush_interval: Duration,
}

/// Receiving ends handed to the detection pipeline
pub struct BufferReceivers {
    pub batches: mpsc::Receiver<Vec<CallEvent>>,
    pub fast: mpsc::Receiver<CallEvent>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BufferStats {
    pub submitted: u64,
    pub dropped: u64,
    pub flushed_batches: u64,
    pub fast_path_events: u64,
    pub fast_path_skipped: u64,
    pub queued: usize,
}

pub struct EventBuffer {
    queue: Mutex<VecDeque<CallEvent>>,
    config: BufferConfig,
    batch_tx: mpsc::Sender<Vec<CallEvent>>,
    fast_tx: mpsc::Sender<CallEvent>,
    flush_signal: Notify,
    submitted: Counter,
    dropped: Counter,
    flushed_batches: Counter,
    fast_path_events: Counter,
    fast_path_skipped: Counter,
}

impl EventBuffer {
    pub fn new(config: BufferConfig) -> (Arc<Self>, BufferReceivers) {
        let (batch_tx, batch_rx) = mpsc::channel(BATCH_CHANNEL_CAPACITY);
        let (fast_tx, fast_rx) = mpsc::channel(FAST_CHANNEL_CAPACITY);
        let buffer = Arc::new(Self {
            queue: Mutex::new(VecDeque::with_capacity(config.high_watermark * 2)),
            config,
            batch_tx,
            fast_tx,
            flush_signal: Notify::new(),
            submitted: Counter::new(),
            dropped: Counter::new(),
            flushed_batches: Counter::new(),
            fast_path_events: Counter::new(),
            fast_path_skipped: Counter::new(),
        });
        (
            buffer,
            BufferReceivers {
                batches: batch_rx,
                fast: fast_rx,
            },
        )
    }

    /// Enqueue one event. Never blocks and never touches I/O.
    pub fn submit(&self, event: CallEvent) {
        let fast_eligible = !event.status.is_terminal();
        let queued = self.enqueue(event.clone());
        self.submitted.inc();

        if queued >= self.config.high_watermark {
            // Backpressure: fast path off, immediate flush requested
            if fast_eligible {
                self.fast_path_skipped.inc();
            }
            self.flush_signal.notify_one();
        } else if fast_eligible {
            match self.fast_tx.try_send(event) {
                Ok(()) => self.fast_path_events.inc(),
                Err(_) => self.fast_path_skipped.inc(),
            }
        }
    }

    /// Enqueue a batch, preserving its internal order.
    pub fn submit_batch(&self, events: Vec<CallEvent>) -> usize {
        let count = events.len();
        for event in events {
            self.submit(event);
        }
        count
    }

    fn enqueue(&self, event: CallEvent) -> usize {
        let mut queue = self.queue.lock();
        queue.push_back(event);
        while queue.len() > self.config.capacity {
            queue.pop_front();
            self.dropped.inc();
        }
        queue.len()
    }

    fn drain(&self) -> Vec<CallEvent> {
        let mut queue = self.queue.lock();
        queue.drain(..).collect()
    }

    /// Periodic/watermark flush loop. The send may suspend while the
    /// detector digests the previous batch; submissions keep landing in the
    /// queue meanwhile and overflow drops oldest-first.
    pub async fn run_flusher(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.flush_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.flush_signal.notified() => {}
                _ = shutdown.changed() => {
                    let batch = self.drain();
                    if !batch.is_empty() {
                        self.flushed_batches.inc();
                        let _ = self.batch_tx.send(batch).await;
                    }
                    tracing::info!("Event buffer flusher stopped");
                    return;
                }
            }

            let batch = self.drain();
            if batch.is_empty() {
                continue;
            }
            self.flushed_batches.inc();
            if self.batch_tx.send(batch).await.is_err() {
                tracing::warn!("Detector batch channel closed, flusher exiting");
                return;
            }
        }
    }

    pub fn queued(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn stats(&self) -> BufferStats {
        BufferStats {
            submitted: self.submitted.get(),
            dropped: self.dropped.get(),
            flushed_batches: self.flushed_batches.get(),
            fast_path_events: self.fast_path_events.get(),
            fast_path_skipped: self.fast_path_skipped.get(),
            queued: self.queued(),
        }
    }
}
