//! Bounded FIFO between the network loop and the worker pool
//!
//! `offer` never waits: when the buffer is full the incoming envelope is
//! dropped (drop-newest) and counted. `take` parks the calling worker until
//! an envelope arrives or the queue is closed.

use crate::error::{Result, StreamError};
use crate::mqtt::envelope::Envelope;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::Notify;
use tracing::{debug, warn};

pub const DEFAULT_QUEUE_CAPACITY: usize = 500;

#[derive(Debug)]
pub struct DispatchQueue {
    items: Mutex<VecDeque<Envelope>>,
    capacity: usize,
    available: Notify,
    closed: AtomicBool,
    dropped: AtomicU64,
}

impl Default for DispatchQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

impl DispatchQueue {
    /// Creates a queue holding at most `capacity` envelopes (at least one)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
            capacity,
            available: Notify::new(),
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Envelope>> {
        // A panicking holder cannot leave the deque half-modified
        self.items.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Enqueues without blocking; false means the envelope was not accepted
    pub fn offer(&self, envelope: Envelope) -> bool {
        match self.push(envelope) {
            Ok(()) => true,
            Err(StreamError::Capacity { topic, capacity }) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    "Dispatch queue full ({}), dropped message on {} ({} dropped so far)",
                    capacity, topic, dropped
                );
                false
            }
            Err(e) => {
                debug!("{}", e);
                false
            }
        }
    }

    /// Like `offer`, but reports why the envelope was refused and does not count drops
    pub fn push(&self, envelope: Envelope) -> Result<()> {
        if self.is_closed() {
            return Err(StreamError::InvalidTransition(format!(
                "dispatch queue closed, rejecting message on {}",
                envelope.topic()
            )));
        }
        {
            let mut items = self.lock();
            if items.len() >= self.capacity {
                return Err(StreamError::Capacity {
                    topic: envelope.topic().to_string(),
                    capacity: self.capacity,
                });
            }
            items.push_back(envelope);
        }
        self.available.notify_one();
        Ok(())
    }

    /// Waits for the next envelope; `None` once closed and empty
    pub async fn take(&self) -> Option<Envelope> {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut items = self.lock();
                if let Some(envelope) = items.pop_front() {
                    let more = !items.is_empty();
                    drop(items);
                    if more {
                        // Pass the wakeup on so idle workers pick up the rest
                        self.available.notify_one();
                    }
                    return Some(envelope);
                }
            }
            if self.is_closed() {
                return None;
            }

            notified.await;
        }
    }

    /// Idempotent; wakes every waiting `take`
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!("Dispatch queue closed with {} pending", self.len());
        }
        self.available.notify_waiters();
    }

    /// Discards everything still buffered and returns how many were removed
    pub fn clear(&self) -> usize {
        let mut items = self.lock();
        let count = items.len();
        items.clear();
        count
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of envelopes rejected because the queue was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
