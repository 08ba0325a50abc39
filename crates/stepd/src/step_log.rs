//! In-memory output buffer for a single step.
//!
//! Holds every byte the step has written and fans new writes out to live
//! subscribers. The buffer is bound to a cancellation token: once the token
//! fires the buffer is done, later writes are dropped, and every subscriber
//! channel is closed after delivering what was already queued.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::debug;

use crate::engine::OutputSink;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StepLogError {
    #[error("offset {offset} is past the end of the log ({len} bytes)")]
    InvalidOffset { offset: usize, len: usize },
}

pub type Result<T> = std::result::Result<T, StepLogError>;

/// Handle identifying one subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// History plus the live channel for bytes written after it.
#[derive(Debug)]
pub struct Subscription {
    pub id: SubscriptionId,
    /// Bytes already buffered, starting at the requested offset.
    pub history: Vec<u8>,
    /// Chunks written after `history` was taken. Closes when the log is done
    /// or the subscriber is removed.
    pub receiver: mpsc::UnboundedReceiver<Vec<u8>>,
}

#[derive(Debug, Default)]
struct Inner {
    data: Vec<u8>,
    subscribers: HashMap<SubscriptionId, mpsc::UnboundedSender<Vec<u8>>>,
    next_id: u64,
    closed: bool,
}

#[derive(Debug)]
pub struct StepLog {
    inner: Mutex<Inner>,
    done: CancellationToken,
}

impl StepLog {
    /// Create a buffer that finishes when `done` is cancelled.
    pub fn new(done: CancellationToken) -> Arc<Self> {
        let log = Arc::new(Self {
            inner: Mutex::new(Inner::default()),
            done,
        });

        let watcher = Arc::clone(&log);
        tokio::spawn(async move {
            watcher.done.cancelled().await;
            watcher.close_out();
        });

        log
    }

    /// Resolves when the owning scope has ended.
    pub fn done(&self) -> WaitForCancellationFuture<'_> {
        self.done.cancelled()
    }

    pub fn is_done(&self) -> bool {
        self.done.is_cancelled()
    }

    /// Number of bytes buffered so far.
    pub(crate) fn len(&self) -> usize {
        self.lock().data.len()
    }

    /// Subscribe from `offset`. The history copy and the registration of the
    /// live channel happen under one lock, so no write falls between them.
    pub fn subscribe(&self, offset: usize) -> Result<Subscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.lock();

        let len = inner.data.len();
        if offset > len {
            return Err(StepLogError::InvalidOffset { offset, len });
        }

        let id = SubscriptionId(inner.next_id);
        inner.next_id += 1;
        let history = inner.data[offset..].to_vec();

        // A finished log hands out history and an already-closed channel.
        if !inner.closed && !self.is_done() {
            inner.subscribers.insert(id, tx);
        }

        Ok(Subscription {
            id,
            history,
            receiver: rx,
        })
    }

    /// Remove a subscriber, closing its channel. Safe to call repeatedly and
    /// after the log is done.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        if self.lock().subscribers.remove(&id).is_some() {
            debug!(subscriber = id.0, "log subscriber removed");
        }
    }

    #[cfg(test)]
    fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    fn close_out(&self) {
        let mut inner = self.lock();
        inner.closed = true;
        inner.subscribers.clear();
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl OutputSink for StepLog {
    fn write(&self, chunk: &[u8]) {
        if chunk.is_empty() {
            return;
        }

        let mut inner = self.lock();
        if inner.closed || self.done.is_cancelled() {
            return;
        }

        inner.data.extend_from_slice(chunk);
        // Drop subscribers whose receiving side has gone away.
        inner
            .subscribers
            .retain(|_, tx| tx.send(chunk.to_vec()).is_ok());
    }
}
