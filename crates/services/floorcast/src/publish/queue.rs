//! Bounded chunk queue for the publish worker
//!
//! Implements a drop-oldest policy: the relay side never blocks on a slow
//! encoder, the oldest pending chunk is evicted instead.

use std::collections::VecDeque;

use parking_lot::{Condvar, Mutex};

use crate::media::MediaChunk;
use crate::metrics::global_metrics;

/// Bounded queue shared between the relay task and the worker thread
pub struct ChunkQueue {
    inner: Mutex<QueueInner>,
    condvar: Condvar,
    capacity: usize,
}

struct QueueInner {
    chunks: VecDeque<MediaChunk>,
    closed: bool,
    dropped: u64,
}

impl ChunkQueue {
    /// Create a queue holding at most `capacity` pending chunks
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(QueueInner {
                chunks: VecDeque::with_capacity(capacity),
                closed: false,
                dropped: 0,
            }),
            condvar: Condvar::new(),
            capacity,
        }
    }

    /// Push a chunk, evicting the oldest pending one if the queue is full
    ///
    /// Returns the evicted chunk. Pushing to a closed queue discards the
    /// chunk and returns `None`.
    pub fn push(&self, chunk: MediaChunk) -> Option<MediaChunk> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return None;
        }

        let evicted = if inner.chunks.len() >= self.capacity {
            inner.dropped += 1;
            inner.chunks.pop_front()
        } else {
            None
        };

        if let Some(old) = &evicted {
            global_metrics().queue_evicted(1);
            tracing::warn!(
                media_type = %old.media_type,
                sequence = old.sequence_number,
                capacity = self.capacity,
                "Worker queue full, dropped oldest chunk"
            );
        }

        inner.chunks.push_back(chunk);
        self.condvar.notify_one();
        evicted
    }

    /// Pop the oldest chunk, blocking until one arrives
    ///
    /// Returns `None` once the queue has been closed.
    pub fn pop(&self) -> Option<MediaChunk> {
        let mut inner = self.inner.lock();
        loop {
            if inner.closed {
                return None;
            }
            if let Some(chunk) = inner.chunks.pop_front() {
                return Some(chunk);
            }
            self.condvar.wait(&mut inner);
        }
    }

    /// Close the queue and discard everything still pending
    ///
    /// Returns the number of discarded chunks. Wakes a blocked `pop`.
    pub fn close_and_discard(&self) -> usize {
        let mut inner = self.inner.lock();
        inner.closed = true;
        let discarded = inner.chunks.len();
        inner.chunks.clear();
        self.condvar.notify_all();
        discarded
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().chunks.is_empty()
    }

    /// Total chunks evicted by the drop-oldest policy
    pub fn dropped(&self) -> u64 {
        self.inner.lock().dropped
    }
}
