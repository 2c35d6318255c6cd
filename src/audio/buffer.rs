//! # Frame Buffer
//!
//! The hand-off point between the real-time media callback and the extractor link.
//!
//! ## Key Features:
//! - **Bounded**: holds at most `capacity` PCM chunks (25 by default)
//! - **Never blocks the producer**: a push into a full buffer drops the oldest chunk
//! - **Wakes the consumer**: the extractor sender waits on a `Notify` instead of spinning
//!
//! Dropping the oldest chunk keeps the most recent speech when the extractor falls behind.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::warn;

pub struct FrameBuffer {
    chunks: Mutex<VecDeque<Vec<u8>>>,
    capacity: usize,
    dropped: AtomicU64,
    notify: Notify,
}

impl FrameBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            chunks: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            dropped: AtomicU64::new(0),
            notify: Notify::new(),
        }
    }

    /// Append a PCM chunk. Returns `true` when an older chunk had to be dropped.
    pub fn push(&self, chunk: Vec<u8>) -> bool {
        if chunk.is_empty() {
            return false;
        }

        let overflowed = {
            let mut chunks = self.chunks.lock();
            let overflowed = if chunks.len() >= self.capacity {
                chunks.pop_front();
                true
            } else {
                false
            };
            chunks.push_back(chunk);
            overflowed
        };

        if overflowed {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(capacity = self.capacity, dropped, "Frame buffer overflow, dropped oldest chunk");
        }

        self.notify.notify_one();
        overflowed
    }

    pub fn try_pop(&self) -> Option<Vec<u8>> {
        self.chunks.lock().pop_front()
    }

    /// Pop a chunk, waiting up to `wait` for one to arrive.
    pub async fn pop_timeout(&self, wait: Duration) -> Option<Vec<u8>> {
        if let Some(chunk) = self.try_pop() {
            return Some(chunk);
        }
        // A push between the check above and this wait leaves a stored permit
        let _ = tokio::time::timeout(wait, self.notify.notified()).await;
        self.try_pop()
    }

    pub fn len(&self) -> usize {
        self.chunks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.lock().is_empty()
    }

    /// Chunks dropped because the buffer was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
