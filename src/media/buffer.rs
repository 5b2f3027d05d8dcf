//! Bounded fragment buffer fed by the fallback transport
//!
//! The socket reader appends media-container fragments as they arrive and
//! the consumer drains them. When the consumer falls behind and the buffer
//! is full, the newest fragment is dropped instead of tearing the
//! connection down.

use bytes::Bytes;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::Notify;

/// Counters for a fallback stream buffer
///
/// All fields use atomic operations so the reader task and consumers can
/// touch them without coordination.
#[derive(Debug, Default)]
pub struct BufferStats {
    /// Fragments accepted into the buffer
    pub fragments_appended: AtomicU64,

    /// Fragments dropped because the buffer was full or released
    pub fragments_dropped: AtomicU64,

    /// Total payload bytes accepted
    pub bytes_appended: AtomicU64,
}

impl BufferStats {
    fn record_append(&self, size: usize) {
        self.fragments_appended.fetch_add(1, Ordering::Relaxed);
        self.bytes_appended.fetch_add(size as u64, Ordering::Relaxed);
    }

    fn record_drop(&self) {
        self.fragments_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn fragments_appended(&self) -> u64 {
        self.fragments_appended.load(Ordering::Relaxed)
    }

    pub fn fragments_dropped(&self) -> u64 {
        self.fragments_dropped.load(Ordering::Relaxed)
    }

    pub fn bytes_appended(&self) -> u64 {
        self.bytes_appended.load(Ordering::Relaxed)
    }

    /// Dropped fragments as a percentage of everything received
    pub fn drop_rate(&self) -> f64 {
        let dropped = self.fragments_dropped();
        let total = self.fragments_appended() + dropped;
        if total == 0 {
            return 0.0;
        }
        (dropped as f64 / total as f64) * 100.0
    }

    pub fn summary(&self) -> BufferSummary {
        BufferSummary {
            fragments_appended: self.fragments_appended(),
            fragments_dropped: self.fragments_dropped(),
            bytes_appended: self.bytes_appended(),
            drop_rate: self.drop_rate(),
        }
    }
}

/// Snapshot of buffer counters
#[derive(Debug, Clone)]
pub struct BufferSummary {
    pub fragments_appended: u64,
    pub fragments_dropped: u64,
    pub bytes_appended: u64,
    pub drop_rate: f64,
}

impl fmt::Display for BufferSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} fragments ({} dropped, {:.2}%), {} bytes",
            self.fragments_appended, self.fragments_dropped, self.drop_rate, self.bytes_appended
        )
    }
}

pub struct MediaBuffer {
    fragments: Mutex<VecDeque<Bytes>>,
    capacity: usize,
    released: AtomicBool,
    ready: Notify,
    stats: BufferStats,
}

impl MediaBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            fragments: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
            released: AtomicBool::new(false),
            ready: Notify::new(),
            stats: BufferStats::default(),
        }
    }

    /// Append a fragment; returns false when it was dropped
    pub fn append(&self, fragment: Bytes) -> bool {
        if self.is_released() {
            self.stats.record_drop();
            return false;
        }

        {
            let mut fragments = self.lock();
            if fragments.len() >= self.capacity {
                drop(fragments);
                self.stats.record_drop();
                return false;
            }
            self.stats.record_append(fragment.len());
            fragments.push_back(fragment);
        }

        self.ready.notify_one();
        true
    }

    /// Take the oldest buffered fragment without waiting
    pub fn pop(&self) -> Option<Bytes> {
        self.lock().pop_front()
    }

    /// Wait for the next fragment; `None` once the buffer has been released
    pub async fn next_fragment(&self) -> Option<Bytes> {
        loop {
            let notified = self.ready.notified();
            if let Some(fragment) = self.pop() {
                return Some(fragment);
            }
            if self.is_released() {
                return None;
            }
            notified.await;
        }
    }

    /// Drop everything buffered and refuse further appends
    pub fn release(&self) {
        self.released.store(true, Ordering::Release);
        self.lock().clear();
        self.ready.notify_waiters();
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
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

    pub fn stats(&self) -> &BufferStats {
        &self.stats
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<Bytes>> {
        self.fragments.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl fmt::Debug for MediaBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaBuffer")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .field("released", &self.is_released())
            .finish()
    }
}
