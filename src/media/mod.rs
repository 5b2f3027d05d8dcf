//! Read-only views onto a live preview stream
//!
//! A [`MediaHandle`] is what consumers get back from a connection that has
//! reached `playing`. It never owns the transport: closing the connection
//! releases the underlying tracks or buffer, and the handle goes dead with it.

pub mod buffer;

pub use buffer::{BufferStats, BufferSummary, MediaBuffer};

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::watch;
use webrtc::track::track_remote::TrackRemote;

/// Remote tracks delivered by the primary transport
///
/// Tracks show up asynchronously after negotiation, so the set starts empty
/// and grows; `subscribe` lets a renderer wait for them.
pub struct TrackSet {
    tracks: RwLock<Vec<Arc<TrackRemote>>>,
    count: watch::Sender<usize>,
    released: AtomicBool,
}

impl TrackSet {
    pub fn new() -> Self {
        let (count, _) = watch::channel(0);
        Self {
            tracks: RwLock::new(Vec::new()),
            count,
            released: AtomicBool::new(false),
        }
    }

    pub fn push(&self, track: Arc<TrackRemote>) {
        if self.released.load(Ordering::Acquire) {
            return;
        }
        let len = {
            let mut tracks = self.tracks.write().unwrap_or_else(|e| e.into_inner());
            tracks.push(track);
            tracks.len()
        };
        self.count.send_replace(len);
    }

    pub fn tracks(&self) -> Vec<Arc<TrackRemote>> {
        self.tracks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn len(&self) -> usize {
        *self.count.borrow()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Track count updates
    pub fn subscribe(&self) -> watch::Receiver<usize> {
        self.count.subscribe()
    }

    pub fn release(&self) {
        self.released.store(true, Ordering::Release);
        self.tracks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.count.send_replace(0);
    }
}

impl Default for TrackSet {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
pub enum MediaHandle {
    /// Real-time tracks from the offer/answer transport
    Tracks(Arc<TrackSet>),
    /// Container fragments from the socket fallback
    Buffer(Arc<MediaBuffer>),
}

impl MediaHandle {
    pub fn kind(&self) -> &'static str {
        match self {
            MediaHandle::Tracks(_) => "tracks",
            MediaHandle::Buffer(_) => "buffer",
        }
    }

    pub fn as_tracks(&self) -> Option<&Arc<TrackSet>> {
        match self {
            MediaHandle::Tracks(tracks) => Some(tracks),
            MediaHandle::Buffer(_) => None,
        }
    }

    pub fn as_buffer(&self) -> Option<&Arc<MediaBuffer>> {
        match self {
            MediaHandle::Buffer(buffer) => Some(buffer),
            MediaHandle::Tracks(_) => None,
        }
    }
}

/// Two handles are equal when they view the same underlying stream
impl PartialEq for MediaHandle {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (MediaHandle::Tracks(a), MediaHandle::Tracks(b)) => Arc::ptr_eq(a, b),
            (MediaHandle::Buffer(a), MediaHandle::Buffer(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for MediaHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaHandle::Tracks(tracks) => write!(f, "MediaHandle::Tracks({})", tracks.len()),
            MediaHandle::Buffer(buffer) => write!(f, "MediaHandle::Buffer({:?})", buffer),
        }
    }
}
