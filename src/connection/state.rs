//! Connection state management

use crate::error::ConnectionError;
use crate::media::MediaHandle;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::watch;

/// Per-source connection state machine
///
/// `Error` and `Unavailable` end an attempt; only an explicit retry moves
/// them back to `Loading`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected and nothing in flight
    Idle,

    /// Checking the gateway and requesting a stream
    Loading,

    /// Negotiating a transport
    Connecting,

    /// Media is flowing
    Playing,

    /// Every transport failed, or the stream ended
    Error,

    /// Gateway unreachable or unable to stream this source
    Unavailable,
}

impl ConnectionState {
    /// Check if this state transition is valid
    pub fn can_transition_to(&self, target: &ConnectionState) -> bool {
        use ConnectionState::*;

        match (self, target) {
            // start or retry, from anywhere
            (_, Loading) => true,

            // stop, from anywhere
            (_, Idle) => true,

            // From Loading
            (Loading, Connecting) => true,
            (Loading, Unavailable) => true,
            (Loading, Error) => true, // missing source id

            // From Connecting (fallback stays in Connecting)
            (Connecting, Playing) => true,
            (Connecting, Error) => true,

            // From Playing
            (Playing, Error) => true, // stream ended under us

            // Self-transitions
            (a, b) if a == b => true,

            _ => false,
        }
    }

    /// Get a human-readable description of this state
    pub fn description(&self) -> &'static str {
        match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Loading => "loading",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Playing => "playing",
            ConnectionState::Error => "error",
            ConnectionState::Unavailable => "unavailable",
        }
    }

    /// Ended attempt, recoverable only by retry
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Error | ConnectionState::Unavailable)
    }

    /// Attempt in flight or media flowing
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ConnectionState::Loading | ConnectionState::Connecting | ConnectionState::Playing
        )
    }

    pub fn is_playing(&self) -> bool {
        matches!(self, ConnectionState::Playing)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// What consumers observe for one source
///
/// Only `playing` snapshots carry a media handle and only terminal ones
/// carry an error message; the constructors are the sole way to build one.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionSnapshot {
    state: ConnectionState,
    media: Option<MediaHandle>,
    error: Option<String>,
}

impl ConnectionSnapshot {
    pub fn idle() -> Self {
        Self::bare(ConnectionState::Idle)
    }

    pub fn loading() -> Self {
        Self::bare(ConnectionState::Loading)
    }

    pub fn connecting() -> Self {
        Self::bare(ConnectionState::Connecting)
    }

    pub fn playing(media: MediaHandle) -> Self {
        Self {
            state: ConnectionState::Playing,
            media: Some(media),
            error: None,
        }
    }

    /// Terminal snapshot for a failed attempt
    pub fn failed(err: &ConnectionError) -> Self {
        let state = match err {
            ConnectionError::GatewayUnavailable(_) => ConnectionState::Unavailable,
            _ => ConnectionState::Error,
        };
        Self {
            state,
            media: None,
            error: Some(err.to_string()),
        }
    }

    fn bare(state: ConnectionState) -> Self {
        Self {
            state,
            media: None,
            error: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn media(&self) -> Option<&MediaHandle> {
        self.media.as_ref()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }
}

impl Default for ConnectionSnapshot {
    fn default() -> Self {
        Self::idle()
    }
}

/// Per-source publication point shared by successive lifecycles
///
/// A consumer subscribed to a source keeps its receiver across stop/start.
/// Only the lifecycle currently owning the slot may publish, so a stopping
/// lifecycle can't overwrite the state of the one that replaced it.
pub struct StateSlot {
    tx: watch::Sender<ConnectionSnapshot>,
    owner: Mutex<u64>,
}

impl StateSlot {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(ConnectionSnapshot::idle());
        Self {
            tx,
            owner: Mutex::new(0),
        }
    }

    /// Hand the slot to a new lifecycle generation
    pub fn claim(&self, generation: u64) {
        *self.lock_owner() = generation;
    }

    /// Publish on behalf of `generation`; false when it no longer owns the slot
    pub fn publish(&self, generation: u64, snapshot: ConnectionSnapshot) -> bool {
        let owner = self.lock_owner();
        if *owner != generation {
            return false;
        }
        self.tx.send_replace(snapshot);
        true
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionSnapshot> {
        self.tx.subscribe()
    }

    pub fn has_subscribers(&self) -> bool {
        self.tx.receiver_count() > 0
    }

    fn lock_owner(&self) -> MutexGuard<'_, u64> {
        self.owner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for StateSlot {
    fn default() -> Self {
        Self::new()
    }
}
