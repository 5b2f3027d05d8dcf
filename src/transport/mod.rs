//! Transport strategies
//!
//! A lifecycle holds an ordered list of strategies and tries them in turn,
//! stopping at the first that connects. The default order is the
//! offer/answer transport first, then the socket fallback.

mod socket;
mod webrtc;

pub use self::socket::SocketTransport;
pub use self::webrtc::WebRtcTransport;

use crate::config::Config;
use crate::connection::AttemptSignal;
use crate::error::TransportError;
use crate::gateway::StreamStart;
use crate::media::MediaHandle;
use crate::types::SourceId;
use async_trait::async_trait;
use std::sync::Arc;

/// Transport attempts allowed per start: primary plus one fallback
pub const MAX_TRANSPORT_ATTEMPTS: usize = 2;

/// A live transport owned by a connection lifecycle
#[async_trait]
pub trait TransportSession: Send + Sync {
    /// Read-only view handed to consumers
    fn media(&self) -> MediaHandle;

    /// Resolves when the remote side ends the stream
    async fn closed(&self);

    /// Release every resource held by the session
    async fn close(&self);
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Name for logging
    fn name(&self) -> &'static str;

    /// Endpoint this strategy would use, if the gateway offered one
    fn endpoint(&self, start: &StreamStart) -> Option<String>;

    /// Connect, giving up as soon as `signal` is cancelled
    ///
    /// Anything created before a failure or cancellation is released before
    /// returning.
    async fn connect(
        &self,
        source: &SourceId,
        endpoint: &str,
        signal: &AttemptSignal,
    ) -> Result<Arc<dyn TransportSession>, TransportError>;
}

/// Offer/answer first, socket fallback second
pub fn default_transports(
    config: &Config,
    client: reqwest::Client,
) -> Result<Vec<Arc<dyn Transport>>, TransportError> {
    Ok(vec![
        Arc::new(WebRtcTransport::new(config, client)?),
        Arc::new(SocketTransport::new(config.fallback_buffer_capacity)),
    ])
}
