//! Local media gateway access
//!
//! The gateway bridges capture devices to real-time transports. It exposes
//! an HTTP api for availability and stream control, and a websocket event
//! channel used to learn when a lazily-started gateway comes up.

mod feed;
mod http;
mod types;

pub use feed::{FeedGuard, StatusFeed};
pub use http::HttpGateway;
pub use types::{GatewayEvent, StreamStart};

use crate::error::GatewayError;
use crate::types::SourceId;
use async_trait::async_trait;

/// Stream control operations offered by the gateway
#[async_trait]
pub trait GatewayApi: Send + Sync {
    /// Lightweight reachability check
    async fn probe_availability(&self) -> Result<bool, GatewayError>;

    /// Ask the gateway to start streaming a source
    async fn start_stream(&self, source: &SourceId) -> Result<StreamStart, GatewayError>;

    /// Tell the gateway a source is no longer watched; callers ignore failures
    async fn stop_stream(&self, source: &SourceId) -> Result<(), GatewayError>;
}
