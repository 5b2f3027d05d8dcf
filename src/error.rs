//! Error types
//!
//! Every failure here is scoped to a single source's connection: none of
//! them should ever escape the lifecycle that produced it.

use thiserror::Error;

/// Why a connection attempt ended without reaching `playing`
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    #[error("no source id provided")]
    NoSourceIdProvided,

    #[error("gateway unavailable: {0}")]
    GatewayUnavailable(String),

    #[error("negotiation failed: {0}")]
    NegotiationFailed(String),

    #[error("all transports failed: {0}")]
    AllTransportsFailed(String),

    /// The transport closed after media had started flowing
    #[error("stream ended: {0}")]
    StreamEnded(String),

    /// Superseded or stopped; never shown to consumers
    #[error("attempt cancelled")]
    Cancelled,
}

impl ConnectionError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ConnectionError::Cancelled)
    }
}

/// Failures talking to the gateway's HTTP or socket endpoints
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("gateway answered {status} for {url}")]
    Status { status: u16, url: String },

    #[error("invalid payload: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("socket error: {0}")]
    Socket(#[from] async_tungstenite::tungstenite::Error),

    #[error("invalid gateway url: {0}")]
    Url(String),
}

/// Outcome of a single transport strategy attempt
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("cancelled")]
    Cancelled,

    #[error("{0}")]
    Negotiation(String),

    #[error("socket: {0}")]
    Socket(String),
}

impl TransportError {
    pub fn negotiation(err: impl std::fmt::Display) -> Self {
        TransportError::Negotiation(err.to_string())
    }

    pub fn socket(err: impl std::fmt::Display) -> Self {
        TransportError::Socket(err.to_string())
    }
}
