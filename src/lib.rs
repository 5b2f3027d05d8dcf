//! Live preview connections for an editing profile's input sources.
//!
//! [`sync::SourceSyncController`] decides which sources need a preview,
//! [`connection::ConnectionRegistry`] keeps at most one
//! [`connection::ConnectionLifecycle`] per source, and each lifecycle
//! negotiates a stream with the local media gateway, falling back from the
//! offer/answer transport to a socket stream when needed.

pub mod availability;
pub mod config;
pub mod connection;
pub mod error;
pub mod gateway;
pub mod heartbeat;
pub mod media;
pub mod sync;
pub mod transport;
pub mod types;

#[cfg(test)]
pub(crate) mod test_support;
