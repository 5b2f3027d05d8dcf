//! Push channel from the gateway
//!
//! The subscription is opened explicitly by application startup through
//! [`StatusFeed::initialize`] and lives until the returned guard is disposed.

use super::GatewayEvent;
use crate::availability::AvailabilityCache;
use async_tungstenite::tokio::{ConnectStream, connect_async};
use async_tungstenite::tungstenite::Message;
use async_tungstenite::WebSocketStream;
use futures_util::StreamExt;
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const INITIAL_BACKOFF: Duration = Duration::from_millis(500);

pub struct StatusFeed;

/// Keeps the push subscription alive; dropping it also stops the feed
pub struct FeedGuard {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl FeedGuard {
    /// Stop the feed and wait for its socket to close
    pub async fn dispose(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    pub fn is_active(&self) -> bool {
        !self.cancel.is_cancelled()
    }
}

impl Drop for FeedGuard {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl StatusFeed {
    /// Subscribe `cache` to gateway status events published at `url`
    ///
    /// Reconnects with a doubling delay capped at `max_backoff` whenever the
    /// socket can't be opened or drops.
    pub fn initialize(url: String, cache: Arc<AvailabilityCache>, max_backoff: Duration) -> FeedGuard {
        let cancel = CancellationToken::new();

        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                let mut backoff = INITIAL_BACKOFF.min(max_backoff);

                loop {
                    let connected = tokio::select! {
                        _ = cancel.cancelled() => break,
                        connected = connect_async(url.as_str()) => connected,
                    };

                    match connected {
                        Ok((ws_stream, _)) => {
                            info!("Gateway event channel connected: {}", url);
                            backoff = INITIAL_BACKOFF.min(max_backoff);
                            pump(ws_stream, &cache, &cancel).await;
                            if cancel.is_cancelled() {
                                break;
                            }
                            info!("Gateway event channel closed, reconnecting");
                        }
                        Err(e) => debug!("Gateway event channel unreachable: {}", e),
                    }

                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(max_backoff);
                }
            }
        });

        FeedGuard {
            cancel,
            task: Some(task),
        }
    }
}

async fn pump(
    mut ws_stream: WebSocketStream<ConnectStream>,
    cache: &AvailabilityCache,
    cancel: &CancellationToken,
) {
    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => None,
            msg = ws_stream.next() => Some(msg),
        };

        let Some(msg) = msg else {
            let _ = ws_stream.close(None).await;
            return;
        };

        match msg {
            Some(Ok(Message::Text(text))) => apply_message(cache, text.as_str()),
            Some(Ok(Message::Close(_))) | None => return,
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                warn!("Gateway event channel error: {}", e);
                return;
            }
        }
    }
}

fn apply_message(cache: &AvailabilityCache, text: &str) {
    match GatewayEvent::parse(text) {
        Ok(Some(event)) => cache.handle_event(&event),
        Ok(None) => {}
        Err(e) => debug!("Ignoring malformed gateway event: {}", e),
    }
}
