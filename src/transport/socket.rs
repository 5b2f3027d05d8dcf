//! Fallback transport: binary container fragments over a websocket

use super::{Transport, TransportSession};
use crate::connection::AttemptSignal;
use crate::error::TransportError;
use crate::gateway::StreamStart;
use crate::media::{MediaBuffer, MediaHandle};
use crate::types::SourceId;
use async_trait::async_trait;
use async_tungstenite::tokio::connect_async;
use async_tungstenite::tungstenite::Message;
use futures_util::StreamExt;
use log::{debug, info, warn};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub struct SocketTransport {
    buffer_capacity: usize,
}

impl SocketTransport {
    pub fn new(buffer_capacity: usize) -> Self {
        SocketTransport { buffer_capacity }
    }
}

#[async_trait]
impl Transport for SocketTransport {
    fn name(&self) -> &'static str {
        "socket"
    }

    fn endpoint(&self, start: &StreamStart) -> Option<String> {
        start.fallback_stream_url.clone()
    }

    async fn connect(
        &self,
        source: &SourceId,
        endpoint: &str,
        signal: &AttemptSignal,
    ) -> Result<Arc<dyn TransportSession>, TransportError> {
        let (mut ws_stream, _) = signal
            .select(connect_async(endpoint))
            .await
            .ok_or(TransportError::Cancelled)?
            .map_err(TransportError::socket)?;

        let buffer = Arc::new(MediaBuffer::new(self.buffer_capacity));
        let ended = CancellationToken::new();

        let reader = tokio::spawn({
            let buffer = Arc::clone(&buffer);
            let ended = ended.clone();
            let source = source.clone();
            async move {
                loop {
                    let msg = tokio::select! {
                        _ = ended.cancelled() => None,
                        msg = ws_stream.next() => Some(msg),
                    };
                    let Some(msg) = msg else {
                        break;
                    };

                    match msg {
                        Some(Ok(Message::Binary(fragment))) => {
                            if !buffer.append(fragment) {
                                debug!("{}: fallback buffer full, fragment dropped", source);
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            info!("{}: fallback stream closed by gateway", source);
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!("{}: fallback stream error: {}", source, e);
                            break;
                        }
                    }
                }
                ended.cancel();
                let _ = ws_stream.close(None).await;
                debug!("{}: fallback reader stopped ({})", source, buffer.stats().summary());
            }
        });

        Ok(Arc::new(SocketSession {
            buffer,
            ended,
            reader: Mutex::new(Some(reader)),
        }))
    }
}

struct SocketSession {
    buffer: Arc<MediaBuffer>,
    ended: CancellationToken,
    reader: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl TransportSession for SocketSession {
    fn media(&self) -> MediaHandle {
        MediaHandle::Buffer(Arc::clone(&self.buffer))
    }

    async fn closed(&self) {
        self.ended.cancelled().await;
    }

    async fn close(&self) {
        self.ended.cancel();
        let reader = self
            .reader
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(reader) = reader {
            let _ = reader.await;
        }
        self.buffer.release();
    }
}
