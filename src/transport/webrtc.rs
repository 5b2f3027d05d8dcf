//! Primary transport: offer/answer negotiation against the gateway
//!
//! The client creates a receive-only offer, waits (bounded) for ICE
//! gathering so the offer carries its candidates, POSTs it to the
//! negotiation url and applies the plain-text answer. There is a single
//! signaling round trip, so trickle ICE is not used.

use super::{Transport, TransportSession};
use crate::config::Config;
use crate::connection::AttemptSignal;
use crate::error::TransportError;
use crate::gateway::StreamStart;
use crate::media::{MediaHandle, TrackSet};
use crate::types::SourceId;
use async_trait::async_trait;
use log::{debug, info};
use reqwest::header::CONTENT_TYPE;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCRtpTransceiver, RTCRtpTransceiverInit};
use webrtc::track::track_remote::TrackRemote;

const SDP_CONTENT_TYPE: &str = "application/sdp";

pub(crate) fn create_webrtc_api() -> Result<Arc<API>, TransportError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(TransportError::negotiation)?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)
        .map_err(TransportError::negotiation)?;

    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build();

    Ok(Arc::new(api))
}

/// Wait for ICE gathering, but never longer than `ceiling`
///
/// Returns false when the ceiling elapsed first. The offer then goes out with
/// whatever candidates were gathered so far.
pub(crate) async fn gather_with_ceiling<F: Future>(gather: F, ceiling: Duration) -> bool {
    tokio::time::timeout(ceiling, gather).await.is_ok()
}

pub struct WebRtcTransport {
    api: Arc<API>,
    client: reqwest::Client,
    ice_servers: Vec<String>,
    ice_gathering_timeout: Duration,
}

impl WebRtcTransport {
    pub fn new(config: &Config, client: reqwest::Client) -> Result<Self, TransportError> {
        Ok(WebRtcTransport {
            api: create_webrtc_api()?,
            client,
            ice_servers: config.ice_servers.clone(),
            ice_gathering_timeout: config.ice_gathering_timeout,
        })
    }

    async fn create_peer_connection(&self) -> Result<Arc<RTCPeerConnection>, TransportError> {
        let mut config = RTCConfiguration::default();
        if !self.ice_servers.is_empty() {
            config.ice_servers = vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }];
        }

        let connection = self
            .api
            .new_peer_connection(config)
            .await
            .map_err(TransportError::negotiation)?;
        Ok(Arc::new(connection))
    }

    /// Run the offer/answer exchange on an already created connection
    async fn negotiate(
        &self,
        connection: &Arc<RTCPeerConnection>,
        source: &SourceId,
        endpoint: &str,
        signal: &AttemptSignal,
    ) -> Result<(), TransportError> {
        for kind in [RTPCodecType::Video, RTPCodecType::Audio] {
            connection
                .add_transceiver_from_kind(
                    kind,
                    Some(RTCRtpTransceiverInit {
                        direction: RTCRtpTransceiverDirection::Recvonly,
                        send_encodings: Vec::new(),
                    }),
                )
                .await
                .map_err(TransportError::negotiation)?;
        }

        let offer = signal
            .select(connection.create_offer(None))
            .await
            .ok_or(TransportError::Cancelled)?
            .map_err(TransportError::negotiation)?;

        // must be taken before the local description starts gathering
        let mut gather_complete = connection.gathering_complete_promise().await;

        signal
            .select(connection.set_local_description(offer))
            .await
            .ok_or(TransportError::Cancelled)?
            .map_err(TransportError::negotiation)?;

        let gathered = signal
            .select(gather_with_ceiling(gather_complete.recv(), self.ice_gathering_timeout))
            .await
            .ok_or(TransportError::Cancelled)?;
        if !gathered {
            debug!(
                "{}: ICE gathering exceeded {:?}, sending offer as is",
                source, self.ice_gathering_timeout
            );
        }

        let local = connection
            .local_description()
            .await
            .ok_or_else(|| TransportError::Negotiation("no local description".to_string()))?;

        let response = signal
            .select(
                self.client
                    .post(endpoint)
                    .header(CONTENT_TYPE, SDP_CONTENT_TYPE)
                    .body(local.sdp)
                    .send(),
            )
            .await
            .ok_or(TransportError::Cancelled)?
            .map_err(TransportError::negotiation)?;

        if !response.status().is_success() {
            return Err(TransportError::Negotiation(format!(
                "negotiation endpoint answered {}",
                response.status()
            )));
        }

        let answer_sdp = signal
            .select(response.text())
            .await
            .ok_or(TransportError::Cancelled)?
            .map_err(TransportError::negotiation)?;
        let answer = RTCSessionDescription::answer(answer_sdp).map_err(TransportError::negotiation)?;

        signal
            .select(connection.set_remote_description(answer))
            .await
            .ok_or(TransportError::Cancelled)?
            .map_err(TransportError::negotiation)?;

        Ok(())
    }

    /// Wire the handlers, negotiate, and close the peer on any failure
    async fn establish(
        &self,
        connection: Arc<RTCPeerConnection>,
        source: &SourceId,
        endpoint: &str,
        signal: &AttemptSignal,
    ) -> Result<WebRtcSession, TransportError> {
        let tracks = Arc::new(TrackSet::new());
        let ended = CancellationToken::new();

        let tracks_clone = Arc::clone(&tracks);
        connection.on_track(Box::new(
            move |track: Arc<TrackRemote>, _receiver: Arc<RTCRtpReceiver>, _transceiver: Arc<RTCRtpTransceiver>| {
                let tracks = Arc::clone(&tracks_clone);
                Box::pin(async move {
                    tracks.push(track);
                })
            },
        ));

        let ended_clone = ended.clone();
        let source_clone = source.clone();
        connection.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            debug!("{}: peer connection state {}", source_clone, state);
            if matches!(state, RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed) {
                ended_clone.cancel();
            }
            Box::pin(async {})
        }));

        if let Err(e) = self.negotiate(&connection, source, endpoint, signal).await {
            // never leave a half-negotiated peer behind
            let _ = connection.close().await;
            tracks.release();
            return Err(e);
        }

        info!("{}: offer/answer negotiated with {}", source, endpoint);

        Ok(WebRtcSession {
            connection,
            tracks,
            ended,
        })
    }
}

#[async_trait]
impl Transport for WebRtcTransport {
    fn name(&self) -> &'static str {
        "webrtc"
    }

    fn endpoint(&self, start: &StreamStart) -> Option<String> {
        start.primary_negotiation_url.clone()
    }

    async fn connect(
        &self,
        source: &SourceId,
        endpoint: &str,
        signal: &AttemptSignal,
    ) -> Result<Arc<dyn TransportSession>, TransportError> {
        let connection = self.create_peer_connection().await?;
        let session = self.establish(connection, source, endpoint, signal).await?;
        Ok(Arc::new(session))
    }
}

struct WebRtcSession {
    connection: Arc<RTCPeerConnection>,
    tracks: Arc<TrackSet>,
    ended: CancellationToken,
}

#[async_trait]
impl TransportSession for WebRtcSession {
    fn media(&self) -> MediaHandle {
        MediaHandle::Tracks(Arc::clone(&self.tracks))
    }

    async fn closed(&self) {
        self.ended.cancelled().await;
    }

    async fn close(&self) {
        for transceiver in self.connection.get_transceivers().await.iter() {
            let _ = transceiver.stop().await;
        }
        let _ = self.connection.close().await;
        self.tracks.release();
        self.ended.cancel();
    }
}
