//! Fakes for the gateway, transports and connection control.

use crate::connection::{AttemptSignal, ConnectionSnapshot};
use crate::error::{ConnectionError, GatewayError, TransportError};
use crate::gateway::{GatewayApi, StreamStart};
use crate::media::{MediaBuffer, MediaHandle, TrackSet};
use crate::sync::ConnectionControl;
use crate::transport::{Transport, TransportSession};
use crate::types::SourceId;
use async_trait::async_trait;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Stream start offering both transports
pub fn stream_start() -> StreamStart {
    StreamStart {
        available: true,
        primary_negotiation_url: Some("http://gateway/whep".to_string()),
        fallback_stream_url: Some("ws://gateway/stream".to_string()),
        stream_name: None,
    }
}

/// Gateway call, in the order the fake received it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayCall {
    Probe,
    Start(SourceId),
    Stop(SourceId),
}

/// Scripted gateway
pub struct FakeGateway {
    available: AtomicBool,
    probe_error: bool,
    probe_delay: Duration,
    probes: AtomicUsize,
    starts: Mutex<HashMap<SourceId, StreamStart>>,
    start_delays: Mutex<HashMap<SourceId, Duration>>,
    calls: Mutex<Vec<GatewayCall>>,
}

impl FakeGateway {
    pub fn new() -> Self {
        Self {
            available: AtomicBool::new(true),
            probe_error: false,
            probe_delay: Duration::ZERO,
            probes: AtomicUsize::new(0),
            starts: Mutex::new(HashMap::new()),
            start_delays: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_availability(self, available: bool) -> Self {
        self.available.store(available, Ordering::SeqCst);
        self
    }

    pub fn with_probe_delay(mut self, delay: Duration) -> Self {
        self.probe_delay = delay;
        self
    }

    pub fn with_probe_error(mut self) -> Self {
        self.probe_error = true;
        self
    }

    pub fn set_availability(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn set_stream_start(&self, source: &str, start: StreamStart) {
        self.starts.lock().unwrap().insert(SourceId::from(source), start);
    }

    pub fn set_start_delay(&self, source: &str, delay: Duration) {
        self.start_delays.lock().unwrap().insert(SourceId::from(source), delay);
    }

    pub fn probe_count(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    pub fn start_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, GatewayCall::Start(_)))
            .count()
    }

    pub fn stopped(&self) -> Vec<SourceId> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                GatewayCall::Stop(id) => Some(id),
                _ => None,
            })
            .collect()
    }

    pub fn calls(&self) -> Vec<GatewayCall> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: GatewayCall) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl GatewayApi for FakeGateway {
    async fn probe_availability(&self) -> Result<bool, GatewayError> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        self.record(GatewayCall::Probe);
        if !self.probe_delay.is_zero() {
            tokio::time::sleep(self.probe_delay).await;
        }
        if self.probe_error {
            return Err(GatewayError::Url("connection refused".to_string()));
        }
        Ok(self.available.load(Ordering::SeqCst))
    }

    async fn start_stream(&self, source: &SourceId) -> Result<StreamStart, GatewayError> {
        self.record(GatewayCall::Start(source.clone()));
        let delay = self.start_delays.lock().unwrap().get(source).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let start = self.starts.lock().unwrap().get(source).cloned();
        Ok(start.unwrap_or_else(stream_start))
    }

    async fn stop_stream(&self, source: &SourceId) -> Result<(), GatewayError> {
        self.record(GatewayCall::Stop(source.clone()));
        Err(GatewayError::Status {
            status: 500,
            url: format!("/stream/stop/{}", source),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Primary,
    Fallback,
}

/// Transport with a scripted delay and outcome
pub struct FakeTransport {
    kind: TransportKind,
    fail: bool,
    delay: Duration,
    close_delay: Duration,
    connects: AtomicUsize,
    open: Arc<AtomicUsize>,
    sessions: Mutex<Vec<CancellationToken>>,
}

impl FakeTransport {
    pub fn new(kind: TransportKind) -> Self {
        Self {
            kind,
            fail: false,
            delay: Duration::ZERO,
            close_delay: Duration::ZERO,
            connects: AtomicUsize::new(0),
            open: Arc::new(AtomicUsize::new(0)),
            sessions: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Sessions take `delay` to close
    pub fn with_close_delay(mut self, delay: Duration) -> Self {
        self.close_delay = delay;
        self
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Sessions connected and not yet closed
    pub fn open_sessions(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }

    /// Simulate the remote side ending every session
    pub fn end_sessions(&self) {
        for ended in self.sessions.lock().unwrap().iter() {
            ended.cancel();
        }
    }
}

#[async_trait]
impl Transport for FakeTransport {
    fn name(&self) -> &'static str {
        match self.kind {
            TransportKind::Primary => "primary",
            TransportKind::Fallback => "fallback",
        }
    }

    fn endpoint(&self, start: &StreamStart) -> Option<String> {
        match self.kind {
            TransportKind::Primary => start.primary_negotiation_url.clone(),
            TransportKind::Fallback => start.fallback_stream_url.clone(),
        }
    }

    async fn connect(
        &self,
        _source: &SourceId,
        _endpoint: &str,
        signal: &AttemptSignal,
    ) -> Result<Arc<dyn TransportSession>, TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        signal
            .select(tokio::time::sleep(self.delay))
            .await
            .ok_or(TransportError::Cancelled)?;

        if self.fail {
            return Err(TransportError::Negotiation(format!("{} refused", self.name())));
        }

        let media = match self.kind {
            TransportKind::Primary => MediaHandle::Tracks(Arc::new(TrackSet::new())),
            TransportKind::Fallback => MediaHandle::Buffer(Arc::new(MediaBuffer::new(8))),
        };
        let ended = CancellationToken::new();
        self.sessions.lock().unwrap().push(ended.clone());
        self.open.fetch_add(1, Ordering::SeqCst);

        Ok(Arc::new(FakeSession {
            media,
            ended,
            closed: AtomicBool::new(false),
            close_delay: self.close_delay,
            open: Arc::clone(&self.open),
        }))
    }
}

struct FakeSession {
    media: MediaHandle,
    ended: CancellationToken,
    closed: AtomicBool,
    close_delay: Duration,
    open: Arc<AtomicUsize>,
}

#[async_trait]
impl TransportSession for FakeSession {
    fn media(&self) -> MediaHandle {
        self.media.clone()
    }

    async fn closed(&self) {
        self.ended.cancelled().await;
    }

    async fn close(&self) {
        if !self.close_delay.is_zero() {
            tokio::time::sleep(self.close_delay).await;
        }
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.open.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// Call received by [`RecordingControl`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCall {
    Start(SourceId),
    Stop(SourceId),
    StopAll,
    Retry(SourceId),
}

/// Connection control that records calls and tracks an active set
#[derive(Default)]
pub struct RecordingControl {
    calls: Mutex<Vec<ControlCall>>,
    active: Mutex<HashSet<SourceId>>,
    failing: Mutex<HashSet<SourceId>>,
}

impl RecordingControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts of `source` settle in `error`
    pub fn fail_source(&self, source: &str) {
        self.failing.lock().unwrap().insert(SourceId::from(source));
    }

    pub fn calls(&self) -> Vec<ControlCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.calls.lock().unwrap().clear();
    }

    pub fn count(&self, call: &ControlCall) -> usize {
        self.calls().iter().filter(|c| *c == call).count()
    }

    fn settle(&self, source: &SourceId) -> ConnectionSnapshot {
        if self.failing.lock().unwrap().contains(source) {
            return ConnectionSnapshot::failed(&ConnectionError::AllTransportsFailed("scripted".into()));
        }
        ConnectionSnapshot::playing(MediaHandle::Buffer(Arc::new(MediaBuffer::new(1))))
    }
}

#[async_trait]
impl ConnectionControl for RecordingControl {
    fn start_connection(&self, source: &SourceId) -> BoxFuture<'static, ConnectionSnapshot> {
        self.calls.lock().unwrap().push(ControlCall::Start(source.clone()));
        self.active.lock().unwrap().insert(source.clone());
        let snapshot = self.settle(source);
        async move { snapshot }.boxed()
    }

    async fn stop_connection(&self, source: &SourceId) {
        self.calls.lock().unwrap().push(ControlCall::Stop(source.clone()));
        self.active.lock().unwrap().remove(source);
    }

    async fn stop_all_connections(&self) {
        self.calls.lock().unwrap().push(ControlCall::StopAll);
        self.active.lock().unwrap().clear();
    }

    fn retry_connection(&self, source: &SourceId) -> BoxFuture<'static, ConnectionSnapshot> {
        self.calls.lock().unwrap().push(ControlCall::Retry(source.clone()));
        self.active.lock().unwrap().insert(source.clone());
        let snapshot = self.settle(source);
        async move { snapshot }.boxed()
    }

    fn has_active_connections(&self) -> bool {
        !self.active.lock().unwrap().is_empty()
    }
}
