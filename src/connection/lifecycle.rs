//! Per-source connection lifecycle
//!
//! Each `start` opens a new attempt with a fresh token and cancels the one
//! before it. The attempt checks the gateway, asks it to start a stream and
//! walks the transport strategies in order. Every state commit is checked
//! against the current token, so a slow, superseded attempt can never
//! overwrite a newer one's state.

use super::attempt::AttemptSignal;
use super::state::{ConnectionSnapshot, ConnectionState, StateSlot};
use crate::availability::AvailabilityCache;
use crate::error::{ConnectionError, TransportError};
use crate::gateway::{GatewayApi, StreamStart};
use crate::transport::{MAX_TRANSPORT_ATTEMPTS, Transport, TransportSession};
use crate::types::SourceId;
use futures_util::future::{BoxFuture, Shared};
use log::{debug, info, warn};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;

/// Collaborators shared by every lifecycle of a registry
#[derive(Clone)]
pub struct LifecycleContext {
    pub gateway: Arc<dyn GatewayApi>,
    pub availability: Arc<AvailabilityCache>,
    /// Tried in order, first success wins
    pub transports: Arc<Vec<Arc<dyn Transport>>>,
}

impl LifecycleContext {
    pub fn new(
        gateway: Arc<dyn GatewayApi>,
        availability: Arc<AvailabilityCache>,
        transports: Vec<Arc<dyn Transport>>,
    ) -> Self {
        Self {
            gateway,
            availability,
            transports: Arc::new(transports),
        }
    }
}

/// Resolves once a stopped predecessor for the same source has released
/// its transport and acknowledged the stop to the gateway
pub type Drain = Shared<BoxFuture<'static, ()>>;

struct Inner {
    /// Token of the newest attempt; bumped by start and stop
    attempt: u64,
    signal: Option<AttemptSignal>,
    session: Option<Arc<dyn TransportSession>>,
    /// The gateway was asked to start this source and may need a stop
    stream_requested: bool,
    snapshot: ConnectionSnapshot,
}

pub struct ConnectionLifecycle {
    source_id: SourceId,
    context: LifecycleContext,
    slot: Arc<StateSlot>,
    generation: u64,
    predecessor: Option<Drain>,
    inner: Mutex<Inner>,
    tasks: TaskTracker,
}

impl ConnectionLifecycle {
    /// Create an idle lifecycle publishing into `slot` as `generation`
    pub fn new(source_id: SourceId, context: LifecycleContext, slot: Arc<StateSlot>, generation: u64) -> Self {
        slot.claim(generation);
        slot.publish(generation, ConnectionSnapshot::idle());

        Self {
            source_id,
            context,
            slot,
            generation,
            predecessor: None,
            inner: Mutex::new(Inner {
                attempt: 0,
                signal: None,
                session: None,
                stream_requested: false,
                snapshot: ConnectionSnapshot::idle(),
            }),
            tasks: TaskTracker::new(),
        }
    }

    /// Hold every attempt until `drain` resolves, so the gateway never sees
    /// this lifecycle's stream start before the predecessor's stop
    pub fn with_predecessor(mut self, drain: Drain) -> Self {
        self.predecessor = Some(drain);
        self
    }

    pub fn source_id(&self) -> &SourceId {
        &self.source_id
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        self.lock().snapshot.clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.lock().snapshot.state()
    }

    /// Begin a new attempt, superseding whatever was in flight
    ///
    /// The state is `loading` by the time this returns. The handle resolves
    /// with the snapshot the attempt settled on.
    pub fn start(self: &Arc<Self>) -> JoinHandle<ConnectionSnapshot> {
        let (signal, previous) = {
            let mut inner = self.lock();
            if let Some(old) = inner.signal.take() {
                old.cancel();
            }
            inner.attempt += 1;
            let signal = AttemptSignal::new(inner.attempt);
            inner.signal = Some(signal.clone());
            let previous = inner.session.take();
            self.commit(&mut inner, signal.token(), ConnectionSnapshot::loading());
            (signal, previous)
        };

        debug!("{}: attempt {} started", self.source_id, signal.token());

        let this = Arc::clone(self);
        self.tasks.spawn(async move {
            if let Some(previous) = previous {
                previous.close().await;
            }

            match this.run_attempt(&signal).await {
                Ok(session) => this.promote(&signal, session).await,
                Err(e) if e.is_cancelled() => {
                    debug!("{}: attempt {} cancelled", this.source_id, signal.token());
                }
                Err(e) => {
                    warn!("{}: {}", this.source_id, e);
                    this.publish(&signal, ConnectionSnapshot::failed(&e));
                }
            }

            this.snapshot()
        })
    }

    /// Fresh start with a new attempt token
    pub fn retry(self: &Arc<Self>) -> JoinHandle<ConnectionSnapshot> {
        info!("{}: retrying connection", self.source_id);
        self.start()
    }

    /// Cancel any attempt and release every transport resource
    ///
    /// Returns once in-flight work has drained and the state is `idle`.
    /// A failing stop acknowledgement from the gateway is ignored.
    pub async fn stop(&self) {
        let (signal, session, stream_requested) = {
            let mut inner = self.lock();
            inner.attempt += 1;
            let stream_requested = std::mem::take(&mut inner.stream_requested);
            (inner.signal.take(), inner.session.take(), stream_requested)
        };

        if let Some(signal) = signal {
            signal.cancel();
        }

        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();

        if let Some(session) = session {
            session.close().await;
        }

        {
            let mut inner = self.lock();
            let token = inner.attempt;
            self.commit(&mut inner, token, ConnectionSnapshot::idle());
        }

        if stream_requested {
            if let Err(e) = self.context.gateway.stop_stream(&self.source_id).await {
                debug!("{}: ignoring failed stop acknowledgement: {}", self.source_id, e);
            }
        }

        debug!("{}: stopped", self.source_id);
    }

    async fn run_attempt(&self, signal: &AttemptSignal) -> Result<Arc<dyn TransportSession>, ConnectionError> {
        if self.source_id.is_blank() {
            return Err(ConnectionError::NoSourceIdProvided);
        }

        if let Some(drain) = &self.predecessor {
            signal
                .select(drain.clone())
                .await
                .ok_or(ConnectionError::Cancelled)?;
        }

        let available = signal
            .select(self.context.availability.is_available())
            .await
            .ok_or(ConnectionError::Cancelled)?;
        if !available {
            return Err(ConnectionError::GatewayUnavailable("gateway is not reachable".to_string()));
        }

        self.mark_stream_requested(signal)?;
        let start = signal
            .select(self.context.gateway.start_stream(&self.source_id))
            .await
            .ok_or(ConnectionError::Cancelled)?
            .map_err(|e| ConnectionError::GatewayUnavailable(e.to_string()))?;

        if !start.available {
            return Err(ConnectionError::GatewayUnavailable(format!(
                "gateway cannot stream {}",
                self.source_id
            )));
        }

        if !self.publish(signal, ConnectionSnapshot::connecting()) {
            return Err(ConnectionError::Cancelled);
        }

        self.connect_transports(&start, signal).await
    }

    /// Try each transport with an endpoint, at most two, first success wins
    async fn connect_transports(
        &self,
        start: &StreamStart,
        signal: &AttemptSignal,
    ) -> Result<Arc<dyn TransportSession>, ConnectionError> {
        if !start.has_endpoint() {
            return Err(ConnectionError::AllTransportsFailed(
                "gateway offered no transport endpoint".to_string(),
            ));
        }

        let mut failures: Vec<String> = Vec::new();

        let candidates = self
            .context
            .transports
            .iter()
            .filter_map(|transport| transport.endpoint(start).map(|endpoint| (transport, endpoint)))
            .take(MAX_TRANSPORT_ATTEMPTS);

        for (transport, endpoint) in candidates {
            if signal.cancelled() {
                return Err(ConnectionError::Cancelled);
            }
            if !failures.is_empty() {
                warn!("{}: falling back to {} transport", self.source_id, transport.name());
            }

            match transport.connect(&self.source_id, &endpoint, signal).await {
                Ok(session) => {
                    info!("{}: connected over {}", self.source_id, transport.name());
                    return Ok(session);
                }
                Err(TransportError::Cancelled) => return Err(ConnectionError::Cancelled),
                Err(e) => {
                    warn!("{}: {} transport failed: {}", self.source_id, transport.name(), e);
                    failures.push(format!("{}: {}", transport.name(), e));
                }
            }
        }

        match failures.len() {
            0 => Err(ConnectionError::AllTransportsFailed(
                "no transport accepted the offered endpoints".to_string(),
            )),
            1 => Err(ConnectionError::NegotiationFailed(failures.remove(0))),
            _ => Err(ConnectionError::AllTransportsFailed(failures.join("; "))),
        }
    }

    /// Commit a connected session, or close it when the attempt is stale
    async fn promote(self: &Arc<Self>, signal: &AttemptSignal, session: Arc<dyn TransportSession>) {
        let committed = {
            let mut inner = self.lock();
            if inner.attempt == signal.token() && !signal.cancelled() {
                inner.session = Some(Arc::clone(&session));
                self.commit(&mut inner, signal.token(), ConnectionSnapshot::playing(session.media()))
            } else {
                false
            }
        };

        if !committed {
            debug!("{}: discarding session of superseded attempt {}", self.source_id, signal.token());
            session.close().await;
            return;
        }

        self.watch_session(signal.clone(), session);
    }

    /// Move to `error` if the remote side ends a playing stream
    fn watch_session(self: &Arc<Self>, signal: AttemptSignal, session: Arc<dyn TransportSession>) {
        let this = Arc::clone(self);
        self.tasks.spawn(async move {
            if signal.select(session.closed()).await.is_none() {
                return;
            }

            let ended = {
                let mut inner = this.lock();
                if inner.attempt != signal.token() || signal.cancelled() {
                    None
                } else {
                    let err = ConnectionError::StreamEnded("transport closed by remote".to_string());
                    this.commit(&mut inner, signal.token(), ConnectionSnapshot::failed(&err));
                    inner.session.take()
                }
            };

            if let Some(session) = ended {
                warn!("{}: stream ended by remote", this.source_id);
                session.close().await;
            }
        });
    }

    fn mark_stream_requested(&self, signal: &AttemptSignal) -> Result<(), ConnectionError> {
        let mut inner = self.lock();
        if inner.attempt != signal.token() {
            return Err(ConnectionError::Cancelled);
        }
        inner.stream_requested = true;
        Ok(())
    }

    /// Publish for an attempt; false when it has been superseded
    fn publish(&self, signal: &AttemptSignal, snapshot: ConnectionSnapshot) -> bool {
        if signal.cancelled() {
            return false;
        }
        let mut inner = self.lock();
        self.commit(&mut inner, signal.token(), snapshot)
    }

    fn commit(&self, inner: &mut Inner, token: u64, snapshot: ConnectionSnapshot) -> bool {
        if inner.attempt != token {
            return false;
        }

        let from = inner.snapshot.state();
        let to = snapshot.state();
        if !from.can_transition_to(&to) {
            warn!("{}: rejected transition {} -> {}", self.source_id, from, to);
            return false;
        }

        if from != to {
            debug!("{}: {} -> {}", self.source_id, from, to);
        }
        inner.snapshot = snapshot.clone();
        self.slot.publish(self.generation, snapshot);
        true
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}
