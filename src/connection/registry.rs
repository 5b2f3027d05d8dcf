//! Connection registry
//!
//! The only place lifecycles are created or destroyed. Starts for distinct
//! sources run independently; the map lock is held just long enough to
//! insert or remove an entry, never across an await.

use super::lifecycle::{ConnectionLifecycle, Drain, LifecycleContext};
use super::state::{ConnectionSnapshot, ConnectionState, StateSlot};
use crate::availability::AvailabilityCache;
use crate::config::Config;
use crate::error::ConnectionError;
use crate::gateway::HttpGateway;
use crate::transport::default_transports;
use crate::types::SourceId;
use futures_util::FutureExt;
use futures_util::future::join_all;
use log::{debug, error, info};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Result of asking the registry to start a source
pub enum StartOutcome {
    /// A non-terminal lifecycle already existed; nothing was started
    AlreadyActive(ConnectionSnapshot),

    /// A new attempt is running
    Started(JoinHandle<ConnectionSnapshot>),
}

impl StartOutcome {
    /// Snapshot the attempt settled on, or the existing one
    pub async fn settled(self) -> ConnectionSnapshot {
        match self {
            StartOutcome::AlreadyActive(snapshot) => snapshot,
            StartOutcome::Started(handle) => match handle.await {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    error!("Connection task failed: {}", e);
                    ConnectionSnapshot::failed(&ConnectionError::AllTransportsFailed(e.to_string()))
                }
            },
        }
    }

    pub fn is_started(&self) -> bool {
        matches!(self, StartOutcome::Started(_))
    }
}

#[derive(Default)]
struct Entries {
    lifecycles: HashMap<SourceId, Arc<ConnectionLifecycle>>,
    /// Outlive lifecycles so subscriptions survive stop/start
    slots: HashMap<SourceId, Arc<StateSlot>>,
    /// Stops still in flight, keyed by source, tagged with a ticket
    stopping: HashMap<SourceId, (u64, Drain)>,
}

impl Entries {
    /// Forget slots nobody subscribes to and no lifecycle publishes into
    fn prune_slots(&mut self) {
        let Entries {
            lifecycles,
            slots,
            stopping,
        } = self;
        slots.retain(|id, slot| {
            slot.has_subscribers() || lifecycles.contains_key(id) || stopping.contains_key(id)
        });
    }
}

pub struct ConnectionRegistry {
    context: LifecycleContext,
    entries: Mutex<Entries>,
    generation: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new(context: LifecycleContext) -> Self {
        Self {
            context,
            entries: Mutex::new(Entries::default()),
            generation: AtomicU64::new(0),
        }
    }

    /// Build the registry with the HTTP gateway and default transports
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let gateway = Arc::new(HttpGateway::new(config)?);
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        let availability = Arc::new(AvailabilityCache::new(gateway.clone()));
        let transports = default_transports(config, client)?;

        Ok(Self::new(LifecycleContext::new(gateway, availability, transports)))
    }

    pub fn availability(&self) -> &Arc<AvailabilityCache> {
        &self.context.availability
    }

    /// Start a source unless a non-terminal lifecycle already exists
    ///
    /// A lifecycle left in `error` or `unavailable` is restarted in place.
    /// A new lifecycle for a source that is still stopping waits for that
    /// stop to reach the gateway before requesting a stream.
    pub fn start_connection(&self, source_id: &SourceId) -> StartOutcome {
        let mut entries = self.lock();

        if let Some(existing) = entries.lifecycles.get(source_id) {
            let snapshot = existing.snapshot();
            if !snapshot.state().is_terminal() && snapshot.state() != ConnectionState::Idle {
                debug!("{}: already {}, start ignored", source_id, snapshot.state());
                return StartOutcome::AlreadyActive(snapshot);
            }
            return StartOutcome::Started(existing.start());
        }

        let slot = Arc::clone(
            entries
                .slots
                .entry(source_id.clone())
                .or_insert_with(|| Arc::new(StateSlot::new())),
        );
        let mut lifecycle = ConnectionLifecycle::new(
            source_id.clone(),
            self.context.clone(),
            slot,
            self.next_ticket(),
        );
        if let Some((_, drain)) = entries.stopping.get(source_id) {
            debug!("{}: waiting for previous connection to stop", source_id);
            lifecycle = lifecycle.with_predecessor(drain.clone());
        }
        let lifecycle = Arc::new(lifecycle);
        entries.lifecycles.insert(source_id.clone(), Arc::clone(&lifecycle));

        info!("{}: connection registered", source_id);
        StartOutcome::Started(lifecycle.start())
    }

    /// Stop and remove a source; unknown ids are a no-op
    pub async fn stop_connection(&self, source_id: &SourceId) {
        let (ticket, drain) = {
            let mut entries = self.lock();
            let Some(lifecycle) = entries.lifecycles.remove(source_id) else {
                return;
            };
            self.begin_drain(&mut entries, lifecycle)
        };

        drain.await;
        self.finish_drain(source_id, ticket);
        info!("{}: connection removed", source_id);
    }

    /// Stop every source and wait until all of them are idle
    pub async fn stop_all_connections(&self) {
        let drains: Vec<(SourceId, u64, Drain)> = {
            let mut entries = self.lock();
            let drained: Vec<(SourceId, Arc<ConnectionLifecycle>)> = entries.lifecycles.drain().collect();
            drained
                .into_iter()
                .map(|(id, lifecycle)| {
                    let (ticket, drain) = self.begin_drain(&mut entries, lifecycle);
                    (id, ticket, drain)
                })
                .collect()
        };

        if drains.is_empty() {
            return;
        }

        info!("Stopping {} connection(s)", drains.len());
        join_all(drains.iter().map(|(_, _, drain)| drain.clone())).await;

        for (id, ticket, _) in &drains {
            self.finish_drain(id, *ticket);
        }
    }

    /// Retry an existing lifecycle, or start one
    pub fn retry_connection(&self, source_id: &SourceId) -> StartOutcome {
        let existing = self.lock().lifecycles.get(source_id).cloned();
        match existing {
            Some(lifecycle) => StartOutcome::Started(lifecycle.retry()),
            None => self.start_connection(source_id),
        }
    }

    /// Changes to one source's state, including before its first start
    pub fn subscribe(&self, source_id: &SourceId) -> watch::Receiver<ConnectionSnapshot> {
        let mut entries = self.lock();
        entries.prune_slots();
        entries
            .slots
            .entry(source_id.clone())
            .or_insert_with(|| Arc::new(StateSlot::new()))
            .subscribe()
    }

    /// Current state of a source; idle when unknown
    pub fn snapshot(&self, source_id: &SourceId) -> ConnectionSnapshot {
        let entries = self.lock();
        match entries.lifecycles.get(source_id) {
            Some(lifecycle) => lifecycle.snapshot(),
            None => ConnectionSnapshot::idle(),
        }
    }

    /// Sources with a lifecycle in the registry, sorted
    pub fn active_keys(&self) -> Vec<SourceId> {
        let mut keys: Vec<SourceId> = self.lock().lifecycles.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.lock().lifecycles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Count of sources per state, for status reporting
    pub fn state_counts(&self) -> Vec<(ConnectionState, usize)> {
        let mut counts: Vec<(ConnectionState, usize)> = Vec::new();
        for lifecycle in self.lock().lifecycles.values() {
            let state = lifecycle.state();
            match counts.iter_mut().find(|(s, _)| *s == state) {
                Some((_, count)) => *count += 1,
                None => counts.push((state, 1)),
            }
        }
        counts
    }

    /// Run the stop on its own task, chained after any stop already in
    /// flight for the same source
    fn begin_drain(&self, entries: &mut Entries, lifecycle: Arc<ConnectionLifecycle>) -> (u64, Drain) {
        let source_id = lifecycle.source_id().clone();
        let earlier = entries.stopping.get(&source_id).map(|(_, drain)| drain.clone());
        let stop = tokio::spawn(async move { lifecycle.stop().await });

        let drain: Drain = async move {
            if let Some(earlier) = earlier {
                earlier.await;
            }
            if let Err(e) = stop.await {
                error!("Stop task failed: {}", e);
            }
        }
        .boxed()
        .shared();

        let ticket = self.next_ticket();
        entries.stopping.insert(source_id, (ticket, drain.clone()));
        (ticket, drain)
    }

    fn finish_drain(&self, source_id: &SourceId, ticket: u64) {
        let mut entries = self.lock();
        if entries.stopping.get(source_id).is_some_and(|(t, _)| *t == ticket) {
            entries.stopping.remove(source_id);
        }
        entries.prune_slots();
    }

    fn next_ticket(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn lock(&self) -> MutexGuard<'_, Entries> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FakeGateway, FakeTransport, GatewayCall, TransportKind};
    use crate::transport::Transport;
    use std::time::Duration;
    use tokio::time::Instant;

    fn registry_with(gateway: Arc<FakeGateway>, primary: Arc<FakeTransport>) -> ConnectionRegistry {
        let availability = Arc::new(AvailabilityCache::new(gateway.clone()));
        let fallback: Arc<dyn Transport> = Arc::new(FakeTransport::new(TransportKind::Fallback));
        let transports: Vec<Arc<dyn Transport>> = vec![primary, fallback];
        ConnectionRegistry::new(LifecycleContext::new(gateway, availability, transports))
    }

    fn registry() -> (ConnectionRegistry, Arc<FakeGateway>, Arc<FakeTransport>) {
        let gateway = Arc::new(FakeGateway::new());
        let primary = Arc::new(FakeTransport::new(TransportKind::Primary));
        (registry_with(gateway.clone(), primary.clone()), gateway, primary)
    }

    #[tokio::test(start_paused = true)]
    async fn test_parallel_starts_take_slowest_time() {
        let gateway = Arc::new(FakeGateway::new());
        gateway.set_start_delay("a", Duration::from_millis(100));
        gateway.set_start_delay("b", Duration::from_millis(300));
        gateway.set_start_delay("c", Duration::from_millis(900));
        let registry = registry_with(gateway, Arc::new(FakeTransport::new(TransportKind::Primary)));

        let started = Instant::now();
        let outcomes: Vec<StartOutcome> = ["a", "b", "c"]
            .into_iter()
            .map(|id| registry.start_connection(&SourceId::from(id)))
            .collect();
        let settled = join_all(outcomes.into_iter().map(StartOutcome::settled)).await;
        let elapsed = started.elapsed();

        assert!(settled.iter().all(|s| s.state() == ConnectionState::Playing));
        assert!(elapsed >= Duration::from_millis(900));
        assert!(elapsed < Duration::from_millis(1300), "starts ran sequentially: {:?}", elapsed);
    }

    #[tokio::test]
    async fn test_at_most_one_lifecycle_per_source() {
        let (registry, gateway, primary) = registry();
        let cam = SourceId::from("cam");

        let first = registry.start_connection(&cam);
        let second = registry.start_connection(&cam);

        assert!(first.is_started());
        assert!(!second.is_started());
        assert_eq!(first.settled().await.state(), ConnectionState::Playing);

        assert!(!registry.start_connection(&cam).is_started());
        assert_eq!(registry.len(), 1);
        assert_eq!(gateway.start_count(), 1);
        assert_eq!(primary.open_sessions(), 1);
    }

    #[tokio::test]
    async fn test_terminal_lifecycle_restarts() {
        let gateway = Arc::new(FakeGateway::new().with_availability(false));
        let primary = Arc::new(FakeTransport::new(TransportKind::Primary));
        let registry = registry_with(gateway, primary);
        let cam = SourceId::from("cam");

        let snapshot = registry.start_connection(&cam).settled().await;
        assert_eq!(snapshot.state(), ConnectionState::Unavailable);

        registry.availability().mark_available();
        let outcome = registry.start_connection(&cam);
        assert!(outcome.is_started());
        assert_eq!(outcome.settled().await.state(), ConnectionState::Playing);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let (registry, gateway, primary) = registry();
        let cam = SourceId::from("cam");

        registry.start_connection(&cam).settled().await;
        registry.stop_connection(&cam).await;
        let after_once = (registry.active_keys(), registry.snapshot(&cam).state());

        registry.stop_connection(&cam).await;
        registry.stop_connection(&SourceId::from("unknown")).await;

        assert_eq!((registry.active_keys(), registry.snapshot(&cam).state()), after_once);
        assert!(registry.is_empty());
        assert_eq!(primary.open_sessions(), 0);
        assert_eq!(gateway.stopped(), vec![cam]);
    }

    #[tokio::test]
    async fn test_stop_all_drains() {
        let (registry, _, primary) = registry();

        let outcomes: Vec<StartOutcome> = ["a", "b", "c"]
            .into_iter()
            .map(|id| registry.start_connection(&SourceId::from(id)))
            .collect();
        join_all(outcomes.into_iter().map(StartOutcome::settled)).await;
        assert_eq!(primary.open_sessions(), 3);

        registry.stop_all_connections().await;
        assert!(registry.is_empty());
        assert_eq!(primary.open_sessions(), 0);

        registry.stop_all_connections().await;
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_subscription_survives_restart() {
        let (registry, _, _) = registry();
        let cam = SourceId::from("cam");

        let mut rx = registry.subscribe(&cam);
        assert_eq!(rx.borrow_and_update().state(), ConnectionState::Idle);

        registry.start_connection(&cam).settled().await;
        assert_eq!(rx.borrow_and_update().state(), ConnectionState::Playing);
        assert!(rx.borrow().media().is_some());

        registry.stop_connection(&cam).await;
        assert_eq!(rx.borrow_and_update().state(), ConnectionState::Idle);
        assert!(rx.borrow().media().is_none());

        registry.start_connection(&cam).settled().await;
        assert_eq!(rx.borrow_and_update().state(), ConnectionState::Playing);
    }

    #[tokio::test]
    async fn test_unrelated_subscriptions_untouched() {
        let (registry, _, _) = registry();
        let mut other = registry.subscribe(&SourceId::from("other"));
        other.borrow_and_update();

        registry.start_connection(&SourceId::from("cam")).settled().await;

        assert!(!other.has_changed().unwrap());
    }

    #[tokio::test]
    async fn test_retry_without_lifecycle_starts() {
        let (registry, _, _) = registry();
        let cam = SourceId::from("cam");

        let outcome = registry.retry_connection(&cam);
        assert!(outcome.is_started());
        assert_eq!(outcome.settled().await.state(), ConnectionState::Playing);

        let again = registry.retry_connection(&cam);
        assert!(again.is_started());
        assert_eq!(again.settled().await.state(), ConnectionState::Playing);
        assert_eq!(registry.active_keys(), vec![cam]);
    }

    #[tokio::test]
    async fn test_state_counts() {
        let (registry, _, _) = registry();
        registry.start_connection(&SourceId::from("a")).settled().await;
        registry.start_connection(&SourceId::from("b")).settled().await;

        assert_eq!(registry.state_counts(), vec![(ConnectionState::Playing, 2)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_waits_for_previous_stop() {
        let gateway = Arc::new(FakeGateway::new());
        let primary = Arc::new(
            FakeTransport::new(TransportKind::Primary).with_close_delay(Duration::from_millis(100)),
        );
        let registry = Arc::new(registry_with(gateway.clone(), primary.clone()));
        let cam = SourceId::from("cam");

        registry.start_connection(&cam).settled().await;

        let stopping = {
            let registry = Arc::clone(&registry);
            let cam = cam.clone();
            tokio::spawn(async move { registry.stop_connection(&cam).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let settled = registry.start_connection(&cam).settled().await;
        stopping.await.unwrap();

        assert_eq!(settled.state(), ConnectionState::Playing);
        assert_eq!(registry.active_keys(), vec![cam.clone()]);
        assert_eq!(registry.snapshot(&cam).state(), ConnectionState::Playing);
        assert_eq!(primary.open_sessions(), 1);

        let calls = gateway.calls();
        let stop = calls
            .iter()
            .position(|call| *call == GatewayCall::Stop(cam.clone()))
            .unwrap();
        let last_start = calls
            .iter()
            .rposition(|call| *call == GatewayCall::Start(cam.clone()))
            .unwrap();
        assert!(stop < last_start, "stop reached the gateway after the new start: {:?}", calls);
        assert_eq!(gateway.stopped().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_predecessor_drain_stays_stopped() {
        let gateway = Arc::new(FakeGateway::new());
        let primary = Arc::new(
            FakeTransport::new(TransportKind::Primary).with_close_delay(Duration::from_millis(100)),
        );
        let registry = Arc::new(registry_with(gateway.clone(), primary.clone()));
        let cam = SourceId::from("cam");

        registry.start_connection(&cam).settled().await;
        let stopping = {
            let registry = Arc::clone(&registry);
            let cam = cam.clone();
            tokio::spawn(async move { registry.stop_connection(&cam).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let restart = registry.start_connection(&cam);
        registry.stop_connection(&cam).await;
        restart.settled().await;
        stopping.await.unwrap();

        assert!(registry.is_empty());
        assert_eq!(primary.open_sessions(), 0);
        assert_eq!(gateway.start_count(), 1);
    }

    #[tokio::test]
    async fn test_unused_subscription_slots_are_pruned() {
        let (registry, _, _) = registry();

        drop(registry.subscribe(&SourceId::from("ghost")));
        let _kept = registry.subscribe(&SourceId::from("kept"));
        assert_eq!(registry.lock().slots.len(), 1);

        let cam = SourceId::from("cam");
        registry.start_connection(&cam).settled().await;
        registry.stop_connection(&cam).await;
        assert!(!registry.lock().slots.contains_key(&cam));
        assert!(registry.lock().slots.contains_key(&SourceId::from("kept")));
    }
}
