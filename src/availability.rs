//! Gateway availability cache
//!
//! The gateway starts lazily and may take an unbounded time to come up, so
//! reachability is probed at most once per cache generation and then served
//! from memory. Concurrent callers share the in-flight probe. A negative
//! result is soft: nothing retries in a loop, the push channel flips the
//! cache once the gateway reports itself ready.

use crate::gateway::{GatewayApi, GatewayEvent};
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use log::{debug, info};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
    Unknown,
    Available,
    Unavailable,
}

impl Availability {
    pub fn as_bool(self) -> Option<bool> {
        match self {
            Availability::Unknown => None,
            Availability::Available => Some(true),
            Availability::Unavailable => Some(false),
        }
    }
}

impl From<bool> for Availability {
    fn from(available: bool) -> Self {
        if available {
            Availability::Available
        } else {
            Availability::Unavailable
        }
    }
}

type Probe = Shared<BoxFuture<'static, bool>>;

struct CacheState {
    status: Availability,
    inflight: Option<Probe>,
    /// Bumped by every reset or push so stale probe results are discarded
    generation: u64,
}

pub struct AvailabilityCache {
    gateway: Arc<dyn GatewayApi>,
    state: Mutex<CacheState>,
}

impl AvailabilityCache {
    pub fn new(gateway: Arc<dyn GatewayApi>) -> Self {
        Self {
            gateway,
            state: Mutex::new(CacheState {
                status: Availability::Unknown,
                inflight: None,
                generation: 0,
            }),
        }
    }

    /// Whether the gateway is reachable, probing at most once
    ///
    /// Transport errors while probing count as "not available" and are
    /// never returned to the caller.
    pub async fn is_available(&self) -> bool {
        let (probe, generation) = {
            let mut state = self.lock();
            if let Some(cached) = state.status.as_bool() {
                return cached;
            }

            let probe = match &state.inflight {
                Some(probe) => probe.clone(),
                None => {
                    let probe = self.new_probe();
                    state.inflight = Some(probe.clone());
                    probe
                }
            };
            (probe, state.generation)
        };

        let available = probe.await;

        let mut state = self.lock();
        if state.generation == generation {
            state.status = Availability::from(available);
            state.inflight = None;
            available
        } else {
            // a push or reset landed while probing; it wins
            state.status.as_bool().unwrap_or(available)
        }
    }

    fn new_probe(&self) -> Probe {
        let gateway = Arc::clone(&self.gateway);
        async move {
            match gateway.probe_availability().await {
                Ok(available) => available,
                Err(e) => {
                    debug!("Gateway probe failed: {}", e);
                    false
                }
            }
        }
        .boxed()
        .shared()
    }

    /// Forget the cached result and any probe in flight
    pub fn reset_cache(&self) {
        let mut state = self.lock();
        state.status = Availability::Unknown;
        state.inflight = None;
        state.generation += 1;
    }

    /// Record a push notification that the gateway is up
    pub fn mark_available(&self) {
        let mut state = self.lock();
        if state.status != Availability::Available {
            info!("Gateway reported available");
        }
        state.status = Availability::Available;
        state.inflight = None;
        state.generation += 1;
    }

    /// Apply an event from the gateway's push channel
    pub fn handle_event(&self, event: &GatewayEvent) {
        match event {
            GatewayEvent::Status { available: true } => self.mark_available(),
            GatewayEvent::Status { available: false } => {
                debug!("Gateway reported unavailable, clearing cache");
                self.reset_cache();
            }
        }
    }

    /// Peek at the cached status without probing
    pub fn cached_status(&self) -> Availability {
        self.lock().status
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeGateway;
    use futures_util::future::join_all;
    use std::time::Duration;

    #[tokio::test]
    async fn test_concurrent_callers_share_one_probe() {
        let gateway = Arc::new(FakeGateway::new().with_probe_delay(Duration::from_millis(50)));
        let cache = AvailabilityCache::new(gateway.clone());

        let results = join_all((0..10).map(|_| cache.is_available())).await;

        assert!(results.into_iter().all(|available| available));
        assert_eq!(gateway.probe_count(), 1);
        assert_eq!(cache.cached_status(), Availability::Available);

        // served from cache afterwards
        assert!(cache.is_available().await);
        assert_eq!(gateway.probe_count(), 1);
    }

    #[tokio::test]
    async fn test_probe_error_caches_unavailable() {
        let gateway = Arc::new(FakeGateway::new().with_probe_error());
        let cache = AvailabilityCache::new(gateway.clone());

        assert!(!cache.is_available().await);
        assert_eq!(cache.cached_status(), Availability::Unavailable);

        // soft failure: no retry until reset or push
        assert!(!cache.is_available().await);
        assert_eq!(gateway.probe_count(), 1);
    }

    #[tokio::test]
    async fn test_reset_triggers_new_probe() {
        let gateway = Arc::new(FakeGateway::new().with_availability(false));
        let cache = AvailabilityCache::new(gateway.clone());

        assert!(!cache.is_available().await);
        gateway.set_availability(true);
        cache.reset_cache();
        assert_eq!(cache.cached_status(), Availability::Unknown);

        assert!(cache.is_available().await);
        assert_eq!(gateway.probe_count(), 2);
    }

    #[tokio::test]
    async fn test_push_overrides_inflight_probe() {
        let gateway = Arc::new(
            FakeGateway::new()
                .with_availability(false)
                .with_probe_delay(Duration::from_millis(100)),
        );
        let cache = Arc::new(AvailabilityCache::new(gateway.clone()));

        let pending = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.is_available().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        cache.handle_event(&GatewayEvent::Status { available: true });

        assert!(pending.await.unwrap());
        assert_eq!(cache.cached_status(), Availability::Available);
    }

    #[tokio::test]
    async fn test_unavailable_push_clears_cache() {
        let gateway = Arc::new(FakeGateway::new());
        let cache = AvailabilityCache::new(gateway.clone());

        assert!(cache.is_available().await);
        cache.handle_event(&GatewayEvent::Status { available: false });
        assert_eq!(cache.cached_status(), Availability::Unknown);
    }
}
