//! Source synchronization
//!
//! The controller is the single authority on which sources have a live
//! connection. It reconciles the active profile and its required sources
//! against the set it has itself started, and never reads that set back
//! from the registry.

mod source;

pub use source::{SourceDescriptor, SourceKind, SyncSnapshot};

use crate::connection::{ConnectionRegistry, ConnectionSnapshot};
use crate::types::{ProfileId, SourceId};
use async_trait::async_trait;
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, join_all};
use log::{debug, info, warn};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Operations the controller issues against the connection layer
#[async_trait]
pub trait ConnectionControl: Send + Sync {
    /// Register a start; the future resolves with the settled snapshot
    fn start_connection(&self, source: &SourceId) -> BoxFuture<'static, ConnectionSnapshot>;

    /// Register a retry; the future resolves with the settled snapshot
    fn retry_connection(&self, source: &SourceId) -> BoxFuture<'static, ConnectionSnapshot>;

    async fn stop_connection(&self, source: &SourceId);

    /// Resolves once every connection is stopped
    async fn stop_all_connections(&self);

    fn has_active_connections(&self) -> bool;
}

#[async_trait]
impl ConnectionControl for ConnectionRegistry {
    fn start_connection(&self, source: &SourceId) -> BoxFuture<'static, ConnectionSnapshot> {
        ConnectionRegistry::start_connection(self, source).settled().boxed()
    }

    fn retry_connection(&self, source: &SourceId) -> BoxFuture<'static, ConnectionSnapshot> {
        ConnectionRegistry::retry_connection(self, source).settled().boxed()
    }

    async fn stop_connection(&self, source: &SourceId) {
        ConnectionRegistry::stop_connection(self, source).await
    }

    async fn stop_all_connections(&self) {
        ConnectionRegistry::stop_all_connections(self).await
    }

    fn has_active_connections(&self) -> bool {
        !self.is_empty()
    }
}

/// What one reconciliation did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub started: Vec<SourceId>,
    pub stopped: Vec<SourceId>,
    /// Everything was stopped first because the profile changed or went away
    pub reset: bool,
}

impl SyncReport {
    pub fn is_noop(&self) -> bool {
        self.started.is_empty() && self.stopped.is_empty() && !self.reset
    }
}

#[derive(Default)]
struct SyncState {
    /// `None` until the first snapshot has been applied
    observed_profile: Option<Option<ProfileId>>,
    started: BTreeSet<SourceId>,
    required: BTreeSet<SourceId>,
}

pub struct SourceSyncController {
    control: Arc<dyn ConnectionControl>,
    state: Mutex<SyncState>,
    tasks: TaskTracker,
    shut_down: AtomicBool,
}

impl SourceSyncController {
    pub fn new(control: Arc<dyn ConnectionControl>) -> Self {
        Self {
            control,
            state: Mutex::new(SyncState::default()),
            tasks: TaskTracker::new(),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Reconcile the connection set against `snapshot`
    ///
    /// A profile change stops every connection and waits for them to drain
    /// before any source of the new profile is started. Starts are issued
    /// without waiting for each other; a failing source is only logged.
    pub async fn apply(&self, snapshot: &SyncSnapshot) -> SyncReport {
        let mut state = self.state.lock().await;
        let mut report = SyncReport::default();

        if self.shut_down.load(Ordering::Acquire) {
            debug!("Controller shut down, snapshot ignored");
            return report;
        }

        let profile_changed = state
            .observed_profile
            .as_ref()
            .is_some_and(|previous| *previous != snapshot.profile);
        state.observed_profile = Some(snapshot.profile.clone());

        if profile_changed {
            info!(
                "Profile changed to {}, stopping all previews",
                snapshot.profile.as_ref().map(ProfileId::as_str).unwrap_or("none")
            );
            self.control.stop_all_connections().await;
            report.stopped = std::mem::take(&mut state.started).into_iter().collect();
            report.reset = true;
        }

        if snapshot.profile.is_none() {
            if !state.started.is_empty() || self.control.has_active_connections() {
                self.control.stop_all_connections().await;
                report.stopped.extend(std::mem::take(&mut state.started));
                report.reset = true;
            }
            state.required.clear();
            return report;
        }

        let to_stop: Vec<SourceId> = state.started.difference(&snapshot.required).cloned().collect();
        let to_start: Vec<SourceId> = snapshot.required.difference(&state.started).cloned().collect();

        join_all(to_stop.iter().map(|source| self.control.stop_connection(source))).await;
        for source in &to_stop {
            state.started.remove(source);
        }

        for source in &to_start {
            let settled = self.control.start_connection(source);
            state.started.insert(source.clone());
            self.watch_start(source.clone(), settled);
        }

        state.required = snapshot.required.clone();

        if !to_start.is_empty() || !to_stop.is_empty() {
            debug!("Sync: {} started, {} stopped", to_start.len(), to_stop.len());
        }
        report.stopped.extend(to_stop);
        report.started = to_start;
        report
    }

    /// Retry a source, but only while it is still required
    pub async fn retry(&self, source: &SourceId) -> Option<ConnectionSnapshot> {
        let settled = {
            let mut state = self.state.lock().await;
            if self.shut_down.load(Ordering::Acquire) || !state.required.contains(source) {
                debug!("{}: not required, retry ignored", source);
                return None;
            }
            state.started.insert(source.clone());
            self.control.retry_connection(source)
        };

        Some(settled.await)
    }

    /// Wait for every issued start to settle
    pub async fn settled(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
    }

    /// Apply snapshots as they change until `shutdown` fires
    pub async fn run(&self, mut snapshots: watch::Receiver<SyncSnapshot>, shutdown: CancellationToken) {
        loop {
            let snapshot = snapshots.borrow_and_update().clone();
            self.apply(&snapshot).await;

            tokio::select! {
                _ = shutdown.cancelled() => break,
                changed = snapshots.changed() => {
                    if changed.is_err() {
                        debug!("Snapshot source closed");
                        break;
                    }
                }
            }
        }

        self.shutdown().await;
    }

    /// Stop every connection; only the first call has any effect
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }

        let mut state = self.state.lock().await;
        info!("Shutting down preview sync");
        self.control.stop_all_connections().await;
        state.started.clear();
        state.required.clear();
        drop(state);

        self.tasks.close();
        self.tasks.wait().await;
    }

    pub async fn started(&self) -> Vec<SourceId> {
        self.state.lock().await.started.iter().cloned().collect()
    }

    fn watch_start(&self, source: SourceId, settled: BoxFuture<'static, ConnectionSnapshot>) {
        self.tasks.spawn(async move {
            let snapshot = settled.await;
            if snapshot.state().is_terminal() {
                warn!(
                    "{}: preview {}: {}",
                    source,
                    snapshot.state(),
                    snapshot.error().unwrap_or("no details")
                );
            } else {
                debug!("{}: preview {}", source, snapshot.state());
            }
        });
    }
}
