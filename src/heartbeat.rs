//! Shared heartbeat
//!
//! Many periodic tasks ride on one timer. The timer runs only while at
//! least one task is registered; each tick runs every enabled task whose
//! interval has elapsed since its last run.

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use log::{debug, error};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

pub const DEFAULT_TICK: Duration = Duration::from_secs(1);

type Callback = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

struct HeartbeatTask {
    registration: u64,
    interval: Duration,
    callback: Callback,
    last_run: Option<Instant>,
    enabled: bool,
    forced: bool,
}

impl HeartbeatTask {
    fn is_due(&self, now: Instant) -> bool {
        if !self.enabled {
            return false;
        }
        if self.forced {
            return true;
        }
        match self.last_run {
            Some(last) => now.duration_since(last) >= self.interval,
            None => true,
        }
    }
}

#[derive(Default)]
struct State {
    tasks: HashMap<String, HeartbeatTask>,
    timer: Option<CancellationToken>,
}

struct Shared {
    tick: Duration,
    state: Mutex<State>,
    registrations: AtomicU64,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn run_due(&self) {
        let now = Instant::now();
        let due: Vec<(String, Callback)> = {
            let mut state = self.lock();
            state
                .tasks
                .iter_mut()
                .filter(|(_, task)| task.is_due(now))
                .map(|(id, task)| {
                    task.last_run = Some(now);
                    task.forced = false;
                    (id.clone(), Arc::clone(&task.callback))
                })
                .collect()
        };

        for (id, callback) in due {
            tokio::spawn(async move {
                if let Err(e) = callback().await {
                    error!("Heartbeat task {} failed: {:#}", id, e);
                }
            });
        }
    }

    fn remove(&self, id: &str, registration: u64) {
        let mut state = self.lock();
        let owned = state
            .tasks
            .get(id)
            .is_some_and(|task| task.registration == registration);
        if !owned {
            return;
        }

        state.tasks.remove(id);
        debug!("Heartbeat task {} unregistered", id);

        if state.tasks.is_empty() {
            if let Some(timer) = state.timer.take() {
                timer.cancel();
                debug!("Heartbeat timer stopped");
            }
        }
    }
}

pub struct HeartbeatScheduler {
    shared: Arc<Shared>,
}

impl HeartbeatScheduler {
    pub fn new(tick: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                tick,
                state: Mutex::new(State::default()),
                registrations: AtomicU64::new(0),
            }),
        }
    }

    /// Add a periodic task, starting the timer if it was idle
    ///
    /// Registering an id again replaces the earlier task. The task first
    /// runs on the next tick.
    pub fn register<F, Fut>(&self, id: impl Into<String>, interval: Duration, callback: F) -> Unsubscribe
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let id = id.into();
        let registration = self.shared.registrations.fetch_add(1, Ordering::Relaxed) + 1;
        let callback: Callback = Arc::new(move || callback().boxed());

        let mut state = self.shared.lock();
        state.tasks.insert(
            id.clone(),
            HeartbeatTask {
                registration,
                interval,
                callback,
                last_run: None,
                enabled: true,
                forced: false,
            },
        );
        if state.timer.is_none() {
            state.timer = Some(self.spawn_timer());
        }
        debug!("Heartbeat task {} registered every {:?}", id, interval);

        Unsubscribe {
            shared: Arc::downgrade(&self.shared),
            id,
            registration,
        }
    }

    /// Pause or resume a task without unregistering it
    pub fn set_enabled(&self, id: &str, enabled: bool) -> bool {
        match self.shared.lock().tasks.get_mut(id) {
            Some(task) => {
                task.enabled = enabled;
                true
            }
            None => false,
        }
    }

    /// Run a task on the next tick regardless of its interval
    pub fn run_now(&self, id: &str) -> bool {
        match self.shared.lock().tasks.get_mut(id) {
            Some(task) => {
                task.forced = true;
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.lock().timer.is_some()
    }

    pub fn len(&self) -> usize {
        self.shared.lock().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn spawn_timer(&self) -> CancellationToken {
        let cancel = CancellationToken::new();
        let shared = Arc::downgrade(&self.shared);
        let tick = self.shared.tick;
        let token = cancel.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // the first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(shared) = shared.upgrade() else {
                    break;
                };
                shared.run_due();
            }
        });

        cancel
    }
}

impl Default for HeartbeatScheduler {
    fn default() -> Self {
        Self::new(DEFAULT_TICK)
    }
}

impl Drop for HeartbeatScheduler {
    fn drop(&mut self) {
        if let Some(timer) = self.shared.lock().timer.take() {
            timer.cancel();
        }
    }
}

/// Removes its task when consumed
#[must_use = "dropping the handle keeps the task registered"]
pub struct Unsubscribe {
    shared: Weak<Shared>,
    id: String,
    registration: u64,
}

impl Unsubscribe {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn unsubscribe(self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.remove(&self.id, self.registration);
        }
    }
}
