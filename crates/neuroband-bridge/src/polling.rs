use futures::future::BoxFuture;
use neuroband_types::BridgeResult;
use parking_lot::RwLock as SyncRwLock;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tracing::{debug, info, warn};

pub type PollCallback = Arc<dyn Fn() -> BoxFuture<'static, BridgeResult<()>> + Send + Sync>;

/// Wraps an async closure into the shared callback shape stored per task.
pub fn callback<F, Fut>(f: F) -> PollCallback
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = BridgeResult<()>> + Send + 'static,
{
    Arc::new(move || {
        let fut: BoxFuture<'static, BridgeResult<()>> = Box::pin(f());
        fut
    })
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PollPhase {
    Init,
    Normal,
}

#[derive(Clone, Copy, Debug)]
pub struct PollSpec {
    pub normal_interval: Duration,
    pub init_interval: Duration,
    pub init_duration: Duration,
}

struct PollTask {
    callback: PollCallback,
    spec: PollSpec,
    phase: Arc<SyncRwLock<PollPhase>>,
    handle: JoinHandle<()>,
}

/// Keyed recurring tasks, each ticking fast inside its init window and at a
/// relaxed cadence afterwards. Tasks are independent: one key's slow or
/// failing callback never stalls another key's timer.
pub struct AdaptivePoller {
    tasks: RwLock<HashMap<String, PollTask>>,
}

impl AdaptivePoller {
    pub fn new() -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
        }
    }

    /// Registers a task under `key`, replacing (and cancelling) any previous
    /// task with the same key before the new timer is armed.
    pub async fn start_adaptive_polling(&self, key: &str, callback: PollCallback, spec: PollSpec) {
        let mut tasks = self.tasks.write().await;
        if let Some(old) = tasks.remove(key) {
            old.handle.abort();
            debug!("Replacing polling task '{}'", key);
        }

        let phase = Arc::new(SyncRwLock::new(PollPhase::Init));
        let handle = tokio::spawn(Self::run_task(
            key.to_string(),
            callback.clone(),
            spec,
            phase.clone(),
        ));

        tasks.insert(
            key.to_string(),
            PollTask {
                callback,
                spec,
                phase,
                handle,
            },
        );
        debug!("Registered polling task '{}'", key);
    }

    pub async fn stop_polling(&self, key: &str) {
        if let Some(task) = self.tasks.write().await.remove(key) {
            task.handle.abort();
            debug!("Stopped polling task '{}'", key);
        }
    }

    /// Re-arms every registered task with a fresh init window. Called after a
    /// backend restart so all dependent polls pick up the recovery quickly.
    pub async fn mark_initialization_start(&self) {
        let mut tasks = self.tasks.write().await;
        info!("Initialization window started, re-arming {} polling tasks", tasks.len());

        for (key, task) in tasks.iter_mut() {
            task.handle.abort();
            let phase = Arc::new(SyncRwLock::new(PollPhase::Init));
            task.phase = phase.clone();
            task.handle = tokio::spawn(Self::run_task(
                key.clone(),
                task.callback.clone(),
                task.spec,
                phase,
            ));
        }
    }

    /// Fires every registered callback once, out of band. Timer schedules are
    /// left untouched.
    pub async fn force_immediate_check_all(&self) {
        let tasks = self.tasks.read().await;
        debug!("Forcing immediate check of {} polling tasks", tasks.len());

        for (key, task) in tasks.iter() {
            let key = key.clone();
            let callback = task.callback.clone();
            tokio::spawn(async move {
                Self::run_once(&key, &callback).await;
            });
        }
    }

    pub async fn task_phase(&self, key: &str) -> Option<PollPhase> {
        self.tasks.read().await.get(key).map(|task| *task.phase.read())
    }

    pub async fn active_keys(&self) -> Vec<String> {
        self.tasks.read().await.keys().cloned().collect()
    }

    pub async fn shutdown(&self) {
        let mut tasks = self.tasks.write().await;
        for (key, task) in tasks.drain() {
            task.handle.abort();
            debug!("Stopped polling task '{}'", key);
        }
        info!("Polling scheduler shut down");
    }

    async fn run_task(
        key: String,
        callback: PollCallback,
        spec: PollSpec,
        phase: Arc<SyncRwLock<PollPhase>>,
    ) {
        let init_until = Instant::now() + spec.init_duration;
        Self::run_once(&key, &callback).await;

        let mut ticker = interval_at(Instant::now() + spec.init_interval, spec.init_interval);
        loop {
            ticker.tick().await;
            Self::run_once(&key, &callback).await;
            if Instant::now() >= init_until {
                break;
            }
        }

        *phase.write() = PollPhase::Normal;
        debug!("Polling task '{}' switched to normal cadence", key);

        let mut ticker = interval_at(Instant::now() + spec.normal_interval, spec.normal_interval);
        loop {
            ticker.tick().await;
            Self::run_once(&key, &callback).await;
        }
    }

    async fn run_once(key: &str, callback: &PollCallback) {
        if let Err(e) = (callback)().await {
            warn!("Polling task '{}' tick failed: {}", key, e);
        }
    }
}

impl Default for AdaptivePoller {
    fn default() -> Self {
        Self::new()
    }
}
