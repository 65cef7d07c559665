//! Periodic background tasks with deterministic shutdown.

use crate::sync::{CameraHealthMonitor, RetentionSweeper, SyncEngine};
use anyhow::Result;
use async_trait::async_trait;
use log::{debug, error, info};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// One unit of periodic work
#[async_trait]
pub trait PeriodicTask: Send + Sync {
    async fn run_once(&self) -> Result<()>;
}

/// Runs the retention sweeper on each tick
pub struct RetentionTask {
    sweeper: Arc<RetentionSweeper>,
}

impl RetentionTask {
    pub fn new(sweeper: Arc<RetentionSweeper>) -> Self {
        Self { sweeper }
    }
}

#[async_trait]
impl PeriodicTask for RetentionTask {
    async fn run_once(&self) -> Result<()> {
        self.sweeper.sweep().await?;
        Ok(())
    }
}

/// Reconciles every configured camera on each tick
pub struct SyncPollTask {
    engine: Arc<SyncEngine>,
}

impl SyncPollTask {
    pub fn new(engine: Arc<SyncEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl PeriodicTask for SyncPollTask {
    async fn run_once(&self) -> Result<()> {
        self.engine.trigger_sync(None).await?;
        Ok(())
    }
}

/// Checks camera reachability on each tick
pub struct CameraHealthTask {
    monitor: Arc<CameraHealthMonitor>,
}

impl CameraHealthTask {
    pub fn new(monitor: Arc<CameraHealthMonitor>) -> Self {
        Self { monitor }
    }
}

#[async_trait]
impl PeriodicTask for CameraHealthTask {
    async fn run_once(&self) -> Result<()> {
        let statuses = self.monitor.check_all().await;
        let offline = statuses.iter().filter(|s| !s.online).count();
        debug!("{} of {} cameras offline", offline, statuses.len());
        Ok(())
    }
}

/// Owns the periodic tasks. Each task runs under a child of the root
/// cancellation token; `shutdown` cancels the root and waits for every task.
pub struct Scheduler {
    root: CancellationToken,
    tasks: Mutex<Vec<(String, JoinHandle<()>)>>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            root: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Run `task` every `period`, starting immediately. A tick that comes
    /// due while the previous run is still going is skipped.
    pub async fn spawn_periodic(
        &self,
        name: &str,
        period: Duration,
        task: Arc<dyn PeriodicTask>,
    ) {
        info!("Starting {} with interval of {:?}", name, period);

        let token = self.root.child_token();
        let task_name = name.to_string();
        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                debug!("Running {}", task_name);
                tokio::select! {
                    _ = token.cancelled() => break,
                    result = task.run_once() => {
                        if let Err(e) = result {
                            error!("{} failed: {}", task_name, e);
                        }
                    }
                }
            }

            info!("{} stopped", task_name);
        });

        self.tasks.lock().await.push((name.to_string(), handle));
    }

    pub async fn task_count(&self) -> usize {
        self.tasks.lock().await.len()
    }

    /// Cancel every task and wait for them to finish
    pub async fn shutdown(&self) {
        self.root.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for (name, handle) in tasks {
            if let Err(e) = handle.await {
                error!("{} did not shut down cleanly: {}", name, e);
            }
        }
    }
}
