//! Queue worker
//!
//! Drains World queues into the dispatcher: adaptive-backoff polling, a
//! concurrency semaphore, and graceful shutdown through a watch channel.
//! This is the only place real wall-clock time enters the core; handlers
//! receive the time their message was picked up.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument};

use crate::dispatch::Dispatcher;
use crate::engine::Registry;
use crate::world::World;

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct QueueWorkerConfig {
    /// Queues to poll, in round-robin order.
    pub queues: Vec<String>,

    /// Maximum concurrent handler executions.
    pub max_concurrency: usize,

    /// Poll interval while work keeps arriving.
    pub min_poll_interval: Duration,

    /// Poll interval ceiling while idle.
    pub max_poll_interval: Duration,

    /// Idle backoff multiplier.
    pub backoff_multiplier: f64,

    /// Maximum deliveries claimed per queue per poll.
    pub batch_size: usize,

    /// How long shutdown waits for in-flight handlers.
    pub shutdown_timeout: Duration,
}

impl Default for QueueWorkerConfig {
    fn default() -> Self {
        Self {
            queues: Vec::new(),
            max_concurrency: 10,
            min_poll_interval: Duration::from_millis(100),
            max_poll_interval: Duration::from_secs(5),
            backoff_multiplier: 1.5,
            batch_size: 10,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl QueueWorkerConfig {
    /// Configuration polling the given queues.
    pub fn new(queues: Vec<String>) -> Self {
        Self {
            queues,
            ..Default::default()
        }
    }

    /// Configuration covering everything a registry serves: the shard's
    /// tick queue, every step queue, and both health queues.
    pub fn for_registry(registry: &Registry, shard: &str) -> Self {
        let mut queues = vec![wrun_core::queues::workflow(shard)];
        queues.extend(registry.step_queues());
        queues.push(wrun_core::queues::WORKFLOW_HEALTH.to_string());
        queues.push(wrun_core::queues::STEP_HEALTH.to_string());
        Self::new(queues)
    }

    /// Set the concurrency ceiling.
    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    /// Set the poll interval bounds.
    pub fn with_poll_intervals(mut self, min: Duration, max: Duration) -> Self {
        self.min_poll_interval = min;
        self.max_poll_interval = max.max(min);
        self
    }

    /// Set the per-poll batch size.
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    /// Set the shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Worker lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    Stopped,
    Running,
    Draining,
}

/// Worker errors.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("worker is already running")]
    AlreadyRunning,

    #[error("graceful shutdown timed out")]
    ShutdownTimeout,
}

/// Polls queues and feeds the dispatcher.
///
/// # Example
///
/// ```ignore
/// let config = QueueWorkerConfig::for_registry(&registry, "");
/// let worker = QueueWorker::new(world, dispatcher, config);
/// worker.start()?;
/// // ...
/// worker.shutdown().await?;
/// ```
pub struct QueueWorker {
    world: Arc<dyn World>,
    dispatcher: Arc<Dispatcher>,
    config: QueueWorkerConfig,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    permits: Arc<Semaphore>,
    status: std::sync::RwLock<WorkerStatus>,
    poll_handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl QueueWorker {
    /// Build a worker.
    pub fn new(
        world: Arc<dyn World>,
        dispatcher: Arc<Dispatcher>,
        config: QueueWorkerConfig,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let permits = Arc::new(Semaphore::new(config.max_concurrency));

        Self {
            world,
            dispatcher,
            config,
            shutdown_tx,
            shutdown_rx,
            permits,
            status: std::sync::RwLock::new(WorkerStatus::Stopped),
            poll_handle: std::sync::Mutex::new(None),
        }
    }

    /// Current lifecycle state.
    pub fn status(&self) -> WorkerStatus {
        *self.status.read().unwrap()
    }

    /// Start the polling loop.
    #[instrument(skip(self))]
    pub fn start(&self) -> Result<(), WorkerError> {
        {
            let mut status = self.status.write().unwrap();
            if *status == WorkerStatus::Running {
                return Err(WorkerError::AlreadyRunning);
            }
            *status = WorkerStatus::Running;
        }

        info!(
            queues = ?self.config.queues,
            max_concurrency = self.config.max_concurrency,
            "starting queue worker"
        );

        let world = Arc::clone(&self.world);
        let dispatcher = Arc::clone(&self.dispatcher);
        let config = self.config.clone();
        let permits = Arc::clone(&self.permits);
        let mut shutdown_rx = self.shutdown_rx.clone();

        let handle = tokio::spawn(async move {
            let mut interval = config.min_poll_interval;

            loop {
                if *shutdown_rx.borrow() {
                    debug!("poll loop: shutdown requested");
                    break;
                }

                let mut found_work = false;
                for queue in &config.queues {
                    let available = permits.available_permits().min(config.batch_size);
                    if available == 0 {
                        break;
                    }

                    let now = Utc::now();
                    match world.queue().receive(queue, now, available).await {
                        Ok(deliveries) => {
                            for delivery in deliveries {
                                found_work = true;
                                let permit = match Arc::clone(&permits).try_acquire_owned() {
                                    Ok(permit) => permit,
                                    Err(_) => break,
                                };
                                let dispatcher = Arc::clone(&dispatcher);
                                tokio::spawn(async move {
                                    if let Err(e) =
                                        dispatcher.dispatch(delivery, Utc::now()).await
                                    {
                                        error!("dispatch failed against the queue: {e}");
                                    }
                                    drop(permit);
                                });
                            }
                        }
                        Err(e) => {
                            error!(queue, "receive failed: {e}");
                        }
                    }
                }

                interval = if found_work {
                    config.min_poll_interval
                } else {
                    interval.mul_f64(config.backoff_multiplier).min(config.max_poll_interval)
                };

                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown_rx.changed() => {
                        debug!("poll loop: woken for shutdown");
                    }
                }
            }

            debug!("poll loop exited");
        });

        *self.poll_handle.lock().unwrap() = Some(handle);
        Ok(())
    }

    /// Graceful shutdown: stop claiming, wait for in-flight handlers.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) -> Result<(), WorkerError> {
        {
            let mut status = self.status.write().unwrap();
            if *status == WorkerStatus::Stopped {
                return Ok(());
            }
            *status = WorkerStatus::Draining;
        }
        let _ = self.shutdown_tx.send(true);

        let deadline = tokio::time::Instant::now() + self.config.shutdown_timeout;
        loop {
            if self.permits.available_permits() == self.config.max_concurrency {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(WorkerError::ShutdownTimeout);
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        if let Some(handle) = self.poll_handle.lock().unwrap().take() {
            handle.abort();
        }
        *self.status.write().unwrap() = WorkerStatus::Stopped;
        info!("queue worker stopped");
        Ok(())
    }
}

/// Drain queues inline until nothing is due at `now`.
///
/// Deterministic counterpart to the polling loop: no spawning, no wall
/// clock. Tests and embedders advance `now` themselves to fire delayed
/// messages.
pub async fn drain(
    world: &dyn World,
    dispatcher: &Dispatcher,
    queues: &[String],
    now: DateTime<Utc>,
) -> usize {
    let mut handled = 0;
    loop {
        let mut any = false;
        for queue in queues {
            let deliveries = match world.queue().receive(queue, now, 16).await {
                Ok(deliveries) => deliveries,
                Err(e) => {
                    error!(queue, "receive failed while draining: {e}");
                    continue;
                }
            };
            for delivery in deliveries {
                any = true;
                handled += 1;
                if let Err(e) = dispatcher.dispatch(delivery, now).await {
                    error!(queue, "dispatch failed while draining: {e}");
                }
            }
        }
        if !any {
            return handled;
        }
    }
}
