//! Message dispatcher
//!
//! Routes queue messages to the right handler — workflow tick, step
//! attempt, or health responder — and enforces the per-message invariants:
//! schema validation, lifetime clamping with re-enqueue, deadline-bound
//! execution, and acknowledgement back to the queue.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, instrument, warn};

use wrun_core::{queues, MessagePayload, QueueMessage};

use crate::engine::{EngineError, ReplayEngine, TickStatus};
use crate::health::{self, HealthEndpoint};
use crate::step::StepExecutor;
use crate::world::{Delivery, EnqueueOptions, QueueError, StoreError, World};

use super::lifetime::QueueLifetimeConfig;

/// Dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Message lifetime budget.
    pub lifetime: QueueLifetimeConfig,

    /// Requested timeout for a workflow tick, before clamping.
    pub tick_timeout: Duration,

    /// Requested timeout for a step attempt, before clamping.
    pub step_timeout: Duration,

    /// Cap on the transient-failure redelivery backoff.
    pub max_retry_delay: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            lifetime: QueueLifetimeConfig::default(),
            tick_timeout: Duration::from_secs(60),
            step_timeout: Duration::from_secs(300),
            max_retry_delay: Duration::from_secs(60),
        }
    }
}

impl DispatcherConfig {
    /// Set the lifetime budget.
    pub fn with_lifetime(mut self, lifetime: QueueLifetimeConfig) -> Self {
        self.lifetime = lifetime;
        self
    }

    /// Set the requested tick timeout.
    pub fn with_tick_timeout(mut self, timeout: Duration) -> Self {
        self.tick_timeout = timeout;
        self
    }

    /// Set the requested step timeout.
    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = timeout;
        self
    }
}

/// What the dispatcher did with a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Handler ran and the message was acknowledged.
    Handled,

    /// Lifetime budget was spent; an equivalent message with a fresh
    /// budget was enqueued and the old one acknowledged, without invoking
    /// the handler.
    Refreshed,

    /// The message failed validation or hit a permanent error; it was
    /// acknowledged and dropped.
    Rejected,

    /// A transient failure; the message was returned for redelivery.
    Retried,
}

/// Routes deliveries to handlers.
pub struct Dispatcher {
    world: Arc<dyn World>,
    engine: ReplayEngine,
    executor: StepExecutor,
    config: DispatcherConfig,
}

impl Dispatcher {
    /// Build a dispatcher over an engine and executor sharing the same
    /// world.
    pub fn new(
        world: Arc<dyn World>,
        engine: ReplayEngine,
        executor: StepExecutor,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            world,
            engine,
            executor,
            config,
        }
    }

    /// Handle one delivery. Infrastructure errors against the queue itself
    /// surface; handler errors are classified into the returned
    /// disposition.
    #[instrument(skip(self, delivery), fields(queue = %delivery.message.queue_name))]
    pub async fn dispatch(
        &self,
        delivery: Delivery,
        now: DateTime<Utc>,
    ) -> Result<Disposition, QueueError> {
        let message = &delivery.message;

        if let Err(reason) = validate(message) {
            warn!(%reason, "bad message; dropping");
            self.world
                .queue()
                .ack(&message.queue_name, delivery.message_id)
                .await?;
            return Ok(Disposition::Rejected);
        }

        // Spent lifetime budget: acknowledge and re-enqueue an equivalent
        // message with a fresh budget instead of invoking the handler.
        if self
            .config
            .lifetime
            .is_expired(message.created_at, now)
        {
            info!(
                age = ?self.config.lifetime.age(message.created_at, now),
                "message lifetime exhausted; refreshing"
            );
            self.world
                .queue()
                .enqueue(message.refreshed(now), EnqueueOptions::default())
                .await?;
            self.world
                .queue()
                .ack(&message.queue_name, delivery.message_id)
                .await?;
            return Ok(Disposition::Refreshed);
        }

        let requested = match &message.payload {
            MessagePayload::Step(_) => self.config.step_timeout,
            MessagePayload::Tick(_) | MessagePayload::HealthCheck(_) => self.config.tick_timeout,
        };
        let effective = self
            .config
            .lifetime
            .clamp(requested, message.created_at, now)
            .expect("budget checked above");

        let outcome = self.run_handler(message, effective, now).await;

        match outcome {
            Ok(()) => {
                self.world
                    .queue()
                    .ack(&message.queue_name, delivery.message_id)
                    .await?;
                Ok(Disposition::Handled)
            }
            Err(failure) if failure.is_permanent() => {
                error!(error = %failure, "permanent handler failure; dropping message");
                self.world
                    .queue()
                    .ack(&message.queue_name, delivery.message_id)
                    .await?;
                Ok(Disposition::Rejected)
            }
            Err(failure) => {
                let delay = self.retry_delay(delivery.delivery_count);
                debug!(error = %failure, ?delay, "transient handler failure; redelivering");
                self.world
                    .queue()
                    .nack(
                        &message.queue_name,
                        delivery.message_id,
                        now + chrono::Duration::from_std(delay)
                            .unwrap_or_else(|_| chrono::Duration::seconds(60)),
                    )
                    .await?;
                Ok(Disposition::Retried)
            }
        }
    }

    async fn run_handler(
        &self,
        message: &QueueMessage,
        effective_timeout: Duration,
        now: DateTime<Utc>,
    ) -> Result<(), HandlerFailure> {
        match &message.payload {
            MessagePayload::HealthCheck(payload) => {
                let endpoint = HealthEndpoint::from_queue(&message.queue_name)
                    .expect("validated health queue");
                health::respond(
                    self.world.as_ref(),
                    endpoint,
                    payload.correlation_id,
                    now,
                )
                .await
                .map_err(|e| HandlerFailure::Engine(EngineError::Store(e)))
            }

            MessagePayload::Tick(payload) => {
                let tick = self.engine.tick(payload.run_id, now);
                match tokio::time::timeout(effective_timeout, tick).await {
                    Ok(Ok(report)) => {
                        if report.status == TickStatus::AlreadyTerminal {
                            debug!(run_id = %payload.run_id, "tick on terminal run");
                        }
                        Ok(())
                    }
                    Ok(Err(e)) => Err(HandlerFailure::Engine(e)),
                    Err(_) => Err(HandlerFailure::Timeout(effective_timeout)),
                }
            }

            MessagePayload::Step(payload) => self
                .executor
                .execute(payload, effective_timeout, now)
                .await
                .map(|_| ())
                .map_err(HandlerFailure::Engine),
        }
    }

    fn retry_delay(&self, delivery_count: u32) -> Duration {
        let exponent = delivery_count.saturating_sub(1).min(16);
        Duration::from_secs(1u64 << exponent).min(self.config.max_retry_delay)
    }
}

/// A handler failure, classified for the queue.
#[derive(Debug, thiserror::Error)]
enum HandlerFailure {
    #[error(transparent)]
    Engine(EngineError),

    #[error("handler exceeded its clamped deadline of {0:?}")]
    Timeout(Duration),
}

impl HandlerFailure {
    /// Permanent failures are dropped; retrying cannot change them.
    fn is_permanent(&self) -> bool {
        match self {
            Self::Engine(EngineError::NonDeterministic { .. })
            | Self::Engine(EngineError::UnsupportedLegacyOperation(_))
            | Self::Engine(EngineError::CorruptLog { .. })
            | Self::Engine(EngineError::TooManyEvents { .. })
            | Self::Engine(EngineError::Codec(_)) => true,
            // A terminal-run rejection means the message is stale.
            Self::Engine(EngineError::Store(StoreError::TerminalRun { .. })) => true,
            // Registry misses are deploy skew; another worker (or the next
            // deploy) may resolve them.
            Self::Engine(_) | Self::Timeout(_) => false,
        }
    }
}

/// Validate a message's shape and queue consistency.
fn validate(message: &QueueMessage) -> Result<(), String> {
    if message.attempt == 0 {
        return Err("attempt must be 1-based".into());
    }

    match &message.payload {
        MessagePayload::HealthCheck(payload) => {
            if !payload.health_check {
                return Err("health-check marker must be true".into());
            }
            if HealthEndpoint::from_queue(&message.queue_name).is_none() {
                return Err(format!(
                    "health-check payload on non-health queue {:?}",
                    message.queue_name
                ));
            }
        }
        MessagePayload::Tick(_) => {
            if !message.queue_name.starts_with("__wkf_workflow_")
                || HealthEndpoint::from_queue(&message.queue_name).is_some()
            {
                return Err(format!("tick payload on queue {:?}", message.queue_name));
            }
        }
        MessagePayload::Step(payload) => {
            let expected = queues::step(&payload.step_id);
            if message.queue_name != expected {
                return Err(format!(
                    "step payload for {} on queue {:?}, expected {expected:?}",
                    payload.step_id, message.queue_name
                ));
            }
            if payload.attempt != message.attempt {
                return Err("step payload attempt disagrees with envelope".into());
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wrun_core::{Codec, EncodedValue, RunId, StepId, StepInstanceId, StepPayload};

    use crate::engine::{EngineConfig, Registry};
    use crate::world::{EnqueueOutcome, InMemoryWorld};

    fn dispatcher(world: Arc<InMemoryWorld>, config: DispatcherConfig) -> Dispatcher {
        let registry = Arc::new(Registry::builder().build());
        let codec = Codec::plain();
        let engine = ReplayEngine::new(
            Arc::clone(&world) as Arc<dyn World>,
            Arc::clone(&registry),
            codec.clone(),
            EngineConfig::default(),
        );
        let executor = StepExecutor::new(
            Arc::clone(&world) as Arc<dyn World>,
            registry,
            codec,
            "",
        );
        Dispatcher::new(world, engine, executor, config)
    }

    async fn deliver(world: &InMemoryWorld, message: QueueMessage) -> Delivery {
        let queue = message.queue_name.clone();
        let outcome = world
            .queue()
            .enqueue(message, EnqueueOptions::default())
            .await
            .unwrap();
        assert!(matches!(outcome, EnqueueOutcome::Enqueued(_)));
        world
            .queue()
            .receive(&queue, Utc::now() + chrono::Duration::days(2), 1)
            .await
            .unwrap()
            .remove(0)
    }

    #[tokio::test]
    async fn test_bad_message_is_rejected() {
        let world = Arc::new(InMemoryWorld::new());
        let dispatcher = dispatcher(Arc::clone(&world), DispatcherConfig::default());
        let now = Utc::now();

        // A step payload addressed to the wrong queue.
        let step_id = StepId::new("src/a.ts", "f");
        let mut message = QueueMessage::step(
            StepPayload {
                workflow_name: "w".into(),
                workflow_run_id: RunId::generate(),
                workflow_started_at: now.timestamp_millis(),
                step_id: step_id.clone(),
                step_instance_id: StepInstanceId::new(step_id, 1),
                attempt: 1,
                input: EncodedValue::inline(json!(null)),
            },
            now,
        );
        message.queue_name = "__wkf_step_other".into();

        let delivery = deliver(&world, message).await;
        let disposition = dispatcher.dispatch(delivery, now).await.unwrap();
        assert_eq!(disposition, Disposition::Rejected);
        assert_eq!(world.pending_message_count("__wkf_step_other"), 0);
    }

    #[tokio::test]
    async fn test_expired_message_is_refreshed_without_invocation() {
        let world = Arc::new(InMemoryWorld::new());
        let dispatcher = dispatcher(Arc::clone(&world), DispatcherConfig::default());

        let created_at = Utc::now() - chrono::Duration::hours(23);
        let now = Utc::now();
        let run_id = RunId::generate();
        let message = QueueMessage::tick("", run_id, format!("{run_id}:k"), created_at);

        let delivery = deliver(&world, message).await;
        let disposition = dispatcher.dispatch(delivery, now).await.unwrap();
        assert_eq!(disposition, Disposition::Refreshed);

        // The refreshed equivalent is waiting with a fresh budget; the run
        // does not even need to exist for the refresh to happen.
        assert_eq!(world.pending_message_count("__wkf_workflow_"), 1);
        let refreshed = world
            .queue()
            .receive("__wkf_workflow_", now, 1)
            .await
            .unwrap()
            .remove(0);
        assert_eq!(refreshed.message.created_at, now);
        assert_eq!(refreshed.message.attempt, 1);
    }

    #[tokio::test]
    async fn test_transient_failure_is_redelivered_later() {
        let world = Arc::new(InMemoryWorld::new());
        let dispatcher = dispatcher(Arc::clone(&world), DispatcherConfig::default());
        let now = Utc::now();

        // Tick for a run that does not exist: RunNotFound is transient.
        let run_id = RunId::generate();
        let message = QueueMessage::tick("", run_id, format!("{run_id}:k"), now);
        let delivery = deliver(&world, message).await;

        let disposition = dispatcher.dispatch(delivery, now).await.unwrap();
        assert_eq!(disposition, Disposition::Retried);

        // Not due yet at `now`; due after the backoff.
        assert!(world
            .queue()
            .receive("__wkf_workflow_", now, 1)
            .await
            .unwrap()
            .is_empty());
        let later = now + chrono::Duration::seconds(120);
        assert_eq!(
            world
                .queue()
                .receive("__wkf_workflow_", later, 1)
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_health_message_writes_response() {
        let world = Arc::new(InMemoryWorld::new());
        let dispatcher = dispatcher(Arc::clone(&world), DispatcherConfig::default());
        let now = Utc::now();

        let correlation_id = wrun_core::HealthCorrelationId::generate();
        let message =
            QueueMessage::health_check(queues::WORKFLOW_HEALTH, correlation_id, now);
        let delivery = deliver(&world, message).await;

        let disposition = dispatcher.dispatch(delivery, now).await.unwrap();
        assert_eq!(disposition, Disposition::Handled);

        let page = world
            .streams()
            .read(
                crate::health::stream_run_id(&correlation_id),
                &crate::health::stream_name(&correlation_id),
                0,
                4,
            )
            .await
            .unwrap();
        assert_eq!(page.chunks.len(), 1);
        assert!(page.closed);
    }
}
