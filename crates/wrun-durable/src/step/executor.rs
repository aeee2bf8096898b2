//! Step executor
//!
//! Runs one attempt of a step in isolation: records `step_started`, invokes
//! the user function under the clamped deadline, classifies the outcome,
//! and writes exactly one terminal event per instance — or schedules the
//! next attempt through the queue.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use wrun_core::{
    error::codes, Event, EventBody, QueueMessage, RunProjection, StepPayload,
};

use crate::engine::{EngineError, Registry};
use crate::world::{
    append_with_retry, load_value, store_value, EnqueueOptions, StoreError, ValueStoreError, World,
};

use super::{StepContext, StepError};

/// What the executor did with a step message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// Terminal `step_completed` written.
    Completed,

    /// Terminal `step_failed` written.
    Failed,

    /// `step_retry_scheduled` written and the next attempt enqueued.
    RetryScheduled {
        next_attempt: u32,
        next_attempt_at: DateTime<Utc>,
    },

    /// The run is terminal or the instance already has its terminal event;
    /// nothing was executed.
    Skipped,
}

/// Executes step attempts against a World.
pub struct StepExecutor {
    world: Arc<dyn World>,
    registry: Arc<Registry>,
    codec: wrun_core::Codec,
    shard: String,
}

impl StepExecutor {
    /// Build an executor.
    pub fn new(
        world: Arc<dyn World>,
        registry: Arc<Registry>,
        codec: wrun_core::Codec,
        shard: impl Into<String>,
    ) -> Self {
        Self {
            world,
            registry,
            codec,
            shard: shard.into(),
        }
    }

    /// Perform one attempt described by a step message.
    ///
    /// `timeout` is the deadline already clamped to the message lifetime;
    /// the user function is cancelled and cut off when it elapses, and the
    /// timeout is reported as retryable.
    #[instrument(
        skip(self, payload),
        fields(
            run_id = %payload.workflow_run_id,
            step_instance = %payload.step_instance_id,
            attempt = payload.attempt,
        )
    )]
    pub async fn execute(
        &self,
        payload: &StepPayload,
        timeout: Duration,
        now: DateTime<Utc>,
    ) -> Result<StepOutcome, EngineError> {
        let run_id = payload.workflow_run_id;
        let record = self.world.events().get_run(run_id).await?;
        if record.legacy {
            return Err(EngineError::UnsupportedLegacyOperation(run_id));
        }

        let step = self.registry.step(&payload.step_id)?;
        let policy = step.retry_policy();

        let events = self.world.events().load_all(run_id).await?;
        if RunProjection::from_events(&events).status.is_terminal() {
            debug!("run is terminal; dropping step attempt");
            return Ok(StepOutcome::Skipped);
        }

        // Exactly-once per outcome: a recorded terminal event for this
        // instance wins over any redelivered attempt.
        let instance = &payload.step_instance_id;
        let already_terminal = events.iter().any(|e| {
            matches!(
                &e.body,
                EventBody::StepCompleted { step_instance_id, .. }
                | EventBody::StepFailed { step_instance_id, .. }
                    if step_instance_id == instance
            )
        });
        if already_terminal {
            debug!("instance already has a terminal event; dropping attempt");
            return Ok(StepOutcome::Skipped);
        }

        // A redelivered message re-executes the attempt but never records
        // the same step_started twice.
        let already_started = events.iter().any(|e| {
            matches!(
                &e.body,
                EventBody::StepStarted { step_instance_id, attempt }
                    if step_instance_id == instance && *attempt == payload.attempt
            )
        });
        if !already_started {
            let started = Event::new(
                run_id,
                now,
                EventBody::StepStarted {
                    step_instance_id: instance.clone(),
                    attempt: payload.attempt,
                },
            );
            match append_with_retry(self.world.events(), run_id, vec![started]).await {
                Ok(_) => {}
                Err(StoreError::TerminalRun { .. }) => return Ok(StepOutcome::Skipped),
                Err(e) => return Err(e.into()),
            }
        }

        let input = load_value(self.world.as_ref(), &self.codec, &payload.input).await?;
        let started_at = DateTime::from_timestamp_millis(payload.workflow_started_at)
            .unwrap_or(record.created_at);

        let ctx = StepContext::new(
            Arc::clone(&self.world),
            run_id,
            payload.workflow_name.clone(),
            started_at,
            payload.step_id.clone(),
            instance.clone(),
            payload.attempt,
            policy.max_attempts,
        );
        let cancellation = ctx.cancellation_handle();

        let result = tokio::select! {
            result = step.execute_erased(&ctx, input) => result,
            _ = tokio::time::sleep(timeout) => {
                cancellation.cancel();
                warn!(?timeout, "step attempt hit its deadline");
                Err(StepError::deadline_exceeded())
            }
        };

        match result {
            Ok(output) => self.record_completion(payload, output, now).await,
            Err(error) => self.record_failure(payload, &policy, error, now).await,
        }
    }

    async fn record_completion(
        &self,
        payload: &StepPayload,
        output: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<StepOutcome, EngineError> {
        let run_id = payload.workflow_run_id;

        let encoded = match store_value(self.world.as_ref(), &self.codec, &output).await {
            Ok(encoded) => encoded,
            Err(ValueStoreError::Codec(e)) => {
                // The value has no encoding; the step fails for good.
                let error = wrun_core::ErrorValue::new(e.to_string())
                    .with_code(codes::ENCODE_FAILURE);
                return self
                    .write_terminal_failure(payload, error, now)
                    .await
                    .map(|outcome| {
                        info!("step result was unencodable");
                        outcome
                    });
            }
            Err(ValueStoreError::Store(e)) => return Err(e.into()),
        };

        let event = Event::new(
            run_id,
            now,
            EventBody::StepCompleted {
                step_instance_id: payload.step_instance_id.clone(),
                attempt: payload.attempt,
                output: encoded,
            },
        );
        let event_id = event.event_id;

        match append_with_retry(self.world.events(), run_id, vec![event]).await {
            Ok(_) => {}
            Err(StoreError::TerminalRun { .. }) => return Ok(StepOutcome::Skipped),
            Err(e) => return Err(e.into()),
        }

        self.enqueue_tick(run_id, format!("{run_id}:{event_id}"), now)
            .await?;
        info!("step completed");
        Ok(StepOutcome::Completed)
    }

    async fn record_failure(
        &self,
        payload: &StepPayload,
        policy: &crate::reliability::RetryPolicy,
        error: StepError,
        now: DateTime<Utc>,
    ) -> Result<StepOutcome, EngineError> {
        let run_id = payload.workflow_run_id;

        if error.is_retryable() && policy.has_attempts_remaining(payload.attempt) {
            let next_attempt = payload.attempt + 1;
            let delay = error
                .retry_after()
                .unwrap_or_else(|| policy.delay_for_attempt(next_attempt));
            let next_attempt_at = now
                + chrono::Duration::from_std(delay)
                    .unwrap_or_else(|_| chrono::Duration::seconds(300));

            let event = Event::new(
                run_id,
                now,
                EventBody::StepRetryScheduled {
                    step_instance_id: payload.step_instance_id.clone(),
                    attempt: payload.attempt,
                    next_attempt,
                    next_attempt_at,
                    error: error.to_error_value(),
                },
            );
            match append_with_retry(self.world.events(), run_id, vec![event]).await {
                Ok(_) => {}
                Err(StoreError::TerminalRun { .. }) => return Ok(StepOutcome::Skipped),
                Err(e) => return Err(e.into()),
            }

            // The retry is the same payload with the incremented attempt,
            // delivered at the computed time.
            let mut retry = payload.clone();
            retry.attempt = next_attempt;
            self.world
                .queue()
                .enqueue(
                    QueueMessage::step(retry, now),
                    EnqueueOptions {
                        deliver_at: Some(next_attempt_at),
                    },
                )
                .await?;

            info!(next_attempt, %next_attempt_at, "step retry scheduled");
            return Ok(StepOutcome::RetryScheduled {
                next_attempt,
                next_attempt_at,
            });
        }

        let mut cause = error.to_error_value();
        if error.is_retryable() && cause.code.is_none() {
            cause.code = Some(codes::RETRIES_EXHAUSTED.to_string());
        }
        self.write_terminal_failure(payload, cause, now).await
    }

    async fn write_terminal_failure(
        &self,
        payload: &StepPayload,
        error: wrun_core::ErrorValue,
        now: DateTime<Utc>,
    ) -> Result<StepOutcome, EngineError> {
        let run_id = payload.workflow_run_id;
        let event = Event::new(
            run_id,
            now,
            EventBody::StepFailed {
                step_instance_id: payload.step_instance_id.clone(),
                attempt: payload.attempt,
                error,
            },
        );
        let event_id = event.event_id;

        match append_with_retry(self.world.events(), run_id, vec![event]).await {
            Ok(_) => {}
            Err(StoreError::TerminalRun { .. }) => return Ok(StepOutcome::Skipped),
            Err(e) => return Err(e.into()),
        }

        self.enqueue_tick(run_id, format!("{run_id}:{event_id}"), now)
            .await?;
        info!("step failed terminally");
        Ok(StepOutcome::Failed)
    }

    async fn enqueue_tick(
        &self,
        run_id: wrun_core::RunId,
        idempotency_key: String,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        self.world
            .queue()
            .enqueue(
                QueueMessage::tick(&self.shard, run_id, idempotency_key, now),
                EnqueueOptions::default(),
            )
            .await?;
        Ok(())
    }
}
