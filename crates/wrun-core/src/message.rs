//! Queue message envelopes
//!
//! Everything that moves through a queue is a [`QueueMessage`]: an opaque
//! payload plus routing and lifetime metadata. Payload schemas are per
//! queue; decoding is shape-based, so a message that matches no known
//! schema is a `BadMessage` at the dispatcher.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::codec::EncodedValue;
use crate::ids::{HealthCorrelationId, RunId, StepId, StepInstanceId};

/// Queue naming conventions.
pub mod queues {
    use super::StepId;

    /// Workflow tick queue for a shard. The shard may be empty.
    pub fn workflow(shard: &str) -> String {
        format!("__wkf_workflow_{shard}")
    }

    /// Per-step queue, named by the queue-encoded step id.
    pub fn step(step_id: &StepId) -> String {
        format!("__wkf_step_{}", step_id.queue_encoded())
    }

    /// Health-check queue for the workflow endpoint.
    pub const WORKFLOW_HEALTH: &str = "__wkf_workflow_health_check";

    /// Health-check queue for the step endpoint.
    pub const STEP_HEALTH: &str = "__wkf_step_health_check";
}

/// Payload of a workflow tick message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TickPayload {
    /// The run to tick.
    pub run_id: RunId,
}

/// Payload of a step attempt message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct StepPayload {
    /// Workflow the step belongs to.
    pub workflow_name: String,
    /// Run the step belongs to.
    pub workflow_run_id: RunId,
    /// Run start time, epoch milliseconds.
    pub workflow_started_at: i64,
    /// The step function to invoke.
    pub step_id: StepId,
    /// The invocation this attempt belongs to.
    pub step_instance_id: StepInstanceId,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Codec-encoded step input.
    pub input: EncodedValue,
}

/// Payload of a health-check message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct HealthCheckPayload {
    /// Marker distinguishing health checks from real work.
    #[serde(rename = "__healthCheck")]
    pub health_check: bool,
    /// Correlates the request with its response stream.
    pub correlation_id: HealthCorrelationId,
}

/// The payloads a queue can carry, decoded by shape.
///
/// Variant order matters: the health marker and the step fields are
/// distinctive, the bare tick shape matches last.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessagePayload {
    /// Health-check probe.
    HealthCheck(HealthCheckPayload),
    /// Step attempt.
    Step(Box<StepPayload>),
    /// Workflow tick.
    Tick(TickPayload),
}

/// A message as it travels through a queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueMessage {
    /// The schema-per-queue payload.
    pub payload: MessagePayload,

    /// The queue this message belongs on.
    pub queue_name: String,

    /// When this message (or its latest refresh) was enqueued. The lifetime
    /// budget is measured from here.
    pub created_at: DateTime<Utc>,

    /// Deduplication key; the backend suppresses repeats.
    pub idempotency_key: String,

    /// 1-based attempt counter, preserved across lifetime refreshes.
    pub attempt: u32,

    /// When the work was originally requested, preserved across refreshes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requested_at: Option<DateTime<Utc>>,
}

impl QueueMessage {
    /// Build a workflow tick message.
    pub fn tick(shard: &str, run_id: RunId, idempotency_key: String, now: DateTime<Utc>) -> Self {
        Self {
            payload: MessagePayload::Tick(TickPayload { run_id }),
            queue_name: queues::workflow(shard),
            created_at: now,
            idempotency_key,
            attempt: 1,
            requested_at: Some(now),
        }
    }

    /// Build a step attempt message. The idempotency key is
    /// `<stepInstanceId>:<attempt>`.
    pub fn step(payload: StepPayload, now: DateTime<Utc>) -> Self {
        let queue_name = queues::step(&payload.step_id);
        let idempotency_key = format!("{}:{}", payload.step_instance_id, payload.attempt);
        let attempt = payload.attempt;
        Self {
            payload: MessagePayload::Step(Box::new(payload)),
            queue_name,
            created_at: now,
            idempotency_key,
            attempt,
            requested_at: Some(now),
        }
    }

    /// Build a health-check message for the given queue.
    pub fn health_check(
        queue_name: &str,
        correlation_id: HealthCorrelationId,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            payload: MessagePayload::HealthCheck(HealthCheckPayload {
                health_check: true,
                correlation_id,
            }),
            queue_name: queue_name.to_string(),
            created_at: now,
            idempotency_key: format!("health:{correlation_id}"),
            attempt: 1,
            requested_at: Some(now),
        }
    }

    /// An equivalent message with a fresh lifetime budget.
    ///
    /// Payload, queue, and attempt are preserved; `created_at` restarts the
    /// budget. The idempotency key gains a refresh generation so the backend
    /// does not suppress the refresh as a duplicate of its exhausted
    /// ancestor.
    pub fn refreshed(&self, now: DateTime<Utc>) -> Self {
        let (base, generation) = match self.idempotency_key.rsplit_once("#r") {
            Some((base, gen)) => match gen.parse::<u32>() {
                Ok(n) => (base, n),
                Err(_) => (self.idempotency_key.as_str(), 0),
            },
            None => (self.idempotency_key.as_str(), 0),
        };

        Self {
            payload: self.payload.clone(),
            queue_name: self.queue_name.clone(),
            created_at: now,
            idempotency_key: format!("{base}#r{}", generation + 1),
            attempt: self.attempt,
            requested_at: self.requested_at,
        }
    }

    /// The run this message concerns, when the payload names one.
    pub fn run_id(&self) -> Option<RunId> {
        match &self.payload {
            MessagePayload::Tick(tick) => Some(tick.run_id),
            MessagePayload::Step(step) => Some(step.workflow_run_id),
            MessagePayload::HealthCheck(_) => None,
        }
    }
}
