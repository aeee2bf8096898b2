//! Health-check protocol
//!
//! End-to-end liveness across the queue fabric: the caller enqueues a
//! health message on the chosen queue, the endpoint recognizes it and
//! writes a single JSON response line to a well-known stream, and the
//! caller polls that stream until the response lands or the timeout
//! passes. Health streams bypass run-existence validation; both sides
//! derive the same synthetic run id from the correlation id.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use wrun_core::{queues, HealthCorrelationId, QueueMessage, RunId, StreamKind};

use crate::world::{poll_backoff, EnqueueOptions, StoreError, World, HEALTH_STREAM_PREFIX};

/// Which endpoint the probe exercises.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthEndpoint {
    /// The workflow tick path.
    Workflow,
    /// The step execution path.
    Step,
}

impl HealthEndpoint {
    /// The health queue this endpoint listens on.
    pub fn queue_name(&self) -> &'static str {
        match self {
            Self::Workflow => queues::WORKFLOW_HEALTH,
            Self::Step => queues::STEP_HEALTH,
        }
    }

    /// The endpoint a health queue belongs to.
    pub fn from_queue(queue_name: &str) -> Option<Self> {
        match queue_name {
            queues::WORKFLOW_HEALTH => Some(Self::Workflow),
            queues::STEP_HEALTH => Some(Self::Step),
            _ => None,
        }
    }

    /// The endpoint name as it appears in the response.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Workflow => "workflow",
            Self::Step => "step",
        }
    }
}

impl std::fmt::Display for HealthEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Options for a health check.
#[derive(Debug, Clone)]
pub struct HealthOptions {
    /// How long to wait for the response before reporting unhealthy.
    pub timeout: Duration,

    /// Initial poll interval; grows toward one second while waiting,
    /// because backends may create the stream with a delay.
    pub poll_interval: Duration,
}

impl Default for HealthOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(250),
        }
    }
}

impl HealthOptions {
    /// Set the overall timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the initial poll interval.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

/// Outcome of a health check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The single JSON line an endpoint writes to the response stream.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    healthy: bool,
    endpoint: String,
    correlation_id: HealthCorrelationId,
    timestamp: i64,
}

/// Name of the response stream for a correlation id.
pub fn stream_name(correlation_id: &HealthCorrelationId) -> String {
    format!("{HEALTH_STREAM_PREFIX}{correlation_id}")
}

/// Synthetic run id scoping the response stream. Both the caller and the
/// endpoint derive it from the correlation id alone, so they agree without
/// any shared state.
pub fn stream_run_id(correlation_id: &HealthCorrelationId) -> RunId {
    RunId::from_ulid(correlation_id.ulid())
}

/// Probe an endpoint: enqueue the health message, poll the response
/// stream, report.
pub async fn health_check(
    world: &dyn World,
    endpoint: HealthEndpoint,
    options: HealthOptions,
    now: DateTime<Utc>,
) -> HealthReport {
    let correlation_id = HealthCorrelationId::generate();
    let message = QueueMessage::health_check(endpoint.queue_name(), correlation_id, now);

    if let Err(e) = world.queue().enqueue(message, EnqueueOptions::default()).await {
        return HealthReport {
            healthy: false,
            error: Some(format!("health check enqueue failed: {e}")),
        };
    }

    let run_id = stream_run_id(&correlation_id);
    let name = stream_name(&correlation_id);
    let deadline = tokio::time::Instant::now() + options.timeout;
    let mut interval = options.poll_interval;

    loop {
        match world.streams().read(run_id, &name, 0, 16).await {
            Ok(page) if !page.chunks.is_empty() => {
                return match serde_json::from_slice::<HealthResponse>(&page.chunks[0]) {
                    Ok(response)
                        if response.healthy && response.correlation_id == correlation_id =>
                    {
                        info!(%endpoint, %correlation_id, "health check passed");
                        HealthReport {
                            healthy: true,
                            error: None,
                        }
                    }
                    Ok(_) => HealthReport {
                        healthy: false,
                        error: Some("health response did not match the probe".to_string()),
                    },
                    Err(e) => HealthReport {
                        healthy: false,
                        error: Some(format!("health response was unreadable: {e}")),
                    },
                };
            }
            Ok(_) | Err(StoreError::StreamNotFound { .. }) => {
                // Not written yet; backends may create the stream late.
            }
            Err(e) => {
                return HealthReport {
                    healthy: false,
                    error: Some(format!("health stream read failed: {e}")),
                };
            }
        }

        if tokio::time::Instant::now() + interval > deadline {
            warn!(%endpoint, %correlation_id, "health check timed out");
            return HealthReport {
                healthy: false,
                error: Some(format!(
                    "health check for {endpoint} endpoint timed out after {:?}",
                    options.timeout
                )),
            };
        }
        tokio::time::sleep(interval).await;
        interval = poll_backoff(interval, Duration::from_secs(1));
    }
}

/// Endpoint side: write the response line and close the stream.
pub(crate) async fn respond(
    world: &dyn World,
    endpoint: HealthEndpoint,
    correlation_id: HealthCorrelationId,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    let run_id = stream_run_id(&correlation_id);
    let name = stream_name(&correlation_id);

    let response = HealthResponse {
        healthy: true,
        endpoint: endpoint.as_str().to_string(),
        correlation_id,
        timestamp: now.timestamp_millis(),
    };
    let line = serde_json::to_vec(&response)
        .map_err(|e| StoreError::Serialization(e.to_string()))?;

    world
        .streams()
        .open(run_id, &name, StreamKind::JsonChunks, None)
        .await?;
    world.streams().append_chunk(run_id, &name, &line).await?;
    world.streams().close(run_id, &name).await?;

    debug!(%endpoint, %correlation_id, "health response written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::InMemoryWorld;

    #[tokio::test]
    async fn test_probe_and_response_agree_on_stream_key() {
        let correlation_id = HealthCorrelationId::generate();
        let run_id = stream_run_id(&correlation_id);
        assert_eq!(run_id.ulid(), correlation_id.ulid());
        assert!(stream_name(&correlation_id).starts_with(HEALTH_STREAM_PREFIX));
    }

    #[tokio::test]
    async fn test_respond_writes_single_closed_line() {
        let world = InMemoryWorld::new();
        let correlation_id = HealthCorrelationId::generate();
        let now = Utc::now();

        respond(&world, HealthEndpoint::Workflow, correlation_id, now)
            .await
            .unwrap();

        let page = world
            .streams()
            .read(stream_run_id(&correlation_id), &stream_name(&correlation_id), 0, 16)
            .await
            .unwrap();
        assert_eq!(page.chunks.len(), 1);
        assert!(page.closed);

        let response: HealthResponse = serde_json::from_slice(&page.chunks[0]).unwrap();
        assert!(response.healthy);
        assert_eq!(response.endpoint, "workflow");
        assert_eq!(response.timestamp, now.timestamp_millis());
    }

    #[tokio::test]
    async fn test_health_check_times_out_when_nobody_responds() {
        let world = InMemoryWorld::new();
        let options = HealthOptions::default()
            .with_timeout(Duration::from_millis(100))
            .with_poll_interval(Duration::from_millis(10));

        let report = health_check(&world, HealthEndpoint::Step, options, Utc::now()).await;
        assert!(!report.healthy);
        assert!(report.error.unwrap().contains("timed out"));
    }

    #[test]
    fn test_endpoint_queue_mapping() {
        assert_eq!(
            HealthEndpoint::from_queue(queues::WORKFLOW_HEALTH),
            Some(HealthEndpoint::Workflow)
        );
        assert_eq!(
            HealthEndpoint::from_queue(queues::STEP_HEALTH),
            Some(HealthEndpoint::Step)
        );
        assert_eq!(HealthEndpoint::from_queue("__wkf_workflow_"), None);
    }
}
