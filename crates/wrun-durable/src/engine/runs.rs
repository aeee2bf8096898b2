//! Run client surface
//!
//! The external API over runs: start a workflow, observe a run's derived
//! state, await its return value, cancel it. Everything here is a view
//! over the event log; nothing is stored twice.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{info, instrument};

use wrun_core::{
    error::codes, Codec, ErrorValue, Event, EventBody, QueueMessage, RunId, RunProjection,
    RunStatus, CURRENT_SPEC_VERSION,
};

use crate::world::{
    load_value, store_value, EnqueueOptions, EventPage, ListOptions, NewRun, StoreError, World,
};

use super::registry::Registry;
use super::replay::EngineError;

/// A run's derived state, as external observers see it.
#[derive(Debug, Clone)]
pub struct RunView {
    pub run_id: RunId,
    pub workflow_name: String,
    pub spec_version: String,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Errors from awaiting a run's return value.
#[derive(Debug, thiserror::Error)]
pub enum RunResultError {
    /// The run has not finished yet. A normal not-ready response: retry
    /// after the run progresses.
    #[error("run {run_id} has not completed (status: {status}); retry later")]
    NotCompleted { run_id: RunId, status: RunStatus },

    /// The run failed; the original cause is attached.
    #[error("run {run_id} failed: {cause}")]
    Failed { run_id: RunId, cause: ErrorValue },

    /// Infrastructure failure while reading the run.
    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Client for starting and observing runs.
pub struct WorkflowClient {
    world: Arc<dyn World>,
    registry: Arc<Registry>,
    codec: Codec,
    shard: String,
}

impl WorkflowClient {
    /// Build a client.
    pub fn new(
        world: Arc<dyn World>,
        registry: Arc<Registry>,
        codec: Codec,
        shard: impl Into<String>,
    ) -> Self {
        Self {
            world,
            registry,
            codec,
            shard: shard.into(),
        }
    }

    /// Start a new run of a registered workflow.
    ///
    /// Creates the run, appends `run_created`, and enqueues the first tick.
    #[instrument(skip(self, arguments))]
    pub async fn start(
        &self,
        workflow_name: &str,
        arguments: Value,
        now: DateTime<Utc>,
    ) -> Result<RunId, EngineError> {
        // Fail before creating anything if the name is not registered.
        self.registry.workflow(workflow_name)?;

        let run_id = RunId::generate();
        let encoded = store_value(self.world.as_ref(), &self.codec, &arguments).await?;

        self.world
            .events()
            .create_run(NewRun {
                run_id,
                workflow_name: workflow_name.to_string(),
                spec_version: CURRENT_SPEC_VERSION.to_string(),
                created_at: now,
            })
            .await?;

        self.world
            .events()
            .append(
                run_id,
                0,
                vec![Event::new(
                    run_id,
                    now,
                    EventBody::RunCreated {
                        workflow_name: workflow_name.to_string(),
                        spec_version: CURRENT_SPEC_VERSION.to_string(),
                        arguments: encoded,
                    },
                )],
            )
            .await?;

        self.world
            .queue()
            .enqueue(
                QueueMessage::tick(&self.shard, run_id, format!("{run_id}:run_created"), now),
                EnqueueOptions::default(),
            )
            .await?;

        info!(%run_id, workflow_name, "run started");
        Ok(run_id)
    }

    /// A run's derived state.
    pub async fn get_run(&self, run_id: RunId) -> Result<RunView, EngineError> {
        let record = self.world.events().get_run(run_id).await?;
        let events = self.world.events().load_all(run_id).await?;
        let projection = RunProjection::from_events(&events);

        Ok(RunView {
            run_id,
            workflow_name: record.workflow_name,
            spec_version: record.spec_version,
            status: projection.status,
            created_at: record.created_at,
            started_at: projection.started_at,
            completed_at: projection.completed_at,
        })
    }

    /// The run's return value.
    ///
    /// Not-finished runs yield [`RunResultError::NotCompleted`]; failed and
    /// cancelled runs yield [`RunResultError::Failed`] with the cause.
    pub async fn return_value(&self, run_id: RunId) -> Result<Value, RunResultError> {
        let events = self
            .world
            .events()
            .load_all(run_id)
            .await
            .map_err(EngineError::from)?;
        let projection = RunProjection::from_events(&events);

        match projection.status {
            RunStatus::Completed => {
                let output = projection.output.ok_or_else(|| {
                    EngineError::CorruptLog {
                        run_id,
                        detail: "completed run without an output".into(),
                    }
                })?;
                let value = load_value(self.world.as_ref(), &self.codec, &output)
                    .await
                    .map_err(EngineError::from)?;
                Ok(value)
            }
            RunStatus::Failed => Err(RunResultError::Failed {
                run_id,
                cause: projection
                    .error
                    .unwrap_or_else(|| ErrorValue::new("run failed")),
            }),
            RunStatus::Cancelled => Err(RunResultError::Failed {
                run_id,
                cause: ErrorValue::new(
                    projection
                        .cancel_reason
                        .map(|reason| format!("run cancelled: {reason}"))
                        .unwrap_or_else(|| "run cancelled".to_string()),
                )
                .with_code(codes::CANCELLED),
            }),
            status => Err(RunResultError::NotCompleted { run_id, status }),
        }
    }

    /// Cancel a run. Terminal runs reject the cancel; the terminal state is
    /// absorbing.
    #[instrument(skip(self))]
    pub async fn cancel_run(
        &self,
        run_id: RunId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let record = self.world.events().get_run(run_id).await?;
        if record.legacy {
            return Err(EngineError::UnsupportedLegacyOperation(run_id));
        }

        const MAX_ATTEMPTS: u32 = 5;
        let mut attempt = 0;
        loop {
            let events = self.world.events().load_all(run_id).await?;
            let projection = RunProjection::from_events(&events);
            if projection.status.is_terminal() {
                return Err(EngineError::Store(StoreError::TerminalRun {
                    run_id,
                    status: projection.status,
                }));
            }

            let cancelled = Event::new(
                run_id,
                now,
                EventBody::RunCancelled {
                    reason: reason.to_string(),
                },
            );
            match self
                .world
                .events()
                .append(run_id, events.len() as u64, vec![cancelled])
                .await
            {
                Ok(_) => {
                    info!(%run_id, reason, "run cancelled");
                    return Ok(());
                }
                Err(StoreError::ConcurrentAppend { .. }) if attempt < MAX_ATTEMPTS => {
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Paginated event listing, for observers.
    pub async fn list_events(
        &self,
        run_id: RunId,
        options: ListOptions,
    ) -> Result<EventPage, EngineError> {
        Ok(self.world.events().list(run_id, options).await?)
    }
}
