//! Replay engine
//!
//! A tick re-executes the workflow body against the run's event prefix and
//! produces either new side-effect requests (steps, sleeps, hooks, stream
//! bindings) or a terminal state. All new events for a tick are appended in
//! one atomic batch under the run lease; scheduling happens only after the
//! append commits, so no observer ever sees a message for an event that
//! does not exist.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, error, info, instrument, warn};

use wrun_core::{
    error::codes, Codec, CodecError, ErrorValue, Event, EventBody, QueueMessage, RunId,
    StepPayload,
};

use crate::world::{
    load_value, store_value, EnqueueOptions, QueueError, StoreError, ValueStoreError, World,
};

use super::context::{Effect, Interrupt, ReplayIndex, RunContext};
use super::registry::{Registry, RegistryError};

/// Configuration for the replay engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Shard suffix for the workflow tick queue.
    pub shard: String,

    /// Ceiling on events per run, as a runaway-workflow guard.
    pub max_events_per_run: usize,

    /// How long to wait between polls while a stream read waits for its
    /// producer to close the stream.
    pub stream_poll_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            shard: String::new(),
            max_events_per_run: 10_000,
            stream_poll_interval: Duration::from_secs(5),
        }
    }
}

impl EngineConfig {
    /// Set the tick queue shard.
    pub fn with_shard(mut self, shard: impl Into<String>) -> Self {
        self.shard = shard.into();
        self
    }

    /// Set the per-run event ceiling.
    pub fn with_max_events_per_run(mut self, max: usize) -> Self {
        self.max_events_per_run = max;
        self
    }
}

/// Errors from engine operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Storage failure.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Queue failure.
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    /// Codec failure.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Registry lookup failure.
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Replay diverged from the recorded history.
    #[error("nondeterministic workflow on {run_id}: {detail}")]
    NonDeterministic { run_id: RunId, detail: String },

    /// The run predates the event-sourced format and the operation cannot
    /// be expressed in legacy form.
    #[error("unsupported operation for legacy run {0}")]
    UnsupportedLegacyOperation(RunId),

    /// Event ceiling exceeded.
    #[error("run {run_id} has too many events ({count} > {max})")]
    TooManyEvents {
        run_id: RunId,
        count: usize,
        max: usize,
    },

    /// The log violates a structural invariant.
    #[error("corrupt log for {run_id}: {detail}")]
    CorruptLog { run_id: RunId, detail: String },
}

impl From<ValueStoreError> for EngineError {
    fn from(error: ValueStoreError) -> Self {
        match error {
            ValueStoreError::Codec(e) => Self::Codec(e),
            ValueStoreError::Store(e) => Self::Store(e),
        }
    }
}

/// How a tick ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickStatus {
    /// The body returned; `run_completed` was appended.
    Completed,

    /// The body failed; `run_failed` was appended.
    Failed,

    /// The body suspended; requests were recorded and scheduled.
    Suspended,

    /// The run was already terminal; nothing happened.
    AlreadyTerminal,
}

/// Result of processing one tick.
#[derive(Debug, Clone)]
pub struct TickReport {
    pub status: TickStatus,
    pub events_written: usize,
    pub messages_enqueued: usize,
}

/// A message to send after the tick's append commits.
enum Scheduled {
    Step {
        payload: StepPayload,
        deliver_at: Option<DateTime<Utc>>,
    },
    Tick {
        idempotency_key: String,
        deliver_at: Option<DateTime<Utc>>,
    },
}

/// The replay engine: drives workflow bodies over their event logs.
pub struct ReplayEngine {
    world: Arc<dyn World>,
    registry: Arc<Registry>,
    codec: Codec,
    config: EngineConfig,
}

impl ReplayEngine {
    /// Build an engine.
    pub fn new(
        world: Arc<dyn World>,
        registry: Arc<Registry>,
        codec: Codec,
        config: EngineConfig,
    ) -> Self {
        Self {
            world,
            registry,
            codec,
            config,
        }
    }

    /// The engine's world.
    pub fn world(&self) -> &Arc<dyn World> {
        &self.world
    }

    /// Process one tick for a run at the given time.
    #[instrument(skip(self))]
    pub async fn tick(&self, run_id: RunId, now: DateTime<Utc>) -> Result<TickReport, EngineError> {
        let record = self.world.events().get_run(run_id).await?;
        if record.legacy {
            return Err(EngineError::UnsupportedLegacyOperation(run_id));
        }

        let stored = self.world.events().load_all(run_id).await?;
        if stored.len() > self.config.max_events_per_run {
            return Err(EngineError::TooManyEvents {
                run_id,
                count: stored.len(),
                max: self.config.max_events_per_run,
            });
        }

        let projection = wrun_core::RunProjection::from_events(&stored);
        if projection.status.is_terminal() {
            debug!(status = %projection.status, "run already terminal");
            return Ok(TickReport {
                status: TickStatus::AlreadyTerminal,
                events_written: 0,
                messages_enqueued: 0,
            });
        }

        let arguments = self.run_arguments(run_id, &stored).await?;

        // Events this tick will append, in order: run_started, wait
        // completions, then whatever replay produces.
        let mut new_events: Vec<Event> = Vec::new();
        if !stored.iter().any(|e| matches!(e.body, EventBody::RunStarted)) {
            new_events.push(Event::new(run_id, now, EventBody::RunStarted));
        }
        new_events.extend(due_wait_completions(run_id, &stored, now));

        // Replay runs against the prefix as it will exist after this
        // tick's completions land.
        let mut view = stored.clone();
        view.extend(new_events.iter().cloned());
        let index = ReplayIndex::build(&view, self.world.as_ref(), &self.codec).await?;

        let workflow = self.registry.workflow(&record.workflow_name)?;
        let mut ctx = RunContext::new(&record, &index, now);

        let body_result = catch_unwind(AssertUnwindSafe(|| {
            workflow.run_erased(&mut ctx, arguments)
        }));

        let body_result = match body_result {
            Ok(result) => result,
            Err(panic) => {
                // A panic past all step boundaries is a bug in the body;
                // the run fails with the panic code.
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "workflow body panicked".to_string());
                error!(%message, "workflow body panicked");
                Err(Interrupt::Fatal(
                    ErrorValue::new(message).with_code(codes::PANIC),
                ))
            }
        };

        if let Some(detail) = ctx.nondeterminism() {
            return Err(EngineError::NonDeterministic {
                run_id,
                detail: detail.to_string(),
            });
        }
        let unconsumed = ctx.unconsumed_steps();
        if !unconsumed.is_empty() {
            return Err(EngineError::NonDeterministic {
                run_id,
                detail: format!(
                    "replay never reached recorded step instances: {}",
                    unconsumed.join(", ")
                ),
            });
        }

        let mut scheduled: Vec<Scheduled> = Vec::new();
        let status = match body_result {
            Ok(output) => {
                let effects = ctx.into_effects();
                self.effects_to_events(run_id, &record, effects, now, &mut new_events, &mut scheduled)
                    .await?;

                match store_value(self.world.as_ref(), &self.codec, &output).await {
                    Ok(encoded) => {
                        new_events.push(Event::new(
                            run_id,
                            now,
                            EventBody::RunCompleted { output: encoded },
                        ));
                        info!("run completed");
                        TickStatus::Completed
                    }
                    Err(ValueStoreError::Codec(e)) => {
                        new_events.push(Event::new(
                            run_id,
                            now,
                            EventBody::RunFailed {
                                error: ErrorValue::new(e.to_string())
                                    .with_code(codes::ENCODE_FAILURE),
                            },
                        ));
                        warn!("run result was unencodable");
                        TickStatus::Failed
                    }
                    Err(ValueStoreError::Store(e)) => return Err(e.into()),
                }
            }
            Err(Interrupt::Fatal(cause)) => {
                let effects = ctx.into_effects();
                self.effects_to_events(run_id, &record, effects, now, &mut new_events, &mut scheduled)
                    .await?;
                info!(message = %cause.message, "run failed");
                new_events.push(Event::new(run_id, now, EventBody::RunFailed { error: cause }));
                TickStatus::Failed
            }
            Err(Interrupt::Suspend) => {
                let effects = ctx.into_effects();
                self.effects_to_events(run_id, &record, effects, now, &mut new_events, &mut scheduled)
                    .await?;
                // Self-healing: requests already in the log whose messages
                // may have been lost are re-enqueued idempotently.
                self.reschedule_recorded(&record, &view, now, &mut scheduled);
                debug!("run suspended");
                TickStatus::Suspended
            }
        };

        let events_written = new_events.len();
        if events_written > 0 {
            match self
                .world
                .events()
                .append(run_id, stored.len() as u64, new_events)
                .await
            {
                Ok(_) => {}
                Err(StoreError::TerminalRun { .. }) => {
                    // Cancelled between load and append; the terminal state
                    // is absorbing.
                    return Ok(TickReport {
                        status: TickStatus::AlreadyTerminal,
                        events_written: 0,
                        messages_enqueued: 0,
                    });
                }
                Err(e) => return Err(e.into()),
            }
        }

        let mut messages_enqueued = 0;
        for action in scheduled {
            match action {
                Scheduled::Step {
                    payload,
                    deliver_at,
                } => {
                    self.world
                        .queue()
                        .enqueue(QueueMessage::step(payload, now), EnqueueOptions { deliver_at })
                        .await?;
                    messages_enqueued += 1;
                }
                Scheduled::Tick {
                    idempotency_key,
                    deliver_at,
                } => {
                    self.world
                        .queue()
                        .enqueue(
                            QueueMessage::tick(&self.config.shard, run_id, idempotency_key, now),
                            EnqueueOptions { deliver_at },
                        )
                        .await?;
                    messages_enqueued += 1;
                }
            }
        }

        Ok(TickReport {
            status,
            events_written,
            messages_enqueued,
        })
    }

    async fn run_arguments(&self, run_id: RunId, stored: &[Event]) -> Result<Value, EngineError> {
        let first = stored.first().ok_or_else(|| EngineError::CorruptLog {
            run_id,
            detail: "log is empty".into(),
        })?;
        match &first.body {
            EventBody::RunCreated { arguments, .. } => {
                Ok(load_value(self.world.as_ref(), &self.codec, arguments).await?)
            }
            other => Err(EngineError::CorruptLog {
                run_id,
                detail: format!("first event is {}, expected run_created", other.event_type()),
            }),
        }
    }

    /// Convert replay effects into events and scheduling actions.
    async fn effects_to_events(
        &self,
        run_id: RunId,
        record: &crate::world::RunRecord,
        effects: Vec<Effect>,
        now: DateTime<Utc>,
        new_events: &mut Vec<Event>,
        scheduled: &mut Vec<Scheduled>,
    ) -> Result<(), EngineError> {
        for effect in effects {
            match effect {
                Effect::StepRequest {
                    step_id,
                    instance,
                    input,
                } => {
                    let encoded = store_value(self.world.as_ref(), &self.codec, &input).await?;
                    new_events.push(Event::new(
                        run_id,
                        now,
                        EventBody::StepRequested {
                            step_id: step_id.clone(),
                            step_instance_id: instance.clone(),
                            input: encoded.clone(),
                        },
                    ));
                    scheduled.push(Scheduled::Step {
                        payload: StepPayload {
                            workflow_name: record.workflow_name.clone(),
                            workflow_run_id: run_id,
                            workflow_started_at: record.created_at.timestamp_millis(),
                            step_id,
                            step_instance_id: instance,
                            attempt: 1,
                            input: encoded,
                        },
                        deliver_at: None,
                    });
                }

                Effect::Sleep { wait_id, wake_at } => {
                    new_events.push(Event::new(
                        run_id,
                        now,
                        EventBody::SleepScheduled {
                            wait_id: wait_id.clone(),
                            wake_at,
                        },
                    ));
                    scheduled.push(Scheduled::Tick {
                        idempotency_key: format!("{run_id}:{wait_id}"),
                        deliver_at: Some(wake_at),
                    });
                }

                Effect::HookCreate { token, metadata } => {
                    let encoded = store_value(self.world.as_ref(), &self.codec, &metadata).await?;
                    new_events.push(Event::new(
                        run_id,
                        now,
                        EventBody::HookCreated {
                            hook_token: token,
                            metadata: encoded,
                        },
                    ));
                }

                Effect::WaitStart { wait_id, token } => {
                    new_events.push(Event::new(
                        run_id,
                        now,
                        EventBody::WaitStarted {
                            wait_id,
                            hook_token: token,
                        },
                    ));
                }

                Effect::WantStream { stream_name } => {
                    self.bind_stream(run_id, &stream_name, now, new_events, scheduled)
                        .await?;
                }
            }
        }
        Ok(())
    }

    /// Bind a closed stream's content into the log, or schedule a poll
    /// until its producer closes it.
    async fn bind_stream(
        &self,
        run_id: RunId,
        stream_name: &str,
        now: DateTime<Utc>,
        new_events: &mut Vec<Event>,
        scheduled: &mut Vec<Scheduled>,
    ) -> Result<(), EngineError> {
        let mut chunks: Vec<Vec<u8>> = Vec::new();
        let mut cursor = 0;
        let mut kind = wrun_core::StreamKind::Bytes;
        let closed = loop {
            match self
                .world
                .streams()
                .read(run_id, stream_name, cursor, 256)
                .await
            {
                Ok(page) => {
                    kind = page.kind;
                    let drained = page.chunks.is_empty();
                    chunks.extend(page.chunks);
                    cursor = page.next_cursor;
                    if page.closed {
                        break true;
                    }
                    if drained {
                        // Caught up with a still-open stream.
                        break false;
                    }
                }
                Err(StoreError::StreamNotFound { .. }) => break false,
                Err(e) => return Err(e.into()),
            }
        };

        if closed {
            new_events.push(Event::new(
                run_id,
                now,
                EventBody::StreamOpened {
                    stream_name: stream_name.to_string(),
                    namespace: None,
                    kind,
                },
            ));
            for chunk in &chunks {
                new_events.push(Event::new(
                    run_id,
                    now,
                    EventBody::StreamChunk {
                        stream_name: stream_name.to_string(),
                        chunk: BASE64.encode(chunk),
                    },
                ));
            }
            new_events.push(Event::new(
                run_id,
                now,
                EventBody::StreamClosed {
                    stream_name: stream_name.to_string(),
                },
            ));
            scheduled.push(Scheduled::Tick {
                idempotency_key: format!("{run_id}:stream-bound:{stream_name}"),
                deliver_at: None,
            });
        } else {
            scheduled.push(Scheduled::Tick {
                idempotency_key: format!(
                    "{run_id}:stream-poll:{stream_name}:{}",
                    now.timestamp_millis()
                ),
                deliver_at: Some(
                    now + chrono::Duration::from_std(self.config.stream_poll_interval)
                        .unwrap_or_else(|_| chrono::Duration::seconds(5)),
                ),
            });
        }
        Ok(())
    }

    /// Re-enqueue messages for work already recorded in the log. All sends
    /// are idempotent, so this is free when the original messages are still
    /// in the queue and restores progress when one was lost.
    fn reschedule_recorded(
        &self,
        record: &crate::world::RunRecord,
        view: &[Event],
        now: DateTime<Utc>,
        scheduled: &mut Vec<Scheduled>,
    ) {
        use std::collections::HashMap;

        enum ClusterTail {
            Requested {
                step_id: wrun_core::StepId,
                input: wrun_core::EncodedValue,
            },
            RetryScheduled {
                step_id: wrun_core::StepId,
                input: wrun_core::EncodedValue,
                next_attempt: u32,
                next_attempt_at: DateTime<Utc>,
            },
            InFlightOrDone,
        }

        let mut clusters: HashMap<String, ClusterTail> = HashMap::new();
        let mut inputs: HashMap<String, (wrun_core::StepId, wrun_core::EncodedValue)> =
            HashMap::new();
        let mut instances: HashMap<String, wrun_core::StepInstanceId> = HashMap::new();

        for event in view {
            match &event.body {
                EventBody::StepRequested {
                    step_id,
                    step_instance_id,
                    input,
                } => {
                    let key = step_instance_id.to_string();
                    inputs.insert(key.clone(), (step_id.clone(), input.clone()));
                    instances.insert(key.clone(), step_instance_id.clone());
                    clusters.insert(
                        key,
                        ClusterTail::Requested {
                            step_id: step_id.clone(),
                            input: input.clone(),
                        },
                    );
                }
                EventBody::StepStarted {
                    step_instance_id, ..
                }
                | EventBody::StepCompleted {
                    step_instance_id, ..
                }
                | EventBody::StepFailed {
                    step_instance_id, ..
                } => {
                    clusters
                        .insert(step_instance_id.to_string(), ClusterTail::InFlightOrDone);
                }
                EventBody::StepRetryScheduled {
                    step_instance_id,
                    next_attempt,
                    next_attempt_at,
                    ..
                } => {
                    let key = step_instance_id.to_string();
                    if let Some((step_id, input)) = inputs.get(&key) {
                        clusters.insert(
                            key,
                            ClusterTail::RetryScheduled {
                                step_id: step_id.clone(),
                                input: input.clone(),
                                next_attempt: *next_attempt,
                                next_attempt_at: *next_attempt_at,
                            },
                        );
                    }
                }
                EventBody::SleepScheduled { wait_id, wake_at } => {
                    if *wake_at > now {
                        scheduled.push(Scheduled::Tick {
                            idempotency_key: format!("{}:{wait_id}", record.run_id),
                            deliver_at: Some(*wake_at),
                        });
                    }
                }
                _ => {}
            }
        }

        for (key, tail) in clusters {
            let Some(instance) = instances.get(&key) else {
                continue;
            };
            let make_payload =
                |step_id: &wrun_core::StepId, input: &wrun_core::EncodedValue, attempt: u32| {
                    StepPayload {
                        workflow_name: record.workflow_name.clone(),
                        workflow_run_id: record.run_id,
                        workflow_started_at: record.created_at.timestamp_millis(),
                        step_id: step_id.clone(),
                        step_instance_id: instance.clone(),
                        attempt,
                        input: input.clone(),
                    }
                };
            match tail {
                ClusterTail::Requested { step_id, input } => scheduled.push(Scheduled::Step {
                    payload: make_payload(&step_id, &input, 1),
                    deliver_at: None,
                }),
                ClusterTail::RetryScheduled {
                    step_id,
                    input,
                    next_attempt,
                    next_attempt_at,
                } => scheduled.push(Scheduled::Step {
                    payload: make_payload(&step_id, &input, next_attempt),
                    deliver_at: Some(next_attempt_at),
                }),
                ClusterTail::InFlightOrDone => {}
            }
        }
    }
}

/// Completions for waits that are satisfied as of `now`: due sleeps and
/// hook waits whose token was resumed.
fn due_wait_completions(run_id: RunId, stored: &[Event], now: DateTime<Utc>) -> Vec<Event> {
    use std::collections::HashSet;

    let mut completed: HashSet<&str> = HashSet::new();
    let mut resumed: HashSet<&str> = HashSet::new();
    for event in stored {
        match &event.body {
            EventBody::WaitCompleted { wait_id } => {
                completed.insert(wait_id.as_str());
            }
            EventBody::HookResumed { hook_token, .. } => {
                resumed.insert(hook_token.as_str());
            }
            _ => {}
        }
    }

    let mut due: Vec<Event> = Vec::new();
    let mut seen: HashSet<&str> = HashSet::new();
    for event in stored {
        match &event.body {
            EventBody::SleepScheduled { wait_id, wake_at }
                if !completed.contains(wait_id.as_str())
                    && seen.insert(wait_id.as_str())
                    && *wake_at <= now =>
            {
                due.push(Event::new(
                    run_id,
                    now,
                    EventBody::WaitCompleted {
                        wait_id: wait_id.clone(),
                    },
                ));
            }
            EventBody::WaitStarted {
                wait_id,
                hook_token: Some(token),
            } if !completed.contains(wait_id.as_str())
                && seen.insert(wait_id.as_str())
                && resumed.contains(token.as_str()) =>
            {
                due.push(Event::new(
                    run_id,
                    now,
                    EventBody::WaitCompleted {
                        wait_id: wait_id.clone(),
                    },
                ));
            }
            _ => {}
        }
    }
    due
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wrun_core::{EncodedValue, RunStatus, StepId, CURRENT_SPEC_VERSION};

    use crate::engine::workflow::WorkflowFn;
    use crate::world::{EventStore, InMemoryWorld, NewRun};

    fn add_step_id() -> StepId {
        StepId::new("src/flows.ts", "add")
    }

    struct AddWorkflow;

    impl WorkflowFn for AddWorkflow {
        const NAME: &'static str = "add";
        type Input = (i64, i64);
        type Output = i64;

        fn run(
            &self,
            ctx: &mut RunContext<'_>,
            (a, b): Self::Input,
        ) -> Result<Self::Output, Interrupt> {
            let sum: i64 = ctx.step(&add_step_id(), &(a, b))?;
            Ok(sum)
        }
    }

    struct PanickyWorkflow;

    impl WorkflowFn for PanickyWorkflow {
        const NAME: &'static str = "panicky";
        type Input = ();
        type Output = ();

        fn run(&self, _ctx: &mut RunContext<'_>, _input: ()) -> Result<(), Interrupt> {
            panic!("unexpected state");
        }
    }

    async fn seeded_run(
        world: &InMemoryWorld,
        workflow_name: &str,
        arguments: Value,
    ) -> RunId {
        let run_id = RunId::generate();
        let now = Utc::now();
        world
            .create_run(NewRun {
                run_id,
                workflow_name: workflow_name.into(),
                spec_version: CURRENT_SPEC_VERSION.into(),
                created_at: now,
            })
            .await
            .unwrap();
        world
            .append(
                run_id,
                0,
                vec![Event::new(
                    run_id,
                    now,
                    EventBody::RunCreated {
                        workflow_name: workflow_name.into(),
                        spec_version: CURRENT_SPEC_VERSION.into(),
                        arguments: EncodedValue::inline(arguments),
                    },
                )],
            )
            .await
            .unwrap();
        run_id
    }

    fn engine(world: Arc<InMemoryWorld>) -> ReplayEngine {
        let registry = Arc::new(
            Registry::builder()
                .workflow(AddWorkflow)
                .workflow(PanickyWorkflow)
                .build(),
        );
        ReplayEngine::new(world, registry, Codec::plain(), EngineConfig::default())
    }

    #[tokio::test]
    async fn test_first_tick_requests_step() {
        let world = Arc::new(InMemoryWorld::new());
        let run_id = seeded_run(&world, "add", json!([2, 3])).await;
        let engine = engine(Arc::clone(&world));

        let report = engine.tick(run_id, Utc::now()).await.unwrap();
        assert_eq!(report.status, TickStatus::Suspended);

        let events = world.load_all(run_id).await.unwrap();
        let types: Vec<&str> = events.iter().map(|e| e.body.event_type()).collect();
        assert_eq!(types, vec!["run_created", "run_started", "step_requested"]);

        // The step message landed on its queue.
        let queue = wrun_core::queues::step(&add_step_id());
        assert_eq!(world.pending_message_count(&queue), 1);
    }

    #[tokio::test]
    async fn test_tick_completes_after_step_result() {
        let world = Arc::new(InMemoryWorld::new());
        let run_id = seeded_run(&world, "add", json!([2, 3])).await;
        let engine = engine(Arc::clone(&world));
        let now = Utc::now();

        engine.tick(run_id, now).await.unwrap();

        // Simulate the executor recording the outcome.
        let events = world.load_all(run_id).await.unwrap();
        let instance = events
            .iter()
            .find_map(|e| e.body.step_instance_id())
            .unwrap()
            .clone();
        let seq = events.len() as u64;
        world
            .append(
                run_id,
                seq,
                vec![
                    Event::new(
                        run_id,
                        now,
                        EventBody::StepStarted {
                            step_instance_id: instance.clone(),
                            attempt: 1,
                        },
                    ),
                    Event::new(
                        run_id,
                        now,
                        EventBody::StepCompleted {
                            step_instance_id: instance,
                            attempt: 1,
                            output: EncodedValue::inline(json!(5)),
                        },
                    ),
                ],
            )
            .await
            .unwrap();

        let report = engine.tick(run_id, now).await.unwrap();
        assert_eq!(report.status, TickStatus::Completed);

        let projection =
            wrun_core::RunProjection::from_events(&world.load_all(run_id).await.unwrap());
        assert_eq!(projection.status, RunStatus::Completed);
        assert_eq!(
            projection.output.unwrap().as_inline().unwrap(),
            &json!(5)
        );
    }

    #[tokio::test]
    async fn test_second_tick_while_in_flight_writes_nothing() {
        let world = Arc::new(InMemoryWorld::new());
        let run_id = seeded_run(&world, "add", json!([2, 3])).await;
        let engine = engine(Arc::clone(&world));
        let now = Utc::now();

        engine.tick(run_id, now).await.unwrap();
        let before = world.load_all(run_id).await.unwrap().len();

        let report = engine.tick(run_id, now).await.unwrap();
        assert_eq!(report.status, TickStatus::Suspended);
        assert_eq!(report.events_written, 0);
        assert_eq!(world.load_all(run_id).await.unwrap().len(), before);
    }

    #[tokio::test]
    async fn test_replay_determinism_same_requests() {
        let world = Arc::new(InMemoryWorld::new());
        let run_id = seeded_run(&world, "add", json!([2, 3])).await;
        let engine = engine(Arc::clone(&world));
        let now = Utc::now();

        engine.tick(run_id, now).await.unwrap();
        let first: Vec<String> = world
            .load_all(run_id)
            .await
            .unwrap()
            .iter()
            .filter_map(|e| e.body.step_instance_id().map(|i| i.to_string()))
            .collect();

        // Replaying the same prefix requests nothing new.
        engine.tick(run_id, now).await.unwrap();
        let second: Vec<String> = world
            .load_all(run_id)
            .await
            .unwrap()
            .iter()
            .filter_map(|e| e.body.step_instance_id().map(|i| i.to_string()))
            .collect();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_panic_fails_run_with_panic_code() {
        let world = Arc::new(InMemoryWorld::new());
        let run_id = seeded_run(&world, "panicky", json!(null)).await;
        let engine = engine(Arc::clone(&world));

        let report = engine.tick(run_id, Utc::now()).await.unwrap();
        assert_eq!(report.status, TickStatus::Failed);

        let projection =
            wrun_core::RunProjection::from_events(&world.load_all(run_id).await.unwrap());
        assert_eq!(projection.status, RunStatus::Failed);
        let error = projection.error.unwrap();
        assert!(error.has_code(codes::PANIC));
        assert!(error.message.contains("unexpected state"));
    }

    #[tokio::test]
    async fn test_legacy_run_is_rejected() {
        let world = Arc::new(InMemoryWorld::new());
        let run_id = RunId::generate();
        world
            .create_run(NewRun {
                run_id,
                workflow_name: "add".into(),
                spec_version: "3.0.0".into(),
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        let engine = engine(Arc::clone(&world));

        let denied = engine.tick(run_id, Utc::now()).await;
        assert!(matches!(
            denied,
            Err(EngineError::UnsupportedLegacyOperation(_))
        ));
    }

    #[tokio::test]
    async fn test_due_sleep_completes_on_tick() {
        let world = Arc::new(InMemoryWorld::new());
        let run_id = seeded_run(&world, "add", json!([1, 1])).await;
        let now = Utc::now();

        // Seed a scheduled sleep that is already due.
        world
            .append(
                run_id,
                1,
                vec![
                    Event::new(run_id, now, EventBody::RunStarted),
                    Event::new(
                        run_id,
                        now,
                        EventBody::SleepScheduled {
                            wait_id: "sleep#1".into(),
                            wake_at: now - chrono::Duration::seconds(1),
                        },
                    ),
                ],
            )
            .await
            .unwrap();

        let engine = engine(Arc::clone(&world));
        engine.tick(run_id, now).await.unwrap();

        let events = world.load_all(run_id).await.unwrap();
        assert!(events
            .iter()
            .any(|e| matches!(&e.body, EventBody::WaitCompleted { wait_id } if wait_id == "sleep#1")));
    }
}
