//! Workflow run context
//!
//! The workflow body executes from the beginning on every tick against a
//! [`RunContext`]. Every recordable operation is an interceptor: a recorded
//! outcome returns synchronously, an unresolved point short-circuits the
//! tick with [`Interrupt::Suspend`] through `?`. Determinism comes from
//! replaying log-observed decisions instead of re-doing them, plus the
//! deterministic substitutes the context provides for time, randomness,
//! and id generation.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use wrun_core::{
    from_value, to_value, Codec, ErrorValue, Event, EventBody, HookToken, RunId, StepId,
    StepInstanceId,
};

use crate::world::{load_value, RunRecord, ValueStoreError, World};

/// Why the workflow body stopped short of returning.
#[derive(Debug, Clone, PartialEq)]
pub enum Interrupt {
    /// The body reached a point whose outcome is not recorded yet. The tick
    /// ends without a terminal state; the pending effects are scheduled.
    Suspend,

    /// The body failed for good. The run fails with this cause.
    Fatal(ErrorValue),
}

impl Interrupt {
    /// A fatal interrupt with just a message.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal(ErrorValue::new(message))
    }
}

impl From<ErrorValue> for Interrupt {
    fn from(error: ErrorValue) -> Self {
        Self::Fatal(error)
    }
}

/// API called outside its legal context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ContextError {
    /// A workflow-context API was called elsewhere.
    #[error("not in workflow context")]
    NotInWorkflowContext,

    /// A step-context API was called elsewhere.
    #[error("not in step context")]
    NotInStepContext,

    /// The API exists but is forbidden during replay; do the work in a step.
    #[error("unavailable in workflow context; perform this work inside a step")]
    UnavailableInWorkflowContext,
}

impl ContextError {
    fn code(self) -> &'static str {
        match self {
            Self::NotInWorkflowContext => "not_in_workflow_context",
            Self::NotInStepContext => "not_in_step_context",
            Self::UnavailableInWorkflowContext => "unavailable_in_workflow_context",
        }
    }
}

impl From<ContextError> for Interrupt {
    fn from(error: ContextError) -> Self {
        Self::Fatal(ErrorValue::new(error.to_string()).with_code(error.code()))
    }
}

/// A durable pause point handed back by [`RunContext::create_hook`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hook {
    token: HookToken,
}

impl Hook {
    /// The single-use token an external caller resumes with.
    pub fn token(&self) -> &HookToken {
        &self.token
    }
}

/// A side-effect request produced by a suspended tick.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Effect {
    /// Request a new step invocation.
    StepRequest {
        step_id: StepId,
        instance: StepInstanceId,
        input: Value,
    },

    /// Schedule a sleep with its absolute wake time.
    Sleep {
        wait_id: String,
        wake_at: DateTime<Utc>,
    },

    /// Record a freshly created hook.
    HookCreate { token: HookToken, metadata: Value },

    /// Record that the run is waiting on an external signal.
    WaitStart {
        wait_id: String,
        token: Option<HookToken>,
    },

    /// The body wants a stream bound into the log.
    WantStream { stream_name: String },
}

#[derive(Debug, Clone)]
pub(crate) enum StepClusterState {
    /// Requested or started, no terminal event yet.
    Pending,
    Completed {
        output: Value,
        at: DateTime<Utc>,
    },
    Failed {
        error: ErrorValue,
        at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone)]
pub(crate) struct StepCluster {
    pub(crate) state: StepClusterState,
    /// Recorded input, resolved, for divergence detection.
    pub(crate) input: Option<Value>,
}

#[derive(Debug, Clone)]
pub(crate) struct SleepRecord {
    pub(crate) wake_at: DateTime<Utc>,
    pub(crate) completed: bool,
    pub(crate) completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub(crate) struct WaitRecord {
    pub(crate) token: Option<HookToken>,
    pub(crate) completed: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct StreamBinding {
    pub(crate) chunks: Vec<Vec<u8>>,
    pub(crate) closed: bool,
    pub(crate) closed_at: Option<DateTime<Utc>>,
}

/// Replay cache built from the event prefix in one pass.
///
/// Blob-referenced payloads are resolved here, before replay begins, so the
/// workflow body itself never touches I/O.
#[derive(Debug, Default)]
pub(crate) struct ReplayIndex {
    pub(crate) steps: HashMap<String, StepCluster>,
    pub(crate) sleeps: HashMap<String, SleepRecord>,
    pub(crate) waits: HashMap<String, WaitRecord>,
    /// Hook tokens in creation order, with creation times.
    pub(crate) hooks: Vec<(HookToken, DateTime<Utc>)>,
    /// Token -> resolved resumption payload and time.
    pub(crate) resumptions: HashMap<String, (Value, DateTime<Utc>)>,
    pub(crate) streams: HashMap<String, StreamBinding>,
}

impl ReplayIndex {
    pub(crate) async fn build(
        events: &[Event],
        world: &dyn World,
        codec: &Codec,
    ) -> Result<Self, ValueStoreError> {
        let mut index = Self::default();

        for event in events {
            match &event.body {
                EventBody::StepRequested {
                    step_instance_id,
                    input,
                    ..
                } => {
                    let input = load_value(world, codec, input).await?;
                    index.steps.insert(
                        step_instance_id.to_string(),
                        StepCluster {
                            state: StepClusterState::Pending,
                            input: Some(input),
                        },
                    );
                }
                EventBody::StepCompleted {
                    step_instance_id,
                    output,
                    ..
                } => {
                    let output = load_value(world, codec, output).await?;
                    if let Some(cluster) = index.steps.get_mut(&step_instance_id.to_string()) {
                        cluster.state = StepClusterState::Completed {
                            output,
                            at: event.created_at,
                        };
                    }
                }
                EventBody::StepFailed {
                    step_instance_id,
                    error,
                    ..
                } => {
                    if let Some(cluster) = index.steps.get_mut(&step_instance_id.to_string()) {
                        cluster.state = StepClusterState::Failed {
                            error: error.clone(),
                            at: event.created_at,
                        };
                    }
                }
                EventBody::SleepScheduled { wait_id, wake_at } => {
                    index.sleeps.insert(
                        wait_id.clone(),
                        SleepRecord {
                            wake_at: *wake_at,
                            completed: false,
                            completed_at: None,
                        },
                    );
                }
                EventBody::WaitStarted {
                    wait_id,
                    hook_token,
                } => {
                    index.waits.insert(
                        wait_id.clone(),
                        WaitRecord {
                            token: hook_token.clone(),
                            completed: false,
                        },
                    );
                }
                EventBody::WaitCompleted { wait_id } => {
                    if let Some(sleep) = index.sleeps.get_mut(wait_id) {
                        sleep.completed = true;
                        sleep.completed_at = Some(event.created_at);
                    }
                    if let Some(wait) = index.waits.get_mut(wait_id) {
                        wait.completed = true;
                    }
                }
                EventBody::HookCreated { hook_token, .. } => {
                    index.hooks.push((hook_token.clone(), event.created_at));
                }
                EventBody::HookResumed {
                    hook_token,
                    payload,
                } => {
                    let payload = load_value(world, codec, payload).await?;
                    index.resumptions.insert(
                        hook_token.as_str().to_string(),
                        (payload, event.created_at),
                    );
                }
                EventBody::StreamOpened { stream_name, .. } => {
                    index.streams.insert(
                        stream_name.clone(),
                        StreamBinding {
                            chunks: Vec::new(),
                            closed: false,
                            closed_at: None,
                        },
                    );
                }
                EventBody::StreamChunk { stream_name, chunk } => {
                    if let Some(binding) = index.streams.get_mut(stream_name) {
                        let bytes = BASE64.decode(chunk).map_err(|e| {
                            ValueStoreError::Codec(wrun_core::CodecError::DecodeFailure(
                                e.to_string(),
                            ))
                        })?;
                        binding.chunks.push(bytes);
                    }
                }
                EventBody::StreamClosed { stream_name } => {
                    if let Some(binding) = index.streams.get_mut(stream_name) {
                        binding.closed = true;
                        binding.closed_at = Some(event.created_at);
                    }
                }
                _ => {}
            }
        }

        Ok(index)
    }

    /// Sleeps without a completion yet, with their wake times.
    pub(crate) fn unresolved_sleeps(&self) -> impl Iterator<Item = (&String, DateTime<Utc>)> {
        self.sleeps
            .iter()
            .filter(|(_, record)| !record.completed)
            .map(|(wait_id, record)| (wait_id, record.wake_at))
    }
}

/// The deterministic context a workflow body executes against.
pub struct RunContext<'a> {
    run_id: RunId,
    workflow_name: &'a str,
    spec_version: &'a str,
    index: &'a ReplayIndex,
    tick_time: DateTime<Utc>,
    clock: DateTime<Utc>,
    rng: StdRng,
    sequence_counter: u64,
    step_counters: HashMap<StepId, u32>,
    sleep_counter: u32,
    wait_counter: u32,
    hook_counter: usize,
    effects: Vec<Effect>,
    consumed_steps: HashSet<String>,
    nondeterminism: Option<String>,
}

impl<'a> RunContext<'a> {
    pub(crate) fn new(
        record: &'a RunRecord,
        index: &'a ReplayIndex,
        tick_time: DateTime<Utc>,
    ) -> Self {
        // The substitute RNG is seeded from the run id, so every replay of
        // the run draws the same sequence.
        let raw = u128::from(record.run_id.ulid());
        let seed = (raw >> 64) as u64 ^ raw as u64;

        Self {
            run_id: record.run_id,
            workflow_name: &record.workflow_name,
            spec_version: &record.spec_version,
            index,
            tick_time,
            clock: record.created_at,
            rng: StdRng::seed_from_u64(seed),
            sequence_counter: 0,
            step_counters: HashMap::new(),
            sleep_counter: 0,
            wait_counter: 0,
            hook_counter: 0,
            effects: Vec::new(),
            consumed_steps: HashSet::new(),
            nondeterminism: None,
        }
    }

    /// The run being executed.
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// The workflow's registered name.
    pub fn workflow_name(&self) -> &str {
        self.workflow_name
    }

    /// The spec version this run was created under.
    pub fn spec_version(&self) -> &str {
        self.spec_version
    }

    // =========================================================================
    // Steps
    // =========================================================================

    /// Invoke a step. A recorded terminal failure becomes a fatal interrupt;
    /// use [`try_step`](Self::try_step) to catch it instead.
    pub fn step<I: Serialize, O: DeserializeOwned>(
        &mut self,
        step_id: &StepId,
        input: &I,
    ) -> Result<O, Interrupt> {
        match self.try_step(step_id, input)? {
            Ok(output) => Ok(output),
            Err(error) => Err(Interrupt::Fatal(error)),
        }
    }

    /// Invoke a step, surfacing a terminal failure as a catchable value.
    pub fn try_step<I: Serialize, O: DeserializeOwned>(
        &mut self,
        step_id: &StepId,
        input: &I,
    ) -> Result<Result<O, ErrorValue>, Interrupt> {
        let input = to_value(input).map_err(|e| Interrupt::fatal(e.to_string()))?;
        match self.try_step_value(step_id, input)? {
            Ok(output) => {
                let typed =
                    from_value(output).map_err(|e| Interrupt::fatal(e.to_string()))?;
                Ok(Ok(typed))
            }
            Err(error) => Ok(Err(error)),
        }
    }

    /// Type-erased step invocation.
    pub fn try_step_value(
        &mut self,
        step_id: &StepId,
        input: Value,
    ) -> Result<Result<Value, ErrorValue>, Interrupt> {
        let counter = self.step_counters.entry(step_id.clone()).or_insert(0);
        *counter += 1;
        let instance = StepInstanceId::new(step_id.clone(), *counter);
        let key = instance.to_string();

        match self.index.steps.get(&key) {
            Some(cluster) => {
                self.consumed_steps.insert(key);

                if let Some(recorded) = &cluster.input {
                    if *recorded != input {
                        self.nondeterminism = Some(format!(
                            "step {instance} was replayed with an input different from its recorded request"
                        ));
                        return Err(Interrupt::Suspend);
                    }
                }

                match &cluster.state {
                    StepClusterState::Completed { output, at } => {
                        self.advance_clock(*at);
                        Ok(Ok(output.clone()))
                    }
                    StepClusterState::Failed { error, at } => {
                        self.advance_clock(*at);
                        Ok(Err(error.clone()))
                    }
                    StepClusterState::Pending => Err(Interrupt::Suspend),
                }
            }
            None => {
                self.effects.push(Effect::StepRequest {
                    step_id: step_id.clone(),
                    instance,
                    input,
                });
                Err(Interrupt::Suspend)
            }
        }
    }

    // =========================================================================
    // Sleeps
    // =========================================================================

    /// Sleep for a duration, measured from the tick that first reached this
    /// call site.
    pub fn sleep(&mut self, duration: Duration) -> Result<(), Interrupt> {
        let wake_at = self.tick_time
            + chrono::Duration::from_std(duration)
                .map_err(|_| Interrupt::fatal("sleep duration out of range"))?;
        self.sleep_at(wake_at)
    }

    /// Sleep until an absolute time.
    pub fn sleep_until(&mut self, wake_at: DateTime<Utc>) -> Result<(), Interrupt> {
        self.sleep_at(wake_at)
    }

    fn sleep_at(&mut self, wake_at: DateTime<Utc>) -> Result<(), Interrupt> {
        self.sleep_counter += 1;
        let wait_id = format!("sleep#{}", self.sleep_counter);

        match self.index.sleeps.get(&wait_id) {
            Some(record) if record.completed => {
                if let Some(at) = record.completed_at {
                    self.advance_clock(at);
                }
                Ok(())
            }
            Some(_) => Err(Interrupt::Suspend),
            None => {
                self.effects.push(Effect::Sleep { wait_id, wake_at });
                Err(Interrupt::Suspend)
            }
        }
    }

    // =========================================================================
    // Hooks
    // =========================================================================

    /// Create a durable hook. Returns immediately with the token; awaiting
    /// the hook is a separate suspension point.
    pub fn create_hook<M: Serialize>(&mut self, metadata: &M) -> Result<Hook, Interrupt> {
        let metadata = to_value(metadata).map_err(|e| Interrupt::fatal(e.to_string()))?;
        self.hook_counter += 1;

        match self.index.hooks.get(self.hook_counter - 1) {
            Some((token, at)) => {
                let at = *at;
                let token = token.clone();
                self.advance_clock(at);
                Ok(Hook { token })
            }
            None => {
                let token = HookToken::generate();
                self.effects.push(Effect::HookCreate {
                    token: token.clone(),
                    metadata,
                });
                Ok(Hook { token })
            }
        }
    }

    /// Await a hook's resumption payload.
    pub fn await_hook<T: DeserializeOwned>(&mut self, hook: &Hook) -> Result<T, Interrupt> {
        let value = self.await_hook_value(hook)?;
        from_value(value).map_err(|e| Interrupt::fatal(e.to_string()))
    }

    /// Type-erased hook await.
    pub fn await_hook_value(&mut self, hook: &Hook) -> Result<Value, Interrupt> {
        self.wait_counter += 1;
        let wait_id = format!("wait#{}", self.wait_counter);

        if let Some((payload, at)) = self.index.resumptions.get(hook.token().as_str()) {
            let (payload, at) = (payload.clone(), *at);
            self.advance_clock(at);
            return Ok(payload);
        }

        if !self.index.waits.contains_key(&wait_id) {
            self.effects.push(Effect::WaitStart {
                wait_id,
                token: Some(hook.token().clone()),
            });
        }
        Err(Interrupt::Suspend)
    }

    // =========================================================================
    // Streams
    // =========================================================================

    /// Read a named stream's full chunk sequence. The content binds into
    /// the log once the stream is closed, so replay is deterministic.
    pub fn read_stream(&mut self, stream_name: &str) -> Result<Vec<Vec<u8>>, Interrupt> {
        match self.index.streams.get(stream_name) {
            Some(binding) if binding.closed => {
                if let Some(at) = binding.closed_at {
                    self.advance_clock(at);
                }
                Ok(binding.chunks.clone())
            }
            Some(_) => Err(Interrupt::Suspend),
            None => {
                self.effects.push(Effect::WantStream {
                    stream_name: stream_name.to_string(),
                });
                Err(Interrupt::Suspend)
            }
        }
    }

    /// Stream writes are a step-side API. Fails with
    /// [`ContextError::UnavailableInWorkflowContext`].
    pub fn write_stream(&mut self, _stream_name: &str, _chunk: &[u8]) -> Result<(), Interrupt> {
        Err(ContextError::UnavailableInWorkflowContext.into())
    }

    // =========================================================================
    // Deterministic substitutes
    // =========================================================================

    /// The replay clock: the creation time of the most recently consumed
    /// recorded event. Stable across replays of the same prefix, unlike the
    /// wall clock, which must never be read inside a workflow body.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock
    }

    /// Deterministic random draw, seeded from the run id.
    pub fn random_u64(&mut self) -> u64 {
        self.rng.gen()
    }

    /// Deterministic random draw in `[0, 1)`.
    pub fn random_f64(&mut self) -> f64 {
        self.rng.gen()
    }

    /// Monotonic sequence number, unique within the run body.
    pub fn sequence(&mut self) -> u64 {
        self.sequence_counter += 1;
        self.sequence_counter
    }

    // =========================================================================
    // Engine-side accessors
    // =========================================================================

    fn advance_clock(&mut self, at: DateTime<Utc>) {
        if at > self.clock {
            self.clock = at;
        }
    }

    pub(crate) fn nondeterminism(&self) -> Option<&str> {
        self.nondeterminism.as_deref()
    }

    /// Recorded step clusters this replay never reached: the body diverged
    /// from its history.
    pub(crate) fn unconsumed_steps(&self) -> Vec<String> {
        self.index
            .steps
            .keys()
            .filter(|key| !self.consumed_steps.contains(*key))
            .cloned()
            .collect()
    }

    pub(crate) fn into_effects(self) -> Vec<Effect> {
        self.effects
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wrun_core::{EncodedValue, StreamKind, CURRENT_SPEC_VERSION};

    use crate::world::InMemoryWorld;

    fn record(run_id: RunId) -> RunRecord {
        RunRecord {
            run_id,
            workflow_name: "test".into(),
            spec_version: CURRENT_SPEC_VERSION.into(),
            created_at: Utc::now(),
            legacy: false,
        }
    }

    fn step_id() -> StepId {
        StepId::new("src/flows.ts", "add")
    }

    async fn index_of(run_id: RunId, bodies: Vec<EventBody>) -> ReplayIndex {
        let world = InMemoryWorld::new();
        let codec = Codec::plain();
        let events: Vec<Event> = bodies
            .into_iter()
            .map(|body| Event::new(run_id, Utc::now(), body))
            .collect();
        ReplayIndex::build(&events, &world, &codec).await.unwrap()
    }

    #[tokio::test]
    async fn test_first_execution_requests_step_and_suspends() {
        let run_id = RunId::generate();
        let rec = record(run_id);
        let index = index_of(run_id, vec![]).await;
        let mut ctx = RunContext::new(&rec, &index, Utc::now());

        let result: Result<i64, Interrupt> = ctx.step(&step_id(), &json!([2, 3]));
        assert_eq!(result.unwrap_err(), Interrupt::Suspend);

        let effects = ctx.into_effects();
        assert_eq!(effects.len(), 1);
        match &effects[0] {
            Effect::StepRequest { instance, input, .. } => {
                assert_eq!(instance.occurrence(), 1);
                assert_eq!(*input, json!([2, 3]));
            }
            other => panic!("unexpected effect: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_recorded_completion_returns_synchronously() {
        let run_id = RunId::generate();
        let rec = record(run_id);
        let instance = StepInstanceId::new(step_id(), 1);
        let index = index_of(
            run_id,
            vec![
                EventBody::StepRequested {
                    step_id: step_id(),
                    step_instance_id: instance.clone(),
                    input: EncodedValue::inline(json!([2, 3])),
                },
                EventBody::StepStarted {
                    step_instance_id: instance.clone(),
                    attempt: 1,
                },
                EventBody::StepCompleted {
                    step_instance_id: instance,
                    attempt: 1,
                    output: EncodedValue::inline(json!(5)),
                },
            ],
        )
        .await;

        let mut ctx = RunContext::new(&rec, &index, Utc::now());
        let result: i64 = ctx.step(&step_id(), &json!([2, 3])).unwrap();
        assert_eq!(result, 5);
        assert!(ctx.unconsumed_steps().is_empty());
        assert!(ctx.into_effects().is_empty());
    }

    #[tokio::test]
    async fn test_in_flight_step_suspends_without_new_effects() {
        let run_id = RunId::generate();
        let rec = record(run_id);
        let instance = StepInstanceId::new(step_id(), 1);
        let index = index_of(
            run_id,
            vec![
                EventBody::StepRequested {
                    step_id: step_id(),
                    step_instance_id: instance.clone(),
                    input: EncodedValue::inline(json!([2, 3])),
                },
                EventBody::StepStarted {
                    step_instance_id: instance,
                    attempt: 1,
                },
            ],
        )
        .await;

        let mut ctx = RunContext::new(&rec, &index, Utc::now());
        let result: Result<i64, Interrupt> = ctx.step(&step_id(), &json!([2, 3]));
        assert_eq!(result.unwrap_err(), Interrupt::Suspend);
        assert!(ctx.into_effects().is_empty());
    }

    #[tokio::test]
    async fn test_recorded_failure_is_catchable() {
        let run_id = RunId::generate();
        let rec = record(run_id);
        let instance = StepInstanceId::new(step_id(), 1);
        let index = index_of(
            run_id,
            vec![
                EventBody::StepRequested {
                    step_id: step_id(),
                    step_instance_id: instance.clone(),
                    input: EncodedValue::inline(json!([2, 3])),
                },
                EventBody::StepFailed {
                    step_instance_id: instance,
                    attempt: 1,
                    error: ErrorValue::new("bad"),
                },
            ],
        )
        .await;

        let mut ctx = RunContext::new(&rec, &index, Utc::now());
        let caught: Result<i64, ErrorValue> = ctx.try_step(&step_id(), &json!([2, 3])).unwrap();
        assert_eq!(caught.unwrap_err().message, "bad");

        // The plain form escalates the same failure to a fatal interrupt.
        let mut ctx = RunContext::new(&rec, &index, Utc::now());
        let fatal: Result<i64, Interrupt> = ctx.step(&step_id(), &json!([2, 3]));
        assert!(matches!(fatal.unwrap_err(), Interrupt::Fatal(e) if e.message == "bad"));
    }

    #[tokio::test]
    async fn test_input_divergence_flags_nondeterminism() {
        let run_id = RunId::generate();
        let rec = record(run_id);
        let instance = StepInstanceId::new(step_id(), 1);
        let index = index_of(
            run_id,
            vec![EventBody::StepRequested {
                step_id: step_id(),
                step_instance_id: instance,
                input: EncodedValue::inline(json!([2, 3])),
            }],
        )
        .await;

        let mut ctx = RunContext::new(&rec, &index, Utc::now());
        let result: Result<i64, Interrupt> = ctx.step(&step_id(), &json!([9, 9]));
        assert_eq!(result.unwrap_err(), Interrupt::Suspend);
        assert!(ctx.nondeterminism().is_some());
    }

    #[tokio::test]
    async fn test_occurrences_count_per_call_site() {
        let run_id = RunId::generate();
        let rec = record(run_id);
        let index = index_of(run_id, vec![]).await;
        let mut ctx = RunContext::new(&rec, &index, Utc::now());

        let _ = ctx.try_step_value(&step_id(), json!(1));
        let _ = ctx.try_step_value(&step_id(), json!(2));

        let effects = ctx.into_effects();
        let occurrences: Vec<u32> = effects
            .iter()
            .filter_map(|e| match e {
                Effect::StepRequest { instance, .. } => Some(instance.occurrence()),
                _ => None,
            })
            .collect();
        assert_eq!(occurrences, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_sleep_schedules_then_resolves() {
        let run_id = RunId::generate();
        let rec = record(run_id);
        let tick = Utc::now();

        let index = index_of(run_id, vec![]).await;
        let mut ctx = RunContext::new(&rec, &index, tick);
        assert_eq!(
            ctx.sleep(Duration::from_secs(5)).unwrap_err(),
            Interrupt::Suspend
        );
        let effects = ctx.into_effects();
        match &effects[0] {
            Effect::Sleep { wait_id, wake_at } => {
                assert_eq!(wait_id, "sleep#1");
                assert_eq!(*wake_at, tick + chrono::Duration::seconds(5));
            }
            other => panic!("unexpected effect: {other:?}"),
        }

        // Completed wait replays synchronously.
        let index = index_of(
            run_id,
            vec![
                EventBody::SleepScheduled {
                    wait_id: "sleep#1".into(),
                    wake_at: tick,
                },
                EventBody::WaitCompleted {
                    wait_id: "sleep#1".into(),
                },
            ],
        )
        .await;
        let mut ctx = RunContext::new(&rec, &index, tick);
        ctx.sleep(Duration::from_secs(5)).unwrap();
    }

    #[tokio::test]
    async fn test_hook_create_replays_recorded_token() {
        let run_id = RunId::generate();
        let rec = record(run_id);

        let index = index_of(run_id, vec![]).await;
        let mut ctx = RunContext::new(&rec, &index, Utc::now());
        let hook = ctx.create_hook(&json!({ "kind": "approval" })).unwrap();
        let fresh_token = hook.token().clone();
        assert_eq!(ctx.into_effects().len(), 1);

        let index = index_of(
            run_id,
            vec![EventBody::HookCreated {
                hook_token: fresh_token.clone(),
                metadata: EncodedValue::inline(json!({ "kind": "approval" })),
            }],
        )
        .await;
        let mut ctx = RunContext::new(&rec, &index, Utc::now());
        let replayed = ctx.create_hook(&json!({ "kind": "approval" })).unwrap();
        assert_eq!(replayed.token(), &fresh_token);
        assert!(ctx.into_effects().is_empty());
    }

    #[tokio::test]
    async fn test_await_hook_resolves_on_resumption() {
        let run_id = RunId::generate();
        let rec = record(run_id);
        let token = HookToken::generate();

        let index = index_of(
            run_id,
            vec![EventBody::HookCreated {
                hook_token: token.clone(),
                metadata: EncodedValue::inline(json!({})),
            }],
        )
        .await;
        let mut ctx = RunContext::new(&rec, &index, Utc::now());
        let hook = ctx.create_hook(&json!({})).unwrap();
        let pending: Result<Value, _> = ctx.await_hook_value(&hook);
        assert_eq!(pending.unwrap_err(), Interrupt::Suspend);

        let index = index_of(
            run_id,
            vec![
                EventBody::HookCreated {
                    hook_token: token.clone(),
                    metadata: EncodedValue::inline(json!({})),
                },
                EventBody::WaitStarted {
                    wait_id: "wait#1".into(),
                    hook_token: Some(token.clone()),
                },
                EventBody::HookResumed {
                    hook_token: token,
                    payload: EncodedValue::inline(json!({ "x": 7 })),
                },
            ],
        )
        .await;
        let mut ctx = RunContext::new(&rec, &index, Utc::now());
        let hook = ctx.create_hook(&json!({})).unwrap();
        let payload = ctx.await_hook_value(&hook).unwrap();
        assert_eq!(payload, json!({ "x": 7 }));
    }

    #[tokio::test]
    async fn test_deterministic_substitutes() {
        let run_id = RunId::generate();
        let rec = record(run_id);
        let index = index_of(run_id, vec![]).await;

        let mut first = RunContext::new(&rec, &index, Utc::now());
        let mut second = RunContext::new(&rec, &index, Utc::now() + chrono::Duration::hours(1));

        assert_eq!(first.random_u64(), second.random_u64());
        assert_eq!(first.random_u64(), second.random_u64());
        assert_eq!(first.sequence(), 1);
        assert_eq!(first.sequence(), 2);
        assert_eq!(second.sequence(), 1);

        // The replay clock ignores the tick time until events are consumed.
        assert_eq!(first.now(), rec.created_at);
        assert_eq!(second.now(), rec.created_at);
    }

    #[tokio::test]
    async fn test_stream_read_wants_binding_then_replays() {
        let run_id = RunId::generate();
        let rec = record(run_id);

        let index = index_of(run_id, vec![]).await;
        let mut ctx = RunContext::new(&rec, &index, Utc::now());
        assert_eq!(ctx.read_stream("logs").unwrap_err(), Interrupt::Suspend);
        assert!(matches!(
            ctx.into_effects()[0],
            Effect::WantStream { ref stream_name } if stream_name == "logs"
        ));

        let index = index_of(
            run_id,
            vec![
                EventBody::StreamOpened {
                    stream_name: "logs".into(),
                    namespace: None,
                    kind: StreamKind::Bytes,
                },
                EventBody::StreamChunk {
                    stream_name: "logs".into(),
                    chunk: BASE64.encode(b"hello"),
                },
                EventBody::StreamClosed {
                    stream_name: "logs".into(),
                },
            ],
        )
        .await;
        let mut ctx = RunContext::new(&rec, &index, Utc::now());
        let chunks = ctx.read_stream("logs").unwrap();
        assert_eq!(chunks, vec![b"hello".to_vec()]);
    }

    #[tokio::test]
    async fn test_workflow_context_cannot_write_streams() {
        let run_id = RunId::generate();
        let rec = record(run_id);
        let index = index_of(run_id, vec![]).await;
        let mut ctx = RunContext::new(&rec, &index, Utc::now());

        let denied = ctx.write_stream("logs", b"hi").unwrap_err();
        assert!(matches!(
            denied,
            Interrupt::Fatal(e) if e.has_code("unavailable_in_workflow_context")
        ));
    }
}
