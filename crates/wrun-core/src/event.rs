//! The event model
//!
//! Events form the append-only log for a run. They are used for:
//! - Persisting run progress
//! - Replaying the workflow function after recovery
//! - Deriving run, step, hook, and stream state
//!
//! Events are immutable once written. The log is the single source of
//! truth: everything else is a projection over it, computed here by
//! [`RunProjection`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::codec::EncodedValue;
use crate::error::ErrorValue;
use crate::ids::{EventId, HookToken, RunId, StepId, StepInstanceId};

/// How a stream's chunks are to be interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StreamKind {
    /// Raw bytes.
    Bytes,
    /// Each chunk is one JSON document.
    JsonChunks,
}

/// One recorded event.
///
/// Wire shape: `{ eventId, runId, eventType, createdAt, correlationId?,
/// eventData? }`. The total order within a run is `(createdAt, eventId)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Unique within the run; breaks `createdAt` ties.
    pub event_id: EventId,

    /// The run this event belongs to.
    pub run_id: RunId,

    /// When the event was appended.
    pub created_at: DateTime<Utc>,

    /// Optional correlation with an external request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    /// The typed payload, discriminated by `eventType`.
    #[serde(flatten)]
    pub body: EventBody,
}

impl Event {
    /// Build an event for a run at a given time.
    pub fn new(run_id: RunId, created_at: DateTime<Utc>, body: EventBody) -> Self {
        Self {
            event_id: EventId::generate(),
            run_id,
            created_at,
            correlation_id: None,
            body,
        }
    }

    /// Attach a correlation id.
    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

/// The closed set of event payloads.
///
/// Serialization uses the `eventType` discriminator with the payload under
/// `eventData`, so unknown future variants fail decoding loudly instead of
/// being silently dropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "eventType",
    content = "eventData",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum EventBody {
    // =========================================================================
    // Run lifecycle
    // =========================================================================
    /// Run was created with its workflow identity and encoded arguments.
    RunCreated {
        workflow_name: String,
        spec_version: String,
        arguments: EncodedValue,
    },

    /// First tick reached the run.
    RunStarted,

    /// Workflow function returned a value (terminal).
    RunCompleted { output: EncodedValue },

    /// Workflow function failed past all step boundaries (terminal).
    RunFailed { error: ErrorValue },

    /// Run was cancelled externally (terminal).
    RunCancelled { reason: String },

    // =========================================================================
    // Step invocations (cluster shares the instance id; retries share the
    // instance and increment the attempt)
    // =========================================================================
    /// Replay requested a step whose outcome is not yet recorded.
    StepRequested {
        step_id: StepId,
        step_instance_id: StepInstanceId,
        input: EncodedValue,
    },

    /// An executor began attempt N of the instance.
    StepStarted {
        step_instance_id: StepInstanceId,
        attempt: u32,
    },

    /// The instance produced its value (terminal for the instance).
    StepCompleted {
        step_instance_id: StepInstanceId,
        attempt: u32,
        output: EncodedValue,
    },

    /// The instance failed for good (terminal for the instance).
    StepFailed {
        step_instance_id: StepInstanceId,
        attempt: u32,
        error: ErrorValue,
    },

    /// An attempt failed retryably; the next attempt is scheduled.
    StepRetryScheduled {
        step_instance_id: StepInstanceId,
        attempt: u32,
        next_attempt: u32,
        next_attempt_at: DateTime<Utc>,
        error: ErrorValue,
    },

    // =========================================================================
    // Waits (sleeps and hook awaits)
    // =========================================================================
    /// Replay scheduled a sleep with its absolute wake time.
    SleepScheduled {
        wait_id: String,
        wake_at: DateTime<Utc>,
    },

    /// Replay began waiting on an external signal.
    WaitStarted {
        wait_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        hook_token: Option<HookToken>,
    },

    /// The referenced wait is satisfied.
    WaitCompleted { wait_id: String },

    // =========================================================================
    // Hooks
    // =========================================================================
    /// Workflow created a hook with a fresh single-use token.
    HookCreated {
        hook_token: HookToken,
        metadata: EncodedValue,
    },

    /// An external caller resumed the hook with a payload.
    HookResumed {
        hook_token: HookToken,
        payload: EncodedValue,
    },

    // =========================================================================
    // Streams
    // =========================================================================
    /// A named stream was opened for this run.
    StreamOpened {
        stream_name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        namespace: Option<String>,
        kind: StreamKind,
    },

    /// One chunk of stream content (base64).
    StreamChunk { stream_name: String, chunk: String },

    /// The stream is finite from here on.
    StreamClosed { stream_name: String },
}

impl EventBody {
    /// The discriminator as it appears on the wire.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::RunCreated { .. } => "run_created",
            Self::RunStarted => "run_started",
            Self::RunCompleted { .. } => "run_completed",
            Self::RunFailed { .. } => "run_failed",
            Self::RunCancelled { .. } => "run_cancelled",
            Self::StepRequested { .. } => "step_requested",
            Self::StepStarted { .. } => "step_started",
            Self::StepCompleted { .. } => "step_completed",
            Self::StepFailed { .. } => "step_failed",
            Self::StepRetryScheduled { .. } => "step_retry_scheduled",
            Self::SleepScheduled { .. } => "sleep_scheduled",
            Self::WaitStarted { .. } => "wait_started",
            Self::WaitCompleted { .. } => "wait_completed",
            Self::HookCreated { .. } => "hook_created",
            Self::HookResumed { .. } => "hook_resumed",
            Self::StreamOpened { .. } => "stream_opened",
            Self::StreamChunk { .. } => "stream_chunk",
            Self::StreamClosed { .. } => "stream_closed",
        }
    }

    /// True when this event ends the run.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::RunCompleted { .. } | Self::RunFailed { .. } | Self::RunCancelled { .. }
        )
    }

    /// True for events that may arrive after the run is terminal and are
    /// dropped silently instead of rejected (late stream content).
    pub fn is_informational(&self) -> bool {
        matches!(
            self,
            Self::StreamOpened { .. } | Self::StreamChunk { .. } | Self::StreamClosed { .. }
        )
    }

    /// The step instance this event belongs to, if any.
    pub fn step_instance_id(&self) -> Option<&StepInstanceId> {
        match self {
            Self::StepRequested {
                step_instance_id, ..
            }
            | Self::StepStarted {
                step_instance_id, ..
            }
            | Self::StepCompleted {
                step_instance_id, ..
            }
            | Self::StepFailed {
                step_instance_id, ..
            }
            | Self::StepRetryScheduled {
                step_instance_id, ..
            } => Some(step_instance_id),
            _ => None,
        }
    }
}

/// Run status, derived from the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Created but not yet ticked.
    Pending,
    /// At least one tick has run; work may be in flight.
    Running,
    /// Suspended on an outstanding hook or sleep, with no step in flight.
    Paused,
    /// Finished with a value.
    Completed,
    /// Finished with an error.
    Failed,
    /// Cancelled externally.
    Cancelled,
}

impl RunStatus {
    /// True for absorbing states: no non-informational event may follow.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Projection of run state from an event prefix.
///
/// `paused` is a view: the run has started, nothing terminal happened, no
/// step is in flight, and at least one sleep or hook wait is unresolved.
#[derive(Debug, Clone)]
pub struct RunProjection {
    /// Derived run status.
    pub status: RunStatus,
    /// Time of the first tick, if any.
    pub started_at: Option<DateTime<Utc>>,
    /// Time of the terminal event, if any.
    pub completed_at: Option<DateTime<Utc>>,
    /// Encoded return value, when completed.
    pub output: Option<EncodedValue>,
    /// Failure cause, when failed.
    pub error: Option<ErrorValue>,
    /// Cancellation reason, when cancelled.
    pub cancel_reason: Option<String>,
}

impl RunProjection {
    /// Compute the projection with a single ascending pass over the log.
    pub fn from_events(events: &[Event]) -> Self {
        let mut projection = Self {
            status: RunStatus::Pending,
            started_at: None,
            completed_at: None,
            output: None,
            error: None,
            cancel_reason: None,
        };

        // Instance id -> has a terminal step event.
        let mut steps: HashMap<String, bool> = HashMap::new();
        // Wait id -> completed.
        let mut waits: HashMap<String, bool> = HashMap::new();
        // Hook-wait id -> token, resolved separately through hook_resumed.
        let mut hook_waits: HashMap<String, HookToken> = HashMap::new();
        let mut resumed_tokens: Vec<HookToken> = Vec::new();

        for event in events {
            match &event.body {
                EventBody::RunStarted => {
                    projection.started_at.get_or_insert(event.created_at);
                }
                EventBody::RunCompleted { output } => {
                    projection.status = RunStatus::Completed;
                    projection.completed_at = Some(event.created_at);
                    projection.output = Some(output.clone());
                }
                EventBody::RunFailed { error } => {
                    projection.status = RunStatus::Failed;
                    projection.completed_at = Some(event.created_at);
                    projection.error = Some(error.clone());
                }
                EventBody::RunCancelled { reason } => {
                    projection.status = RunStatus::Cancelled;
                    projection.completed_at = Some(event.created_at);
                    projection.cancel_reason = Some(reason.clone());
                }
                EventBody::StepRequested {
                    step_instance_id, ..
                } => {
                    steps.entry(step_instance_id.to_string()).or_insert(false);
                }
                EventBody::StepCompleted {
                    step_instance_id, ..
                }
                | EventBody::StepFailed {
                    step_instance_id, ..
                } => {
                    steps.insert(step_instance_id.to_string(), true);
                }
                EventBody::SleepScheduled { wait_id, .. } => {
                    waits.entry(wait_id.clone()).or_insert(false);
                }
                EventBody::WaitStarted {
                    wait_id,
                    hook_token,
                } => {
                    waits.entry(wait_id.clone()).or_insert(false);
                    if let Some(token) = hook_token {
                        hook_waits.insert(wait_id.clone(), token.clone());
                    }
                }
                EventBody::WaitCompleted { wait_id } => {
                    waits.insert(wait_id.clone(), true);
                }
                EventBody::HookResumed { hook_token, .. } => {
                    resumed_tokens.push(hook_token.clone());
                }
                _ => {}
            }
        }

        if projection.status.is_terminal() {
            return projection;
        }

        if projection.started_at.is_none() {
            return projection;
        }

        let step_in_flight = steps.values().any(|terminal| !terminal);
        let wait_outstanding = waits.iter().any(|(wait_id, completed)| {
            if *completed {
                return false;
            }
            // A hook wait counts as resolved once its token was resumed,
            // even before the bookkeeping wait_completed lands.
            match hook_waits.get(wait_id) {
                Some(token) => !resumed_tokens.contains(token),
                None => true,
            }
        });

        projection.status = if !step_in_flight && wait_outstanding {
            RunStatus::Paused
        } else {
            RunStatus::Running
        };
        projection
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(run_id: RunId, body: EventBody) -> Event {
        Event::new(run_id, Utc::now(), body)
    }

    fn instance(n: u32) -> StepInstanceId {
        StepInstanceId::new(StepId::new("src/a.ts", "f"), n)
    }

    #[test]
    fn test_event_wire_shape() {
        let run_id = RunId::generate();
        let e = event(
            run_id,
            EventBody::StepStarted {
                step_instance_id: instance(1),
                attempt: 2,
            },
        );

        let wire = serde_json::to_value(&e).unwrap();
        assert_eq!(wire["eventType"], "step_started");
        assert_eq!(wire["runId"], run_id.to_string());
        assert_eq!(wire["eventData"]["attempt"], 2);
        assert!(wire.get("correlationId").is_none());

        let parsed: Event = serde_json::from_value(wire).unwrap();
        assert_eq!(parsed, e);
    }

    #[test]
    fn test_unit_variant_has_no_event_data() {
        let e = event(RunId::generate(), EventBody::RunStarted);
        let wire = serde_json::to_value(&e).unwrap();
        assert_eq!(wire["eventType"], "run_started");
        assert!(wire.get("eventData").is_none());
    }

    #[test]
    fn test_unknown_event_type_is_rejected() {
        let wire = json!({
            "eventId": EventId::generate().to_string(),
            "runId": RunId::generate().to_string(),
            "createdAt": Utc::now(),
            "eventType": "quantum_leap",
        });
        assert!(serde_json::from_value::<Event>(wire).is_err());
    }

    #[test]
    fn test_terminal_classification() {
        assert!(EventBody::RunCompleted {
            output: EncodedValue::inline(json!(1))
        }
        .is_terminal());
        assert!(EventBody::RunCancelled {
            reason: "op".into()
        }
        .is_terminal());
        assert!(!EventBody::RunStarted.is_terminal());

        assert!(EventBody::StreamClosed {
            stream_name: "s".into()
        }
        .is_informational());
        assert!(!EventBody::RunStarted.is_informational());
    }

    #[test]
    fn test_projection_pending_then_running() {
        let run_id = RunId::generate();
        let created = event(
            run_id,
            EventBody::RunCreated {
                workflow_name: "add".into(),
                spec_version: "4.1.0".into(),
                arguments: EncodedValue::inline(json!([2, 3])),
            },
        );
        assert_eq!(
            RunProjection::from_events(&[created.clone()]).status,
            RunStatus::Pending
        );

        let started = event(run_id, EventBody::RunStarted);
        let requested = event(
            run_id,
            EventBody::StepRequested {
                step_id: StepId::new("src/a.ts", "f"),
                step_instance_id: instance(1),
                input: EncodedValue::inline(json!([])),
            },
        );
        let projection = RunProjection::from_events(&[created, started, requested]);
        assert_eq!(projection.status, RunStatus::Running);
    }

    #[test]
    fn test_projection_paused_on_outstanding_sleep() {
        let run_id = RunId::generate();
        let log = vec![
            event(run_id, EventBody::RunStarted),
            event(
                run_id,
                EventBody::SleepScheduled {
                    wait_id: "sleep#1".into(),
                    wake_at: Utc::now(),
                },
            ),
        ];
        assert_eq!(RunProjection::from_events(&log).status, RunStatus::Paused);

        // Completing the wait moves the run back to running.
        let mut log = log;
        log.push(event(
            run_id,
            EventBody::WaitCompleted {
                wait_id: "sleep#1".into(),
            },
        ));
        assert_eq!(RunProjection::from_events(&log).status, RunStatus::Running);
    }

    #[test]
    fn test_projection_hook_wait_resolved_by_resumption() {
        let run_id = RunId::generate();
        let token = HookToken::generate();
        let mut log = vec![
            event(run_id, EventBody::RunStarted),
            event(
                run_id,
                EventBody::WaitStarted {
                    wait_id: "wait#1".into(),
                    hook_token: Some(token.clone()),
                },
            ),
        ];
        assert_eq!(RunProjection::from_events(&log).status, RunStatus::Paused);

        log.push(event(
            run_id,
            EventBody::HookResumed {
                hook_token: token,
                payload: EncodedValue::inline(json!({ "x": 7 })),
            },
        ));
        assert_eq!(RunProjection::from_events(&log).status, RunStatus::Running);
    }

    #[test]
    fn test_projection_in_flight_step_keeps_running() {
        let run_id = RunId::generate();
        let log = vec![
            event(run_id, EventBody::RunStarted),
            event(
                run_id,
                EventBody::StepRequested {
                    step_id: StepId::new("src/a.ts", "f"),
                    step_instance_id: instance(1),
                    input: EncodedValue::inline(json!([])),
                },
            ),
            event(
                run_id,
                EventBody::SleepScheduled {
                    wait_id: "sleep#1".into(),
                    wake_at: Utc::now(),
                },
            ),
        ];
        // A step is in flight, so the run is running even with a pending sleep.
        assert_eq!(RunProjection::from_events(&log).status, RunStatus::Running);
    }

    #[test]
    fn test_projection_terminal_wins() {
        let run_id = RunId::generate();
        let log = vec![
            event(run_id, EventBody::RunStarted),
            event(
                run_id,
                EventBody::RunFailed {
                    error: ErrorValue::new("bad"),
                },
            ),
        ];
        let projection = RunProjection::from_events(&log);
        assert_eq!(projection.status, RunStatus::Failed);
        assert_eq!(projection.error.unwrap().message, "bad");
        assert!(projection.completed_at.is_some());
    }
}
