//! Hook manager
//!
//! Hooks are durable pause points: a workflow creates one and suspends on
//! it; an external caller holding the token resumes it exactly once with a
//! payload. Resumption appends `hook_resumed` to the target run and
//! enqueues a workflow tick, so the run picks the payload up on its next
//! replay. Tokens are single-use: a consumed token is indistinguishable
//! from an unknown one.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{info, instrument};

use wrun_core::{
    Codec, Event, EventBody, HookToken, QueueMessage, RunId, RunProjection, RunStatus,
};

use crate::world::{
    load_value, store_value, EnqueueOptions, QueueError, StoreError, ValueStoreError, World,
};

/// Errors from hook operations.
#[derive(Debug, thiserror::Error)]
pub enum HookError {
    /// Unknown or already-consumed token.
    #[error("hook not found")]
    NotFound,

    /// The token was already used once.
    #[error("hook already resumed")]
    AlreadyResumed,

    /// The owning run is terminal; the hook can never be consumed.
    #[error("run {run_id} is {status}; hook cannot be resumed")]
    TerminalRun { run_id: RunId, status: RunStatus },

    /// The owning run predates the event-sourced format.
    #[error("unsupported operation for legacy run {0}")]
    UnsupportedLegacyOperation(RunId),

    /// Storage failure.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Queue failure.
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    /// Codec failure on the payload or metadata.
    #[error("codec error: {0}")]
    Codec(#[from] wrun_core::CodecError),
}

impl From<ValueStoreError> for HookError {
    fn from(error: ValueStoreError) -> Self {
        match error {
            ValueStoreError::Codec(e) => Self::Codec(e),
            ValueStoreError::Store(e) => Self::Store(e),
        }
    }
}

/// What an external caller learns about a live hook.
#[derive(Debug, Clone)]
pub struct HookView {
    /// Run that created the hook.
    pub run_id: RunId,
    /// Decoded metadata attached at creation.
    pub metadata: Value,
    /// When the hook was created.
    pub created_at: DateTime<Utc>,
}

/// External-side hook operations.
pub struct HookManager {
    world: Arc<dyn World>,
    codec: Codec,
    shard: String,
}

impl HookManager {
    /// Build a manager.
    pub fn new(world: Arc<dyn World>, codec: Codec, shard: impl Into<String>) -> Self {
        Self {
            world,
            codec,
            shard: shard.into(),
        }
    }

    /// Look up a live hook by token. Consumed and unknown tokens both fail
    /// with [`HookError::NotFound`].
    pub async fn hook_by_token(&self, token: &HookToken) -> Result<HookView, HookError> {
        let run_id = self
            .world
            .events()
            .find_hook(token)
            .await?
            .ok_or(HookError::NotFound)?;

        let events = self.world.events().load_all(run_id).await?;
        let (created_at, metadata) = find_creation(&events, token).ok_or(HookError::NotFound)?;
        if is_resumed(&events, token) {
            return Err(HookError::NotFound);
        }

        let metadata = load_value(self.world.as_ref(), &self.codec, metadata).await?;
        Ok(HookView {
            run_id,
            metadata,
            created_at,
        })
    }

    /// Resume a hook with a payload. Atomic: validates single use, appends
    /// `hook_resumed`, and enqueues a workflow tick for the target run. A
    /// second call with the same token fails with
    /// [`HookError::AlreadyResumed`].
    #[instrument(skip(self, payload, token))]
    pub async fn resume_hook(
        &self,
        token: &HookToken,
        payload: Value,
        now: DateTime<Utc>,
    ) -> Result<(), HookError> {
        let run_id = self
            .world
            .events()
            .find_hook(token)
            .await?
            .ok_or(HookError::NotFound)?;

        let record = self.world.events().get_run(run_id).await?;
        if record.legacy {
            return Err(HookError::UnsupportedLegacyOperation(run_id));
        }

        let encoded = store_value(self.world.as_ref(), &self.codec, &payload).await?;

        // Validate-and-append loop: a concurrent append (another resume, a
        // step outcome) invalidates the snapshot, so re-validate before
        // retrying.
        const MAX_ATTEMPTS: u32 = 5;
        let mut attempt = 0;
        let event_id = loop {
            let events = self.world.events().load_all(run_id).await?;
            if find_creation(&events, token).is_none() {
                return Err(HookError::NotFound);
            }
            if is_resumed(&events, token) {
                return Err(HookError::AlreadyResumed);
            }
            let projection = RunProjection::from_events(&events);
            if projection.status.is_terminal() {
                return Err(HookError::TerminalRun {
                    run_id,
                    status: projection.status,
                });
            }

            let event = Event::new(
                run_id,
                now,
                EventBody::HookResumed {
                    hook_token: token.clone(),
                    payload: encoded.clone(),
                },
            );
            let event_id = event.event_id;
            match self
                .world
                .events()
                .append(run_id, events.len() as u64, vec![event])
                .await
            {
                Ok(_) => break event_id,
                Err(StoreError::ConcurrentAppend { .. }) if attempt < MAX_ATTEMPTS => {
                    attempt += 1;
                }
                Err(StoreError::TerminalRun { status, .. }) => {
                    return Err(HookError::TerminalRun { run_id, status });
                }
                Err(e) => return Err(e.into()),
            }
        };

        self.world
            .queue()
            .enqueue(
                QueueMessage::tick(&self.shard, run_id, format!("{run_id}:{event_id}"), now),
                EnqueueOptions::default(),
            )
            .await?;

        info!(%run_id, "hook resumed");
        Ok(())
    }
}

fn find_creation<'a>(
    events: &'a [Event],
    token: &HookToken,
) -> Option<(DateTime<Utc>, &'a wrun_core::EncodedValue)> {
    events.iter().find_map(|event| match &event.body {
        EventBody::HookCreated {
            hook_token,
            metadata,
        } if hook_token == token => Some((event.created_at, metadata)),
        _ => None,
    })
}

fn is_resumed(events: &[Event], token: &HookToken) -> bool {
    events.iter().any(|event| {
        matches!(
            &event.body,
            EventBody::HookResumed { hook_token, .. } if hook_token == token
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wrun_core::{EncodedValue, CURRENT_SPEC_VERSION};

    use crate::world::{EventStore, InMemoryWorld, NewRun};

    async fn run_with_hook(world: &InMemoryWorld) -> (RunId, HookToken) {
        let run_id = RunId::generate();
        let token = HookToken::generate();
        let now = Utc::now();

        world
            .create_run(NewRun {
                run_id,
                workflow_name: "approval".into(),
                spec_version: CURRENT_SPEC_VERSION.into(),
                created_at: now,
            })
            .await
            .unwrap();
        world
            .append(
                run_id,
                0,
                vec![
                    Event::new(run_id, now, EventBody::RunStarted),
                    Event::new(
                        run_id,
                        now,
                        EventBody::HookCreated {
                            hook_token: token.clone(),
                            metadata: EncodedValue::inline(json!({ "kind": "approval" })),
                        },
                    ),
                ],
            )
            .await
            .unwrap();

        (run_id, token)
    }

    fn manager(world: Arc<InMemoryWorld>) -> HookManager {
        HookManager::new(world, Codec::plain(), "")
    }

    #[tokio::test]
    async fn test_lookup_returns_metadata() {
        let world = Arc::new(InMemoryWorld::new());
        let (run_id, token) = run_with_hook(&world).await;
        let manager = manager(Arc::clone(&world));

        let view = manager.hook_by_token(&token).await.unwrap();
        assert_eq!(view.run_id, run_id);
        assert_eq!(view.metadata, json!({ "kind": "approval" }));
    }

    #[tokio::test]
    async fn test_unknown_token_not_found() {
        let world = Arc::new(InMemoryWorld::new());
        let manager = manager(Arc::clone(&world));

        let missing = manager.hook_by_token(&HookToken::generate()).await;
        assert!(matches!(missing, Err(HookError::NotFound)));
    }

    #[tokio::test]
    async fn test_resume_is_single_use() {
        let world = Arc::new(InMemoryWorld::new());
        let (run_id, token) = run_with_hook(&world).await;
        let manager = manager(Arc::clone(&world));
        let now = Utc::now();

        manager
            .resume_hook(&token, json!({ "x": 7 }), now)
            .await
            .unwrap();

        // The run got its resumption event and a tick.
        let events = world.load_all(run_id).await.unwrap();
        assert!(events
            .iter()
            .any(|e| matches!(&e.body, EventBody::HookResumed { .. })));
        assert_eq!(world.pending_message_count("__wkf_workflow_"), 1);

        // Second resume fails; the consumed token is also invisible to
        // lookups.
        let again = manager.resume_hook(&token, json!({}), now).await;
        assert!(matches!(again, Err(HookError::AlreadyResumed)));
        assert!(matches!(
            manager.hook_by_token(&token).await,
            Err(HookError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_resume_rejected_on_terminal_run() {
        let world = Arc::new(InMemoryWorld::new());
        let (run_id, token) = run_with_hook(&world).await;
        let manager = manager(Arc::clone(&world));
        let now = Utc::now();

        let seq = world.load_all(run_id).await.unwrap().len() as u64;
        world
            .append(
                run_id,
                seq,
                vec![Event::new(
                    run_id,
                    now,
                    EventBody::RunCancelled {
                        reason: "op".into(),
                    },
                )],
            )
            .await
            .unwrap();

        let denied = manager.resume_hook(&token, json!({}), now).await;
        assert!(matches!(denied, Err(HookError::TerminalRun { .. })));
    }
}
