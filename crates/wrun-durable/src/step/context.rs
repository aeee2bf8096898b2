//! Step execution context

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use wrun_core::{RunId, StepId, StepInstanceId, StreamKind};

use crate::world::{StoreError, World};

/// Context provided to a step attempt.
///
/// Exposes the owning run's metadata, the attempt position, a writable
/// side-channel to the run's named streams, and a cancellation token tied
/// to the message lifetime. Step code should observe cancellation
/// cooperatively; unresponsive steps are cut off at the clamped deadline
/// and reported as retryable.
pub struct StepContext {
    /// Run that requested this step.
    pub run_id: RunId,

    /// Workflow the run executes.
    pub workflow_name: String,

    /// When the run was started.
    pub workflow_started_at: DateTime<Utc>,

    /// The step being invoked.
    pub step_id: StepId,

    /// The invocation this attempt belongs to.
    pub step_instance_id: StepInstanceId,

    /// 1-based attempt number.
    pub attempt: u32,

    /// Attempts allowed by the effective retry policy.
    pub max_attempts: u32,

    world: Arc<dyn World>,
    cancelled: Arc<AtomicBool>,
}

impl StepContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        world: Arc<dyn World>,
        run_id: RunId,
        workflow_name: String,
        workflow_started_at: DateTime<Utc>,
        step_id: StepId,
        step_instance_id: StepInstanceId,
        attempt: u32,
        max_attempts: u32,
    ) -> Self {
        Self {
            run_id,
            workflow_name,
            workflow_started_at,
            step_id,
            step_instance_id,
            attempt,
            max_attempts,
            world,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A handle the executor uses to cancel this attempt at its deadline.
    pub fn cancellation_handle(&self) -> CancellationHandle {
        CancellationHandle {
            cancelled: Arc::clone(&self.cancelled),
        }
    }

    /// True once cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Resolves when cancellation is requested. Useful in `select!`:
    ///
    /// ```ignore
    /// tokio::select! {
    ///     result = do_work() => { ... }
    ///     _ = ctx.cancelled() => return Err(StepError::retryable("cancelled")),
    /// }
    /// ```
    pub async fn cancelled(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
    }

    /// True on the final allowed attempt.
    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    /// Open (or reopen) a named stream for this run.
    pub async fn open_stream(&self, stream_name: &str, kind: StreamKind) -> Result<(), StoreError> {
        self.world
            .streams()
            .open(self.run_id, stream_name, kind, None)
            .await
    }

    /// Append raw bytes to a named stream.
    pub async fn write_stream(&self, stream_name: &str, chunk: &[u8]) -> Result<(), StoreError> {
        self.world
            .streams()
            .append_chunk(self.run_id, stream_name, chunk)
            .await
    }

    /// Append one JSON document to a named stream.
    pub async fn write_stream_json<T: Serialize>(
        &self,
        stream_name: &str,
        value: &T,
    ) -> Result<(), StoreError> {
        let line =
            serde_json::to_vec(value).map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.write_stream(stream_name, &line).await
    }

    /// Close a named stream, making it finite.
    pub async fn close_stream(&self, stream_name: &str) -> Result<(), StoreError> {
        self.world.streams().close(self.run_id, stream_name).await
    }
}

/// Handle to cancel a step attempt.
#[derive(Clone)]
pub struct CancellationHandle {
    cancelled: Arc<AtomicBool>,
}

impl CancellationHandle {
    /// Request cooperative cancellation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::InMemoryWorld;

    fn context(world: Arc<dyn World>) -> StepContext {
        let step_id = StepId::new("src/a.ts", "f");
        StepContext::new(
            world,
            RunId::generate(),
            "test".into(),
            Utc::now(),
            step_id.clone(),
            StepInstanceId::new(step_id, 1),
            1,
            3,
        )
    }

    #[test]
    fn test_cancellation() {
        let ctx = context(Arc::new(InMemoryWorld::new()));
        assert!(!ctx.is_cancelled());

        let handle = ctx.cancellation_handle();
        handle.cancel();
        assert!(ctx.is_cancelled());
    }

    #[test]
    fn test_last_attempt() {
        let world: Arc<dyn World> = Arc::new(InMemoryWorld::new());
        let mut ctx = context(world);
        assert!(!ctx.is_last_attempt());
        ctx.attempt = 3;
        assert!(ctx.is_last_attempt());
    }
}
