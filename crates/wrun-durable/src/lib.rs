//! # wrun-durable
//!
//! A replay-based durable workflow execution engine over a pluggable World
//! backend.
//!
//! ## Features
//!
//! - **Event-sourced runs**: every state change is an event in a per-run
//!   append-only log; run, step, hook, and stream state are projections
//!   over it
//! - **Deterministic replay**: the workflow body re-executes from the
//!   beginning on every tick, with recorded outcomes supplied synchronously
//! - **Exactly-once steps**: side effects live in steps whose outcomes are
//!   recorded once, with automatic capped-backoff retries
//! - **Durable suspend/resume**: sleeps and single-use hooks survive
//!   process restarts through the log and the queue
//! - **Lifetime-clamped scheduling**: handlers never outlive their queue
//!   message's budget; exhausted messages are refreshed, not lost
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        QueueWorker                          │
//! │        (polls World queues, feeds the dispatcher)           │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Dispatcher                           │
//! │   (validates, clamps lifetime, routes tick / step / health) │
//! └─────────────────────────────────────────────────────────────┘
//!                    │                     │
//!                    ▼                     ▼
//! ┌──────────────────────────┐ ┌──────────────────────────────┐
//! │       ReplayEngine       │ │        StepExecutor          │
//! │ (replays workflow bodies)│ │ (one attempt, one outcome)   │
//! └──────────────────────────┘ └──────────────────────────────┘
//!                    │                     │
//!                    ▼                     ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          World                              │
//! │        (EventStore + QueueClient + StreamStore + Blobs)     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use wrun_durable::prelude::*;
//!
//! let registry = Arc::new(
//!     Registry::builder()
//!         .workflow(AddWorkflow)
//!         .step(AddStep)
//!         .build(),
//! );
//! let world: Arc<dyn World> = Arc::new(InMemoryWorld::new());
//! let codec = Codec::plain();
//!
//! let client = WorkflowClient::new(world.clone(), registry.clone(), codec.clone(), "");
//! let run_id = client.start("add", json!([2, 3]), Utc::now()).await?;
//! ```

pub mod dispatch;
pub mod engine;
pub mod health;
pub mod hooks;
pub mod reliability;
pub mod step;
pub mod worker;
pub mod world;

/// Prelude for common imports.
pub mod prelude {
    pub use crate::dispatch::{Dispatcher, DispatcherConfig, QueueLifetimeConfig};
    pub use crate::engine::{
        EngineConfig, EngineError, Hook, Interrupt, Registry, RegistryBuilder, ReplayEngine,
        RunContext, RunResultError, RunView, TickStatus, WorkflowClient, WorkflowFn,
    };
    pub use crate::health::{health_check, HealthEndpoint, HealthOptions, HealthReport};
    pub use crate::hooks::{HookError, HookManager, HookView};
    pub use crate::reliability::RetryPolicy;
    pub use crate::step::{StepContext, StepError, StepExecutor, StepFn};
    pub use crate::worker::{QueueWorker, QueueWorkerConfig};
    pub use crate::world::{InMemoryWorld, World};
    pub use wrun_core::{Codec, ErrorValue, RunId, RunStatus, StepId};
}

// Re-export key types at crate root
pub use dispatch::{Dispatcher, DispatcherConfig, Disposition, QueueLifetimeConfig};
pub use engine::{
    ContextError, EngineConfig, EngineError, Hook, Interrupt, Registry, RegistryBuilder,
    RegistryError, ReplayEngine, RunContext, RunResultError, RunView, TickReport, TickStatus,
    WorkflowClient, WorkflowFn,
};
pub use health::{health_check, HealthEndpoint, HealthOptions, HealthReport};
pub use hooks::{HookError, HookManager, HookView};
pub use reliability::RetryPolicy;
pub use step::{CancellationHandle, StepContext, StepError, StepExecutor, StepFn, StepOutcome};
pub use worker::{drain, QueueWorker, QueueWorkerConfig, WorkerError, WorkerStatus};
pub use world::{
    load_value, store_value, EventStore, InMemoryWorld, QueueClient, StoreError, StreamStore,
    World,
};
