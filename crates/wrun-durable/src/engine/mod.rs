//! The replay engine: contexts, registries, ticks, and the run client.

pub(crate) mod context;
mod registry;
mod replay;
mod runs;
mod workflow;

pub use context::{ContextError, Hook, Interrupt, RunContext};
pub use registry::{AnyStep, AnyWorkflow, Registry, RegistryBuilder, RegistryError};
pub use replay::{EngineConfig, EngineError, ReplayEngine, TickReport, TickStatus};
pub use runs::{RunResultError, RunView, WorkflowClient};
pub use workflow::WorkflowFn;
