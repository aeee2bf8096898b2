//! Workflow and step registries
//!
//! The registries are built once at load time through a builder and frozen
//! before the engine starts: process-wide, read-only thereafter. Type
//! erasure lets the engine drive workflows and steps from stored names and
//! JSON without knowing concrete types.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use wrun_core::{error::codes, from_value, to_value, StepId};

use super::context::{Interrupt, RunContext};
use super::workflow::WorkflowFn;
use crate::reliability::RetryPolicy;
use crate::step::{StepContext, StepError, StepFn};

/// Errors from registry lookups.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Workflow name not registered.
    #[error("unknown workflow: {0}")]
    UnknownWorkflow(String),

    /// Step id not registered.
    #[error("unknown step: {0}")]
    UnknownStep(StepId),
}

/// Type-erased workflow interface.
pub trait AnyWorkflow: Send + Sync {
    /// The registered workflow name.
    fn name(&self) -> &'static str;

    /// Run one tick with JSON input.
    fn run_erased(&self, ctx: &mut RunContext<'_>, input: Value) -> Result<Value, Interrupt>;
}

struct WorkflowWrapper<W: WorkflowFn> {
    inner: W,
}

impl<W: WorkflowFn> AnyWorkflow for WorkflowWrapper<W> {
    fn name(&self) -> &'static str {
        W::NAME
    }

    fn run_erased(&self, ctx: &mut RunContext<'_>, input: Value) -> Result<Value, Interrupt> {
        let typed: W::Input = from_value(input).map_err(|e| {
            Interrupt::Fatal(
                wrun_core::ErrorValue::new(format!("workflow arguments failed to decode: {e}"))
                    .with_code(codes::ENCODE_FAILURE),
            )
        })?;
        let output = self.inner.run(ctx, typed)?;
        to_value(&output).map_err(|e| {
            Interrupt::Fatal(
                wrun_core::ErrorValue::new(format!("workflow result failed to encode: {e}"))
                    .with_code(codes::ENCODE_FAILURE),
            )
        })
    }
}

/// Type-erased step interface.
#[async_trait]
pub trait AnyStep: Send + Sync {
    /// The registered step id.
    fn step_id(&self) -> StepId;

    /// The step's retry policy.
    fn retry_policy(&self) -> RetryPolicy;

    /// Execute one attempt with JSON input.
    async fn execute_erased(&self, ctx: &StepContext, input: Value) -> Result<Value, StepError>;
}

struct StepWrapper<S: StepFn> {
    inner: S,
}

#[async_trait]
impl<S: StepFn> AnyStep for StepWrapper<S> {
    fn step_id(&self) -> StepId {
        self.inner.step_id()
    }

    fn retry_policy(&self) -> RetryPolicy {
        self.inner.retry_policy()
    }

    async fn execute_erased(&self, ctx: &StepContext, input: Value) -> Result<Value, StepError> {
        let typed: S::Input = from_value(input).map_err(|e| {
            StepError::fatal(format!("step input failed to decode: {e}"))
                .with_code(codes::ENCODE_FAILURE)
        })?;
        let output = self.inner.execute(ctx, typed).await?;
        to_value(&output).map_err(|e| {
            StepError::fatal(format!("step result failed to encode: {e}"))
                .with_code(codes::ENCODE_FAILURE)
        })
    }
}

/// Frozen registry of workflows and steps.
pub struct Registry {
    workflows: HashMap<&'static str, Arc<dyn AnyWorkflow>>,
    steps: HashMap<StepId, Arc<dyn AnyStep>>,
}

impl Registry {
    /// Start building a registry.
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Look up a workflow by name.
    pub fn workflow(&self, name: &str) -> Result<&Arc<dyn AnyWorkflow>, RegistryError> {
        self.workflows
            .get(name)
            .ok_or_else(|| RegistryError::UnknownWorkflow(name.to_string()))
    }

    /// Look up a step by id.
    pub fn step(&self, step_id: &StepId) -> Result<&Arc<dyn AnyStep>, RegistryError> {
        self.steps
            .get(step_id)
            .ok_or_else(|| RegistryError::UnknownStep(step_id.clone()))
    }

    /// True when the workflow name is registered.
    pub fn contains_workflow(&self, name: &str) -> bool {
        self.workflows.contains_key(name)
    }

    /// Registered workflow names.
    pub fn workflow_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.workflows.keys().copied()
    }

    /// Registered step ids.
    pub fn step_ids(&self) -> impl Iterator<Item = &StepId> {
        self.steps.keys()
    }

    /// Queue names for every registered step.
    pub fn step_queues(&self) -> Vec<String> {
        self.steps.keys().map(wrun_core::queues::step).collect()
    }

    /// Number of registered workflows.
    pub fn workflow_count(&self) -> usize {
        self.workflows.len()
    }

    /// Number of registered steps.
    pub fn step_count(&self) -> usize {
        self.steps.len()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("workflows", &self.workflows.keys().collect::<Vec<_>>())
            .field("steps", &self.steps.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Builder collecting registrations before the freeze.
#[derive(Default)]
pub struct RegistryBuilder {
    workflows: HashMap<&'static str, Arc<dyn AnyWorkflow>>,
    steps: HashMap<StepId, Arc<dyn AnyStep>>,
}

impl RegistryBuilder {
    /// Register a workflow under [`WorkflowFn::NAME`].
    pub fn workflow<W: WorkflowFn>(mut self, workflow: W) -> Self {
        self.workflows
            .insert(W::NAME, Arc::new(WorkflowWrapper { inner: workflow }));
        self
    }

    /// Register a step under its [`StepFn::step_id`].
    pub fn step<S: StepFn>(mut self, step: S) -> Self {
        self.steps
            .insert(step.step_id(), Arc::new(StepWrapper { inner: step }));
        self
    }

    /// Freeze into an immutable registry.
    pub fn build(self) -> Registry {
        Registry {
            workflows: self.workflows,
            steps: self.steps,
        }
    }
}
