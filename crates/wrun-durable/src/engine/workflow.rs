//! Workflow trait definition

use serde::{de::DeserializeOwned, Serialize};

use super::context::{Interrupt, RunContext};

/// A workflow body: a deterministic function over a [`RunContext`].
///
/// The body re-executes from the beginning on every tick. Recorded outcomes
/// return synchronously from the context's interceptors; the first
/// unresolved point short-circuits the tick with `?` and
/// [`Interrupt::Suspend`]. Side effects belong in steps, never in the body
/// itself.
///
/// # Determinism
///
/// Given the same event prefix, the body must request the same steps with
/// the same inputs in the same order. Use the context's substitutes
/// ([`RunContext::now`], [`RunContext::random_u64`],
/// [`RunContext::sequence`]) instead of the wall clock, process RNG, or
/// global mutable state; divergence from the recorded history fails the
/// tick.
///
/// # Example
///
/// ```ignore
/// struct AddWorkflow;
///
/// impl WorkflowFn for AddWorkflow {
///     const NAME: &'static str = "add";
///     type Input = (i64, i64);
///     type Output = i64;
///
///     fn run(
///         &self,
///         ctx: &mut RunContext<'_>,
///         (a, b): Self::Input,
///     ) -> Result<Self::Output, Interrupt> {
///         let sum: i64 = ctx.step(&ADD_STEP_ID, &(a, b))?;
///         Ok(sum)
///     }
/// }
/// ```
pub trait WorkflowFn: Send + Sync + 'static {
    /// Name the workflow registers under; referenced by `start`.
    const NAME: &'static str;

    /// Input type, decoded from the run's recorded arguments.
    type Input: DeserializeOwned + Send;

    /// Output type, encoded into `run_completed`.
    type Output: Serialize + Send;

    /// Execute one tick of the body.
    fn run(&self, ctx: &mut RunContext<'_>, input: Self::Input) -> Result<Self::Output, Interrupt>;
}
