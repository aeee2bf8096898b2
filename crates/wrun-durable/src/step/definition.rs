//! Step trait definition
//!
//! A step is the unit of side-effecting work: invoked by an executor
//! outside the workflow body, recorded in the log, exactly-once in effect.
//! Steps may fail and be retried; the error type carries the
//! classification.

use std::time::Duration;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};

use wrun_core::{error::codes, ErrorValue, StepId};

use super::StepContext;
use crate::reliability::RetryPolicy;

/// Error raised by step user code, classified for the executor.
#[derive(Debug, Clone, PartialEq)]
pub enum StepError {
    /// Transient failure; schedule another attempt.
    Retryable {
        message: String,
        /// Stable code for programmatic handling.
        code: Option<String>,
        /// Requested delay before the next attempt, overriding the policy's
        /// computed backoff.
        retry_after: Option<Duration>,
    },

    /// Permanent failure; terminal for the instance and visible to the
    /// workflow.
    Fatal {
        message: String,
        code: Option<String>,
    },
}

impl StepError {
    /// A transient failure retried per the step's policy.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self::Retryable {
            message: message.into(),
            code: None,
            retry_after: None,
        }
    }

    /// A transient failure with an explicit delay before the next attempt.
    pub fn retryable_after(message: impl Into<String>, retry_after: Duration) -> Self {
        Self::Retryable {
            message: message.into(),
            code: None,
            retry_after: Some(retry_after),
        }
    }

    /// A permanent failure that bubbles to the workflow.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal {
            message: message.into(),
            code: None,
        }
    }

    /// Set the error code.
    pub fn with_code(mut self, value: impl Into<String>) -> Self {
        match &mut self {
            Self::Retryable { code, .. } | Self::Fatal { code, .. } => *code = Some(value.into()),
        }
        self
    }

    /// True when another attempt may be scheduled.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable { .. })
    }

    /// The requested retry delay, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Retryable { retry_after, .. } => *retry_after,
            Self::Fatal { .. } => None,
        }
    }

    /// The wire form recorded in the log.
    pub fn to_error_value(&self) -> ErrorValue {
        match self {
            Self::Retryable { message, code, .. } | Self::Fatal { message, code } => {
                let mut value = ErrorValue::new(message.clone());
                value.code = code.clone();
                value
            }
        }
    }

    /// Timeout at the execution deadline, reported as retryable.
    pub(crate) fn deadline_exceeded() -> Self {
        Self::retryable("step execution exceeded its deadline").with_code(codes::STEP_TIMEOUT)
    }
}

impl std::fmt::Display for StepError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Retryable { message, .. } => write!(f, "{message} (retryable)"),
            Self::Fatal { message, .. } => write!(f, "{message} (fatal)"),
        }
    }
}

impl std::error::Error for StepError {}

// Unclassified errors take the default retry path.
impl From<anyhow::Error> for StepError {
    fn from(err: anyhow::Error) -> Self {
        Self::retryable(err.to_string())
    }
}

/// A step function with typed input and output.
///
/// # Example
///
/// ```ignore
/// struct ChargeCustomer { client: BillingClient }
///
/// #[async_trait]
/// impl StepFn for ChargeCustomer {
///     type Input = ChargeRequest;
///     type Output = Receipt;
///
///     fn step_id(&self) -> StepId {
///         StepId::new("src/flows/billing.ts", "chargeCustomer")
///     }
///
///     async fn execute(
///         &self,
///         ctx: &StepContext,
///         input: Self::Input,
///     ) -> Result<Self::Output, StepError> {
///         self.client.charge(&input).await.map_err(StepError::from)
///     }
/// }
/// ```
#[async_trait]
pub trait StepFn: Send + Sync + 'static {
    /// Input type, decoded from the recorded invocation.
    type Input: DeserializeOwned + Send;

    /// Output type, encoded into the terminal event.
    type Output: Serialize + Send;

    /// The stable identifier this step registers under.
    fn step_id(&self) -> StepId;

    /// Retry policy override; the default applies otherwise.
    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::default()
    }

    /// Perform one attempt.
    ///
    /// Return [`StepError::retryable`] for transient failures and
    /// [`StepError::fatal`] for permanent ones. The context exposes attempt
    /// metadata, the run's writable streams, and the cancellation token the
    /// code should observe cooperatively.
    async fn execute(
        &self,
        ctx: &StepContext,
        input: Self::Input,
    ) -> Result<Self::Output, StepError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        let err = StepError::retryable("connection reset");
        assert!(err.is_retryable());
        assert_eq!(err.retry_after(), None);

        let delayed = StepError::retryable_after("throttled", Duration::from_secs(5));
        assert_eq!(delayed.retry_after(), Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_fatal_classification() {
        let err = StepError::fatal("bad request").with_code("INVALID_INPUT");
        assert!(!err.is_retryable());

        let value = err.to_error_value();
        assert_eq!(value.message, "bad request");
        assert!(value.has_code("INVALID_INPUT"));
    }

    #[test]
    fn test_unclassified_errors_default_to_retry() {
        let err: StepError = anyhow::anyhow!("something odd").into();
        assert!(err.is_retryable());
    }
}
