//! Error wire shape
//!
//! Errors crossing the log or the queue are plain data:
//! `{ message, stack?, code? }`. Older producers wrote the same object as a
//! JSON-encoded string; decoding accepts both forms.

use serde::{Deserialize, Deserializer, Serialize};

/// Well-known error codes carried in [`ErrorValue::code`].
pub mod codes {
    /// Workflow function failed outside any step boundary without a
    /// classified error.
    pub const PANIC: &str = "panic";
    /// Value could not be encoded by the codec.
    pub const ENCODE_FAILURE: &str = "encode_failure";
    /// Run was cancelled before completing.
    pub const CANCELLED: &str = "cancelled";
    /// Step attempts were exhausted.
    pub const RETRIES_EXHAUSTED: &str = "retries_exhausted";
    /// Step did not finish within its execution deadline.
    pub const STEP_TIMEOUT: &str = "step_timeout";
    /// Replay diverged from the recorded history.
    pub const NONDETERMINISTIC: &str = "nondeterministic";
}

/// A structured error recorded in the log or returned to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorValue {
    /// Human-readable description.
    pub message: String,

    /// Producer-side stack trace, when one was captured.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,

    /// Stable code for programmatic handling.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl ErrorValue {
    /// Create an error with just a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: None,
            code: None,
        }
    }

    /// Set the error code.
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Set the stack trace.
    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    /// True when the code matches.
    pub fn has_code(&self, code: &str) -> bool {
        self.code.as_deref() == Some(code)
    }
}

impl std::fmt::Display for ErrorValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{} ({code})", self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for ErrorValue {}

impl<'de> Deserialize<'de> for ErrorValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Wire {
            Object {
                message: String,
                #[serde(default)]
                stack: Option<String>,
                #[serde(default)]
                code: Option<String>,
            },
            // Legacy form: the object JSON-encoded into a string. A bare
            // message string (no embedded object) is accepted as well.
            Legacy(String),
        }

        match Wire::deserialize(deserializer)? {
            Wire::Object {
                message,
                stack,
                code,
            } => Ok(Self {
                message,
                stack,
                code,
            }),
            Wire::Legacy(raw) => match serde_json::from_str::<ErrorValue>(&raw) {
                Ok(decoded) => Ok(decoded),
                Err(_) => Ok(Self::new(raw)),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_form_round_trip() {
        let err = ErrorValue::new("boom").with_code("panic").with_stack("at f()");
        let json = serde_json::to_string(&err).unwrap();
        let parsed: ErrorValue = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, err);
    }

    #[test]
    fn test_optional_fields_are_omitted() {
        let json = serde_json::to_string(&ErrorValue::new("boom")).unwrap();
        assert_eq!(json, r#"{"message":"boom"}"#);
    }

    #[test]
    fn test_legacy_string_form() {
        let legacy = r#""{\"message\":\"boom\",\"code\":\"panic\"}""#;
        let parsed: ErrorValue = serde_json::from_str(legacy).unwrap();
        assert_eq!(parsed.message, "boom");
        assert!(parsed.has_code("panic"));
    }

    #[test]
    fn test_bare_string_becomes_message() {
        let parsed: ErrorValue = serde_json::from_str(r#""just text""#).unwrap();
        assert_eq!(parsed.message, "just text");
        assert_eq!(parsed.code, None);
    }
}
