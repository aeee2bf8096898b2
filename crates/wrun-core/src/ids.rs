//! Identifier types
//!
//! All sortable ids are ULIDs: lexicographic order matches creation order,
//! and the 26-character Crockford base32 rendering is safe in queue names
//! and URLs. Prefixes make ids self-describing on the wire.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use ulid::Ulid;

/// Error returned when an id string does not match its expected shape.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {kind} id: {value:?}")]
pub struct ParseIdError {
    /// Which id type rejected the input.
    pub kind: &'static str,
    /// The offending input.
    pub value: String,
}

impl ParseIdError {
    fn new(kind: &'static str, value: impl Into<String>) -> Self {
        Self {
            kind,
            value: value.into(),
        }
    }
}

macro_rules! prefixed_ulid {
    ($(#[$doc:meta])* $name:ident, $prefix:literal, $kind:literal) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(Ulid);

        impl $name {
            /// The wire prefix for this id type.
            pub const PREFIX: &'static str = $prefix;

            /// Generate a fresh id from the current time and entropy.
            pub fn generate() -> Self {
                Self(Ulid::new())
            }

            /// Build an id from an existing ULID.
            pub const fn from_ulid(ulid: Ulid) -> Self {
                Self(ulid)
            }

            /// The underlying ULID.
            pub const fn ulid(&self) -> Ulid {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}{}", Self::PREFIX, self.0)
            }
        }

        impl FromStr for $name {
            type Err = ParseIdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let rest = s
                    .strip_prefix(Self::PREFIX)
                    .ok_or_else(|| ParseIdError::new($kind, s))?;
                let ulid = Ulid::from_string(rest).map_err(|_| ParseIdError::new($kind, s))?;
                Ok(Self(ulid))
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

prefixed_ulid!(
    /// Identifies one run of a workflow. Globally unique, sortable, monotonic
    /// within a process.
    RunId,
    "wrun_",
    "run"
);

prefixed_ulid!(
    /// Identifies a blob stored outside the event log.
    BlobId,
    "blob_",
    "blob"
);

prefixed_ulid!(
    /// Correlates a health-check request with its response stream.
    HealthCorrelationId,
    "hc_",
    "health correlation"
);

/// Identifies one event within a run. Bare ULID on the wire; ties on
/// `created_at` are broken by this id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventId(Ulid);

impl EventId {
    /// Generate a fresh event id.
    pub fn generate() -> Self {
        Self(Ulid::new())
    }

    /// Build an id from an existing ULID.
    pub const fn from_ulid(ulid: Ulid) -> Self {
        Self(ulid)
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for EventId {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ulid::from_string(s)
            .map(Self)
            .map_err(|_| ParseIdError::new("event", s))
    }
}

impl Serialize for EventId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for EventId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Identifies a message accepted by a queue backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(Ulid);

impl MessageId {
    /// Generate a fresh message id.
    pub fn generate() -> Self {
        Self(Ulid::new())
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Stable identifier of a step function.
///
/// Format: `step//<source-file-key>//<function-key>`, optionally extended
/// with `#<method>` or `.<static-member>`. Stable across deployments as long
/// as the source location is unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepId(String);

impl StepId {
    const PREFIX: &'static str = "step//";

    /// Build a step id from its source-file and function keys.
    pub fn new(file_key: &str, function_key: &str) -> Self {
        Self(format!("{}{file_key}//{function_key}", Self::PREFIX))
    }

    /// Extend the id with a method name (`#method`).
    pub fn with_method(self, method: &str) -> Self {
        Self(format!("{}#{method}", self.0))
    }

    /// Extend the id with a static member name (`.member`).
    pub fn with_static_member(self, member: &str) -> Self {
        Self(format!("{}.{member}", self.0))
    }

    /// Parse an id from its wire form, validating the prefix.
    pub fn parse(s: &str) -> Result<Self, ParseIdError> {
        if s.starts_with(Self::PREFIX) && s.len() > Self::PREFIX.len() {
            Ok(Self(s.to_string()))
        } else {
            Err(ParseIdError::new("step", s))
        }
    }

    /// The wire form of the id.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Encode the id for use inside a queue name. Queue backends restrict
    /// names to `[a-zA-Z0-9_-]`, so every other byte is rendered as `-xx`
    /// hex. The encoding is injective: literal `-` is escaped too.
    pub fn queue_encoded(&self) -> String {
        let mut out = String::with_capacity(self.0.len());
        for byte in self.0.bytes() {
            match byte {
                b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'_' => out.push(byte as char),
                _ => {
                    out.push('-');
                    out.push_str(&format!("{byte:02x}"));
                }
            }
        }
        out
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One logical call to a step within a run.
///
/// The occurrence number is a per-call-site counter assigned during replay,
/// so the same workflow body always produces the same instance id sequence.
/// Retries share the instance id and increment the attempt instead.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StepInstanceId {
    step_id: StepId,
    occurrence: u32,
}

impl StepInstanceId {
    /// Build an instance id from a step id and its occurrence number.
    pub fn new(step_id: StepId, occurrence: u32) -> Self {
        Self {
            step_id,
            occurrence,
        }
    }

    /// The step this instance invokes.
    pub fn step_id(&self) -> &StepId {
        &self.step_id
    }

    /// The 1-based occurrence of this call site within the run.
    pub fn occurrence(&self) -> u32 {
        self.occurrence
    }
}

impl fmt::Display for StepInstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // `@` never appears in step ids, so the rendering is unambiguous.
        write!(f, "{}@{}", self.step_id, self.occurrence)
    }
}

impl FromStr for StepInstanceId {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (step, occurrence) = s
            .rsplit_once('@')
            .ok_or_else(|| ParseIdError::new("step instance", s))?;
        let occurrence = occurrence
            .parse()
            .map_err(|_| ParseIdError::new("step instance", s))?;
        Ok(Self {
            step_id: StepId::parse(step)?,
            occurrence,
        })
    }
}

impl Serialize for StepInstanceId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for StepInstanceId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Opaque single-use hook token: 128 random bits, base32-encoded.
///
/// Tokens are bearer credentials. They are generated with the process RNG
/// and rendered through the ULID alphabet, which keeps them the same shape
/// as other ids without being sortable or guessable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HookToken(String);

impl HookToken {
    /// Generate a fresh unguessable token.
    pub fn generate() -> Self {
        let bits: u128 = rand::random();
        Self(Ulid::from(bits).to_string())
    }

    /// Wrap an existing token string (e.g. received from a caller).
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// The wire form of the token.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HookToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_id_round_trip() {
        let id = RunId::generate();
        let wire = id.to_string();
        assert!(wire.starts_with("wrun_"));
        assert_eq!(wire.len(), "wrun_".len() + 26);

        let parsed: RunId = wire.parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_run_id_rejects_wrong_prefix() {
        let err = "blob_01ARZ3NDEKTSV4RRFFQ69G5FAV".parse::<RunId>();
        assert!(err.is_err());
    }

    #[test]
    fn test_run_ids_sort_by_creation() {
        let a = RunId::generate();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = RunId::generate();
        assert!(a < b);
        assert!(a.to_string() < b.to_string());
    }

    #[test]
    fn test_step_id_format() {
        let id = StepId::new("src/flows/billing.ts", "chargeCustomer");
        assert_eq!(id.as_str(), "step//src/flows/billing.ts//chargeCustomer");

        let method = StepId::new("src/api.ts", "Client").with_method("fetch");
        assert_eq!(method.as_str(), "step//src/api.ts//Client#fetch");
    }

    #[test]
    fn test_step_id_parse_rejects_bare_names() {
        assert!(StepId::parse("chargeCustomer").is_err());
        assert!(StepId::parse("step//").is_err());
        assert!(StepId::parse("step//a//b").is_ok());
    }

    #[test]
    fn test_queue_encoding_is_queue_safe() {
        let id = StepId::new("src/flows.ts", "add");
        let encoded = id.queue_encoded();
        assert!(encoded
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-'));
        // Distinct ids never collide after encoding.
        let other = StepId::new("src-flows.ts", "add");
        assert_ne!(encoded, other.queue_encoded());
    }

    #[test]
    fn test_step_instance_round_trip() {
        let instance = StepInstanceId::new(StepId::new("src/a.ts", "f"), 3);
        let wire = instance.to_string();
        assert_eq!(wire, "step//src/a.ts//f@3");
        let parsed: StepInstanceId = wire.parse().unwrap();
        assert_eq!(parsed, instance);
    }

    #[test]
    fn test_hook_tokens_are_unique() {
        let a = HookToken::generate();
        let b = HookToken::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 26);
    }

    #[test]
    fn test_event_id_serde() {
        let id = EventId::generate();
        let json = serde_json::to_string(&id).unwrap();
        let parsed: EventId = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, id);
    }
}
