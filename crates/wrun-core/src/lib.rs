//! # wrun-core
//!
//! Wire-level contracts for the wrun durable execution engine: identifiers,
//! the event model, the value codec, the error wire shape, queue message
//! envelopes, and the spec-version gate.
//!
//! This crate is pure data: no I/O, no async. The engine and every World
//! backend share these types, so the log written by one backend replays
//! under another.

pub mod codec;
pub mod error;
pub mod event;
pub mod ids;
pub mod message;
pub mod version;

pub use codec::{
    canonical_json, from_value, to_value, ClassHook, ClassRegistry, ClassRegistryBuilder, Codec,
    CodecError, EncodedValue, StreamRef,
};
pub use error::ErrorValue;
pub use event::{Event, EventBody, RunProjection, RunStatus, StreamKind};
pub use ids::{
    BlobId, EventId, HealthCorrelationId, HookToken, MessageId, ParseIdError, RunId, StepId,
    StepInstanceId,
};
pub use message::{
    queues, HealthCheckPayload, MessagePayload, QueueMessage, StepPayload, TickPayload,
};
pub use version::{is_legacy, InvalidSpecVersion, CURRENT_SPEC_VERSION, LEGACY_BOUNDARY};
