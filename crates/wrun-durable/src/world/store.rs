//! World trait definitions
//!
//! A World is the pluggable backend the engine runs against: ordered event
//! storage per run, an idempotent queue, named byte streams, and blob
//! storage for large payloads. Implementations must be thread-safe and
//! return lazy asynchronous results; every call is a suspension point for
//! the cooperative fabric.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use wrun_core::{
    BlobId, Event, HookToken, MessageId, QueueMessage, RunId, RunStatus, StreamKind,
};

/// Stream names with this prefix bypass run-existence validation: the
/// health-check protocol writes them before any run exists.
pub const HEALTH_STREAM_PREFIX: &str = "__health_check__";

/// Default inline-payload ceiling before values spill to blob storage.
pub const DEFAULT_BLOB_THRESHOLD: usize = 32 * 1024;

/// Error type for storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Run not found.
    #[error("run not found: {0}")]
    RunNotFound(RunId),

    /// Run already exists.
    #[error("run already exists: {0}")]
    RunAlreadyExists(RunId),

    /// Append rejected: the run is in an absorbing terminal state.
    #[error("run {run_id} is {status}; no further events may be appended")]
    TerminalRun { run_id: RunId, status: RunStatus },

    /// Concurrent append detected (single-writer lease violated).
    #[error("concurrent append on {run_id}: expected sequence {expected}, found {actual}")]
    ConcurrentAppend {
        run_id: RunId,
        expected: u64,
        actual: u64,
    },

    /// Stream not found.
    #[error("stream not found: {stream_name} on {run_id}")]
    StreamNotFound { run_id: RunId, stream_name: String },

    /// Write to a closed stream.
    #[error("stream closed: {stream_name} on {run_id}")]
    StreamClosed { run_id: RunId, stream_name: String },

    /// Blob not found.
    #[error("blob not found: {0}")]
    BlobNotFound(BlobId),

    /// Backend-specific failure (transient unless stated otherwise).
    #[error("backend error: {0}")]
    Backend(String),

    /// Serialization failure inside the backend.
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Error type for queue operations.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// Message not found (already acked or expired).
    #[error("message not found: {0}")]
    MessageNotFound(MessageId),

    /// Backend-specific failure (transient unless stated otherwise).
    #[error("backend error: {0}")]
    Backend(String),
}

/// Metadata for a run being created.
#[derive(Debug, Clone)]
pub struct NewRun {
    pub run_id: RunId,
    pub workflow_name: String,
    pub spec_version: String,
    pub created_at: DateTime<Utc>,
}

/// A run's stored metadata. Status and progress are derived from the log,
/// not stored here.
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub run_id: RunId,
    pub workflow_name: String,
    pub spec_version: String,
    pub created_at: DateTime<Utc>,
    /// True when `spec_version` predates the event-sourced format.
    pub legacy: bool,
}

/// Sort order for event listing. Replay must use ascending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

/// Options for paginated event listing.
#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    /// Resume token from a previous page.
    pub cursor: Option<String>,
    /// Sort order by `(created_at, event_id)`.
    pub order: SortOrder,
    /// Page size; backends apply a default when absent.
    pub limit: Option<usize>,
}

/// One page of events.
#[derive(Debug, Clone)]
pub struct EventPage {
    pub data: Vec<Event>,
    /// Token for the next page, present iff `has_more`.
    pub cursor: Option<String>,
    pub has_more: bool,
}

/// Durable, ordered per-run event storage.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Create a run. Fails with [`StoreError::RunAlreadyExists`] on reuse.
    async fn create_run(&self, run: NewRun) -> Result<(), StoreError>;

    /// Fetch a run's stored metadata.
    async fn get_run(&self, run_id: RunId) -> Result<RunRecord, StoreError>;

    /// Atomically append a batch of events.
    ///
    /// `expected_sequence` is the caller's view of the log length; a
    /// mismatch means another writer got there first and fails with
    /// [`StoreError::ConcurrentAppend`]. Appends to terminal runs fail with
    /// [`StoreError::TerminalRun`] unless every event in the batch is
    /// informational, in which case the batch is dropped silently.
    ///
    /// Returns the new sequence (log length).
    async fn append(
        &self,
        run_id: RunId,
        expected_sequence: u64,
        events: Vec<Event>,
    ) -> Result<u64, StoreError>;

    /// Paginated event listing in `(created_at, event_id)` order.
    async fn list(&self, run_id: RunId, options: ListOptions) -> Result<EventPage, StoreError>;

    /// Drain all pages in ascending order.
    async fn load_all(&self, run_id: RunId) -> Result<Vec<Event>, StoreError> {
        let mut events = Vec::new();
        let mut cursor = None;
        loop {
            let page = self
                .list(
                    run_id,
                    ListOptions {
                        cursor,
                        order: SortOrder::Asc,
                        limit: Some(256),
                    },
                )
                .await?;
            events.extend(page.data);
            if !page.has_more {
                return Ok(events);
            }
            cursor = page.cursor;
        }
    }

    /// Resolve a hook token to the run that created it. Backends keep this
    /// as an index derived from `hook_created` events, never as independent
    /// state.
    async fn find_hook(&self, token: &HookToken) -> Result<Option<RunId>, StoreError>;
}

/// Options for enqueueing a message.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Earliest delivery time; immediate when absent. Absolute, because the
    /// core carries no clock of its own.
    pub deliver_at: Option<DateTime<Utc>>,
}

/// Result of an enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Message accepted.
    Enqueued(MessageId),
    /// A message with this idempotency key already exists; the send counts
    /// as successful.
    Duplicate(MessageId),
}

impl EnqueueOutcome {
    /// The id of the message that exists after the call, either way.
    pub fn message_id(&self) -> MessageId {
        match self {
            Self::Enqueued(id) | Self::Duplicate(id) => *id,
        }
    }
}

/// A delivered message awaiting acknowledgement.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message_id: MessageId,
    pub message: QueueMessage,
    /// How many times this message has been delivered, this one included.
    pub delivery_count: u32,
}

/// Reliable queue with idempotent enqueue.
///
/// The workflow tick queue is serialized per run: at most one tick delivery
/// per run is in flight at a time, which gives the engine its single-writer
/// lease.
#[async_trait]
pub trait QueueClient: Send + Sync {
    /// Enqueue a message. Duplicate idempotency keys are suppressed and
    /// reported as [`EnqueueOutcome::Duplicate`].
    async fn enqueue(
        &self,
        message: QueueMessage,
        options: EnqueueOptions,
    ) -> Result<EnqueueOutcome, QueueError>;

    /// Receive up to `max_messages` due messages from a queue. Delivered
    /// messages stay invisible until acked or nacked.
    async fn receive(
        &self,
        queue_name: &str,
        now: DateTime<Utc>,
        max_messages: usize,
    ) -> Result<Vec<Delivery>, QueueError>;

    /// Acknowledge (remove) a delivered message.
    async fn ack(&self, queue_name: &str, message_id: MessageId) -> Result<(), QueueError>;

    /// Return a delivered message to the queue for redelivery at the given
    /// time.
    async fn nack(
        &self,
        queue_name: &str,
        message_id: MessageId,
        redeliver_at: DateTime<Utc>,
    ) -> Result<(), QueueError>;
}

/// One page of stream chunks.
#[derive(Debug, Clone)]
pub struct StreamPage {
    pub chunks: Vec<Vec<u8>>,
    /// Cursor positioned after the returned chunks.
    pub next_cursor: usize,
    /// True when the stream is closed and `next_cursor` is at the end.
    pub closed: bool,
    /// How the stream's chunks are to be interpreted.
    pub kind: StreamKind,
}

/// Named byte streams keyed by run.
#[async_trait]
pub trait StreamStore: Send + Sync {
    /// Open a stream. Opening validates run existence, except for names
    /// under [`HEALTH_STREAM_PREFIX`]. Reopening an existing stream is a
    /// no-op.
    async fn open(
        &self,
        run_id: RunId,
        stream_name: &str,
        kind: StreamKind,
        namespace: Option<&str>,
    ) -> Result<(), StoreError>;

    /// Append one chunk. Writes against terminal runs are dropped silently;
    /// writes to a closed stream fail with [`StoreError::StreamClosed`].
    async fn append_chunk(
        &self,
        run_id: RunId,
        stream_name: &str,
        chunk: &[u8],
    ) -> Result<(), StoreError>;

    /// Mark the stream finite. Idempotent.
    async fn close(&self, run_id: RunId, stream_name: &str) -> Result<(), StoreError>;

    /// Read chunks from a cursor. Fails with [`StoreError::StreamNotFound`]
    /// until the stream is created (pollers treat that as not-ready).
    async fn read(
        &self,
        run_id: RunId,
        stream_name: &str,
        cursor: usize,
        max_chunks: usize,
    ) -> Result<StreamPage, StoreError>;
}

/// Storage for payloads too large to inline in the log.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store bytes, returning their reference.
    async fn put(&self, bytes: Vec<u8>) -> Result<BlobId, StoreError>;

    /// Fetch bytes by reference.
    async fn get(&self, blob: BlobId) -> Result<Vec<u8>, StoreError>;
}

/// The pluggable backend: storage + queue + streams + blobs.
pub trait World: Send + Sync + 'static {
    fn events(&self) -> &dyn EventStore;
    fn queue(&self) -> &dyn QueueClient;
    fn streams(&self) -> &dyn StreamStore;
    fn blobs(&self) -> &dyn BlobStore;

    /// Inline-payload ceiling; larger encoded values spill to blob storage.
    fn blob_threshold(&self) -> usize {
        DEFAULT_BLOB_THRESHOLD
    }
}

/// Grow a poll interval toward its ceiling.
pub fn poll_backoff(current: Duration, max: Duration) -> Duration {
    (current * 2).min(max)
}
