//! The pluggable World: storage, queue, streams, blobs.

mod memory;
mod store;

pub use memory::InMemoryWorld;
pub use store::{
    poll_backoff, BlobStore, Delivery, EnqueueOptions, EnqueueOutcome, EventPage, EventStore,
    ListOptions, NewRun, QueueClient, QueueError, RunRecord, SortOrder, StoreError, StreamPage,
    StreamStore, World, DEFAULT_BLOB_THRESHOLD, HEALTH_STREAM_PREFIX,
};

use serde_json::Value;
use wrun_core::{Codec, CodecError, EncodedValue};

/// Errors from moving values across the codec/blob boundary.
#[derive(Debug, thiserror::Error)]
pub enum ValueStoreError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Encode a value for storage, spilling to blob storage past the world's
/// inline threshold.
pub async fn store_value(
    world: &dyn World,
    codec: &Codec,
    value: &Value,
) -> Result<EncodedValue, ValueStoreError> {
    let bytes = codec.to_bytes(value)?;
    if bytes.len() > world.blob_threshold() {
        let blob = world.blobs().put(bytes).await?;
        Ok(EncodedValue::blob(blob))
    } else {
        Ok(EncodedValue::inline(codec.encode(value)?))
    }
}

/// Append events with a bounded retry against concurrent-append conflicts.
///
/// Workflow ticks hold the run lease, so their appends use an exact
/// expected sequence and surface conflicts. Step executors and external
/// callers append around the lease; they reload and retry a few times
/// before giving up. Terminal-run rejections are not retried here — the
/// caller decides whether they are an error or a silent drop.
pub async fn append_with_retry(
    events: &dyn EventStore,
    run_id: wrun_core::RunId,
    batch: Vec<wrun_core::Event>,
) -> Result<u64, StoreError> {
    const MAX_ATTEMPTS: u32 = 5;
    let mut attempt = 0;
    loop {
        let current = events.load_all(run_id).await?;
        match events.append(run_id, current.len() as u64, batch.clone()).await {
            Ok(sequence) => return Ok(sequence),
            Err(StoreError::ConcurrentAppend { .. }) if attempt < MAX_ATTEMPTS => {
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Decode a stored value, resolving blob references lazily.
pub async fn load_value(
    world: &dyn World,
    codec: &Codec,
    encoded: &EncodedValue,
) -> Result<Value, ValueStoreError> {
    match encoded {
        EncodedValue::Inline(value) => Ok(codec.decode(value)?),
        EncodedValue::Ref { blob } => {
            let bytes = world.blobs().get(*blob).await?;
            Ok(codec.from_bytes(&bytes)?)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_small_values_stay_inline() {
        let world = InMemoryWorld::new();
        let codec = Codec::plain();
        let value = json!({ "a": 1 });

        let encoded = store_value(&world, &codec, &value).await.unwrap();
        assert!(!encoded.is_ref());
        assert_eq!(load_value(&world, &codec, &encoded).await.unwrap(), value);
    }

    #[tokio::test]
    async fn test_large_values_spill_to_blobs() {
        let world = InMemoryWorld::with_blob_threshold(64);
        let codec = Codec::plain();
        let value = json!({ "payload": "x".repeat(256) });

        let encoded = store_value(&world, &codec, &value).await.unwrap();
        assert!(encoded.is_ref());
        assert_eq!(load_value(&world, &codec, &encoded).await.unwrap(), value);
    }
}
