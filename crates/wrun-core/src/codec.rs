//! Value codec
//!
//! Values crossing the log, the queue, or a stream are JSON trees with a
//! small set of rich shapes riding in tagged objects under the reserved
//! `__wkf` key: dates, binary payloads, stream references, registered class
//! instances, and structured errors. Encoding is deterministic: the same
//! tree always produces byte-equal canonical output, regardless of map
//! insertion order.
//!
//! The codec itself is pure. Spilling large payloads to blob storage and
//! resolving [`EncodedValue::Ref`] back happens at the World boundary, which
//! owns the threshold and the blob store.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::ErrorValue;
use crate::ids::{BlobId, RunId};

/// Reserved key marking a tagged rich value.
pub const TAG_KEY: &str = "__wkf";

/// Reserved key marking a blob reference envelope.
pub const BLOB_KEY: &str = "$blob";

/// Errors from encoding or decoding values.
///
/// `EncodeFailure` is always non-retryable: the same value will fail the
/// same way on every attempt.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// The value has no encoding (unregistered class, malformed tag,
    /// reserved key in user data).
    #[error("value cannot be encoded: {0}")]
    EncodeFailure(String),

    /// The bytes or tree could not be decoded.
    #[error("value cannot be decoded: {0}")]
    DecodeFailure(String),

    /// A class tag referenced an id missing from the registry.
    #[error("unknown class id: {0}")]
    UnknownClass(String),
}

/// An encoded value as stored: inline, or a reference to blob storage.
///
/// Interfaces accept either shape; decoding resolves references lazily
/// through the owning backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EncodedValue {
    /// Reference to an externally stored payload.
    Ref {
        #[serde(rename = "$blob")]
        blob: BlobId,
    },

    /// The encoded tree, stored inline.
    Inline(Value),
}

impl EncodedValue {
    /// Wrap an encoded tree inline.
    pub fn inline(value: Value) -> Self {
        Self::Inline(value)
    }

    /// Wrap a blob reference.
    pub fn blob(blob: BlobId) -> Self {
        Self::Ref { blob }
    }

    /// True when this value must be resolved through blob storage.
    pub fn is_ref(&self) -> bool {
        matches!(self, Self::Ref { .. })
    }

    /// The inline tree, if present.
    pub fn as_inline(&self) -> Option<&Value> {
        match self {
            Self::Inline(value) => Some(value),
            Self::Ref { .. } => None,
        }
    }
}

/// A reference to a named byte stream, as carried inside encoded values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamRef {
    /// Run that owns the stream.
    pub run_id: RunId,
    /// Stream name within the run.
    pub stream_name: String,
}

/// Transform hook applied to a registered class's data tree.
pub type ClassHook = Arc<dyn Fn(&Value) -> Result<Value, CodecError> + Send + Sync>;

#[derive(Clone, Default)]
struct ClassEntry {
    encode: Option<ClassHook>,
    decode: Option<ClassHook>,
}

/// Process-wide table of registered class identities.
///
/// Built once at load time through [`ClassRegistryBuilder`] and frozen
/// before the engine starts; runtime mutation is a bug by construction.
#[derive(Clone, Default)]
pub struct ClassRegistry {
    entries: HashMap<String, ClassEntry>,
}

impl ClassRegistry {
    /// An empty registry (no classes round-trip).
    pub fn empty() -> Self {
        Self::default()
    }

    /// True when the class id is registered.
    pub fn contains(&self, class_id: &str) -> bool {
        self.entries.contains_key(class_id)
    }

    /// Number of registered classes.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no classes are registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for ClassRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClassRegistry")
            .field("class_ids", &self.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Builder collecting class registrations before freezing.
#[derive(Default)]
pub struct ClassRegistryBuilder {
    entries: HashMap<String, ClassEntry>,
}

impl ClassRegistryBuilder {
    /// Start an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a class id whose instances serialize through plain serde.
    pub fn register(mut self, class_id: impl Into<String>) -> Self {
        self.entries.insert(class_id.into(), ClassEntry::default());
        self
    }

    /// Register a class id with custom serialize/deserialize hooks applied
    /// to the instance's data tree.
    pub fn register_with_hooks(
        mut self,
        class_id: impl Into<String>,
        encode: ClassHook,
        decode: ClassHook,
    ) -> Self {
        self.entries.insert(
            class_id.into(),
            ClassEntry {
                encode: Some(encode),
                decode: Some(decode),
            },
        );
        self
    }

    /// Freeze into an immutable registry.
    pub fn freeze(self) -> ClassRegistry {
        ClassRegistry {
            entries: self.entries,
        }
    }
}

/// The value codec: validates, tags, and canonicalizes JSON trees.
#[derive(Clone)]
pub struct Codec {
    classes: Arc<ClassRegistry>,
}

impl Codec {
    /// Build a codec over a frozen class registry.
    pub fn new(classes: ClassRegistry) -> Self {
        Self {
            classes: Arc::new(classes),
        }
    }

    /// A codec with no registered classes.
    pub fn plain() -> Self {
        Self::new(ClassRegistry::empty())
    }

    /// The class registry in use.
    pub fn classes(&self) -> &ClassRegistry {
        &self.classes
    }

    // =========================================================================
    // Tagged constructors
    // =========================================================================

    /// Tag a date for ISO-8601 round-trip.
    pub fn date(at: DateTime<Utc>) -> Value {
        json!({ TAG_KEY: "date", "value": at.to_rfc3339_opts(SecondsFormat::Millis, true) })
    }

    /// Tag a binary payload (base64 on the wire).
    pub fn binary(bytes: &[u8]) -> Value {
        json!({ TAG_KEY: "bytes", "base64": BASE64.encode(bytes) })
    }

    /// Tag a reference to a named stream.
    pub fn stream(stream_ref: &StreamRef) -> Value {
        json!({
            TAG_KEY: "stream",
            "runId": stream_ref.run_id.to_string(),
            "streamName": stream_ref.stream_name,
        })
    }

    /// Tag a structured error.
    pub fn error(err: &ErrorValue) -> Value {
        let mut map = Map::new();
        map.insert(TAG_KEY.into(), Value::String("error".into()));
        map.insert("message".into(), Value::String(err.message.clone()));
        if let Some(stack) = &err.stack {
            map.insert("stack".into(), Value::String(stack.clone()));
        }
        if let Some(code) = &err.code {
            map.insert("code".into(), Value::String(code.clone()));
        }
        Value::Object(map)
    }

    /// Tag an instance of a registered class. Fails with [`CodecError::UnknownClass`]
    /// when the id was never registered.
    pub fn class<T: Serialize>(&self, class_id: &str, instance: &T) -> Result<Value, CodecError> {
        let entry = self
            .classes
            .entries
            .get(class_id)
            .ok_or_else(|| CodecError::UnknownClass(class_id.to_string()))?;
        let data = to_value(instance)?;
        let data = match &entry.encode {
            Some(hook) => hook(&data)?,
            None => data,
        };
        Ok(json!({ TAG_KEY: "class", "classId": class_id, "data": data }))
    }

    // =========================================================================
    // Tagged extractors
    // =========================================================================

    /// Extract a tagged date.
    pub fn as_date(value: &Value) -> Option<DateTime<Utc>> {
        let obj = tagged(value, "date")?;
        let raw = obj.get("value")?.as_str()?;
        DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    }

    /// Extract a tagged binary payload.
    pub fn as_binary(value: &Value) -> Option<Vec<u8>> {
        let obj = tagged(value, "bytes")?;
        BASE64.decode(obj.get("base64")?.as_str()?).ok()
    }

    /// Extract a tagged stream reference.
    pub fn as_stream(value: &Value) -> Option<StreamRef> {
        let obj = tagged(value, "stream")?;
        Some(StreamRef {
            run_id: obj.get("runId")?.as_str()?.parse().ok()?,
            stream_name: obj.get("streamName")?.as_str()?.to_string(),
        })
    }

    /// Extract a tagged error.
    pub fn as_error(value: &Value) -> Option<ErrorValue> {
        let obj = tagged(value, "error")?;
        Some(ErrorValue {
            message: obj.get("message")?.as_str()?.to_string(),
            stack: obj.get("stack").and_then(Value::as_str).map(String::from),
            code: obj.get("code").and_then(Value::as_str).map(String::from),
        })
    }

    /// Extract and deserialize a tagged class instance.
    pub fn class_instance<T: DeserializeOwned>(
        &self,
        value: &Value,
        class_id: &str,
    ) -> Result<T, CodecError> {
        let obj = tagged(value, "class")
            .ok_or_else(|| CodecError::DecodeFailure("not a class value".into()))?;
        let found = obj
            .get("classId")
            .and_then(Value::as_str)
            .ok_or_else(|| CodecError::DecodeFailure("class tag without classId".into()))?;
        if found != class_id {
            return Err(CodecError::DecodeFailure(format!(
                "expected class {class_id}, found {found}"
            )));
        }
        let entry = self
            .classes
            .entries
            .get(found)
            .ok_or_else(|| CodecError::UnknownClass(found.to_string()))?;
        let data = obj
            .get("data")
            .cloned()
            .ok_or_else(|| CodecError::DecodeFailure("class tag without data".into()))?;
        let data = match &entry.decode {
            Some(hook) => hook(&data)?,
            None => data,
        };
        from_value(data)
    }

    // =========================================================================
    // Encode / decode
    // =========================================================================

    /// Validate a tree for encoding. Rejects reserved-key misuse, malformed
    /// tags, and unregistered class ids.
    pub fn encode(&self, value: &Value) -> Result<Value, CodecError> {
        self.check(value, Mode::Encode)?;
        Ok(value.clone())
    }

    /// Encode to canonical bytes: sorted object keys, no insignificant
    /// whitespace, so equal trees are byte-equal.
    pub fn to_bytes(&self, value: &Value) -> Result<Vec<u8>, CodecError> {
        self.check(value, Mode::Encode)?;
        Ok(canonical_json(value).into_bytes())
    }

    /// Validate a stored tree for decoding. Rejects unknown tags and class
    /// ids this process never registered.
    pub fn decode(&self, value: &Value) -> Result<Value, CodecError> {
        self.check(value, Mode::Decode)?;
        Ok(value.clone())
    }

    /// Decode from stored bytes.
    pub fn from_bytes(&self, bytes: &[u8]) -> Result<Value, CodecError> {
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|e| CodecError::DecodeFailure(e.to_string()))?;
        self.decode(&value)
    }

    /// Encode a structured error for storage.
    pub fn encode_error(&self, err: &ErrorValue) -> Value {
        Self::error(err)
    }

    /// Decode an error from any accepted wire form: the tagged form, the
    /// plain object form, or the legacy JSON-encoded-string form.
    pub fn decode_error(&self, value: &Value) -> Result<ErrorValue, CodecError> {
        if let Some(err) = Self::as_error(value) {
            return Ok(err);
        }
        serde_json::from_value(value.clone()).map_err(|e| CodecError::DecodeFailure(e.to_string()))
    }

    fn check(&self, value: &Value, mode: Mode) -> Result<(), CodecError> {
        match value {
            Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_) => Ok(()),
            Value::Array(items) => items.iter().try_for_each(|v| self.check(v, mode)),
            Value::Object(map) => {
                if map.contains_key(TAG_KEY) {
                    return self.check_tag(map, mode);
                }
                if map.contains_key(BLOB_KEY) {
                    return Err(mode.fail(format!("reserved key {BLOB_KEY:?} in value")));
                }
                map.values().try_for_each(|v| self.check(v, mode))
            }
        }
    }

    fn check_tag(&self, map: &Map<String, Value>, mode: Mode) -> Result<(), CodecError> {
        let kind = map
            .get(TAG_KEY)
            .and_then(Value::as_str)
            .ok_or_else(|| mode.fail(format!("{TAG_KEY} tag must be a string")))?;
        match kind {
            "date" => {
                let raw = map
                    .get("value")
                    .and_then(Value::as_str)
                    .ok_or_else(|| mode.fail("date tag without value".into()))?;
                DateTime::parse_from_rfc3339(raw)
                    .map_err(|_| mode.fail(format!("invalid date: {raw:?}")))?;
                Ok(())
            }
            "bytes" => {
                let raw = map
                    .get("base64")
                    .and_then(Value::as_str)
                    .ok_or_else(|| mode.fail("bytes tag without base64".into()))?;
                BASE64
                    .decode(raw)
                    .map_err(|_| mode.fail("invalid base64 payload".into()))?;
                Ok(())
            }
            "stream" => {
                let run_id = map
                    .get("runId")
                    .and_then(Value::as_str)
                    .ok_or_else(|| mode.fail("stream tag without runId".into()))?;
                run_id
                    .parse::<RunId>()
                    .map_err(|e| mode.fail(e.to_string()))?;
                map.get("streamName")
                    .and_then(Value::as_str)
                    .ok_or_else(|| mode.fail("stream tag without streamName".into()))?;
                Ok(())
            }
            "error" => {
                map.get("message")
                    .and_then(Value::as_str)
                    .ok_or_else(|| mode.fail("error tag without message".into()))?;
                Ok(())
            }
            "class" => {
                let class_id = map
                    .get("classId")
                    .and_then(Value::as_str)
                    .ok_or_else(|| mode.fail("class tag without classId".into()))?;
                if !self.classes.contains(class_id) {
                    return Err(CodecError::UnknownClass(class_id.to_string()));
                }
                let data = map
                    .get("data")
                    .ok_or_else(|| mode.fail("class tag without data".into()))?;
                self.check(data, mode)
            }
            other => Err(mode.fail(format!("unknown tag kind: {other:?}"))),
        }
    }
}

#[derive(Clone, Copy)]
enum Mode {
    Encode,
    Decode,
}

impl Mode {
    fn fail(self, message: String) -> CodecError {
        match self {
            Self::Encode => CodecError::EncodeFailure(message),
            Self::Decode => CodecError::DecodeFailure(message),
        }
    }
}

fn tagged<'a>(value: &'a Value, kind: &str) -> Option<&'a Map<String, Value>> {
    let obj = value.as_object()?;
    (obj.get(TAG_KEY)?.as_str()? == kind).then_some(obj)
}

/// Serialize any serde value into a JSON tree.
pub fn to_value<T: Serialize>(value: &T) -> Result<Value, CodecError> {
    serde_json::to_value(value).map_err(|e| CodecError::EncodeFailure(e.to_string()))
}

/// Deserialize a JSON tree into a typed value.
pub fn from_value<T: DeserializeOwned>(value: Value) -> Result<T, CodecError> {
    serde_json::from_value(value).map_err(|e| CodecError::DecodeFailure(e.to_string()))
}

/// Render a tree as canonical JSON: object keys sorted, compact separators.
pub fn canonical_json(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => serde_json::to_string(s).expect("strings always serialize"),
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", parts.join(","))
        }
        Value::Object(map) => {
            let sorted: BTreeMap<&String, &Value> = map.iter().collect();
            let parts: Vec<String> = sorted
                .into_iter()
                .map(|(k, v)| {
                    format!(
                        "{}:{}",
                        serde_json::to_string(k).expect("strings always serialize"),
                        canonical_json(v)
                    )
                })
                .collect();
            format!("{{{}}}", parts.join(","))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Money {
        cents: i64,
        currency: String,
    }

    #[test]
    fn test_canonical_json_sorts_keys() {
        let value = json!({ "b": 2, "a": 1, "nested": { "z": [1, 2], "a": null } });
        assert_eq!(
            canonical_json(&value),
            r#"{"a":1,"b":2,"nested":{"a":null,"z":[1,2]}}"#
        );
    }

    #[test]
    fn test_encoding_is_deterministic() {
        let codec = Codec::plain();
        let value = json!({ "x": [1, 2, 3], "y": { "k": "v" } });
        let first = codec.to_bytes(&value).unwrap();
        let second = codec.to_bytes(&value).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_date_round_trip() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 45).unwrap();
        let tagged = Codec::date(at);
        assert_eq!(Codec::as_date(&tagged), Some(at));

        let codec = Codec::plain();
        let bytes = codec.to_bytes(&tagged).unwrap();
        let back = codec.from_bytes(&bytes).unwrap();
        assert_eq!(Codec::as_date(&back), Some(at));
    }

    #[test]
    fn test_binary_round_trip() {
        let payload = vec![0u8, 1, 2, 255];
        let tagged = Codec::binary(&payload);
        assert_eq!(Codec::as_binary(&tagged), Some(payload));
    }

    #[test]
    fn test_stream_ref_round_trip() {
        let stream_ref = StreamRef {
            run_id: RunId::generate(),
            stream_name: "logs".into(),
        };
        let tagged = Codec::stream(&stream_ref);
        assert_eq!(Codec::as_stream(&tagged), Some(stream_ref));
    }

    #[test]
    fn test_registered_class_round_trip() {
        let codec = Codec::new(ClassRegistryBuilder::new().register("Money").freeze());
        let money = Money {
            cents: 4200,
            currency: "EUR".into(),
        };

        let tagged = codec.class("Money", &money).unwrap();
        let bytes = codec.to_bytes(&tagged).unwrap();
        let back = codec.from_bytes(&bytes).unwrap();
        let decoded: Money = codec.class_instance(&back, "Money").unwrap();
        assert_eq!(decoded, money);
    }

    #[test]
    fn test_unregistered_class_fails_encode() {
        let codec = Codec::plain();
        let result = codec.class("Money", &json!({}));
        assert!(matches!(result, Err(CodecError::UnknownClass(_))));
    }

    #[test]
    fn test_unknown_class_in_stored_value_fails_decode() {
        let codec = Codec::plain();
        let value = json!({ TAG_KEY: "class", "classId": "Gone", "data": {} });
        assert!(matches!(
            codec.decode(&value),
            Err(CodecError::UnknownClass(_))
        ));
    }

    #[test]
    fn test_class_hooks_are_applied() {
        let encode: ClassHook = Arc::new(|data| Ok(json!({ "wrapped": data })));
        let decode: ClassHook = Arc::new(|data| {
            data.get("wrapped")
                .cloned()
                .ok_or_else(|| CodecError::DecodeFailure("missing wrapper".into()))
        });
        let codec = Codec::new(
            ClassRegistryBuilder::new()
                .register_with_hooks("Wrapped", encode, decode)
                .freeze(),
        );

        let tagged = codec.class("Wrapped", &json!(7)).unwrap();
        assert_eq!(tagged["data"], json!({ "wrapped": 7 }));
        let out: i64 = codec.class_instance(&tagged, "Wrapped").unwrap();
        assert_eq!(out, 7);
    }

    #[test]
    fn test_reserved_key_in_user_data_fails() {
        let codec = Codec::plain();
        let sneaky = json!({ "$blob": "blob_01ARZ3NDEKTSV4RRFFQ69G5FAV" });
        assert!(matches!(
            codec.encode(&sneaky),
            Err(CodecError::EncodeFailure(_))
        ));

        let fake_tag = json!({ TAG_KEY: "mystery" });
        assert!(matches!(
            codec.encode(&fake_tag),
            Err(CodecError::EncodeFailure(_))
        ));
    }

    #[test]
    fn test_error_decode_accepts_all_forms() {
        let codec = Codec::plain();
        let err = ErrorValue::new("bad").with_code("panic");

        // Tagged form.
        let tagged = codec.encode_error(&err);
        assert_eq!(codec.decode_error(&tagged).unwrap(), err);

        // Plain object form.
        let object = json!({ "message": "bad", "code": "panic" });
        assert_eq!(codec.decode_error(&object).unwrap(), err);

        // Legacy string form.
        let legacy = json!(r#"{"message":"bad","code":"panic"}"#);
        assert_eq!(codec.decode_error(&legacy).unwrap(), err);
    }

    #[test]
    fn test_encoded_value_serde_shapes() {
        let inline = EncodedValue::inline(json!({ "a": 1 }));
        let json_inline = serde_json::to_value(&inline).unwrap();
        assert_eq!(json_inline, json!({ "a": 1 }));

        let blob = BlobId::generate();
        let reference = EncodedValue::blob(blob);
        let json_ref = serde_json::to_value(&reference).unwrap();
        assert_eq!(json_ref, json!({ "$blob": blob.to_string() }));

        let parsed: EncodedValue = serde_json::from_value(json_ref).unwrap();
        assert!(parsed.is_ref());
        let parsed: EncodedValue = serde_json::from_value(json_inline).unwrap();
        assert!(!parsed.is_ref());
    }
}
