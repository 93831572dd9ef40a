//! The JSON codec sitting between envelope values and wire bytes.
//!
//! The concrete backend is swappable: it is picked by the
//! `HERMOD_JSON` environment variable during the init process of the
//! library, or at runtime with `use_backend`. The envelope shape is
//! invariant across backends, and every backend must emit compact
//! output, since the framer relies on the termination byte sequence
//! never appearing inside a serialized envelope. Splitting a buffer
//! that coalesced several envelopes is the framer's job; the codec
//! only ever sees one document at a time.

use std::sync::atomic::{AtomicUsize, Ordering};

use serde_json::Value;

use crate::hub::error::*;

/// A (de)serializer of JSON values.
///
/// Implementations have no other coupling to the Manager; they
/// translate between `serde_json::Value` and UTF-8 bytes.
pub trait JsonBackend: Send + Sync {
    /// The name this backend is selected by.
    fn name(&self) -> &'static str;

    /// Serializes a value into compact UTF-8 JSON bytes.
    fn encode(&self, value: &Value) -> Result<Vec<u8>>;

    /// Deserializes one JSON document from UTF-8 bytes.
    fn decode(&self, bytes: &[u8]) -> Result<Value>;
}

struct SerdeJson;

impl JsonBackend for SerdeJson {
    fn name(&self) -> &'static str {
        "serde_json"
    }

    fn encode(&self, value: &Value) -> Result<Vec<u8>> {
        serde_json::to_vec(value).wrapped(ErrorKind::CommunicationSerialize)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value> {
        serde_json::from_slice(bytes).wrapped(ErrorKind::CommunicationSerialize)
    }
}

static BACKENDS: [&(dyn JsonBackend); 1] = [&SerdeJson];

static SELECTED: AtomicUsize = AtomicUsize::new(0);

/// Initialize the serialize module, honoring the `HERMOD_JSON`
/// environment variable if present.
pub(crate) unsafe fn init() -> Result<()> {
    match std::env::var("HERMOD_JSON") {
        Ok(name) => use_backend(&name),
        Err(_) => Ok(()),
    }
}

/// Selects the JSON backend by name, case-insensitively.
pub fn use_backend(name: &str) -> Result<()> {
    let index = BACKENDS
        .iter()
        .position(|b| b.name().eq_ignore_ascii_case(name));
    match index {
        Some(i) => {
            SELECTED.store(i, Ordering::Release);
            Ok(())
        }
        None => Err(Error::wrapped(
            ErrorKind::CommunicationSerialize,
            format!("Unknown JSON backend {:?}", name),
        )),
    }
}

/// Returns the currently selected JSON backend.
pub fn backend() -> &'static dyn JsonBackend {
    BACKENDS[SELECTED.load(Ordering::Acquire)]
}

/// Serializes a value with the selected backend.
pub fn serialize(value: &Value) -> Result<Vec<u8>> {
    backend().encode(value)
}

/// Deserializes a single JSON document with the selected backend.
pub fn deserialize(bytes: &[u8]) -> Result<Value> {
    backend().decode(bytes)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_round_trip() {
        let value = json!({
            "service": "Echo",
            "attribute": "echo",
            "args": [1, 2.5, "three", null, [true, false]],
            "kwargs": {"x": 4},
            "uuid": "abc",
            "error": false,
        });
        let bytes = serialize(&value).unwrap();
        assert_eq!(deserialize(&bytes).unwrap(), value);
    }

    #[test]
    fn test_compact_output() {
        // newlines inside strings must be escaped, never emitted raw
        let value = json!({"message": "line one\nline two"});
        let bytes = serialize(&value).unwrap();
        assert!(!bytes.contains(&b'\n'));
    }

    #[test]
    fn test_unknown_backend() {
        assert!(use_backend("not-a-backend").is_err());
        assert_eq!(backend().name(), "serde_json");
    }

    #[test]
    fn test_select_backend_case_insensitive() {
        use_backend("SERDE_JSON").unwrap();
        assert_eq!(backend().name(), "serde_json");
    }
}
