//! Payload and snapshot envelopes
//!
//! Every plaintext that gets encrypted is wrapped in a versioned envelope
//! first. Upcast steps registered per `(event_type, from_version)` migrate
//! old payloads forward at decode time; decoding without a path to the
//! latest version is a fatal typed error.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::CodecError;

/// Versioned wrapper around an event payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayloadEnvelope {
    pub payload_version: u32,
    pub data: Value,
}

impl PayloadEnvelope {
    pub fn new(payload_version: u32, data: Value) -> Self {
        Self {
            payload_version,
            data,
        }
    }

    /// Canonical byte form (struct field order is the canonical key order).
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Versioned wrapper around a snapshot state blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotEnvelope {
    pub schema_version: u32,
    pub state: Value,
}

impl SnapshotEnvelope {
    pub const LATEST_SCHEMA: u32 = 1;

    pub fn latest(state: Value) -> Self {
        Self {
            schema_version: Self::LATEST_SCHEMA,
            state,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode and reject snapshots written by a newer schema.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let envelope: Self = serde_json::from_slice(bytes)?;
        if envelope.schema_version > Self::LATEST_SCHEMA {
            return Err(CodecError::UnknownSnapshotVersion {
                version: envelope.schema_version,
                latest: Self::LATEST_SCHEMA,
            });
        }
        Ok(envelope)
    }
}

/// One upcast step: payload data at `from_version` → data at `from_version + 1`.
pub type UpcastFn = fn(Value) -> Value;

/// Registry of payload versions and upcast steps per event type.
///
/// Event types without an entry are implicitly at version 1.
#[derive(Default)]
pub struct UpcasterRegistry {
    latest: HashMap<String, u32>,
    steps: HashMap<(String, u32), UpcastFn>,
}

impl UpcasterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare the latest payload version for an event type.
    pub fn declare_latest(&mut self, event_type: &str, version: u32) {
        self.latest.insert(event_type.to_string(), version);
    }

    /// Register the step migrating `event_type` payloads from
    /// `from_version` to `from_version + 1`.
    pub fn register(&mut self, event_type: &str, from_version: u32, step: UpcastFn) {
        self.steps
            .insert((event_type.to_string(), from_version), step);
        let latest = self.latest.entry(event_type.to_string()).or_insert(1);
        if *latest < from_version + 1 {
            *latest = from_version + 1;
        }
    }

    pub fn latest_version(&self, event_type: &str) -> u32 {
        self.latest.get(event_type).copied().unwrap_or(1)
    }

    /// Wrap payload data in an envelope at the latest version.
    pub fn encode_payload(&self, event_type: &str, data: Value) -> Result<Vec<u8>, CodecError> {
        PayloadEnvelope::new(self.latest_version(event_type), data).encode()
    }

    /// Decode an envelope and upcast it to the latest version.
    pub fn decode_payload(&self, event_type: &str, bytes: &[u8]) -> Result<Value, CodecError> {
        let envelope = PayloadEnvelope::decode(bytes)?;
        let latest = self.latest_version(event_type);

        let mut version = envelope.payload_version;
        let mut data = envelope.data;

        while version < latest {
            let step = self
                .steps
                .get(&(event_type.to_string(), version))
                .ok_or_else(|| CodecError::UnknownPayloadVersion {
                    event_type: event_type.to_string(),
                    version,
                    latest,
                })?;
            data = step(data);
            version += 1;
        }

        if version != latest {
            return Err(CodecError::UnknownPayloadVersion {
                event_type: event_type.to_string(),
                version,
                latest,
            });
        }

        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_payload_envelope_round_trip() {
        let envelope = PayloadEnvelope::new(1, json!({"title": "Learn sailing"}));
        let bytes = envelope.encode().unwrap();
        assert_eq!(PayloadEnvelope::decode(&bytes).unwrap(), envelope);
    }

    #[test]
    fn test_envelope_key_order_is_stable() {
        let bytes = PayloadEnvelope::new(1, json!(null)).encode().unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with(r#"{"payloadVersion":1,"#));
    }

    #[test]
    fn test_decode_at_latest_version_passes_through() {
        let registry = UpcasterRegistry::new();
        let bytes = registry
            .encode_payload("GoalCreated", json!({"title": "t"}))
            .unwrap();
        let data = registry.decode_payload("GoalCreated", &bytes).unwrap();
        assert_eq!(data, json!({"title": "t"}));
    }

    #[test]
    fn test_upcast_applies_steps_in_order() {
        let mut registry = UpcasterRegistry::new();
        registry.register("GoalCreated", 1, |mut data| {
            data["category"] = json!("uncategorized");
            data
        });

        let old = PayloadEnvelope::new(1, json!({"title": "t"})).encode().unwrap();
        let data = registry.decode_payload("GoalCreated", &old).unwrap();
        assert_eq!(data, json!({"title": "t", "category": "uncategorized"}));
    }

    #[test]
    fn test_decode_newer_than_latest_fails() {
        let registry = UpcasterRegistry::new();
        let future = PayloadEnvelope::new(5, json!({})).encode().unwrap();
        let result = registry.decode_payload("GoalCreated", &future);
        assert!(matches!(
            result,
            Err(CodecError::UnknownPayloadVersion { version: 5, .. })
        ));
    }

    #[test]
    fn test_missing_upcast_step_fails() {
        let mut registry = UpcasterRegistry::new();
        registry.declare_latest("GoalCreated", 3);

        let old = PayloadEnvelope::new(1, json!({})).encode().unwrap();
        let result = registry.decode_payload("GoalCreated", &old);
        assert!(matches!(
            result,
            Err(CodecError::UnknownPayloadVersion { version: 1, latest: 3, .. })
        ));
    }

    #[test]
    fn test_snapshot_envelope_rejects_newer_schema() {
        let bytes = SnapshotEnvelope {
            schema_version: 9,
            state: json!({}),
        }
        .encode()
        .unwrap();
        assert!(matches!(
            SnapshotEnvelope::decode(&bytes),
            Err(CodecError::UnknownSnapshotVersion { version: 9, .. })
        ));
    }
}
