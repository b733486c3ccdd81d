//! Sync record codec
//!
//! (De)materialization between local event rows and the canonical wire
//! record: stable key order, base64url for ciphertext bytes, and a fatal
//! check that the record id matches the enclosing event id.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::event_store::StoredEventRow;

use super::TransportError;

/// Canonical wire record. Field order is the canonical key order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncEventRecord {
    pub id: String,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub event_type: String,
    /// AEAD ciphertext, base64url without padding
    pub payload: String,
    pub version: i64,
    pub occurred_at: i64,
    pub actor_id: Option<String>,
    pub causation_id: Option<String>,
    pub correlation_id: Option<String>,
    pub epoch: Option<i64>,
    /// Keyring-update envelope, base64url without padding
    pub keyring_update: Option<String>,
}

impl SyncEventRecord {
    /// Materialize a local row into the wire shape.
    pub fn from_row(row: &StoredEventRow) -> Self {
        Self {
            id: row.id.clone(),
            aggregate_type: row.aggregate_type.clone(),
            aggregate_id: row.aggregate_id.clone(),
            event_type: row.event_type.clone(),
            payload: URL_SAFE_NO_PAD.encode(&row.payload_encrypted),
            version: row.version,
            occurred_at: row.occurred_at,
            actor_id: row.actor_id.clone(),
            causation_id: row.causation_id.clone(),
            correlation_id: row.correlation_id.clone(),
            epoch: row.epoch,
            keyring_update: row
                .keyring_update
                .as_ref()
                .map(|bytes| URL_SAFE_NO_PAD.encode(bytes)),
        }
    }

    /// Canonical JSON form.
    pub fn to_record_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// A remote event decoded back into byte form, ready for insertion.
#[derive(Debug, Clone)]
pub struct RemoteEvent {
    pub event_id: String,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub event_type: String,
    pub payload_encrypted: Vec<u8>,
    pub keyring_update: Option<Vec<u8>>,
    pub version: i64,
    pub occurred_at: i64,
    pub actor_id: Option<String>,
    pub causation_id: Option<String>,
    pub correlation_id: Option<String>,
    pub epoch: Option<i64>,
}

/// Parse and validate an incoming record.
///
/// Any shape violation or an id mismatch between the envelope and the
/// record is fatal; nothing is written for a bad record.
pub fn dematerialize(event_id: &str, record_json: &str) -> Result<RemoteEvent, TransportError> {
    let record: SyncEventRecord = serde_json::from_str(record_json)
        .map_err(|e| TransportError::Protocol(format!("Malformed sync record: {}", e)))?;

    if record.id != event_id {
        return Err(TransportError::Protocol(format!(
            "EventId mismatch: envelope {} carries record {}",
            event_id, record.id
        )));
    }

    let payload_encrypted = URL_SAFE_NO_PAD
        .decode(&record.payload)
        .map_err(|e| TransportError::Protocol(format!("Invalid payload encoding: {}", e)))?;

    let keyring_update = record
        .keyring_update
        .as_ref()
        .map(|encoded| {
            URL_SAFE_NO_PAD.decode(encoded).map_err(|e| {
                TransportError::Protocol(format!("Invalid keyringUpdate encoding: {}", e))
            })
        })
        .transpose()?;

    Ok(RemoteEvent {
        event_id: record.id,
        aggregate_type: record.aggregate_type,
        aggregate_id: record.aggregate_id,
        event_type: record.event_type,
        payload_encrypted,
        keyring_update,
        version: record.version,
        occurred_at: record.occurred_at,
        actor_id: record.actor_id,
        causation_id: record.causation_id,
        correlation_id: record.correlation_id,
        epoch: record.epoch,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row() -> StoredEventRow {
        StoredEventRow {
            commit_sequence: 4,
            id: "event-1".to_string(),
            aggregate_type: "goal".to_string(),
            aggregate_id: "goal-A".to_string(),
            event_type: "GoalCreated".to_string(),
            payload_encrypted: vec![0xde, 0xad, 0xbe, 0xef],
            keyring_update: Some(vec![1, 2, 3]),
            version: 1,
            occurred_at: 1_700_000_000_000,
            actor_id: Some("actor-1".to_string()),
            causation_id: None,
            correlation_id: None,
            epoch: Some(1),
        }
    }

    #[test]
    fn test_record_json_has_stable_key_order() {
        let json = SyncEventRecord::from_row(&row()).to_record_json().unwrap();
        let id_pos = json.find(r#""id""#).unwrap();
        let type_pos = json.find(r#""aggregateType""#).unwrap();
        let payload_pos = json.find(r#""payload""#).unwrap();
        let keyring_pos = json.find(r#""keyringUpdate""#).unwrap();
        assert!(id_pos < type_pos && type_pos < payload_pos && payload_pos < keyring_pos);

        // Null fields stay present on the wire.
        assert!(json.contains(r#""causationId":null"#));
    }

    #[test]
    fn test_round_trip_through_wire_form() {
        let source = row();
        let json = SyncEventRecord::from_row(&source).to_record_json().unwrap();
        let remote = dematerialize("event-1", &json).unwrap();

        assert_eq!(remote.payload_encrypted, source.payload_encrypted);
        assert_eq!(remote.keyring_update, source.keyring_update);
        assert_eq!(remote.version, 1);
        assert_eq!(remote.aggregate_id, "goal-A");
    }

    #[test]
    fn test_event_id_mismatch_is_fatal() {
        let json = SyncEventRecord::from_row(&row()).to_record_json().unwrap();
        let result = dematerialize("event-2", &json);

        match result {
            Err(TransportError::Protocol(message)) => {
                assert!(message.contains("EventId mismatch"));
            }
            other => panic!("expected protocol violation, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_malformed_json_is_fatal() {
        assert!(matches!(
            dematerialize("event-1", "{not json"),
            Err(TransportError::Protocol(_))
        ));
    }

    #[test]
    fn test_invalid_base64_is_fatal() {
        let mut record = SyncEventRecord::from_row(&row());
        record.payload = "!!!not-base64url!!!".to_string();
        let json = record.to_record_json().unwrap();

        assert!(matches!(
            dematerialize("event-1", &json),
            Err(TransportError::Protocol(_))
        ));
    }
}
