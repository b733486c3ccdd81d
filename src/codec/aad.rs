//! AAD builder
//!
//! Byte-stable Additional Authenticated Data strings. These are part of the
//! persisted format: any change breaks decryption of existing stores.

/// AAD for an event payload: binds the ciphertext to its stream position.
pub fn event_payload(
    aggregate_type: &str,
    aggregate_id: &str,
    event_type: &str,
    version: i64,
) -> String {
    format!("{}|{}|{}|v{}", aggregate_type, aggregate_id, event_type, version)
}

/// AAD for a per-aggregate snapshot.
pub fn snapshot(aggregate_id: &str, snapshot_version: i64) -> String {
    format!("{}|snapshot|v{}", aggregate_id, snapshot_version)
}

/// AAD for a projection cache blob.
pub fn projection_cache(
    projection_id: &str,
    scope_key: &str,
    cache_version: i64,
    global_sequence: i64,
    pending_commit_sequence: i64,
) -> String {
    format!(
        "{}|{}|v{}|gs{}|pc{}",
        projection_id, scope_key, cache_version, global_sequence, pending_commit_sequence
    )
}

/// AAD for a search index artifact.
pub fn index_artifact(
    index_id: &str,
    scope_key: &str,
    artifact_version: i64,
    global_sequence: i64,
    pending_commit_sequence: i64,
) -> String {
    format!(
        "{}|{}|v{}|gs{}|pc{}",
        index_id, scope_key, artifact_version, global_sequence, pending_commit_sequence
    )
}

/// AAD for process-manager state.
pub fn process_manager(
    pm_id: &str,
    scope_key: &str,
    state_version: i64,
    global_sequence: i64,
    pending_commit_sequence: i64,
) -> String {
    format!(
        "{}|{}|v{}|gs{}|pc{}",
        pm_id, scope_key, state_version, global_sequence, pending_commit_sequence
    )
}

/// AAD for a wrapped aggregate key at rest.
pub fn aggregate_key(aggregate_id: &str, epoch: i64) -> String {
    format!("{}|key|e{}", aggregate_id, epoch)
}

/// AAD for a keyring-update envelope carried on an event.
pub fn keyring_update(aggregate_id: &str, epoch: i64) -> String {
    format!("{}|keyring|e{}", aggregate_id, epoch)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_payload_aad_is_byte_stable() {
        assert_eq!(
            event_payload("goal", "goal-A", "GoalCreated", 1),
            "goal|goal-A|GoalCreated|v1"
        );
    }

    #[test]
    fn test_snapshot_aad_is_byte_stable() {
        assert_eq!(snapshot("goal-A", 7), "goal-A|snapshot|v7");
    }

    #[test]
    fn test_projection_cache_aad_is_byte_stable() {
        assert_eq!(
            projection_cache("goal-snapshots", "goal-A", 3, 42, 0),
            "goal-snapshots|goal-A|v3|gs42|pc0"
        );
    }

    #[test]
    fn test_every_component_changes_the_aad() {
        let base = event_payload("goal", "goal-A", "GoalCreated", 1);
        assert_ne!(base, event_payload("project", "goal-A", "GoalCreated", 1));
        assert_ne!(base, event_payload("goal", "goal-B", "GoalCreated", 1));
        assert_ne!(base, event_payload("goal", "goal-A", "GoalRenamed", 1));
        assert_ne!(base, event_payload("goal", "goal-A", "GoalCreated", 2));
    }
}
