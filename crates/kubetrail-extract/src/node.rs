//! Node change detection.
//!
//! Kubelets rewrite their Node object every few seconds just to bump
//! heartbeat times. Those updates carry no information worth keeping.

use serde_json::Value;

use crate::error::ExtractResult;

/// True unless the two Node payloads differ only in
/// `metadata.resourceVersion` and `status.conditions[*].lastHeartbeatTime`.
pub fn node_has_major_update(previous: &str, current: &str) -> ExtractResult<bool> {
    let mut previous: Value = serde_json::from_str(previous)?;
    let mut current: Value = serde_json::from_str(current)?;
    strip_volatile_fields(&mut previous);
    strip_volatile_fields(&mut current);
    Ok(previous != current)
}

fn strip_volatile_fields(node: &mut Value) {
    if let Some(metadata) = node.get_mut("metadata").and_then(Value::as_object_mut) {
        metadata.remove("resourceVersion");
    }
    let conditions = node
        .get_mut("status")
        .and_then(|status| status.get_mut("conditions"))
        .and_then(Value::as_array_mut);
    for condition in conditions.into_iter().flatten() {
        if let Some(condition) = condition.as_object_mut() {
            condition.remove("lastHeartbeatTime");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(version: &str, heartbeat: &str, ready: &str) -> String {
        format!(
            r#"{{"metadata":{{"name":"node-1","resourceVersion":"{version}"}},
               "status":{{"conditions":[{{"type":"Ready","status":"{ready}","lastHeartbeatTime":"{heartbeat}"}}]}}}}"#
        )
    }

    #[test]
    fn heartbeat_only_is_minor() {
        let a = node("1", "2019-01-15T10:00:00Z", "True");
        let b = node("2", "2019-01-15T10:00:10Z", "True");
        assert!(!node_has_major_update(&a, &b).unwrap());
    }

    #[test]
    fn condition_change_is_major() {
        let a = node("1", "2019-01-15T10:00:00Z", "True");
        let b = node("2", "2019-01-15T10:00:10Z", "False");
        assert!(node_has_major_update(&a, &b).unwrap());
    }

    #[test]
    fn label_change_is_major() {
        let a = r#"{"metadata":{"resourceVersion":"1","labels":{"zone":"a"}}}"#;
        let b = r#"{"metadata":{"resourceVersion":"2","labels":{"zone":"b"}}}"#;
        assert!(node_has_major_update(a, b).unwrap());
    }

    #[test]
    fn invalid_json_fails() {
        assert!(node_has_major_update("{}", "nope").is_err());
    }
}
