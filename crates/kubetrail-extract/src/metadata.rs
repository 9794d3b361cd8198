//! Object metadata and involved-object extraction.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use tracing::warn;

use crate::error::{ExtractError, ExtractResult};

pub const EVENT_KIND: &str = "Event";
pub const NODE_KIND: &str = "Node";
pub const POD_KIND: &str = "Pod";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OwnerReference {
    #[serde(deserialize_with = "null_as_default")]
    pub kind: String,
    #[serde(deserialize_with = "null_as_default")]
    pub name: String,
    #[serde(deserialize_with = "null_as_default")]
    pub uid: String,
}

/// The `metadata` block of any Kubernetes object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KubeMetadata {
    #[serde(deserialize_with = "null_as_default")]
    pub name: String,
    #[serde(deserialize_with = "null_as_default")]
    pub namespace: String,
    #[serde(deserialize_with = "null_as_default")]
    pub uid: String,
    #[serde(deserialize_with = "null_as_default")]
    pub self_link: String,
    #[serde(deserialize_with = "null_as_default")]
    pub resource_version: String,
    pub creation_timestamp: Option<String>,
    #[serde(deserialize_with = "null_as_default")]
    pub owner_references: Vec<OwnerReference>,
}

impl KubeMetadata {
    /// Parsed `creationTimestamp`; `None` when absent or unparseable.
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        let value = self.creation_timestamp.as_deref()?;
        match parse_timestamp(value) {
            Ok(ts) => Some(ts),
            Err(e) => {
                warn!(name = %self.name, error = %e, "ignoring creation timestamp");
                None
            }
        }
    }
}

/// The object an Event refers to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InvolvedObject {
    #[serde(deserialize_with = "null_as_default")]
    pub kind: String,
    #[serde(deserialize_with = "null_as_default")]
    pub name: String,
    #[serde(deserialize_with = "null_as_default")]
    pub namespace: String,
    #[serde(deserialize_with = "null_as_default")]
    pub uid: String,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct MetadataEnvelope {
    #[serde(deserialize_with = "null_as_default")]
    metadata: KubeMetadata,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct InvolvedEnvelope {
    #[serde(deserialize_with = "null_as_default")]
    involved_object: InvolvedObject,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct PodEnvelope {
    #[serde(deserialize_with = "null_as_default")]
    spec: PodSpec,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct PodSpec {
    #[serde(deserialize_with = "null_as_default")]
    node_name: String,
}

pub fn extract_metadata(payload: &str) -> ExtractResult<KubeMetadata> {
    let envelope: MetadataEnvelope = serde_json::from_str(payload)?;
    Ok(envelope.metadata)
}

pub fn extract_involved_object(payload: &str) -> ExtractResult<InvolvedObject> {
    let envelope: InvolvedEnvelope = serde_json::from_str(payload)?;
    Ok(envelope.involved_object)
}

/// `spec.nodeName` of a Pod, if it has been scheduled.
pub fn extract_node_name(payload: &str) -> ExtractResult<Option<String>> {
    let envelope: PodEnvelope = serde_json::from_str(payload)?;
    let name = envelope.spec.node_name;
    Ok((!name.is_empty()).then_some(name))
}

/// Deserialize an explicit JSON `null` as the type's default, the same as
/// a missing field.
pub(crate) fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Parse an RFC 3339 timestamp into UTC.
pub fn parse_timestamp(value: &str) -> ExtractResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|source| ExtractError::Timestamp {
            value: value.to_string(),
            source,
        })
}
