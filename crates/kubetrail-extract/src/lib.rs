//! kubetrail-extract — typed views over Kubernetes object payloads.
//!
//! Watch records carry the raw object JSON. The extractors here pull out
//! the handful of fields ingestion needs and tolerate anything missing;
//! they only fail when the payload is not JSON at all.

pub mod error;
pub mod event;
pub mod metadata;
pub mod node;

pub use error::{ExtractError, ExtractResult};
pub use event::{EventInfo, extract_event_info};
pub use metadata::{
    EVENT_KIND, InvolvedObject, KubeMetadata, NODE_KIND, OwnerReference, POD_KIND,
    extract_involved_object, extract_metadata, extract_node_name, parse_timestamp,
};
pub use node::node_has_major_update;
