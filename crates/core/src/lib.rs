//! autodisco core types: event identities, derived mappings and the registry seam.

#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

pub mod mapping;

pub use mapping::{safe_put, Mapping};

/// Priority of pod-scope entries in the registry.
pub const POD_PRIORITY: i32 = 1;
/// Priority of container-scope entries. Outranks [`POD_PRIORITY`] so container
/// specific configuration wins ties.
pub const CONTAINER_PRIORITY: i32 = 2;

/// Composite key correlating a publish with its later removal.
///
/// Pod scope uses the pod UID alone, container scope uses `<uid>.<container>`
/// where `<container>` is always the container *spec* name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventIdentity(String);

impl EventIdentity {
    pub fn pod(uid: &str) -> Self { Self(uid.to_string()) }

    pub fn container(uid: &str, container_name: &str) -> Self {
        Self(format!("{}.{}", uid, container_name))
    }

    pub fn as_str(&self) -> &str { &self.0 }

    pub fn is_empty(&self) -> bool { self.0.is_empty() }
}

impl fmt::Display for EventIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

impl AsRef<str> for EventIdentity {
    fn as_ref(&self) -> &str { &self.0 }
}

/// Fields merged into an event at `target` by the registry consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddFields {
    pub target: String,
    pub fields: serde_json::Value,
}

/// Processor directive attached to a derived mapping.
/// Serializes as `{"add_fields": {"target": .., "fields": ..}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Processor {
    pub add_fields: AddFields,
}

impl Processor {
    pub fn add_fields(target: impl Into<String>, fields: serde_json::Value) -> Self {
        Self { add_fields: AddFields { target: target.into(), fields } }
    }

    pub fn target(&self) -> &str { &self.add_fields.target }
}

pub type Processors = SmallVec<[Processor; 4]>;

/// Metadata computed for one pod or container, ready to publish.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivedMapping {
    pub id: EventIdentity,
    pub priority: i32,
    /// Variables under the `kubernetes.*` namespace.
    pub mapping: Mapping,
    pub processors: Processors,
}

/// Errors returned by a registry when it refuses an entry.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("registry: empty id")]
    EmptyId,
    #[error("registry: empty key at '{0}'")]
    EmptyKey(String),
}

/// Downstream configuration-resolution registry fed by the provider.
///
/// Publish errors are reported but callers treat them as best-effort.
pub trait ProviderComm: Send + Sync {
    fn add_or_update(
        &self,
        id: &EventIdentity,
        priority: i32,
        mapping: Mapping,
        processors: Processors,
    ) -> Result<(), RegistryError>;

    fn remove(&self, id: &EventIdentity);
}

pub mod prelude {
    pub use super::{
        safe_put, DerivedMapping, EventIdentity, Mapping, Processor, Processors, ProviderComm, RegistryError,
        CONTAINER_PRIORITY, POD_PRIORITY,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identities_compose_uid_and_container_name() {
        assert_eq!(EventIdentity::pod("abc").as_str(), "abc");
        assert_eq!(EventIdentity::container("abc", "app").as_str(), "abc.app");
        assert_eq!(EventIdentity::container("abc", "app").to_string(), "abc.app");
    }

    #[test]
    fn container_priority_outranks_pod() {
        assert!(CONTAINER_PRIORITY > POD_PRIORITY);
    }

    #[test]
    fn processor_serializes_as_add_fields() {
        let p = Processor::add_fields("container", serde_json::json!({"id": "c1"}));
        let v = serde_json::to_value(&p).expect("serialize");
        assert_eq!(v, serde_json::json!({"add_fields": {"target": "container", "fields": {"id": "c1"}}}));
    }
}
