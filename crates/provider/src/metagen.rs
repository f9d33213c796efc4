//! Metadata generation seam: pod (plus optional container overrides) to a
//! namespaced variable tree.

use std::sync::Arc;

use k8s_openapi::api::core::v1::{Namespace, Node, Pod};
use serde_json::Value;

use autodisco_core::{safe_put, Mapping};
use autodisco_kubehub::Store;

/// Top-level namespace produced for kubernetes metadata.
pub const KUBERNETES: &str = "kubernetes";

#[derive(Debug, thiserror::Error)]
pub enum MetaGenError {
    #[error("pod is missing {0}")]
    MissingField(&'static str),
    #[error("metadata generation: {0}")]
    Other(String),
}

/// Produces metadata for a pod. The result maps each top-level namespace
/// (`kubernetes`, ...) to its variable tree. `overrides` are dotted keys set
/// inside the `kubernetes` tree, e.g. `("container.name", "app")`.
pub trait MetaGen: Send + Sync {
    fn generate(&self, pod: &Pod, overrides: &[(&str, &str)]) -> Result<Mapping, MetaGenError>;
}

/// Generator covering pod identity and labels, enriched from the node and
/// namespace caches when those are available.
#[derive(Default)]
pub struct BasicPodMetaGen {
    nodes: Option<Arc<dyn Store<Node>>>,
    namespaces: Option<Arc<dyn Store<Namespace>>>,
}

impl BasicPodMetaGen {
    pub fn new(nodes: Option<Arc<dyn Store<Node>>>, namespaces: Option<Arc<dyn Store<Namespace>>>) -> Self {
        Self { nodes, namespaces }
    }
}

/// Dotted label keys expanded into a tree; `None` when there are no labels.
fn label_tree<'a>(labels: impl Iterator<Item = (&'a String, &'a String)>) -> Option<Value> {
    let mut tree = Mapping::new();
    for (k, v) in labels {
        safe_put(&mut tree, k, Value::String(v.clone()));
    }
    (!tree.is_empty()).then_some(Value::Object(tree))
}

impl MetaGen for BasicPodMetaGen {
    fn generate(&self, pod: &Pod, overrides: &[(&str, &str)]) -> Result<Mapping, MetaGenError> {
        let uid = pod.metadata.uid.as_deref().filter(|u| !u.is_empty()).ok_or(MetaGenError::MissingField("metadata.uid"))?;
        let name = pod.metadata.name.as_deref().ok_or(MetaGenError::MissingField("metadata.name"))?;

        let mut k = Mapping::new();
        safe_put(&mut k, "pod.name", Value::String(name.to_string()));
        safe_put(&mut k, "pod.uid", Value::String(uid.to_string()));
        if let Some(ip) = pod.status.as_ref().and_then(|s| s.pod_ip.as_deref()) {
            safe_put(&mut k, "pod.ip", Value::String(ip.to_string()));
        }
        if let Some(l) = label_tree(pod.metadata.labels.iter().flatten()) {
            k.insert("labels".into(), l);
        }

        if let Some(ns) = pod.metadata.namespace.as_deref() {
            k.insert("namespace".into(), Value::String(ns.to_string()));
            if let Some(namespace) = self.namespaces.as_ref().and_then(|s| s.get_by_key(ns)) {
                if let Some(nuid) = namespace.metadata.uid.as_deref() {
                    k.insert("namespace_uid".into(), Value::String(nuid.to_string()));
                }
                if let Some(l) = label_tree(namespace.metadata.labels.iter().flatten()) {
                    k.insert("namespace_labels".into(), l);
                }
            }
        }

        if let Some(node) = pod.spec.as_ref().and_then(|s| s.node_name.as_deref()) {
            safe_put(&mut k, "node.name", Value::String(node.to_string()));
            if let Some(n) = self.nodes.as_ref().and_then(|s| s.get_by_key(node)) {
                if let Some(nuid) = n.metadata.uid.as_deref() {
                    safe_put(&mut k, "node.uid", Value::String(nuid.to_string()));
                }
                if let Some(l) = label_tree(n.metadata.labels.iter().flatten()) {
                    safe_put(&mut k, "node.labels", l);
                }
            }
        }

        for (key, value) in overrides {
            safe_put(&mut k, key, Value::String(value.to_string()));
        }

        let mut out = Mapping::new();
        out.insert(KUBERNETES.to_string(), Value::Object(k));
        Ok(out)
    }
}
