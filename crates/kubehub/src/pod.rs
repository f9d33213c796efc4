//! Pod helpers: container enumeration and namespace annotation lookup.

use k8s_openapi::api::core::v1::{Container, ContainerStatus, Namespace, Pod};
use serde_json::Value;

use autodisco_core::{safe_put, Mapping};

use crate::store::Store;

/// A container of a pod joined with its runtime status.
#[derive(Debug, Clone)]
pub struct ContainerInPod {
    /// Runtime container id; empty while the container does not exist in the runtime.
    pub id: String,
    /// Runtime name parsed from the status `containerID` prefix, e.g. `containerd`.
    pub runtime: String,
    pub spec: Container,
    pub status: Option<ContainerStatus>,
    pub init: bool,
}

/// Split `<runtime>://<id>`.
fn parse_container_id(raw: &str) -> (String, String) {
    match raw.split_once("://") {
        Some((runtime, id)) => (runtime.to_string(), id.to_string()),
        None => (String::new(), raw.to_string()),
    }
}

/// Init containers then regular containers, each joined by name with its status.
pub fn containers_in_pod(pod: &Pod) -> Vec<ContainerInPod> {
    let Some(spec) = pod.spec.as_ref() else { return Vec::new() };
    let status = pod.status.as_ref();
    let init_statuses = status.and_then(|s| s.init_container_statuses.as_deref()).unwrap_or(&[]);
    let statuses = status.and_then(|s| s.container_statuses.as_deref()).unwrap_or(&[]);

    let join = |c: &Container, statuses: &[ContainerStatus], init: bool| {
        let st = statuses.iter().find(|s| s.name == c.name).cloned();
        let (runtime, id) = st
            .as_ref()
            .and_then(|s| s.container_id.as_deref())
            .map(parse_container_id)
            .unwrap_or_default();
        ContainerInPod { id, runtime, spec: c.clone(), status: st, init }
    };

    let mut out = Vec::new();
    for c in spec.init_containers.as_deref().unwrap_or(&[]) {
        out.push(join(c, init_statuses, true));
    }
    for c in &spec.containers {
        out.push(join(c, statuses, false));
    }
    out
}

/// Annotations of the pod's namespace as a dotted-key tree; empty when the
/// namespace is unknown or no namespace store is available.
pub fn pod_namespace_annotations(pod: &Pod, namespaces: Option<&dyn Store<Namespace>>) -> Mapping {
    let mut out = Mapping::new();
    let (Some(store), Some(ns)) = (namespaces, pod.metadata.namespace.as_deref()) else { return out };
    let Some(namespace) = store.get_by_key(ns) else { return out };
    for (k, v) in namespace.metadata.annotations.iter().flatten() {
        safe_put(&mut out, k, Value::String(v.clone()));
    }
    out
}
