//! Pod eventer: turns pod lifecycle events into registry entries, or into
//! fleet hints for pods that ask for them.

use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::FutureExt;
use k8s_openapi::api::core::v1::{ContainerPort, Namespace, Node, Pod};
use kube::ResourceExt;
use metrics::counter;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use autodisco_core::prelude::*;
use autodisco_fleet::{HintsCmd, HintsContainer, HintsKubernetes, HintsPod, HintsRequest};
use autodisco_kubehub::{
    containers_in_pod, pod_namespace_annotations, ContainerInPod, CrossUpdateLock, NamespacePodUpdater, NodePodUpdater,
    PodUpdateFn, ResourceEventHandler, WatchError, Watcher,
};

use crate::config::Config;
use crate::metagen::{MetaGen, KUBERNETES};

/// Pod annotation that routes a pod's containers to the hints endpoint.
pub const HINTS_ANNOTATION: &str = "elastic-co-hints/package";
const HINTS_EVENT_START: &str = "Start";

/// Watch subscriptions driving a [`PodEventer`]. Node and namespace watchers
/// are optional; without them the eventer runs without cross-updates. Their
/// cross-updates are registered only when `add_resource_metadata` enables them.
pub struct PodWatchers {
    pub pods: Arc<dyn Watcher<Pod>>,
    pub nodes: Option<Arc<dyn Watcher<Node>>>,
    pub namespaces: Option<Arc<dyn Watcher<Namespace>>>,
}

/// Publishes pod and container metadata while pods run and retracts it when
/// they go away.
pub struct PodEventer {
    inner: Arc<Inner>,
}

struct Inner {
    comm: Arc<dyn ProviderComm>,
    scope: &'static str,
    hints_enabled: bool,
    cleanup_timeout: Duration,
    metagen: Arc<dyn MetaGen>,
    watchers: PodWatchers,
    hints: Option<HintsCmd>,
    cross_update: Arc<CrossUpdateLock>,
    shutdown: CancellationToken,
}

impl PodEventer {
    /// Wire handlers into the given watchers. Nothing runs until [`start`](Self::start).
    pub fn new(
        cfg: &Config,
        comm: Arc<dyn ProviderComm>,
        watchers: PodWatchers,
        metagen: Arc<dyn MetaGen>,
        hints: Option<HintsCmd>,
    ) -> Self {
        let cross_update = Arc::new(CrossUpdateLock::new());
        let inner = Arc::new(Inner {
            comm,
            scope: cfg.scope.as_str(),
            hints_enabled: cfg.hints.enabled,
            cleanup_timeout: cfg.cleanup_timeout,
            metagen,
            watchers,
            hints,
            cross_update: Arc::clone(&cross_update),
            shutdown: CancellationToken::new(),
        });

        // Handlers hold the eventer weakly; the watchers are owned by it.
        let weak = Arc::downgrade(&inner);
        let w = &inner.watchers;
        w.pods.add_event_handler(Arc::new(PodHandler { inner: weak.clone() }));
        let pod_store = w.pods.store();
        let metadata = &cfg.add_resource_metadata;
        if let Some(nodes) = w.nodes.as_ref().filter(|_| metadata.node.enabled) {
            nodes.add_event_handler(Arc::new(NodePodUpdater::new(
                update_fn(&weak),
                Arc::clone(&pod_store),
                Arc::clone(&cross_update),
            )));
        }
        if let Some(namespaces) = w.namespaces.as_ref().filter(|_| metadata.namespace.enabled) {
            namespaces.add_event_handler(Arc::new(NamespacePodUpdater::new(
                update_fn(&weak),
                Arc::clone(&pod_store),
                Arc::clone(&cross_update),
            )));
        }
        Self { inner }
    }

    /// Start node and namespace watchers (best-effort), then the pod watcher.
    pub async fn start(&self) -> Result<(), WatchError> {
        let w = &self.inner.watchers;
        if let Some(nodes) = &w.nodes {
            if let Err(e) = nodes.start().await {
                warn!(error = %e, "node watcher failed to start; node changes will not refresh pods");
            }
        }
        if let Some(namespaces) = &w.namespaces {
            if let Err(e) = namespaces.start().await {
                warn!(error = %e, "namespace watcher failed to start; namespace changes will not refresh pods");
            }
        }
        w.pods.start().await?;
        info!(scope = self.inner.scope, hints = self.inner.hints.is_some(), "pod eventer started");
        Ok(())
    }

    /// Stop all watchers and drop pending deferred cleanups and in-flight
    /// hint dispatches.
    pub fn stop(&self) {
        self.inner.shutdown.cancel();
        let w = &self.inner.watchers;
        w.pods.stop();
        if let Some(namespaces) = &w.namespaces { namespaces.stop(); }
        if let Some(nodes) = &w.nodes { nodes.stop(); }
        debug!("pod eventer stopped");
    }
}

fn update_fn(inner: &Weak<Inner>) -> PodUpdateFn {
    let inner = inner.clone();
    Arc::new(move |pod: Arc<Pod>| {
        let inner = inner.clone();
        async move {
            if let Some(i) = inner.upgrade() {
                i.unlocked_update(&pod).await;
            }
        }
        .boxed()
    })
}

struct PodHandler {
    inner: Weak<Inner>,
}

#[async_trait::async_trait]
impl ResourceEventHandler<Pod> for PodHandler {
    async fn on_add(&self, pod: Arc<Pod>) {
        if let Some(i) = self.inner.upgrade() { i.on_add(&pod).await; }
    }

    async fn on_update(&self, pod: Arc<Pod>) {
        if let Some(i) = self.inner.upgrade() { i.on_update(&pod).await; }
    }

    async fn on_delete(&self, pod: Arc<Pod>) {
        if let Some(i) = self.inner.upgrade() { i.on_delete(pod).await; }
    }
}

impl Inner {
    async fn on_add(&self, pod: &Pod) {
        let _guard = self.cross_update.shared().await;
        counter!("provider_pod_events_total", 1u64, "kind" => "add");
        debug!(pod = %pod.name_any(), uid = pod_uid(pod), "pod added");
        self.emit_running(pod).await;
    }

    async fn on_update(&self, pod: &Pod) {
        let _guard = self.cross_update.shared().await;
        counter!("provider_pod_events_total", 1u64, "kind" => "update");
        self.unlocked_update(pod).await;
    }

    /// Update path without the cross-update lock; callers hold it.
    async fn unlocked_update(&self, pod: &Pod) {
        debug!(pod = %pod.name_any(), uid = pod_uid(pod), "pod updated");
        self.emit_running(pod).await;
    }

    async fn on_delete(self: &Arc<Self>, pod: Arc<Pod>) {
        let _guard = self.cross_update.shared().await;
        counter!("provider_pod_events_total", 1u64, "kind" => "delete");
        debug!(pod = %pod.name_any(), uid = pod_uid(&pod), "pod deleted");
        self.emit_stopped(&pod);
        self.schedule_cleanup(pod);
    }

    /// Repeat the removal once `cleanup_timeout` elapses, unless stopped first.
    fn schedule_cleanup(self: &Arc<Self>, pod: Arc<Pod>) {
        let weak = Arc::downgrade(self);
        let token = self.shutdown.clone();
        let delay = self.cleanup_timeout;
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    if let Some(inner) = weak.upgrade() {
                        debug!(uid = pod_uid(&pod), "deferred pod cleanup");
                        inner.emit_stopped(&pod);
                    }
                }
            }
        });
    }

    async fn emit_running(&self, pod: &Pod) {
        let ns_annotations = {
            let store = self.watchers.namespaces.as_ref().map(|w| w.store());
            pod_namespace_annotations(pod, store.as_deref())
        };
        let annotations = pod_annotations(pod);
        if let Some(data) = self.pod_data(pod, &ns_annotations, &annotations) {
            self.publish(data);
        }
        self.emit_containers(pod, &ns_annotations, &annotations).await;
    }

    async fn emit_containers(&self, pod: &Pod, ns_annotations: &Mapping, annotations: &Mapping) {
        let hints = match &self.hints {
            Some(cmd) if self.hints_enabled && has_hints(pod) => Some(cmd),
            None if self.hints_enabled && has_hints(pod) => {
                warn!(pod = %pod.name_any(), "pod requests hints but no fleet server is configured; publishing locally");
                None
            }
            _ => None,
        };
        for c in containers_in_pod(pod) {
            // Not created in the runtime yet; a later update brings the id.
            if c.id.is_empty() { continue; }
            // Hinted containers go to fleet as is; only registry entries need metadata.
            match hints {
                Some(cmd) => self.dispatch_hints(cmd, pod, &c).await,
                None => {
                    if let Some(data) = self.container_data(pod, &c, ns_annotations, annotations) {
                        self.publish(data);
                    }
                }
            }
        }
    }

    fn emit_stopped(&self, pod: &Pod) {
        let uid = pod_uid(pod);
        self.remove(&EventIdentity::pod(uid));
        for c in containers_in_pod(pod) {
            self.remove(&container_identity(uid, &c));
        }
    }

    fn publish(&self, data: DerivedMapping) {
        counter!("provider_registry_updates_total", 1u64);
        if let Err(e) = self.comm.add_or_update(&data.id, data.priority, data.mapping, data.processors) {
            warn!(id = %data.id, error = %e, "registry rejected entry");
        }
    }

    fn remove(&self, id: &EventIdentity) {
        counter!("provider_registry_removes_total", 1u64);
        self.comm.remove(id);
    }

    async fn dispatch_hints(&self, cmd: &HintsCmd, pod: &Pod, c: &ContainerInPod) {
        let req = hints_request(cmd.agent_info().agent_id(), pod, c);
        match cmd.execute(&self.shutdown, &req).await {
            Ok(_) => {
                counter!("provider_hints_dispatch_total", 1u64, "result" => "ok");
                debug!(pod = %pod.name_any(), container = %c.spec.name, "hints sent");
            }
            Err(e) => {
                counter!("provider_hints_dispatch_total", 1u64, "result" => "error");
                warn!(pod = %pod.name_any(), container = %c.spec.name, error = %e, "hints dispatch failed");
            }
        }
    }

    fn generate(&self, pod: &Pod, overrides: &[(&str, &str)]) -> Option<Mapping> {
        match self.metagen.generate(pod, overrides) {
            Ok(meta) => Some(meta),
            Err(e) => {
                warn!(pod = %pod.name_any(), error = %e, "metadata generation failed; skipping");
                None
            }
        }
    }

    fn pod_data(&self, pod: &Pod, ns_annotations: &Mapping, annotations: &Mapping) -> Option<DerivedMapping> {
        let meta = self.generate(pod, &[])?;
        let mut k8s = kubernetes_tree(&meta);
        k8s.remove("container");
        insert_annotations(&mut k8s, ns_annotations, annotations);
        k8s.insert("scope".into(), Value::String(self.scope.to_string()));
        Some(DerivedMapping {
            id: EventIdentity::pod(pod_uid(pod)),
            priority: POD_PRIORITY,
            mapping: k8s,
            processors: namespace_processors(&meta),
        })
    }

    fn container_data(
        &self,
        pod: &Pod,
        c: &ContainerInPod,
        ns_annotations: &Mapping,
        annotations: &Mapping,
    ) -> Option<DerivedMapping> {
        let meta = self.generate(pod, &[("container.name", c.spec.name.as_str())])?;
        let mut k8s = kubernetes_tree(&meta);
        insert_annotations(&mut k8s, ns_annotations, annotations);

        let image = c.spec.image.clone().unwrap_or_default();
        let mut container = json!({"id": c.id, "name": c.spec.name, "image": image, "runtime": c.runtime});
        if let Some(port) = last_port(c) {
            container["port"] = Value::String(port.container_port.to_string());
            if let Some(name) = &port.name {
                container["port_name"] = Value::String(name.clone());
            }
        }
        k8s.insert("container".into(), container);

        let mut processors = Processors::new();
        processors.push(Processor::add_fields(
            "container",
            json!({"id": c.id, "runtime": c.runtime, "image": {"name": image}}),
        ));
        processors.extend(namespace_processors(&meta));
        Some(DerivedMapping {
            id: container_identity(pod_uid(pod), c),
            priority: CONTAINER_PRIORITY,
            mapping: k8s,
            processors,
        })
    }
}

fn pod_uid(pod: &Pod) -> &str { pod.metadata.uid.as_deref().unwrap_or_default() }

/// Keyed by spec name on both publish and removal.
fn container_identity(uid: &str, c: &ContainerInPod) -> EventIdentity { EventIdentity::container(uid, &c.spec.name) }

fn has_hints(pod: &Pod) -> bool {
    pod.metadata.annotations.as_ref().is_some_and(|a| a.contains_key(HINTS_ANNOTATION))
}

/// Pod annotations as a dotted-key tree without the `kubectl` subtree.
fn pod_annotations(pod: &Pod) -> Mapping {
    let mut out = Mapping::new();
    for (k, v) in pod.metadata.annotations.iter().flatten() {
        safe_put(&mut out, k, Value::String(v.clone()));
    }
    out.remove("kubectl");
    out
}

fn insert_annotations(k8s: &mut Mapping, ns_annotations: &Mapping, annotations: &Mapping) {
    if !ns_annotations.is_empty() {
        k8s.insert("namespace_annotations".into(), Value::Object(ns_annotations.clone()));
    }
    if !annotations.is_empty() {
        k8s.insert("annotations".into(), Value::Object(annotations.clone()));
    }
}

fn kubernetes_tree(meta: &Mapping) -> Mapping {
    meta.get(KUBERNETES).and_then(Value::as_object).cloned().unwrap_or_default()
}

/// One `add_fields` per generated top-level namespace.
fn namespace_processors(meta: &Mapping) -> Processors {
    meta.iter().map(|(ns, tree)| Processor::add_fields(ns.clone(), tree.clone())).collect()
}

/// The last declared port wins.
fn last_port(c: &ContainerInPod) -> Option<&ContainerPort> { c.spec.ports.as_deref().and_then(|p| p.last()) }

fn hints_request(agent_id: &str, pod: &Pod, c: &ContainerInPod) -> HintsRequest {
    let port = last_port(c);
    HintsRequest {
        agent_id: agent_id.to_string(),
        event_type: HINTS_EVENT_START.to_string(),
        kubernetes: HintsKubernetes {
            container: HintsContainer {
                id: c.id.clone(),
                image: c.spec.image.clone().unwrap_or_default(),
                name: c.spec.name.clone(),
                port: port.map(|p| p.container_port.to_string()).unwrap_or_default(),
                port_name: port.and_then(|p| p.name.clone()).unwrap_or_default(),
                runtime: c.runtime.clone(),
            },
            namespace: pod.metadata.namespace.clone().unwrap_or_default(),
            annotations: pod
                .metadata
                .annotations
                .iter()
                .flatten()
                .filter(|(k, _)| !k.starts_with("kubectl.kubernetes.io/"))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            labels: pod.metadata.labels.clone().unwrap_or_default(),
            pod: HintsPod {
                ip: pod.status.as_ref().and_then(|s| s.pod_ip.clone()).unwrap_or_default(),
                name: pod.name_any(),
                uid: pod_uid(pod).to_string(),
            },
        },
    }
}
