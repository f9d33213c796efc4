#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use autodisco_core::{EventIdentity, Mapping, Processors, ProviderComm, RegistryError};
use autodisco_fleet::{AgentInfo, HintsCmd, HintsRequest, SendError, Sender};
use autodisco_kubehub::{object_key, CacheStore, ResourceEventHandler, Store, WatchError, Watcher};
use autodisco_provider::{BasicPodMetaGen, Config, MetaGen, MetaGenError, PodEventer, PodWatchers};
use autodisco_store::MemoryRegistry;
use bytes::Bytes;
use http::{HeaderMap, Method, Response};
use k8s_openapi::api::core::v1::{Container, ContainerStatus, Namespace, Node, Pod, PodSpec, PodStatus};
use kube::api::ObjectMeta;
use kube::Resource;

pub type Log = Arc<Mutex<Vec<String>>>;

tokio::task_local! {
    /// Tags metadata generation with the callback that triggered it.
    pub static ORIGIN: &'static str;
}

/// In-memory watcher; tests push events through it by hand.
pub struct FakeWatcher<K: Resource + Send + Sync + 'static> {
    name: &'static str,
    store: Arc<CacheStore<K>>,
    handlers: Mutex<Vec<Arc<dyn ResourceEventHandler<K>>>>,
    fail_start: bool,
    log: Log,
}

impl<K: Resource + Send + Sync + 'static> FakeWatcher<K> {
    pub fn new(name: &'static str, log: &Log) -> Arc<Self> {
        Arc::new(Self { name, store: Arc::new(CacheStore::new()), handlers: Mutex::new(Vec::new()), fail_start: false, log: Arc::clone(log) })
    }

    pub fn failing(name: &'static str, log: &Log) -> Arc<Self> {
        Arc::new(Self { name, store: Arc::new(CacheStore::new()), handlers: Mutex::new(Vec::new()), fail_start: true, log: Arc::clone(log) })
    }

    fn handlers(&self) -> Vec<Arc<dyn ResourceEventHandler<K>>> { self.handlers.lock().unwrap().clone() }

    /// Put an object in the cache without notifying anyone.
    pub fn seed(&self, obj: K) { self.store.insert(Arc::new(obj)); }

    pub async fn add(&self, obj: K) {
        let o = Arc::new(obj);
        self.store.insert(Arc::clone(&o));
        for h in self.handlers() { h.on_add(Arc::clone(&o)).await; }
    }

    pub async fn update(&self, obj: K) {
        let o = Arc::new(obj);
        self.store.insert(Arc::clone(&o));
        for h in self.handlers() { h.on_update(Arc::clone(&o)).await; }
    }

    pub async fn delete(&self, obj: K) {
        self.store.remove(&object_key(&obj));
        let o = Arc::new(obj);
        for h in self.handlers() { h.on_delete(Arc::clone(&o)).await; }
    }
}

#[async_trait::async_trait]
impl<K: Resource + Send + Sync + 'static> Watcher<K> for FakeWatcher<K> {
    async fn start(&self) -> Result<(), WatchError> {
        self.log.lock().unwrap().push(format!("start:{}", self.name));
        if self.fail_start {
            return Err(WatchError::Stopped { name: self.name.to_string() });
        }
        Ok(())
    }

    fn stop(&self) { self.log.lock().unwrap().push(format!("stop:{}", self.name)); }

    fn add_event_handler(&self, handler: Arc<dyn ResourceEventHandler<K>>) { self.handlers.lock().unwrap().push(handler); }

    fn store(&self) -> Arc<dyn Store<K>> { self.store.clone() }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Add(String, i32),
    Remove(String),
}

/// [`MemoryRegistry`] that also records every call.
#[derive(Default)]
pub struct RecordingComm {
    pub registry: MemoryRegistry,
    calls: Mutex<Vec<Call>>,
}

impl RecordingComm {
    pub fn calls(&self) -> Vec<Call> { self.calls.lock().unwrap().clone() }

    pub fn clear(&self) { self.calls.lock().unwrap().clear(); }

    pub fn ids(&self) -> Vec<String> { self.registry.current().ids().into_iter().map(str::to_string).collect() }

    pub fn adds(&self) -> Vec<String> {
        self.calls().into_iter().filter_map(|c| match c { Call::Add(id, _) => Some(id), _ => None }).collect()
    }

    pub fn removes(&self, id: &str) -> usize {
        self.calls().iter().filter(|c| matches!(c, Call::Remove(r) if r == id)).count()
    }
}

impl ProviderComm for RecordingComm {
    fn add_or_update(&self, id: &EventIdentity, priority: i32, mapping: Mapping, processors: Processors) -> Result<(), RegistryError> {
        self.calls.lock().unwrap().push(Call::Add(id.to_string(), priority));
        self.registry.add_or_update(id, priority, mapping, processors)
    }

    fn remove(&self, id: &EventIdentity) {
        self.calls.lock().unwrap().push(Call::Remove(id.to_string()));
        self.registry.remove(id);
    }
}

/// Wraps [`BasicPodMetaGen`] with a blocking delay, a begin/end log tagged by
/// [`ORIGIN`], and an optional container that always fails.
pub struct TestMetaGen {
    pub inner: BasicPodMetaGen,
    pub delay: Duration,
    pub fail_container: Option<&'static str>,
    pub log: Log,
}

impl TestMetaGen {
    pub fn slow(delay: Duration, log: &Log) -> Arc<Self> {
        Arc::new(Self { inner: BasicPodMetaGen::default(), delay, fail_container: None, log: Arc::clone(log) })
    }

    pub fn failing_for(container: &'static str) -> Arc<Self> {
        Arc::new(Self { inner: BasicPodMetaGen::default(), delay: Duration::ZERO, fail_container: Some(container), log: Log::default() })
    }
}

impl MetaGen for TestMetaGen {
    fn generate(&self, pod: &Pod, overrides: &[(&str, &str)]) -> Result<Mapping, MetaGenError> {
        if let Some(bad) = self.fail_container {
            if overrides.iter().any(|(k, v)| *k == "container.name" && *v == bad) {
                return Err(MetaGenError::Other(format!("no metadata for {bad}")));
            }
        }
        let origin = ORIGIN.try_with(|o| *o).unwrap_or("?");
        self.log.lock().unwrap().push(format!("begin:{origin}"));
        if !self.delay.is_zero() { std::thread::sleep(self.delay); }
        self.log.lock().unwrap().push(format!("end:{origin}"));
        self.inner.generate(pod, overrides)
    }
}

/// Fleet sender answering every request with a fixed status and body.
pub struct FakeSender {
    status: u16,
    body: &'static str,
    pub requests: Mutex<Vec<(String, HintsRequest)>>,
}

impl FakeSender {
    pub fn created() -> Arc<Self> { Self::status(200, r#"{"action":"created"}"#) }

    pub fn status(status: u16, body: &'static str) -> Arc<Self> {
        Arc::new(Self { status, body, requests: Mutex::new(Vec::new()) })
    }

    pub fn requests(&self) -> Vec<(String, HintsRequest)> { self.requests.lock().unwrap().clone() }
}

#[async_trait::async_trait]
impl Sender for FakeSender {
    async fn send(
        &self,
        _method: Method,
        path: &str,
        _params: &[(String, String)],
        _headers: Option<HeaderMap>,
        body: Bytes,
    ) -> Result<Response<Bytes>, SendError> {
        let req: HintsRequest = serde_json::from_slice(&body).expect("hints body");
        self.requests.lock().unwrap().push((path.to_string(), req));
        Ok(Response::builder().status(self.status).body(Bytes::from_static(self.body.as_bytes())).unwrap())
    }

    fn uri(&self) -> String { "http://fake".into() }
}

pub fn hints_cmd(sender: &Arc<FakeSender>) -> HintsCmd { HintsCmd::new(AgentInfo::new("agent-1"), sender.clone()) }

pub struct Harness {
    pub eventer: PodEventer,
    pub pods: Arc<FakeWatcher<Pod>>,
    pub nodes: Arc<FakeWatcher<Node>>,
    pub namespaces: Arc<FakeWatcher<Namespace>>,
    pub comm: Arc<RecordingComm>,
    pub log: Log,
}

pub fn test_config() -> Config { Config { node: Some("node-a".into()), cleanup_timeout: Duration::from_secs(5), ..Default::default() } }

pub fn harness_with(cfg: &Config, metagen: Option<Arc<dyn MetaGen>>, hints: Option<HintsCmd>, log: &Log) -> Harness {
    let pods = FakeWatcher::<Pod>::new("pod", log);
    let nodes = FakeWatcher::<Node>::new("node", log);
    let namespaces = FakeWatcher::<Namespace>::new("namespace", log);
    let comm = Arc::new(RecordingComm::default());
    let metagen = metagen
        .unwrap_or_else(|| Arc::new(BasicPodMetaGen::new(Some(nodes.store()), Some(namespaces.store()))) as Arc<dyn MetaGen>);
    let (pod_w, node_w, ns_w): (Arc<dyn Watcher<Pod>>, Arc<dyn Watcher<Node>>, Arc<dyn Watcher<Namespace>>) =
        (pods.clone(), nodes.clone(), namespaces.clone());
    let watchers = PodWatchers { pods: pod_w, nodes: Some(node_w), namespaces: Some(ns_w) };
    let eventer = PodEventer::new(cfg, comm.clone(), watchers, metagen, hints);
    Harness { eventer, pods, nodes, namespaces, comm, log: Arc::clone(log) }
}

pub fn harness() -> Harness { harness_with(&test_config(), None, None, &Log::default()) }

fn container(name: &str) -> Container { Container { name: name.into(), image: Some(format!("{name}:1.0")), ..Default::default() } }

fn status(name: &str, id: &str) -> ContainerStatus {
    ContainerStatus { name: name.into(), container_id: Some(format!("containerd://{id}")), ..Default::default() }
}

/// Running pod with one init container (`init1`) and one container (`app`).
pub fn pod(name: &str, uid: &str, node: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.into()),
            namespace: Some("default".into()),
            uid: Some(uid.into()),
            labels: Some(BTreeMap::from([("app".to_string(), name.to_string())])),
            ..Default::default()
        },
        spec: Some(PodSpec {
            node_name: Some(node.into()),
            init_containers: Some(vec![container("init1")]),
            containers: vec![container("app")],
            ..Default::default()
        }),
        status: Some(PodStatus {
            pod_ip: Some("10.0.0.7".into()),
            init_container_statuses: Some(vec![status("init1", &format!("{uid}-init1"))]),
            container_statuses: Some(vec![status("app", &format!("{uid}-app"))]),
            ..Default::default()
        }),
    }
}

/// Pod with a single container and no init containers.
pub fn simple_pod(name: &str, uid: &str, node: &str) -> Pod {
    let mut p = pod(name, uid, node);
    if let Some(spec) = p.spec.as_mut() { spec.init_containers = None; }
    if let Some(st) = p.status.as_mut() { st.init_container_statuses = None; }
    p
}

pub fn annotate(mut pod: Pod, key: &str, value: &str) -> Pod {
    pod.metadata.annotations.get_or_insert_with(BTreeMap::new).insert(key.to_string(), value.to_string());
    pod
}

pub fn node(name: &str) -> Node {
    Node { metadata: ObjectMeta { name: Some(name.into()), ..Default::default() }, ..Default::default() }
}

pub fn namespace(name: &str, annotations: &[(&str, &str)]) -> Namespace {
    Namespace {
        metadata: ObjectMeta {
            name: Some(name.into()),
            annotations: Some(annotations.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()),
            ..Default::default()
        },
        ..Default::default()
    }
}
