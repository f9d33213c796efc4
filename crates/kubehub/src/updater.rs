//! Cross-resource updates: node/namespace changes recompute metadata of the
//! pods that reference them.

use std::marker::PhantomData;
use std::sync::Arc;

use futures::future::BoxFuture;
use k8s_openapi::api::core::v1::{Namespace, Node, Pod};
use kube::{Resource, ResourceExt};
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

use crate::store::Store;
use crate::ResourceEventHandler;

/// Serializes cross-resource recomputation against pod-originated emits.
///
/// Pod callbacks take it shared and run concurrently with each other. Node and
/// namespace updaters take it exclusive, so no pod emit ever observes a
/// half-applied node/namespace change. Never acquire it twice on one path.
#[derive(Debug, Default)]
pub struct CrossUpdateLock {
    inner: RwLock<()>,
}

impl CrossUpdateLock {
    pub fn new() -> Self { Self::default() }

    pub async fn shared(&self) -> RwLockReadGuard<'_, ()> { self.inner.read().await }

    pub async fn exclusive(&self) -> RwLockWriteGuard<'_, ()> { self.inner.write().await }
}

/// Callback re-running the pod update path without taking the lock.
pub type PodUpdateFn = Arc<dyn Fn(Arc<Pod>) -> BoxFuture<'static, ()> + Send + Sync>;

/// A resource whose changes affect derived metadata of some pods.
pub trait AffectsPods: Send + Sync + 'static {
    const KIND: &'static str;
    fn affects(&self, pod: &Pod) -> bool;
}

impl AffectsPods for Node {
    const KIND: &'static str = "node";
    fn affects(&self, pod: &Pod) -> bool {
        let node = self.name_any();
        pod.spec.as_ref().and_then(|s| s.node_name.as_deref()) == Some(node.as_str())
    }
}

impl AffectsPods for Namespace {
    const KIND: &'static str = "namespace";
    fn affects(&self, pod: &Pod) -> bool {
        pod.metadata.namespace.as_deref() == Some(self.name_any().as_str())
    }
}

/// Handler for node/namespace watchers. Only updates trigger work: added
/// resources have no pods yet and deleted ones take their pods with them.
pub struct PodUpdater<R> {
    handler: PodUpdateFn,
    store: Arc<dyn Store<Pod>>,
    locker: Arc<CrossUpdateLock>,
    _kind: PhantomData<fn(R)>,
}

pub type NodePodUpdater = PodUpdater<Node>;
pub type NamespacePodUpdater = PodUpdater<Namespace>;

impl<R: AffectsPods> PodUpdater<R> {
    pub fn new(handler: PodUpdateFn, store: Arc<dyn Store<Pod>>, locker: Arc<CrossUpdateLock>) -> Self {
        Self { handler, store, locker, _kind: PhantomData }
    }
}

#[async_trait::async_trait]
impl<R: AffectsPods + Resource> ResourceEventHandler<R> for PodUpdater<R> {
    async fn on_add(&self, _obj: Arc<R>) {}

    async fn on_update(&self, obj: Arc<R>) {
        let _guard = self.locker.exclusive().await;
        let pods: Vec<_> = self.store.list().into_iter().filter(|p| obj.affects(p)).collect();
        debug!(kind = R::KIND, name = %obj.name_any(), pods = pods.len(), "cross update");
        for pod in pods {
            (self.handler)(pod).await;
        }
    }

    async fn on_delete(&self, _obj: Arc<R>) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CacheStore;
    use futures::FutureExt;
    use k8s_openapi::api::core::v1::PodSpec;
    use kube::api::ObjectMeta;
    use std::sync::Mutex;

    fn pod(ns: &str, name: &str, node: &str) -> Arc<Pod> {
        Arc::new(Pod {
            metadata: ObjectMeta { name: Some(name.into()), namespace: Some(ns.into()), ..Default::default() },
            spec: Some(PodSpec { node_name: Some(node.into()), ..Default::default() }),
            ..Default::default()
        })
    }

    fn recorder() -> (PodUpdateFn, Arc<Mutex<Vec<String>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        let f: PodUpdateFn = Arc::new(move |p: Arc<Pod>| {
            let s = Arc::clone(&s);
            async move { s.lock().unwrap().push(p.name_any()); }.boxed()
        });
        (f, seen)
    }

    fn store() -> Arc<CacheStore<Pod>> {
        let st = Arc::new(CacheStore::new());
        st.insert(pod("default", "a", "n1"));
        st.insert(pod("default", "b", "n2"));
        st.insert(pod("prod", "c", "n1"));
        st
    }

    #[tokio::test]
    async fn node_update_touches_pods_on_that_node() {
        let (f, seen) = recorder();
        let up = NodePodUpdater::new(f, store(), Arc::new(CrossUpdateLock::new()));
        let node = Arc::new(Node { metadata: ObjectMeta { name: Some("n1".into()), ..Default::default() }, ..Default::default() });
        up.on_add(Arc::clone(&node)).await;
        assert!(seen.lock().unwrap().is_empty());
        up.on_update(node).await;
        let mut got = seen.lock().unwrap().clone();
        got.sort();
        assert_eq!(got, vec!["a", "c"]);
    }

    #[tokio::test]
    async fn namespace_update_touches_pods_in_namespace() {
        let (f, seen) = recorder();
        let up = NamespacePodUpdater::new(f, store(), Arc::new(CrossUpdateLock::new()));
        let ns = Arc::new(Namespace { metadata: ObjectMeta { name: Some("prod".into()), ..Default::default() }, ..Default::default() });
        up.on_update(Arc::clone(&ns)).await;
        up.on_delete(ns).await;
        assert_eq!(*seen.lock().unwrap(), vec!["c"]);
    }

    #[tokio::test]
    async fn update_waits_for_shared_holders() {
        let (f, seen) = recorder();
        let lock = Arc::new(CrossUpdateLock::new());
        let up = Arc::new(NodePodUpdater::new(f, store(), Arc::clone(&lock)));
        let guard = lock.shared().await;
        let node = Arc::new(Node { metadata: ObjectMeta { name: Some("n2".into()), ..Default::default() }, ..Default::default() });
        let task = tokio::spawn({
            let up = Arc::clone(&up);
            async move { up.on_update(node).await }
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(seen.lock().unwrap().is_empty());
        drop(guard);
        task.await.expect("join");
        assert_eq!(*seen.lock().unwrap(), vec!["b"]);
    }
}
