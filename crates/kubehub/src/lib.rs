//! autodisco kubehub – watch primitive and cross-resource wiring.
//!
//! A [`Watcher`] keeps a local cache of one resource kind and fans add/update/delete
//! callbacks out to registered [`ResourceEventHandler`]s. [`KubeWatcher`] is the
//! kube-rs backed implementation; tests substitute their own.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

mod pod;
mod store;
mod updater;
mod watcher;

pub use pod::{containers_in_pod, pod_namespace_annotations, ContainerInPod};
pub use store::{object_key, CacheStore, Store};
pub use updater::{AffectsPods, CrossUpdateLock, NamespacePodUpdater, NodePodUpdater, PodUpdateFn, PodUpdater};
pub use watcher::KubeWatcher;

/// Errors surfaced by watcher construction and start.
#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    #[error("watcher '{name}': invalid selector '{selector}'")]
    InvalidSelector { name: String, selector: String },
    #[error("watcher '{name}': initial list failed")]
    InitialList {
        name: String,
        #[source]
        source: kube::runtime::watcher::Error,
    },
    #[error("watcher '{name}': cache not synced within {timeout:?}")]
    SyncTimeout { name: String, timeout: Duration },
    #[error("watcher '{name}': stopped before initial sync")]
    Stopped { name: String },
}

/// Scoping and timing options for a watcher.
#[derive(Debug, Clone)]
pub struct WatchOptions {
    /// Upper bound for the initial list in [`Watcher::start`].
    pub sync_timeout: Duration,
    /// Field selector, e.g. `spec.nodeName=node-a`.
    pub field_selector: Option<String>,
    pub label_selector: Option<String>,
    /// Re-deliver every cached object as an update each `sync_timeout`.
    pub honor_resyncs: bool,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self { sync_timeout: Duration::from_secs(600), field_selector: None, label_selector: None, honor_resyncs: false }
    }
}

/// Callbacks for one watched resource kind.
#[async_trait::async_trait]
pub trait ResourceEventHandler<K: Send + Sync + 'static>: Send + Sync {
    async fn on_add(&self, obj: Arc<K>);
    async fn on_update(&self, obj: Arc<K>);
    async fn on_delete(&self, obj: Arc<K>);
}

/// Watch subscription for one resource kind.
#[async_trait::async_trait]
pub trait Watcher<K: Send + Sync + 'static>: Send + Sync {
    /// Begin watching; resolves once the local cache holds the initial list.
    async fn start(&self) -> Result<(), WatchError>;

    /// Stop watching. Best-effort and idempotent.
    fn stop(&self);

    fn add_event_handler(&self, handler: Arc<dyn ResourceEventHandler<K>>);

    /// Local cache of the watched objects.
    fn store(&self) -> Arc<dyn Store<K>>;
}
