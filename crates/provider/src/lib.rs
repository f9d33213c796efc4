//! autodisco provider: kubernetes pod autodiscovery.
//!
//! [`PodEventer`] watches pods (plus their nodes and namespaces) and keeps a
//! [`ProviderComm`] registry in sync with what runs, or hands pods carrying
//! the hints annotation to the fleet hints endpoint. [`new_pod_eventer`]
//! builds one against a live cluster.

#![forbid(unsafe_code)]

use std::sync::Arc;

use k8s_openapi::api::core::v1::{Namespace, Node, Pod};
use kube::Api;
use tracing::{info, warn};

use autodisco_core::ProviderComm;
use autodisco_fleet::{AgentInfo, ClientOptions, FleetClient, FleetError, HintsCmd};
use autodisco_kubehub::{KubeWatcher, WatchError, WatchOptions, Watcher};

pub mod config;
pub mod metagen;
mod pod;

pub use config::{AddResourceMetadata, Config, ConfigError, Enabled, FleetConfig, HintsConfig, Scope};
pub use metagen::{BasicPodMetaGen, MetaGen, MetaGenError};
pub use pod::{PodEventer, PodWatchers, HINTS_ANNOTATION};

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error(transparent)]
    Watch(#[from] WatchError),
    #[error("fleet client: {0}")]
    Fleet(#[from] FleetError),
}

/// Hints command for the configured fleet server. A missing agent id gets a
/// generated one.
pub fn hints_cmd(cfg: &FleetConfig) -> Result<HintsCmd, FleetError> {
    let opts = ClientOptions { api_key: cfg.api_key.clone(), proxy_disable: cfg.proxy_disable };
    let client = FleetClient::new(&cfg.url, &opts).map_err(FleetError::Send)?;
    let info = match cfg.agent_id.as_deref().filter(|id| !id.is_empty()) {
        Some(id) => AgentInfo::new(id),
        None => {
            let info = AgentInfo::generate();
            info!(agent_id = info.agent_id(), "no agent id configured; generated one");
            info
        }
    };
    Ok(HintsCmd::new(info, Arc::new(client)))
}

/// Per-watcher options. Only the pod watcher replays its cache on resync;
/// node and namespace replays would recompute every pod for nothing.
struct WatchPlan {
    pods: WatchOptions,
    nodes: WatchOptions,
    namespaces: WatchOptions,
}

fn watch_plan(cfg: &Config, node: Option<&str>) -> WatchPlan {
    let opts = |field_selector: Option<String>, honor_resyncs: bool| WatchOptions {
        sync_timeout: cfg.sync_period,
        field_selector,
        label_selector: None,
        honor_resyncs,
    };
    WatchPlan {
        pods: opts(node.map(|n| format!("spec.nodeName={}", n)), true),
        nodes: opts(node.map(|n| format!("metadata.name={}", n)), false),
        namespaces: opts(cfg.namespace.as_ref().map(|ns| format!("metadata.name={}", ns)), false),
    }
}

/// Build a pod eventer over kube watchers. Only the pod watcher is required;
/// node and namespace watchers that cannot be built are skipped. Namespace
/// annotations always come from the namespace watcher; `add_resource_metadata`
/// gates the metadata enrichment and the cross-updates.
pub fn new_pod_eventer(
    client: kube::Client,
    cfg: &Config,
    comm: Arc<dyn ProviderComm>,
) -> Result<PodEventer, ProviderError> {
    let node = cfg.effective_node();
    let plan = watch_plan(cfg, node.as_deref());

    let pod_api: Api<Pod> = match cfg.namespace.as_deref() {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    };
    let pods: Arc<dyn Watcher<Pod>> = Arc::new(KubeWatcher::new("pod", pod_api, plan.pods)?);

    let nodes = match KubeWatcher::<Node>::new("node", Api::all(client.clone()), plan.nodes) {
        Ok(w) => Some(Arc::new(w) as Arc<dyn Watcher<Node>>),
        Err(e) => {
            warn!(error = %e, "couldn't create node watcher; continuing without node metadata");
            None
        }
    };
    let namespaces = match KubeWatcher::<Namespace>::new("namespace", Api::all(client), plan.namespaces) {
        Ok(w) => Some(Arc::new(w) as Arc<dyn Watcher<Namespace>>),
        Err(e) => {
            warn!(error = %e, "couldn't create namespace watcher; continuing without namespace metadata");
            None
        }
    };

    let metadata = &cfg.add_resource_metadata;
    let metagen = Arc::new(BasicPodMetaGen::new(
        nodes.as_ref().filter(|_| metadata.node.enabled).map(|w| w.store()),
        namespaces.as_ref().filter(|_| metadata.namespace.enabled).map(|w| w.store()),
    ));
    let hints = match (&cfg.fleet, cfg.hints.enabled) {
        (Some(fleet), true) => Some(hints_cmd(fleet)?),
        _ => None,
    };
    Ok(PodEventer::new(cfg, comm, PodWatchers { pods, nodes, namespaces }, metagen, hints))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_the_pod_watcher_honors_resyncs() {
        let cfg = Config { namespace: Some("prod".into()), ..Default::default() };
        let plan = watch_plan(&cfg, Some("node-a"));
        assert!(plan.pods.honor_resyncs);
        assert!(!plan.nodes.honor_resyncs);
        assert!(!plan.namespaces.honor_resyncs);
        assert_eq!(plan.pods.field_selector.as_deref(), Some("spec.nodeName=node-a"));
        assert_eq!(plan.nodes.field_selector.as_deref(), Some("metadata.name=node-a"));
        assert_eq!(plan.namespaces.field_selector.as_deref(), Some("metadata.name=prod"));
        assert_eq!(plan.pods.sync_timeout, cfg.sync_period);
    }

    #[test]
    fn cluster_scope_watches_without_node_selectors() {
        let plan = watch_plan(&Config::default(), None);
        assert!(plan.pods.field_selector.is_none());
        assert!(plan.nodes.field_selector.is_none());
        assert!(plan.namespaces.field_selector.is_none());
    }

    #[test]
    fn hints_cmd_keeps_configured_agent_id() {
        let cfg = FleetConfig { url: "https://fleet.example:8220".into(), agent_id: Some("agent-7".into()), ..Default::default() };
        assert_eq!(hints_cmd(&cfg).expect("cmd").agent_info().agent_id(), "agent-7");
    }

    #[test]
    fn hints_cmd_generates_missing_agent_id() {
        let cfg = FleetConfig { url: "https://fleet.example:8220".into(), ..Default::default() };
        assert!(!hints_cmd(&cfg).expect("cmd").agent_info().agent_id().is_empty());
    }
}
