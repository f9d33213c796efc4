//! kube-rs backed [`Watcher`]: list+watch into a local cache, fan out callbacks.

use std::collections::HashSet;
use std::fmt::Debug;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use futures::{Stream, StreamExt};
use kube::{
    api::Api,
    runtime::{
        watcher::{self, Event},
        WatchStreamExt,
    },
    Resource,
};
use metrics::counter;
use serde::de::DeserializeOwned;
use tokio::{sync::oneshot, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::store::{object_key, CacheStore, Store};
use crate::{ResourceEventHandler, WatchError, WatchOptions, Watcher};

type HandlerList<K> = Arc<RwLock<Vec<Arc<dyn ResourceEventHandler<K>>>>>;

#[derive(Debug, Clone, Copy)]
enum Notify {
    Add,
    Update,
    Delete,
}

impl Notify {
    fn as_str(self) -> &'static str {
        match self {
            Notify::Add => "add",
            Notify::Update => "update",
            Notify::Delete => "delete",
        }
    }
}

/// Named list+watch over one resource kind.
///
/// A stopped watcher cannot be restarted.
pub struct KubeWatcher<K: Send + Sync + 'static> {
    name: String,
    api: Api<K>,
    options: WatchOptions,
    store: Arc<CacheStore<K>>,
    handlers: HandlerList<K>,
    task: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl<K> KubeWatcher<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    /// Create a watcher. Namespace scoping is carried by `api`
    /// (`Api::namespaced` vs `Api::all`), the rest by `options`.
    pub fn new(name: &str, api: Api<K>, options: WatchOptions) -> Result<Self, WatchError> {
        for sel in [&options.field_selector, &options.label_selector].into_iter().flatten() {
            if !selector_is_valid(sel) {
                return Err(WatchError::InvalidSelector { name: name.to_string(), selector: sel.clone() });
            }
        }
        Ok(Self {
            name: name.to_string(),
            api,
            options,
            store: Arc::new(CacheStore::new()),
            handlers: Arc::new(RwLock::new(Vec::new())),
            task: Mutex::new(None),
            cancel: CancellationToken::new(),
        })
    }

    fn watcher_config(&self) -> watcher::Config {
        let mut cfg = watcher::Config::default();
        if let Some(f) = &self.options.field_selector { cfg = cfg.fields(f); }
        if let Some(l) = &self.options.label_selector { cfg = cfg.labels(l); }
        cfg
    }
}

/// Accepts comma-separated `key=value`, `key==value` and `key!=value` terms.
fn selector_is_valid(sel: &str) -> bool {
    !sel.is_empty()
        && sel.split(',').all(|term| {
            let key = term.split("!=").next().and_then(|k| k.split('=').next()).unwrap_or("");
            term.contains('=') && !key.trim().is_empty()
        })
}

#[async_trait::async_trait]
impl<K> Watcher<K> for KubeWatcher<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    async fn start(&self) -> Result<(), WatchError> {
        {
            let task = self.task.lock().unwrap_or_else(|p| p.into_inner());
            if task.as_ref().is_some_and(|t| !t.is_finished()) {
                return Ok(());
            }
        }
        let (init_tx, init_rx) = oneshot::channel();
        let handle = tokio::spawn(run_watch(
            self.name.clone(),
            self.api.clone(),
            self.watcher_config(),
            self.options.clone(),
            Arc::clone(&self.store),
            Arc::clone(&self.handlers),
            self.cancel.clone(),
            init_tx,
        ));
        *self.task.lock().unwrap_or_else(|p| p.into_inner()) = Some(handle);

        let res = await_init(&self.name, self.options.sync_timeout, init_rx).await;
        if res.is_err() {
            if let Some(t) = self.task.lock().unwrap_or_else(|p| p.into_inner()).take() { t.abort(); }
        } else {
            info!(watcher = %self.name, cached = self.store.len(), "watcher synced");
        }
        res
    }

    fn stop(&self) {
        self.cancel.cancel();
        if let Some(t) = self.task.lock().unwrap_or_else(|p| p.into_inner()).take() {
            t.abort();
            debug!(watcher = %self.name, "watcher stopped");
        }
    }

    fn add_event_handler(&self, handler: Arc<dyn ResourceEventHandler<K>>) {
        self.handlers.write().unwrap_or_else(|p| p.into_inner()).push(handler);
    }

    fn store(&self) -> Arc<dyn Store<K>> { self.store.clone() }
}

type InitTx = oneshot::Sender<Result<(), watcher::Error>>;

/// Wait for the watch loop to report its initial list.
async fn await_init(
    name: &str,
    timeout: Duration,
    init_rx: oneshot::Receiver<Result<(), watcher::Error>>,
) -> Result<(), WatchError> {
    match tokio::time::timeout(timeout, init_rx).await {
        Ok(Ok(Ok(()))) => Ok(()),
        Ok(Ok(Err(source))) => Err(WatchError::InitialList { name: name.to_string(), source }),
        Ok(Err(_)) => Err(WatchError::Stopped { name: name.to_string() }),
        Err(_) => Err(WatchError::SyncTimeout { name: name.to_string(), timeout }),
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_watch<K>(
    name: String,
    api: Api<K>,
    cfg: watcher::Config,
    options: WatchOptions,
    store: Arc<CacheStore<K>>,
    handlers: HandlerList<K>,
    cancel: CancellationToken,
    init_tx: InitTx,
) where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    let stream = watcher::watcher(api, cfg).default_backoff();
    drive(&name, stream, &options, &store, &handlers, &cancel, init_tx).await;
}

/// Feed watch events into the cache and handlers until cancelled or the
/// stream ends. Resyncs start only after the initial list.
async fn drive<K, S>(
    name: &str,
    stream: S,
    options: &WatchOptions,
    store: &CacheStore<K>,
    handlers: &HandlerList<K>,
    cancel: &CancellationToken,
    init_tx: InitTx,
) where
    K: Resource + Send + Sync + 'static,
    S: Stream<Item = Result<Event<K>, watcher::Error>>,
{
    futures::pin_mut!(stream);
    let mut init_tx = Some(init_tx);
    let mut resync = tokio::time::interval(options.sync_timeout.max(Duration::from_secs(1)));
    resync.tick().await;
    info!(watcher = %name, "watcher started");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = resync.tick(), if options.honor_resyncs && init_tx.is_none() => {
                let items = store.list();
                debug!(watcher = %name, count = items.len(), "resync");
                for o in items {
                    notify(name, handlers, Notify::Update, o).await;
                }
            }
            ev = stream.next() => match ev {
                Some(Ok(ev)) => {
                    if apply_event(name, store, handlers, ev).await {
                        if let Some(tx) = init_tx.take() { let _ = tx.send(Ok(())); }
                    }
                }
                Some(Err(e)) => {
                    if let Some(tx) = init_tx.take() {
                        let _ = tx.send(Err(e));
                        break;
                    }
                    warn!(watcher = %name, error = %e, "watch error; retrying with backoff");
                }
                None => break,
            }
        }
    }
    warn!(watcher = %name, "watcher stream ended");
}

/// Apply one event to the cache and notify handlers. Returns true for a
/// full relist.
async fn apply_event<K>(name: &str, store: &CacheStore<K>, handlers: &HandlerList<K>, ev: Event<K>) -> bool
where
    K: Resource + Send + Sync + 'static,
{
    match ev {
        Event::Applied(o) => {
            let o = Arc::new(o);
            let kind = if store.insert(Arc::clone(&o)).is_some() { Notify::Update } else { Notify::Add };
            notify(name, handlers, kind, o).await;
            false
        }
        Event::Deleted(o) => {
            store.remove(&object_key(&o));
            notify(name, handlers, Notify::Delete, Arc::new(o)).await;
            false
        }
        Event::Restarted(list) => {
            debug!(watcher = %name, count = list.len(), "watch restart");
            let listed: HashSet<String> = list.iter().map(object_key).collect();
            for stale in store.keys().into_iter().filter(|k| !listed.contains(k)) {
                if let Some(o) = store.remove(&stale) {
                    notify(name, handlers, Notify::Delete, o).await;
                }
            }
            for o in list {
                let o = Arc::new(o);
                let kind = if store.insert(Arc::clone(&o)).is_some() { Notify::Update } else { Notify::Add };
                notify(name, handlers, kind, o).await;
            }
            true
        }
    }
}

async fn notify<K: Send + Sync + 'static>(name: &str, handlers: &HandlerList<K>, kind: Notify, obj: Arc<K>) {
    counter!("watcher_events_total", 1u64, "watcher" => name.to_string(), "kind" => kind.as_str());
    let hs: Vec<_> = handlers.read().unwrap_or_else(|p| p.into_inner()).clone();
    for h in hs {
        match kind {
            Notify::Add => h.on_add(Arc::clone(&obj)).await,
            Notify::Update => h.on_update(Arc::clone(&obj)).await,
            Notify::Delete => h.on_delete(Arc::clone(&obj)).await,
        }
    }
}
