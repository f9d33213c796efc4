//! autodisco store: in-RAM registry of dynamic variable sets.
//!
//! Every mutation swaps in a new immutable [`RegistrySnapshot`] and bumps the
//! epoch, so readers never block writers.

#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use autodisco_core::{mapping::find_empty_key, EventIdentity, Mapping, Processors, ProviderComm, RegistryError};
use metrics::counter;
use rustc_hash::FxHashMap;
use serde::Serialize;
use tokio::sync::watch;
use tracing::debug;

/// One published variable set.
#[derive(Debug, Clone, Serialize)]
pub struct DynamicEntry {
    pub id: EventIdentity,
    pub priority: i32,
    pub mapping: Mapping,
    pub processors: Processors,
    /// Unix millis of the last publish.
    pub updated_at: i64,
    /// Registry epoch that published this version of the entry.
    pub epoch: u64,
}

/// Entries ordered by `(priority, id)`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RegistrySnapshot {
    pub epoch: u64,
    pub entries: Vec<Arc<DynamicEntry>>,
}

impl RegistrySnapshot {
    pub fn get(&self, id: &str) -> Option<&DynamicEntry> {
        self.entries.iter().find(|e| e.id.as_str() == id).map(|e| e.as_ref())
    }

    pub fn ids(&self) -> Vec<&str> { self.entries.iter().map(|e| e.id.as_str()).collect() }
}

struct State {
    epoch: u64,
    entries: FxHashMap<EventIdentity, Arc<DynamicEntry>>,
}

/// In-memory [`ProviderComm`] implementation.
pub struct MemoryRegistry {
    state: Mutex<State>,
    snap: ArcSwap<RegistrySnapshot>,
    epoch_tx: watch::Sender<u64>,
}

impl Default for MemoryRegistry {
    fn default() -> Self { Self::new() }
}

impl MemoryRegistry {
    pub fn new() -> Self {
        let (epoch_tx, _) = watch::channel(0u64);
        Self {
            state: Mutex::new(State { epoch: 0, entries: FxHashMap::default() }),
            snap: ArcSwap::from_pointee(RegistrySnapshot::default()),
            epoch_tx,
        }
    }

    pub fn current(&self) -> Arc<RegistrySnapshot> { self.snap.load_full() }

    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> { self.epoch_tx.subscribe() }

    pub fn len(&self) -> usize { self.snap.load().entries.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    fn publish(&self, state: &mut State) {
        state.epoch = state.epoch.saturating_add(1);
        let mut entries: Vec<_> = state.entries.values().cloned().collect();
        entries.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id)));
        self.snap.store(Arc::new(RegistrySnapshot { epoch: state.epoch, entries }));
        self.epoch_tx.send_replace(state.epoch);
    }
}

impl ProviderComm for MemoryRegistry {
    fn add_or_update(
        &self,
        id: &EventIdentity,
        priority: i32,
        mapping: Mapping,
        processors: Processors,
    ) -> Result<(), RegistryError> {
        if id.is_empty() { return Err(RegistryError::EmptyId); }
        if let Some(path) = find_empty_key(&mapping) { return Err(RegistryError::EmptyKey(path)); }
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        let entry = DynamicEntry {
            id: id.clone(),
            priority,
            mapping,
            processors,
            updated_at: chrono::Utc::now().timestamp_millis(),
            epoch: state.epoch.saturating_add(1),
        };
        state.entries.insert(id.clone(), Arc::new(entry));
        self.publish(&mut state);
        counter!("registry_updates_total", 1u64);
        debug!(id = %id, priority, epoch = state.epoch, "registry add_or_update");
        Ok(())
    }

    fn remove(&self, id: &EventIdentity) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        if state.entries.remove(id).is_none() { return; }
        self.publish(&mut state);
        counter!("registry_removes_total", 1u64);
        debug!(id = %id, epoch = state.epoch, "registry remove");
    }
}
