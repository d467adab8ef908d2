//! Feature vector caching keyed by dataset fingerprint.

use crate::dataset::DatasetId;
use crate::features::FeatureVector;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

/// Lookup and storage of computed feature vectors.
///
/// Implementations must only return vectors in the current layout; a stale
/// entry is treated as a miss.
pub trait FeatureStore: Send + Sync {
    fn get(&self, id: &DatasetId) -> Option<Arc<FeatureVector>>;

    fn put(&self, id: &DatasetId, vector: Arc<FeatureVector>);
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<DatasetId, Arc<FeatureVector>>,
    order: VecDeque<DatasetId>,
}

/// Bounded in-process cache, oldest insertion evicted first.
#[derive(Debug)]
pub struct MemoryFeatureCache {
    capacity: usize,
    state: Mutex<CacheState>,
}

impl MemoryFeatureCache {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self { capacity: capacity.max(1), state: Mutex::new(CacheState::default()) }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryFeatureCache {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl FeatureStore for MemoryFeatureCache {
    fn get(&self, id: &DatasetId) -> Option<Arc<FeatureVector>> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.entries.get(id).filter(|v| v.is_current_layout()).cloned()
    }

    fn put(&self, id: &DatasetId, vector: Arc<FeatureVector>) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.entries.insert(id.clone(), vector).is_none() {
            state.order.push_back(id.clone());
        }
        while state.entries.len() > self.capacity {
            let Some(oldest) = state.order.pop_front() else { break };
            state.entries.remove(&oldest);
        }
    }
}

/// Two-level store: a fast front cache over a durable backing store.
pub struct LayeredFeatureStore {
    front: MemoryFeatureCache,
    back: Arc<dyn FeatureStore>,
}

impl LayeredFeatureStore {
    #[must_use]
    pub fn new(front: MemoryFeatureCache, back: Arc<dyn FeatureStore>) -> Self {
        Self { front, back }
    }
}

impl FeatureStore for LayeredFeatureStore {
    fn get(&self, id: &DatasetId) -> Option<Arc<FeatureVector>> {
        if let Some(hit) = self.front.get(id) {
            return Some(hit);
        }
        let hit = self.back.get(id)?;
        self.front.put(id, Arc::clone(&hit));
        Some(hit)
    }

    fn put(&self, id: &DatasetId, vector: Arc<FeatureVector>) {
        self.back.put(id, Arc::clone(&vector));
        self.front.put(id, vector);
    }
}
