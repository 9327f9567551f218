//! Process-wide stage cache keyed by opaque integer ids

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::sync::lock;
use crate::usd::load::{InitialLoadSet, PopulationMask};
use crate::usd::stage::Stage;

/// Opaque stage-cache id. `-1` is the invalid id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StageCacheId(i64);

impl StageCacheId {
    pub const INVALID: StageCacheId = StageCacheId(-1);

    pub fn from_i64(value: i64) -> Self {
        Self(value)
    }

    pub fn to_i64(self) -> i64 {
        self.0
    }

    pub fn is_valid(self) -> bool {
        self.0 >= 0
    }
}

impl Default for StageCacheId {
    fn default() -> Self {
        Self::INVALID
    }
}

impl std::fmt::Display for StageCacheId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What makes two opened stages interchangeable. A `None` session layer
/// matches any session layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StageKey {
    pub root_layer: String,
    pub session_layer: Option<String>,
    pub load: InitialLoadSet,
    pub mask: PopulationMask,
}

impl StageKey {
    pub fn matches(&self, stage: &Stage) -> bool {
        stage.root_layer().identifier() == self.root_layer
            && stage.initial_load_set() == self.load
            && stage.population_mask() == &self.mask
            && self
                .session_layer
                .as_deref()
                .map_or(true, |session| stage.session_layer().identifier() == session)
    }
}

/// Holds strong references to stages so they can be shared by id
pub struct StageCache {
    next_id: AtomicI64,
    entries: Mutex<BTreeMap<StageCacheId, Stage>>,
}

impl Default for StageCache {
    fn default() -> Self {
        Self::new()
    }
}

impl StageCache {
    pub fn new() -> Self {
        Self {
            next_id: AtomicI64::new(1),
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    /// Insert a stage, returning its id. Inserting a cached stage again
    /// returns the existing id.
    pub fn insert(&self, stage: Stage) -> StageCacheId {
        let mut entries = lock(&self.entries);
        if let Some((id, _)) = entries.iter().find(|(_, cached)| cached.ptr_eq(&stage)) {
            return *id;
        }
        let id = StageCacheId(self.next_id.fetch_add(1, Ordering::Relaxed));
        log::debug!("Stage cache: inserted {:?} as {}", stage, id);
        entries.insert(id, stage);
        id
    }

    pub fn find(&self, id: StageCacheId) -> Option<Stage> {
        if !id.is_valid() {
            return None;
        }
        lock(&self.entries).get(&id).cloned()
    }

    pub fn contains(&self, id: StageCacheId) -> bool {
        id.is_valid() && lock(&self.entries).contains_key(&id)
    }

    pub fn id_of(&self, stage: &Stage) -> Option<StageCacheId> {
        lock(&self.entries)
            .iter()
            .find(|(_, cached)| cached.ptr_eq(stage))
            .map(|(id, _)| *id)
    }

    pub fn erase(&self, id: StageCacheId) -> bool {
        lock(&self.entries).remove(&id).is_some()
    }

    pub fn erase_stage(&self, stage: &Stage) -> bool {
        match self.id_of(stage) {
            Some(id) => self.erase(id),
            None => false,
        }
    }

    /// Every cached stage matching `key`, oldest first
    pub fn find_matching(&self, key: &StageKey) -> Vec<Stage> {
        lock(&self.entries)
            .values()
            .filter(|stage| key.matches(stage))
            .cloned()
            .collect()
    }

    pub fn find_one_matching(&self, key: &StageKey) -> Option<Stage> {
        self.find_matching(key).into_iter().next()
    }

    pub fn stages(&self) -> Vec<Stage> {
        lock(&self.entries).values().cloned().collect()
    }

    pub fn clear(&self) {
        lock(&self.entries).clear();
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
