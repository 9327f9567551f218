//! Render index
//!
//! Holds the renderable prims (rprims) delegates insert, per-rprim dirty
//! bits, and the scene indices plugins append.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::hydra::scene_index::SceneIndex;
use crate::sync::lock;
use crate::usd::SdfPath;

pub type DirtyBits = u32;

/// Per-rprim dirty bits
pub mod dirty_bits {
    use super::DirtyBits;

    pub const CLEAN: DirtyBits = 0;
    pub const DIRTY_POINTS: DirtyBits = 1 << 0;
    pub const DIRTY_TRANSFORM: DirtyBits = 1 << 1;
    pub const DIRTY_VISIBILITY: DirtyBits = 1 << 2;
    pub const DIRTY_EXTENT: DirtyBits = 1 << 3;
    pub const DIRTY_PRIMVAR: DirtyBits = 1 << 4;
    pub const DIRTY_DISPLAY_STYLE: DirtyBits = 1 << 5;
    pub const DIRTY_TOPOLOGY: DirtyBits = 1 << 6;
    pub const ALL_DIRTY: DirtyBits = !0;
}

/// Dirty state of every rprim, plus a version bumped on each change
#[derive(Debug, Default)]
pub struct ChangeTracker {
    rprims: BTreeMap<SdfPath, DirtyBits>,
    scene_state_version: u64,
}

impl ChangeTracker {
    fn rprim_inserted(&mut self, id: &SdfPath) {
        self.rprims.insert(id.clone(), dirty_bits::ALL_DIRTY);
        self.scene_state_version += 1;
    }

    fn rprim_removed(&mut self, id: &SdfPath) {
        if self.rprims.remove(id).is_some() {
            self.scene_state_version += 1;
        }
    }

    pub fn mark_rprim_dirty(&mut self, id: &SdfPath, bits: DirtyBits) {
        if bits == dirty_bits::CLEAN {
            return;
        }
        match self.rprims.get_mut(id) {
            Some(current) => {
                *current |= bits;
                self.scene_state_version += 1;
            }
            None => log::debug!("Dirtying unknown rprim {}", id),
        }
    }

    pub fn mark_rprim_clean(&mut self, id: &SdfPath) {
        if let Some(current) = self.rprims.get_mut(id) {
            *current = dirty_bits::CLEAN;
        }
    }

    pub fn rprim_dirty_bits(&self, id: &SdfPath) -> DirtyBits {
        self.rprims.get(id).copied().unwrap_or(dirty_bits::CLEAN)
    }

    pub fn scene_state_version(&self) -> u64 {
        self.scene_state_version
    }
}

/// A renderable prim
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rprim {
    pub id: SdfPath,
    pub type_name: String,
    /// Path of the delegate that inserted it
    pub delegate_id: SdfPath,
}

pub type SceneIndexId = u64;

#[derive(Default)]
pub struct RenderIndex {
    rprims: Mutex<BTreeMap<SdfPath, Rprim>>,
    tracker: Mutex<ChangeTracker>,
    scene_indices: Mutex<Vec<(SceneIndexId, Arc<dyn SceneIndex>)>>,
    next_scene_index: AtomicU64,
}

impl RenderIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_rprim(&self, type_name: &str, delegate_id: &SdfPath, id: SdfPath) {
        lock(&self.tracker).rprim_inserted(&id);
        lock(&self.rprims).insert(
            id.clone(),
            Rprim {
                id,
                type_name: type_name.to_string(),
                delegate_id: delegate_id.clone(),
            },
        );
    }

    pub fn remove_rprim(&self, id: &SdfPath) -> bool {
        let removed = lock(&self.rprims).remove(id).is_some();
        if removed {
            lock(&self.tracker).rprim_removed(id);
        }
        removed
    }

    /// Remove every rprim at or below `root`. Returns how many went.
    pub fn remove_subtree(&self, root: &SdfPath) -> usize {
        let doomed: Vec<SdfPath> = lock(&self.rprims)
            .keys()
            .filter(|id| id.has_prefix(root))
            .cloned()
            .collect();
        for id in &doomed {
            self.remove_rprim(id);
        }
        doomed.len()
    }

    pub fn has_rprim(&self, id: &SdfPath) -> bool {
        lock(&self.rprims).contains_key(id)
    }

    pub fn rprim(&self, id: &SdfPath) -> Option<Rprim> {
        lock(&self.rprims).get(id).cloned()
    }

    pub fn rprim_ids(&self) -> Vec<SdfPath> {
        lock(&self.rprims).keys().cloned().collect()
    }

    /// Rprims at or below `root`
    pub fn rprim_subtree(&self, root: &SdfPath) -> Vec<SdfPath> {
        lock(&self.rprims)
            .keys()
            .filter(|id| id.has_prefix(root))
            .cloned()
            .collect()
    }

    pub fn rprim_count(&self) -> usize {
        lock(&self.rprims).len()
    }

    pub fn mark_rprim_dirty(&self, id: &SdfPath, bits: DirtyBits) {
        lock(&self.tracker).mark_rprim_dirty(id, bits);
    }

    pub fn mark_rprim_clean(&self, id: &SdfPath) {
        lock(&self.tracker).mark_rprim_clean(id);
    }

    pub fn dirty_bits(&self, id: &SdfPath) -> DirtyBits {
        lock(&self.tracker).rprim_dirty_bits(id)
    }

    pub fn scene_state_version(&self) -> u64 {
        lock(&self.tracker).scene_state_version()
    }

    pub fn insert_scene_index(&self, scene_index: Arc<dyn SceneIndex>) -> SceneIndexId {
        let id = self.next_scene_index.fetch_add(1, Ordering::SeqCst) + 1;
        log::debug!("Inserting scene index {} ({})", id, scene_index.display_name());
        lock(&self.scene_indices).push((id, scene_index));
        id
    }

    pub fn remove_scene_index(&self, id: SceneIndexId) -> bool {
        let mut indices = lock(&self.scene_indices);
        let before = indices.len();
        indices.retain(|(existing, _)| *existing != id);
        indices.len() != before
    }

    pub fn scene_index(&self, id: SceneIndexId) -> Option<Arc<dyn SceneIndex>> {
        lock(&self.scene_indices)
            .iter()
            .find(|(existing, _)| *existing == id)
            .map(|(_, index)| index.clone())
    }

    pub fn scene_index_count(&self) -> usize {
        lock(&self.scene_indices).len()
    }
}
