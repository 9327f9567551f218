//! Proxy shape path to stage lookup
//!
//! The map is rebuilt from the proxy shape registry on first use after it
//! is marked dirty. Between a stage invalidation and the next stage set it
//! may be stale.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::proxy_shape::ProxyShapeRegistry;
use crate::sync::lock;
use crate::ufe::UfePath;
use crate::usd::{Stage, StageWeak};

struct MapState {
    dirty: bool,
    stages: BTreeMap<String, StageWeak>,
}

pub struct UsdStageMap {
    registry: Arc<ProxyShapeRegistry>,
    state: Mutex<MapState>,
}

impl UsdStageMap {
    pub fn new(registry: Arc<ProxyShapeRegistry>) -> Self {
        Self {
            registry,
            state: Mutex::new(MapState {
                dirty: true,
                stages: BTreeMap::new(),
            }),
        }
    }

    pub fn set_dirty(&self) {
        lock(&self.state).dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        lock(&self.state).dirty
    }

    fn rebuild_if_dirty(&self, state: &mut MapState) {
        if !state.dirty {
            return;
        }
        state.stages = self
            .registry
            .shapes()
            .iter()
            .filter(|shape| shape.stage().is_some())
            .map(|shape| (shape.dag_path(), shape.stage_weak()))
            .collect();
        state.dirty = false;
        log::trace!("Rebuilt stage map with {} proxy shapes", state.stages.len());
    }

    /// Stage of the proxy shape `path` names
    pub fn stage(&self, path: &UfePath) -> Option<Stage> {
        let mut state = lock(&self.state);
        self.rebuild_if_dirty(&mut state);
        state.stages.get(path.dag_path()).and_then(StageWeak::upgrade)
    }

    /// Every proxy shape showing `stage`
    pub fn paths(&self, stage: &Stage) -> Vec<UfePath> {
        let mut state = lock(&self.state);
        self.rebuild_if_dirty(&mut state);
        state
            .stages
            .iter()
            .filter(|(_, weak)| weak.refers_to(stage))
            .map(|(dag_path, _)| UfePath::proxy(dag_path.clone()))
            .collect()
    }

    pub fn path(&self, stage: &Stage) -> Option<UfePath> {
        self.paths(stage).into_iter().next()
    }

    pub fn proxy_paths(&self) -> Vec<UfePath> {
        let mut state = lock(&self.state);
        self.rebuild_if_dirty(&mut state);
        state.stages.keys().cloned().map(UfePath::proxy).collect()
    }

    /// Distinct live stages in the map
    pub fn all_stages(&self) -> Vec<Stage> {
        let mut state = lock(&self.state);
        self.rebuild_if_dirty(&mut state);
        let mut stages: Vec<Stage> = Vec::new();
        for stage in state.stages.values().filter_map(StageWeak::upgrade) {
            if !stages.iter().any(|s| s.ptr_eq(&stage)) {
                stages.push(stage);
            }
        }
        stages
    }
}
