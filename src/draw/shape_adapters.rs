//! Batch-renderer shape adapters
//!
//! One adapter per proxy shape the batch renderer draws. Adapters hold the
//! shape's state, never the graph, so the renderer can ask which shapes
//! changed since the last frame without evaluating anything.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::nodes::{DependencyGraph, NodeId};
use crate::proxy_shape::{ClosestPointRegistry, ProxyShape, ProxyShapeRegistry, ProxyShapeState};
use crate::sync::lock;
use crate::usd::BoundingBox;

struct ShapeAdapter {
    state: Arc<ProxyShapeState>,
    /// `draw_dirty_count` at the last draw
    drawn_at: u64,
}

pub struct ShapeAdapterRegistry {
    adapters: Mutex<BTreeMap<NodeId, ShapeAdapter>>,
    registry: Arc<ProxyShapeRegistry>,
    closest_point: Arc<ClosestPointRegistry>,
}

impl ShapeAdapterRegistry {
    pub fn new(registry: Arc<ProxyShapeRegistry>, closest_point: Arc<ClosestPointRegistry>) -> Self {
        Self {
            adapters: Mutex::new(BTreeMap::new()),
            registry,
            closest_point,
        }
    }

    /// Start drawing the proxy shape `node`. Fails for nodes that are not
    /// live proxy shapes.
    pub fn add_adapter(&self, node: NodeId) -> bool {
        let Some(state) = self.registry.get(node) else {
            log::warn!("Node {} is not a proxy shape; no adapter added", node);
            return false;
        };
        let mut adapters = lock(&self.adapters);
        if adapters.contains_key(&node) {
            return false;
        }
        log::debug!("Adding shape adapter for {}", state.dag_path());
        adapters.insert(node, ShapeAdapter { state, drawn_at: 0 });
        true
    }

    pub fn remove_adapter(&self, node: NodeId) -> bool {
        lock(&self.adapters).remove(&node).is_some()
    }

    pub fn has_adapter(&self, node: NodeId) -> bool {
        lock(&self.adapters).contains_key(&node)
    }

    pub fn len(&self) -> usize {
        lock(&self.adapters).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.adapters).is_empty()
    }

    /// Drop every adapter, as on a new scene
    pub fn clear(&self) {
        lock(&self.adapters).clear();
    }

    /// Bounds of every adapted shape at its output time. Served from each
    /// shape's time-keyed cache when possible.
    pub fn draw_bounds(&self, graph: &DependencyGraph) -> Vec<(NodeId, BoundingBox)> {
        let states: Vec<Arc<ProxyShapeState>> = lock(&self.adapters)
            .values()
            .map(|adapter| adapter.state.clone())
            .collect();
        states
            .into_iter()
            .map(|state| {
                let node = state.node();
                let shape = ProxyShape::new(graph, state, self.closest_point.clone());
                (node, shape.bounding_box())
            })
            .collect()
    }

    /// Adapters whose shape asked for a redraw since it was last drawn
    pub fn adapters_needing_update(&self) -> Vec<NodeId> {
        lock(&self.adapters)
            .iter()
            .filter(|(_, adapter)| adapter.state.draw_dirty_count() != adapter.drawn_at)
            .map(|(node, _)| *node)
            .collect()
    }

    pub fn mark_updated(&self, node: NodeId) {
        if let Some(adapter) = lock(&self.adapters).get_mut(&node) {
            adapter.drawn_at = adapter.state.draw_dirty_count();
        }
    }
}
