//! Node and scene message callbacks
//!
//! Callbacks are run with no registry lock held, so they may add or remove
//! callbacks, including themselves.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::nodes::attribute::NodeKind;
use crate::nodes::node::NodeId;
use crate::sync::lock;

pub type CallbackId = u64;

/// Scene lifecycle events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SceneMessage {
    BeforeNew,
    AfterNew,
    BeforeOpen,
    AfterOpen,
}

/// Identity of a node as reported to callbacks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    pub id: NodeId,
    pub name: String,
    pub type_name: String,
    pub type_hierarchy: Vec<String>,
    pub kind: NodeKind,
    pub dag_path: Option<String>,
}

impl NodeInfo {
    /// Same filter rules as [`NodeClass::is_type`](crate::nodes::NodeClass::is_type)
    pub fn is_type(&self, filter: &str) -> bool {
        match filter {
            "dependNode" => true,
            "dagNode" => self.kind == NodeKind::Dag,
            _ => self.type_hierarchy.iter().any(|t| t == filter),
        }
    }
}

type NodeCallback = Arc<dyn Fn(&NodeInfo) + Send + Sync>;
type SceneCallback = Arc<dyn Fn(SceneMessage) + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    node_added: Vec<(CallbackId, String, NodeCallback)>,
    node_removed: Vec<(CallbackId, String, NodeCallback)>,
    pre_removal: Vec<(CallbackId, NodeId, NodeCallback)>,
    scene: Vec<(CallbackId, SceneMessage, SceneCallback)>,
}

/// Registry of node and scene callbacks for one graph
pub struct MessageRegistry {
    next_id: AtomicU64,
    callbacks: Mutex<Callbacks>,
}

impl Default for MessageRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            callbacks: Mutex::new(Callbacks::default()),
        }
    }

    fn next_id(&self) -> CallbackId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Called after a node matching `type_filter` is created
    pub fn add_node_added_callback<F>(&self, type_filter: &str, callback: F) -> CallbackId
    where
        F: Fn(&NodeInfo) + Send + Sync + 'static,
    {
        let id = self.next_id();
        lock(&self.callbacks)
            .node_added
            .push((id, type_filter.to_string(), Arc::new(callback)));
        id
    }

    pub fn add_node_removed_callback<F>(&self, type_filter: &str, callback: F) -> CallbackId
    where
        F: Fn(&NodeInfo) + Send + Sync + 'static,
    {
        let id = self.next_id();
        lock(&self.callbacks)
            .node_removed
            .push((id, type_filter.to_string(), Arc::new(callback)));
        id
    }

    /// Called just before `node` is deleted. Dropped automatically once the
    /// node is gone.
    pub fn add_node_pre_removal_callback<F>(&self, node: NodeId, callback: F) -> CallbackId
    where
        F: Fn(&NodeInfo) + Send + Sync + 'static,
    {
        let id = self.next_id();
        lock(&self.callbacks)
            .pre_removal
            .push((id, node, Arc::new(callback)));
        id
    }

    pub fn add_scene_callback<F>(&self, message: SceneMessage, callback: F) -> CallbackId
    where
        F: Fn(SceneMessage) + Send + Sync + 'static,
    {
        let id = self.next_id();
        lock(&self.callbacks)
            .scene
            .push((id, message, Arc::new(callback)));
        id
    }

    /// Remove any callback by id. Returns false if it was already gone.
    pub fn remove_callback(&self, id: CallbackId) -> bool {
        let mut callbacks = lock(&self.callbacks);
        let before = callbacks.len();
        callbacks.node_added.retain(|(cb, _, _)| *cb != id);
        callbacks.node_removed.retain(|(cb, _, _)| *cb != id);
        callbacks.pre_removal.retain(|(cb, _, _)| *cb != id);
        callbacks.scene.retain(|(cb, _, _)| *cb != id);
        callbacks.len() != before
    }

    pub fn callback_count(&self) -> usize {
        lock(&self.callbacks).len()
    }

    pub fn pre_removal_callback_count(&self, node: NodeId) -> usize {
        lock(&self.callbacks)
            .pre_removal
            .iter()
            .filter(|(_, n, _)| *n == node)
            .count()
    }

    pub(crate) fn fire_node_added(&self, info: &NodeInfo) {
        let matching: Vec<NodeCallback> = lock(&self.callbacks)
            .node_added
            .iter()
            .filter(|(_, filter, _)| info.is_type(filter))
            .map(|(_, _, cb)| cb.clone())
            .collect();
        for callback in matching {
            callback(info);
        }
    }

    pub(crate) fn fire_node_removed(&self, info: &NodeInfo) {
        let matching: Vec<NodeCallback> = lock(&self.callbacks)
            .node_removed
            .iter()
            .filter(|(_, filter, _)| info.is_type(filter))
            .map(|(_, _, cb)| cb.clone())
            .collect();
        for callback in matching {
            callback(info);
        }
    }

    pub(crate) fn fire_pre_removal(&self, info: &NodeInfo) {
        let matching: Vec<NodeCallback> = lock(&self.callbacks)
            .pre_removal
            .iter()
            .filter(|(_, node, _)| *node == info.id)
            .map(|(_, _, cb)| cb.clone())
            .collect();
        for callback in matching {
            callback(info);
        }
    }

    pub(crate) fn drop_node_callbacks(&self, node: NodeId) {
        lock(&self.callbacks)
            .pre_removal
            .retain(|(_, n, _)| *n != node);
    }

    /// Deliver a scene message. Public so hosts (and tests) can replay the
    /// exact order the application produced.
    pub fn fire_scene(&self, message: SceneMessage) {
        let matching: Vec<SceneCallback> = lock(&self.callbacks)
            .scene
            .iter()
            .filter(|(_, m, _)| *m == message)
            .map(|(_, _, cb)| cb.clone())
            .collect();
        log::debug!("Scene message {:?} to {} callbacks", message, matching.len());
        for callback in matching {
            callback(message);
        }
    }
}

impl Callbacks {
    fn len(&self) -> usize {
        self.node_added.len() + self.node_removed.len() + self.pre_removal.len() + self.scene.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn info(kind: NodeKind, hierarchy: &[&str]) -> NodeInfo {
        NodeInfo {
            id: 1,
            name: "node1".to_string(),
            type_name: hierarchy[0].to_string(),
            type_hierarchy: hierarchy.iter().map(|s| s.to_string()).collect(),
            kind,
            dag_path: None,
        }
    }

    #[test]
    fn test_node_added_filter() {
        let registry = MessageRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        registry.add_node_added_callback("dagNode", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        registry.fire_node_added(&info(NodeKind::Dependency, &["time"]));
        registry.fire_node_added(&info(NodeKind::Dag, &["mesh"]));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_remove_callback() {
        let registry = MessageRegistry::new();
        let id = registry.add_scene_callback(SceneMessage::BeforeNew, |_| {});
        registry.add_node_pre_removal_callback(4, |_| {});
        assert_eq!(registry.callback_count(), 2);
        assert!(registry.remove_callback(id));
        assert!(!registry.remove_callback(id));

        registry.drop_node_callbacks(4);
        assert_eq!(registry.callback_count(), 0);
    }

    #[test]
    fn test_callback_may_remove_itself() {
        let registry = Arc::new(MessageRegistry::new());
        let slot = Arc::new(Mutex::new(0u64));
        let reg = Arc::downgrade(&registry);
        let own_id = slot.clone();
        let id = registry.add_scene_callback(SceneMessage::AfterNew, move |_| {
            if let Some(reg) = reg.upgrade() {
                reg.remove_callback(*lock(&own_id));
            }
        });
        *lock(&slot) = id;
        registry.fire_scene(SceneMessage::AfterNew);
        assert_eq!(registry.callback_count(), 0);
    }
}
