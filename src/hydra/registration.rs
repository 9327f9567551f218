//! Per-node custom scene indices
//!
//! Any DAG node type can contribute a scene index by registering a plugin
//! named after the type: `fooBar` is served by
//! `FooBarMayaNodeSceneIndexPlugin`. Nodes without a plugin draw without
//! one. Each scene index lives exactly as long as its node.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, Weak};

use crate::hydra::render_index::{RenderIndex, SceneIndexId};
use crate::hydra::scene_index::{DataSource, RetainedContainer, SceneIndexPluginRegistry};
use crate::nodes::{CallbackId, DependencyGraph, MessageRegistry, NodeId, NodeInfo};
use crate::sync::lock;

pub const SCENE_INDEX_PLUGIN_SUFFIX: &str = "MayaNodeSceneIndexPlugin";

/// Key of the node handle in a plugin's input arguments
pub const OBJECT_KEY: &str = "object";

/// Plugin identifier serving nodes of `type_name`
pub fn scene_index_plugin_id(type_name: &str) -> String {
    let mut chars = type_name.chars();
    match chars.next() {
        Some(first) => format!(
            "{}{}{}",
            first.to_uppercase(),
            chars.as_str(),
            SCENE_INDEX_PLUGIN_SUFFIX
        ),
        None => SCENE_INDEX_PLUGIN_SUFFIX.to_string(),
    }
}

struct Registration {
    scene_index: SceneIndexId,
    pre_removal: CallbackId,
}

pub struct SceneIndexRegistration {
    this: Weak<SceneIndexRegistration>,
    messages: Arc<MessageRegistry>,
    plugins: Arc<SceneIndexPluginRegistry>,
    render_index: Arc<RenderIndex>,
    registrations: Mutex<BTreeMap<NodeId, Registration>>,
    node_added: Mutex<Option<CallbackId>>,
}

impl SceneIndexRegistration {
    /// Add scene indices for the DAG nodes already in `graph` and for every
    /// DAG node created from now on
    pub fn new(
        graph: &DependencyGraph,
        plugins: Arc<SceneIndexPluginRegistry>,
        render_index: Arc<RenderIndex>,
    ) -> Arc<Self> {
        let registration = Arc::new_cyclic(|this| Self {
            this: this.clone(),
            messages: graph.messages().clone(),
            plugins,
            render_index,
            registrations: Mutex::new(BTreeMap::new()),
            node_added: Mutex::new(None),
        });

        for node in graph.nodes_of_type("dagNode") {
            if let Some(info) = graph.node_info(node) {
                registration.add_custom_scene_index_for_node(&info);
            }
        }

        let this = Arc::downgrade(&registration);
        let callback = registration
            .messages
            .add_node_added_callback("dagNode", move |info| {
                if let Some(registration) = this.upgrade() {
                    registration.add_custom_scene_index_for_node(info);
                }
            });
        *lock(&registration.node_added) = Some(callback);
        registration
    }

    /// Returns true if a scene index was added for the node
    pub fn add_custom_scene_index_for_node(&self, info: &NodeInfo) -> bool {
        if lock(&self.registrations).contains_key(&info.id) {
            return false;
        }
        let plugin_id = scene_index_plugin_id(&info.type_name);
        if !self.plugins.is_registered(&plugin_id) {
            return false;
        }

        let input_args = RetainedContainer::new().with(OBJECT_KEY, DataSource::Node(info.id));
        let Some((scene_index, _)) =
            self.plugins
                .append_scene_index(&plugin_id, &input_args, &self.render_index)
        else {
            return false;
        };

        let this = self.this.clone();
        let pre_removal = self
            .messages
            .add_node_pre_removal_callback(info.id, move |info| {
                if let Some(registration) = this.upgrade() {
                    registration.remove_custom_scene_index_for_node(info.id);
                }
            });

        lock(&self.registrations).insert(
            info.id,
            Registration {
                scene_index,
                pre_removal,
            },
        );
        log::debug!("Added {} for node {}", plugin_id, info.name);
        true
    }

    /// Tear down the node's scene index and its removal callback
    pub fn remove_custom_scene_index_for_node(&self, node: NodeId) -> bool {
        let removed = lock(&self.registrations).remove(&node);
        let Some(registration) = removed else {
            return false;
        };
        self.render_index.remove_scene_index(registration.scene_index);
        self.messages.remove_callback(registration.pre_removal);
        true
    }

    pub fn scene_index_for(&self, node: NodeId) -> Option<SceneIndexId> {
        lock(&self.registrations)
            .get(&node)
            .map(|registration| registration.scene_index)
    }

    pub fn registered_nodes(&self) -> Vec<NodeId> {
        lock(&self.registrations).keys().copied().collect()
    }
}

impl Drop for SceneIndexRegistration {
    fn drop(&mut self) {
        let node_added = lock(&self.node_added).take();
        if let Some(callback) = node_added {
            self.messages.remove_callback(callback);
        }
        let registrations = std::mem::take(&mut *lock(&self.registrations));
        for registration in registrations.into_values() {
            self.render_index.remove_scene_index(registration.scene_index);
            self.messages.remove_callback(registration.pre_removal);
        }
    }
}
