//! Pull-evaluated dependency graph
//!
//! Setting a plug dirties everything it affects; reading a plug computes it
//! only if it is dirty. All methods take `&self` so that notice callbacks
//! fired from inside a compute can read the graph again. A node that is
//! already computing is never re-entered: the read returns the plug's last
//! value, or fails if re-entrant evaluation is rejected.

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};

use crate::error::DgError;
use crate::nodes::attribute::{Attribute, NodeClass, NodeKind, PlugData};
use crate::nodes::data_block::DataBlock;
use crate::nodes::messages::{MessageRegistry, NodeInfo, SceneMessage};
use crate::nodes::node::{DgNode, DirtyQueue, NodeContext, NodeId, NodeState, PlugRef, Status};
use crate::sync::{lock, read, write};

/// A connection between two plugs on different nodes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    pub from_node: NodeId,
    pub from_plug: String,
    pub to_node: NodeId,
    pub to_plug: String,
}

impl Connection {
    pub fn new(from: &PlugRef, to: &PlugRef) -> Self {
        Self {
            from_node: from.node,
            from_plug: from.attribute.clone(),
            to_node: to.node,
            to_plug: to.attribute.clone(),
        }
    }

    pub fn source(&self) -> PlugRef {
        PlugRef::new(self.from_node, self.from_plug.clone())
    }

    pub fn destination(&self) -> PlugRef {
        PlugRef::new(self.to_node, self.to_plug.clone())
    }
}

#[derive(Default)]
struct PlugState {
    values: BTreeMap<String, PlugData>,
    dirty: BTreeSet<String>,
}

struct NodeEntry {
    info: NodeInfo,
    class: Arc<NodeClass>,
    parent: Option<NodeId>,
    node: Mutex<Option<Box<dyn DgNode>>>,
    plugs: Mutex<PlugState>,
    dynamic: Mutex<BTreeMap<String, Attribute>>,
    compute_count: AtomicU64,
}

impl NodeEntry {
    fn attribute(&self, name: &str) -> Option<Attribute> {
        self.class
            .attribute(name)
            .cloned()
            .or_else(|| lock(&self.dynamic).get(name).cloned())
    }

    fn take_node(&self) -> Option<Box<dyn DgNode>> {
        lock(&self.node).take()
    }

    fn restore_node(&self, node: Box<dyn DgNode>) {
        *lock(&self.node) = Some(node);
    }

    fn value(&self, plug: &str) -> PlugData {
        lock(&self.plugs).values.get(plug).cloned().unwrap_or_default()
    }
}

/// The dependency graph
pub struct DependencyGraph {
    next_id: AtomicUsize,
    nodes: RwLock<BTreeMap<NodeId, Arc<NodeEntry>>>,
    connections: RwLock<Vec<Connection>>,
    messages: Arc<MessageRegistry>,
    dirty_queue: DirtyQueue,
    reject_reentrant: AtomicBool,
}

impl Default for DependencyGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self {
            next_id: AtomicUsize::new(1),
            nodes: RwLock::new(BTreeMap::new()),
            connections: RwLock::new(Vec::new()),
            messages: Arc::new(MessageRegistry::new()),
            dirty_queue: DirtyQueue::new(),
            reject_reentrant: AtomicBool::new(false),
        }
    }

    /// Fail re-entrant reads instead of returning the last value
    pub fn set_reject_reentrant(&self, reject: bool) {
        self.reject_reentrant.store(reject, Ordering::SeqCst);
    }

    pub fn messages(&self) -> &Arc<MessageRegistry> {
        &self.messages
    }

    pub fn dirty_queue(&self) -> &DirtyQueue {
        &self.dirty_queue
    }

    fn entry(&self, id: NodeId) -> Result<Arc<NodeEntry>, DgError> {
        read(&self.nodes)
            .get(&id)
            .cloned()
            .ok_or(DgError::NodeNotFound(id))
    }

    fn attribute_of(&self, entry: &NodeEntry, plug: &str) -> Result<Attribute, DgError> {
        entry
            .attribute(plug)
            .ok_or_else(|| DgError::UnknownAttribute {
                node: entry.info.id,
                attr: plug.to_string(),
            })
    }

    fn unique_name(&self, requested: &str, type_name: &str) -> String {
        let base = if requested.is_empty() {
            type_name
        } else {
            requested
        };
        let nodes = read(&self.nodes);
        let taken = |name: &str| nodes.values().any(|e| e.info.name == name);
        if !requested.is_empty() && !taken(base) {
            return base.to_string();
        }
        let stem = base.trim_end_matches(|c: char| c.is_ascii_digit());
        (1..)
            .map(|i| format!("{}{}", stem, i))
            .find(|name| !taken(name))
            .unwrap_or_else(|| base.to_string())
    }

    // ---- nodes -------------------------------------------------------

    /// Add a node. DAG nodes may be parented under another DAG node.
    pub fn create_node(
        &self,
        mut node: Box<dyn DgNode>,
        name: &str,
        parent: Option<NodeId>,
    ) -> Result<NodeId, DgError> {
        self.flush_dirty();
        let class = node.class();
        let parent_path = match parent {
            Some(parent_id) => {
                let parent_entry = self.entry(parent_id)?;
                if parent_entry.info.kind != NodeKind::Dag || class.kind() != NodeKind::Dag {
                    return Err(DgError::InvalidParent(parent_id));
                }
                parent_entry.info.dag_path.clone()
            }
            None => None,
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let name = self.unique_name(name, class.type_name());
        let dag_path = match class.kind() {
            NodeKind::Dag => Some(format!("{}|{}", parent_path.unwrap_or_default(), name)),
            NodeKind::Dependency => None,
        };

        let mut plugs = PlugState::default();
        for attribute in class.attributes() {
            plugs
                .values
                .insert(attribute.name.clone(), attribute.default.clone());
            if attribute.is_computed() {
                plugs.dirty.insert(attribute.name.clone());
            }
        }

        let info = NodeInfo {
            id,
            name: name.clone(),
            type_name: class.type_name().to_string(),
            type_hierarchy: class.type_hierarchy().to_vec(),
            kind: class.kind(),
            dag_path: dag_path.clone(),
        };

        let context = NodeContext::new(id, name, dag_path, self.dirty_queue.clone());
        node.post_constructor(&context);

        let entry = Arc::new(NodeEntry {
            info: info.clone(),
            class,
            parent,
            node: Mutex::new(Some(node)),
            plugs: Mutex::new(plugs),
            dynamic: Mutex::new(BTreeMap::new()),
            compute_count: AtomicU64::new(0),
        });
        write(&self.nodes).insert(id, entry);

        log::debug!("Created {} '{}' as node {}", info.type_name, info.name, id);
        self.messages.fire_node_added(&info);
        Ok(id)
    }

    /// Delete a node, its DAG children first. Pre-removal callbacks run
    /// while the node is still fully connected.
    pub fn delete_node(&self, id: NodeId) -> Result<(), DgError> {
        self.flush_dirty();
        let entry = self.entry(id)?;

        for child in self.dag_children(id) {
            self.delete_node(child)?;
        }

        self.messages.fire_pre_removal(&entry.info);
        if let Some(mut node) = entry.take_node() {
            node.pre_removal();
            entry.restore_node(node);
        }

        let touching: Vec<Connection> = read(&self.connections)
            .iter()
            .filter(|c| c.from_node == id || c.to_node == id)
            .cloned()
            .collect();
        for connection in touching {
            self.disconnect(&connection.source(), &connection.destination())?;
        }

        let removed = write(&self.nodes).remove(&id);
        self.messages.drop_node_callbacks(id);
        self.messages.fire_node_removed(&entry.info);
        log::debug!("Deleted node {} '{}'", id, entry.info.name);

        // The node itself is dropped here, outside every graph lock
        drop(removed);
        drop(entry);
        Ok(())
    }

    pub fn contains(&self, id: NodeId) -> bool {
        read(&self.nodes).contains_key(&id)
    }

    pub fn node_count(&self) -> usize {
        read(&self.nodes).len()
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        read(&self.nodes).keys().copied().collect()
    }

    pub fn node_info(&self, id: NodeId) -> Option<NodeInfo> {
        read(&self.nodes).get(&id).map(|e| e.info.clone())
    }

    pub fn class_of(&self, id: NodeId) -> Option<Arc<NodeClass>> {
        read(&self.nodes).get(&id).map(|e| e.class.clone())
    }

    pub fn find_by_name(&self, name: &str) -> Option<NodeId> {
        read(&self.nodes)
            .values()
            .find(|e| e.info.name == name)
            .map(|e| e.info.id)
    }

    pub fn find_by_dag_path(&self, dag_path: &str) -> Option<NodeId> {
        read(&self.nodes)
            .values()
            .find(|e| e.info.dag_path.as_deref() == Some(dag_path))
            .map(|e| e.info.id)
    }

    pub fn nodes_of_type(&self, type_filter: &str) -> Vec<NodeId> {
        read(&self.nodes)
            .values()
            .filter(|e| e.info.is_type(type_filter))
            .map(|e| e.info.id)
            .collect()
    }

    pub fn dag_children(&self, id: NodeId) -> Vec<NodeId> {
        read(&self.nodes)
            .values()
            .filter(|e| e.parent == Some(id))
            .map(|e| e.info.id)
            .collect()
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        read(&self.nodes).get(&id).and_then(|e| e.parent)
    }

    pub fn node_state(&self, id: NodeId) -> Option<NodeState> {
        let entry = self.entry(id).ok()?;
        let computing = lock(&entry.node).is_none();
        Some(if computing {
            NodeState::Computing
        } else {
            NodeState::Idle
        })
    }

    /// Number of `compute()` calls made on the node so far
    pub fn compute_count(&self, id: NodeId) -> u64 {
        self.entry(id)
            .map(|e| e.compute_count.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Borrow a node as its concrete type. Fails while the node computes.
    pub fn with_node<T: DgNode, R>(&self, id: NodeId, f: impl FnOnce(&T) -> R) -> Result<R, DgError> {
        self.with_node_mut(id, |node: &mut T| f(node))
    }

    pub fn with_node_mut<T: DgNode, R>(
        &self,
        id: NodeId,
        f: impl FnOnce(&mut T) -> R,
    ) -> Result<R, DgError> {
        self.flush_dirty();
        let entry = self.entry(id)?;
        let mut node = entry.take_node().ok_or(DgError::ReentrantEvaluation(id))?;
        let result = node
            .as_any_mut()
            .downcast_mut::<T>()
            .map(f)
            .ok_or(DgError::WrongNodeType {
                node: id,
                expected: std::any::type_name::<T>(),
            });
        entry.restore_node(node);
        result
    }

    // ---- attributes --------------------------------------------------

    pub fn has_attribute(&self, id: NodeId, name: &str) -> bool {
        self.entry(id)
            .map(|e| e.attribute(name).is_some())
            .unwrap_or(false)
    }

    /// Add a dynamic attribute to one node. Re-adding an existing one keeps
    /// its current value.
    pub fn add_dynamic_attribute(&self, id: NodeId, attribute: Attribute) -> Result<(), DgError> {
        let entry = self.entry(id)?;
        if entry.class.has_attribute(&attribute.name) {
            return Ok(());
        }
        lock(&entry.plugs)
            .values
            .entry(attribute.name.clone())
            .or_insert_with(|| attribute.default.clone());
        lock(&entry.dynamic).insert(attribute.name.clone(), attribute);
        Ok(())
    }

    pub fn remove_dynamic_attribute(&self, id: NodeId, name: &str) -> Result<bool, DgError> {
        let entry = self.entry(id)?;
        let removed = lock(&entry.dynamic).remove(name).is_some();
        if removed {
            lock(&entry.plugs).values.remove(name);
        }
        Ok(removed)
    }

    pub fn is_dirty(&self, id: NodeId, plug: &str) -> bool {
        self.entry(id)
            .map(|e| lock(&e.plugs).dirty.contains(plug))
            .unwrap_or(false)
    }

    /// Set an input plug and dirty everything it affects
    pub fn set_value(&self, id: NodeId, plug: &str, value: impl Into<PlugData>) -> Result<(), DgError> {
        self.flush_dirty();
        let entry = self.entry(id)?;
        let attribute = self.attribute_of(&entry, plug)?;
        if attribute.is_computed() || !attribute.writable {
            return Err(DgError::NotWritable(plug.to_string()));
        }
        let target = PlugRef::new(id, plug);
        if self.incoming(&target).is_some() {
            return Err(DgError::AlreadyConnected(target.to_string()));
        }

        {
            let mut plugs = lock(&entry.plugs);
            plugs.values.insert(plug.to_string(), value.into());
            plugs.dirty.remove(plug);
        }
        self.propagate_dirty(target);
        Ok(())
    }

    /// Read a plug, computing it first if it is dirty
    pub fn get_value(&self, id: NodeId, plug: &str) -> Result<PlugData, DgError> {
        self.flush_dirty();
        let entry = self.entry(id)?;
        self.evaluate(&entry, plug)
    }

    fn evaluate(&self, entry: &Arc<NodeEntry>, plug: &str) -> Result<PlugData, DgError> {
        let attribute = self.attribute_of(entry, plug)?;
        {
            let plugs = lock(&entry.plugs);
            if !plugs.dirty.contains(plug) {
                return Ok(plugs.values.get(plug).cloned().unwrap_or_default());
            }
        }

        let target = PlugRef::new(entry.info.id, plug);
        if let Some(connection) = self.incoming(&target) {
            let source = self.entry(connection.from_node)?;
            let value = self.evaluate(&source, &connection.from_plug)?;
            let mut plugs = lock(&entry.plugs);
            plugs.values.insert(plug.to_string(), value.clone());
            plugs.dirty.remove(plug);
            return Ok(value);
        }

        if !attribute.is_computed() {
            let mut plugs = lock(&entry.plugs);
            plugs.dirty.remove(plug);
            return Ok(plugs.values.get(plug).cloned().unwrap_or_default());
        }

        self.compute_plug(entry, plug)
    }

    fn compute_plug(&self, entry: &Arc<NodeEntry>, plug: &str) -> Result<PlugData, DgError> {
        let id = entry.info.id;
        let Some(mut node) = entry.take_node() else {
            if self.reject_reentrant.load(Ordering::SeqCst) {
                return Err(DgError::ReentrantEvaluation(id));
            }
            log::warn!(
                "Re-entrant evaluation of {}.{}; using last value",
                entry.info.name,
                plug
            );
            return Ok(entry.value(plug));
        };

        // Pull every dirty connected input before handing out the block
        let dirty_inputs: Vec<String> = {
            let plugs = lock(&entry.plugs);
            read(&self.connections)
                .iter()
                .filter(|c| c.to_node == id && plugs.dirty.contains(&c.to_plug))
                .map(|c| c.to_plug.clone())
                .collect()
        };
        for input in dirty_inputs {
            if let Err(err) = self.evaluate(entry, &input) {
                entry.restore_node(node);
                return Err(err);
            }
        }

        let mut block = {
            let plugs = lock(&entry.plugs);
            DataBlock::new(id, plugs.values.clone()).with_dirty(plugs.dirty.clone())
        };
        entry.compute_count.fetch_add(1, Ordering::SeqCst);
        let status = node.compute(plug, &mut block);
        entry.restore_node(node);

        if status != Status::Success {
            log::debug!("compute({}.{}) returned {:?}", entry.info.name, plug, status);
        }

        let (written, cleaned) = block.into_results();
        let mut plugs = lock(&entry.plugs);
        for (name, value) in written {
            plugs.values.insert(name, value);
        }
        for name in cleaned {
            plugs.dirty.remove(&name);
        }
        plugs.dirty.remove(plug);
        Ok(plugs.values.get(plug).cloned().unwrap_or_default())
    }

    // ---- dirty propagation ---------------------------------------------

    /// Apply dirty requests queued by notice callbacks
    pub fn flush_dirty(&self) {
        for plug in self.dirty_queue.drain() {
            let Ok(entry) = self.entry(plug.node) else {
                continue;
            };
            lock(&entry.plugs).dirty.insert(plug.attribute.clone());
            self.propagate_dirty(plug);
        }
    }

    /// Dirty the dependents of `origin`: the attributes it affects on its
    /// own node and, through connections, everything downstream.
    fn propagate_dirty(&self, origin: PlugRef) {
        let mut queue = VecDeque::from([(origin, true)]);
        let mut visited: HashSet<(PlugRef, bool)> = HashSet::new();

        while let Some((plug, apply_affects)) = queue.pop_front() {
            if !visited.insert((plug.clone(), apply_affects)) {
                continue;
            }
            let Ok(entry) = self.entry(plug.node) else {
                continue;
            };

            if apply_affects {
                let mut affected: Vec<String> = entry
                    .class
                    .affected_by(&plug.attribute)
                    .into_iter()
                    .map(str::to_string)
                    .collect();
                if let Some(mut node) = entry.take_node() {
                    node.set_dependents_dirty(&plug.attribute, &mut affected);
                    entry.restore_node(node);
                }
                let mut plugs = lock(&entry.plugs);
                for name in affected {
                    plugs.dirty.insert(name.clone());
                    queue.push_back((PlugRef::new(plug.node, name), false));
                }
            }

            for connection in self.outgoing(&plug) {
                if let Ok(downstream) = self.entry(connection.to_node) {
                    lock(&downstream.plugs)
                        .dirty
                        .insert(connection.to_plug.clone());
                }
                queue.push_back((connection.destination(), true));
            }
        }
    }

    // ---- connections -------------------------------------------------

    pub fn connections(&self) -> Vec<Connection> {
        read(&self.connections).clone()
    }

    pub fn incoming(&self, plug: &PlugRef) -> Option<Connection> {
        read(&self.connections)
            .iter()
            .find(|c| c.to_node == plug.node && c.to_plug == plug.attribute)
            .cloned()
    }

    pub fn outgoing(&self, plug: &PlugRef) -> Vec<Connection> {
        read(&self.connections)
            .iter()
            .filter(|c| c.from_node == plug.node && c.from_plug == plug.attribute)
            .cloned()
            .collect()
    }

    pub fn is_connected(&self, plug: &PlugRef) -> bool {
        read(&self.connections).iter().any(|c| {
            (c.to_node == plug.node && c.to_plug == plug.attribute)
                || (c.from_node == plug.node && c.from_plug == plug.attribute)
        })
    }

    /// Connect `from` to `to` and notify both nodes
    pub fn connect(&self, from: &PlugRef, to: &PlugRef) -> Result<(), DgError> {
        self.flush_dirty();
        if from.node == to.node {
            return Err(DgError::SelfConnection);
        }
        let source = self.entry(from.node)?;
        let destination = self.entry(to.node)?;
        let source_attr = self.attribute_of(&source, &from.attribute)?;
        let dest_attr = self.attribute_of(&destination, &to.attribute)?;
        if !source_attr.connectable {
            return Err(DgError::NotConnectable(from.to_string()));
        }
        if !dest_attr.connectable {
            return Err(DgError::NotConnectable(to.to_string()));
        }
        if dest_attr.is_computed() || !dest_attr.writable {
            return Err(DgError::NotWritable(to.to_string()));
        }
        if self.incoming(to).is_some() {
            return Err(DgError::AlreadyConnected(to.to_string()));
        }

        write(&self.connections).push(Connection::new(from, to));
        log::debug!("Connected {} -> {}", from, to);

        if let Some(mut node) = destination.take_node() {
            node.connection_made(&to.attribute, from, false);
            destination.restore_node(node);
        }
        if let Some(mut node) = source.take_node() {
            node.connection_made(&from.attribute, to, true);
            source.restore_node(node);
        }

        lock(&destination.plugs).dirty.insert(to.attribute.clone());
        self.propagate_dirty(to.clone());
        Ok(())
    }

    /// Break the connection from `from` to `to`. The destination keeps the
    /// last value it received.
    pub fn disconnect(&self, from: &PlugRef, to: &PlugRef) -> Result<(), DgError> {
        let removed = {
            let mut connections = write(&self.connections);
            let before = connections.len();
            connections.retain(|c| !(c.source() == *from && c.destination() == *to));
            connections.len() != before
        };
        if !removed {
            return Err(DgError::NotConnected {
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        log::debug!("Disconnected {} -> {}", from, to);

        if let Ok(destination) = self.entry(to.node) {
            if let Some(mut node) = destination.take_node() {
                node.connection_broken(&to.attribute, from, false);
                destination.restore_node(node);
            }
        }
        if let Ok(source) = self.entry(from.node) {
            if let Some(mut node) = source.take_node() {
                node.connection_broken(&from.attribute, to, true);
                source.restore_node(node);
            }
        }
        self.propagate_dirty(to.clone());
        Ok(())
    }

    // ---- scene -------------------------------------------------------

    fn clear(&self) {
        for id in self.node_ids() {
            if self.contains(id) {
                if let Err(err) = self.delete_node(id) {
                    log::warn!("Failed to delete node {} during scene reset: {}", id, err);
                }
            }
        }
    }

    /// Start an empty scene
    pub fn new_scene(&self) {
        self.messages.fire_scene(SceneMessage::BeforeNew);
        self.clear();
        self.messages.fire_scene(SceneMessage::AfterNew);
    }

    /// Replace the scene with whatever `build` creates
    pub fn open_scene<F>(&self, build: F) -> Result<(), DgError>
    where
        F: FnOnce(&DependencyGraph) -> Result<(), DgError>,
    {
        self.messages.fire_scene(SceneMessage::BeforeOpen);
        self.clear();
        let result = build(self);
        self.messages.fire_scene(SceneMessage::AfterOpen);
        result
    }
}
