//! Node trait, compute status and the context handed to nodes

use std::any::Any;
use std::sync::{Arc, Mutex};

use crate::nodes::attribute::NodeClass;
use crate::nodes::data_block::DataBlock;
use crate::sync::lock;

/// Unique identifier for a node
pub type NodeId = usize;

/// Outcome of a node callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Success,
    Failure,
    /// The node does not handle this plug; the caller may try elsewhere
    UnknownParameter,
    InvalidParameter,
}

impl Status {
    pub fn is_success(self) -> bool {
        self == Status::Success
    }

    pub fn is_failure(self) -> bool {
        !self.is_success()
    }
}

/// Return the status from the enclosing function unless it is a success
#[macro_export]
macro_rules! return_on_failure {
    ($status:expr) => {{
        let status = $status;
        if !status.is_success() {
            return status;
        }
    }};
}

/// Evaluation state of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Idle,
    Computing,
}

/// A plug on some node
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PlugRef {
    pub node: NodeId,
    pub attribute: String,
}

impl PlugRef {
    pub fn new(node: NodeId, attribute: impl Into<String>) -> Self {
        Self {
            node,
            attribute: attribute.into(),
        }
    }
}

impl std::fmt::Display for PlugRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.node, self.attribute)
    }
}

/// Dirty requests raised outside of graph calls, typically by notice
/// callbacks. The graph drains the queue before each operation.
#[derive(Clone, Default)]
pub struct DirtyQueue {
    pending: Arc<Mutex<Vec<PlugRef>>>,
}

impl DirtyQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self, plug: PlugRef) {
        let mut pending = lock(&self.pending);
        if !pending.contains(&plug) {
            pending.push(plug);
        }
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.pending).is_empty()
    }

    pub(crate) fn drain(&self) -> Vec<PlugRef> {
        std::mem::take(&mut *lock(&self.pending))
    }
}

/// What a node learns about itself when it is created
#[derive(Clone)]
pub struct NodeContext {
    pub id: NodeId,
    pub name: String,
    pub dag_path: Option<String>,
    dirty: DirtyQueue,
}

impl NodeContext {
    pub(crate) fn new(id: NodeId, name: String, dag_path: Option<String>, dirty: DirtyQueue) -> Self {
        Self {
            id,
            name,
            dag_path,
            dirty,
        }
    }

    /// Ask the graph to dirty one of this node's plugs
    pub fn request_dirty(&self, attribute: &str) {
        self.dirty.request(PlugRef::new(self.id, attribute));
    }

    pub fn dirty_queue(&self) -> &DirtyQueue {
        &self.dirty
    }
}

/// A dependency-graph node
pub trait DgNode: Any + Send {
    fn class(&self) -> Arc<NodeClass>;

    /// Called once after the node joins the graph
    fn post_constructor(&mut self, _context: &NodeContext) {}

    /// Compute `plug`. Plugs a node does not own answer
    /// [`Status::UnknownParameter`].
    fn compute(&mut self, _plug: &str, _data: &mut DataBlock) -> Status {
        Status::UnknownParameter
    }

    /// `plug` is being dirtied; push any extra attributes to dirty
    fn set_dependents_dirty(&mut self, _plug: &str, _affected: &mut Vec<String>) -> Status {
        Status::Success
    }

    fn connection_made(&mut self, _plug: &str, _other: &PlugRef, _as_source: bool) -> Status {
        Status::UnknownParameter
    }

    fn connection_broken(&mut self, _plug: &str, _other: &PlugRef, _as_source: bool) -> Status {
        Status::UnknownParameter
    }

    /// Called just before the node leaves the graph
    fn pre_removal(&mut self) {}

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}
