//! Dependency graph host model
//!
//! A small pull-evaluated node graph: node classes with attributes and
//! affects edges, nodes that compute plugs on demand, and the message
//! callbacks hosts use to track nodes and scene changes.

pub mod attribute;
pub mod data_block;
pub mod graph;
pub mod messages;
pub mod node;
pub mod transform;

pub use attribute::{Attribute, AttributeKind, NodeClass, NodeKind, PlugData, StageData};
pub use data_block::DataBlock;
pub use graph::{Connection, DependencyGraph};
pub use messages::{CallbackId, MessageRegistry, NodeInfo, SceneMessage};
pub use node::{DgNode, DirtyQueue, NodeContext, NodeId, NodeState, PlugRef, Status};
pub use transform::{TransformNode, TRANSFORM_TYPE};
