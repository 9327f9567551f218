//! Metadata pairing a pulled USD prim with the Maya node editing it
//!
//! The prim carries the node's DAG path in custom data; the node carries
//! the prim's scene-item path in a dynamic string attribute. Merge
//! workflows find each side from the other through these two keys.

use crate::error::{DgError, UsdError};
use crate::nodes::{Attribute, DependencyGraph, NodeId, PlugData};
use crate::ufe::UfePath;
use crate::usd::{Prim, SdfPath, Stage, Value};

/// Custom-data key on the USD prim holding the Maya DAG path
pub const PULL_DAG_PATH_KEY: &str = "Maya:Pull:DagPath";

/// Dynamic attribute on the Maya node holding the prim's path
pub const PULL_UFE_PATH_ATTR: &str = "Pull_UfePath";

pub fn write_pulled_dag_path(stage: &Stage, prim_path: &SdfPath, dag_path: &str) -> Result<(), UsdError> {
    stage.set_custom_data(prim_path, PULL_DAG_PATH_KEY, Value::String(dag_path.to_string()))
}

pub fn read_pulled_dag_path(prim: &Prim) -> Option<String> {
    prim.custom_data(PULL_DAG_PATH_KEY)
        .and_then(|value| value.as_str().map(str::to_string))
        .filter(|path| !path.is_empty())
}

pub fn remove_pulled_dag_path(stage: &Stage, prim_path: &SdfPath) -> Result<bool, UsdError> {
    stage.clear_custom_data(prim_path, PULL_DAG_PATH_KEY)
}

/// Store `path` on the node, creating the attribute on first use
pub fn write_pulled_ufe_path(graph: &DependencyGraph, node: NodeId, path: &UfePath) -> Result<(), DgError> {
    graph.add_dynamic_attribute(
        node,
        Attribute::input(PULL_UFE_PATH_ATTR, "").connectable(false),
    )?;
    graph.set_value(node, PULL_UFE_PATH_ATTR, path.to_string())
}

/// The stored path, if the node has one and it parses
pub fn read_pulled_ufe_path(graph: &DependencyGraph, node: NodeId) -> Option<UfePath> {
    if !graph.has_attribute(node, PULL_UFE_PATH_ATTR) {
        return None;
    }
    match graph.get_value(node, PULL_UFE_PATH_ATTR) {
        Ok(PlugData::String(text)) if !text.is_empty() => match text.parse() {
            Ok(path) => Some(path),
            Err(err) => {
                log::warn!("Node {} has an unreadable {}: {}", node, PULL_UFE_PATH_ATTR, err);
                None
            }
        },
        _ => None,
    }
}

pub fn remove_pulled_ufe_path(graph: &DependencyGraph, node: NodeId) -> Result<bool, DgError> {
    graph.remove_dynamic_attribute(node, PULL_UFE_PATH_ATTR)
}

/// Find the prim a pulled node was made from. The returned prim is
/// invalid if the path no longer resolves.
pub fn pulled_prim(graph: &DependencyGraph, node: NodeId, stage: &Stage) -> Prim {
    read_pulled_ufe_path(graph, node)
        .map(|path| stage.prim_at_path(path.prim_path()))
        .unwrap_or_default()
}
