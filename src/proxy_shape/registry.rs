//! Live proxy shapes
//!
//! Shapes add themselves when created and leave just before removal.
//! Consumers that must not touch the graph (the stages subject, batch
//! renderer) enumerate shapes and their stages from here.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use crate::nodes::NodeId;
use crate::proxy_shape::base::ProxyShapeState;
use crate::sync::{read, write};
use crate::usd::Stage;

#[derive(Default)]
pub struct ProxyShapeRegistry {
    shapes: RwLock<BTreeMap<NodeId, Arc<ProxyShapeState>>>,
}

impl ProxyShapeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add(&self, state: Arc<ProxyShapeState>) {
        write(&self.shapes).insert(state.node(), state);
    }

    pub(crate) fn remove(&self, node: NodeId) -> bool {
        write(&self.shapes).remove(&node).is_some()
    }

    pub fn get(&self, node: NodeId) -> Option<Arc<ProxyShapeState>> {
        read(&self.shapes).get(&node).cloned()
    }

    pub fn find_by_dag_path(&self, dag_path: &str) -> Option<Arc<ProxyShapeState>> {
        read(&self.shapes)
            .values()
            .find(|state| state.dag_path() == dag_path)
            .cloned()
    }

    pub fn shapes(&self) -> Vec<Arc<ProxyShapeState>> {
        read(&self.shapes).values().cloned().collect()
    }

    /// Shapes whose current stage is `stage`
    pub fn shapes_for_stage(&self, stage: &Stage) -> Vec<Arc<ProxyShapeState>> {
        read(&self.shapes)
            .values()
            .filter(|state| state.stage_weak().refers_to(stage))
            .cloned()
            .collect()
    }

    /// Every distinct live stage held by some proxy shape
    pub fn all_stages(&self) -> Vec<Stage> {
        let mut stages: Vec<Stage> = Vec::new();
        for state in read(&self.shapes).values() {
            if let Some(stage) = state.stage() {
                if !stages.iter().any(|s| s.ptr_eq(&stage)) {
                    stages.push(stage);
                }
            }
        }
        stages
    }

    pub fn len(&self) -> usize {
        read(&self.shapes).len()
    }

    pub fn is_empty(&self) -> bool {
        read(&self.shapes).is_empty()
    }
}
