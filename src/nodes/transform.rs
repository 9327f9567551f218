//! Transform node: the DAG parent proxy shapes live under

use std::any::Any;
use std::sync::Arc;

use once_cell::sync::Lazy;

use crate::nodes::attribute::{Attribute, NodeClass, NodeKind};
use crate::nodes::node::DgNode;

pub const TRANSFORM_TYPE: &str = "transform";

static TRANSFORM_CLASS: Lazy<Arc<NodeClass>> = Lazy::new(|| {
    Arc::new(
        NodeClass::new(TRANSFORM_TYPE, NodeKind::Dag)
            .with_attribute(Attribute::input("visibility", true)),
    )
});

/// A DAG transform with no computed plugs
#[derive(Debug, Default)]
pub struct TransformNode;

impl DgNode for TransformNode {
    fn class(&self) -> Arc<NodeClass> {
        TRANSFORM_CLASS.clone()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
