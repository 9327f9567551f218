//! Proxy shape hooks
//!
//! Derived proxy shape types customise stage composition and bounds by
//! supplying their own hooks; the base behaviour is in [`BaseHooks`].

use crate::nodes::DataBlock;
use crate::proxy_shape::base::ProxyShape;
use crate::usd::{BoundingBox, LayerHandle, TimeCode};

pub trait ProxyShapeHooks: Send + Sync {
    /// Session layer to compose a newly opened stage with. `None` gives
    /// the stage its own anonymous session layer.
    fn compute_session_layer(&self, _data: &DataBlock) -> Option<LayerHandle> {
        None
    }

    /// Box to cache when the computed bound is empty
    fn cache_empty_bounding_box(&self) -> BoundingBox {
        BoundingBox::empty()
    }

    /// Bound of the shape at `time`
    fn compute_bounding_box(&self, shape: &ProxyShape<'_>, time: TimeCode) -> BoundingBox {
        shape.stage_bounding_box(time)
    }
}

/// Hooks of the plain proxy shape
#[derive(Debug, Clone, Copy, Default)]
pub struct BaseHooks;

impl ProxyShapeHooks for BaseHooks {}
