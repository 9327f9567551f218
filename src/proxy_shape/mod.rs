//! The proxy shape node family
//!
//! [`ProxyShapeBase`] resolves and publishes a USD stage on the graph;
//! [`ProxyShapeListenerBase`] turns a cached stage's notices into change
//! counters. The rest of this module is the per-shape machinery around
//! them: stage resolution, bounds caching, notices and the registry of
//! live shapes.

pub mod base;
pub mod bbox_cache;
pub mod closest_point;
pub mod hooks;
pub mod import_data;
pub mod listener_base;
pub mod notices;
pub mod pull_info;
pub mod registry;

pub use base::{
    attr, ComputeGuard, ProxyShape, ProxyShapeBase, ProxyShapeServices, ProxyShapeState, SelectionMask,
    PROXY_SHAPE_BASE_TYPE, PROXY_SHAPE_TYPE,
};
pub use bbox_cache::{BoundingBoxCache, CacheStatistics};
pub use closest_point::{BoundsIntersector, ClosestPointDelegate, ClosestPointHit, ClosestPointRegistry};
pub use hooks::{BaseHooks, ProxyShapeHooks};
pub use import_data::{ImportData, StageResolver, VariantSelections};
pub use listener_base::{ProxyShapeListenerBase, PROXY_SHAPE_LISTENER_TYPE};
pub use notices::{ProxyNotices, ProxyStageInvalidate, ProxyStageObjectsChanged, ProxyStageSet};
pub use registry::ProxyShapeRegistry;
