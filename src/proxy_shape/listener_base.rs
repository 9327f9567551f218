//! ProxyShapeListenerBase
//!
//! A lightweight node that watches a stage from the stage cache and turns
//! its notices into two counters. Downstream nodes make their outputs
//! depend on `updateId` or `resyncId` instead of holding the stage.

use std::any::Any;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use once_cell::sync::Lazy;

use crate::listener::{classify_objects_changed, ChangeType, StageNoticeListener};
use crate::nodes::{
    Attribute, DataBlock, DgNode, NodeClass, NodeContext, NodeKind, PlugRef, Status,
};
use crate::usd::{Stage, StageCache, StageCacheId};

pub const PROXY_SHAPE_LISTENER_TYPE: &str = "mayaUsdProxyShapeListenerBase";

pub const STAGE_CACHE_ID: &str = "stageCacheId";
pub const OUT_STAGE_CACHE_ID: &str = "outStageCacheId";
pub const UPDATE_ID: &str = "updateId";
pub const RESYNC_ID: &str = "resyncId";

static LISTENER_CLASS: Lazy<Arc<NodeClass>> = Lazy::new(|| {
    Arc::new(
        NodeClass::new(PROXY_SHAPE_LISTENER_TYPE, NodeKind::Dependency)
            .with_attribute(Attribute::input(STAGE_CACHE_ID, -1i64))
            .with_attribute(Attribute::output(OUT_STAGE_CACHE_ID, -1i64))
            .with_attribute(Attribute::output(UPDATE_ID, 0i64))
            .with_attribute(Attribute::output(RESYNC_ID, 0i64))
            .attribute_affects(STAGE_CACHE_ID, OUT_STAGE_CACHE_ID)
            .attribute_affects(STAGE_CACHE_ID, UPDATE_ID)
            .attribute_affects(STAGE_CACHE_ID, RESYNC_ID),
    )
});

/// Change counters. They only ever grow.
#[derive(Debug, Default)]
struct Counters {
    update: AtomicI64,
    resync: AtomicI64,
}

impl Counters {
    /// A resync is always also an update
    fn bump(&self, change: ChangeType) {
        match change {
            ChangeType::Ignored => {}
            ChangeType::Update => {
                self.update.fetch_add(1, Ordering::SeqCst);
            }
            ChangeType::Resync => {
                self.resync.fetch_add(1, Ordering::SeqCst);
                self.update.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    fn update(&self) -> i64 {
        self.update.load(Ordering::SeqCst)
    }

    fn resync(&self) -> i64 {
        self.resync.load(Ordering::SeqCst)
    }
}

pub struct ProxyShapeListenerBase {
    stage_cache: Arc<StageCache>,
    listener: StageNoticeListener,
    counters: Arc<Counters>,
    last_cache_id: Option<i64>,
}

impl ProxyShapeListenerBase {
    pub fn new(stage_cache: Arc<StageCache>) -> Self {
        Self {
            stage_cache,
            listener: StageNoticeListener::new(),
            counters: Arc::new(Counters::default()),
            last_cache_id: None,
        }
    }

    pub fn node_class() -> Arc<NodeClass> {
        LISTENER_CLASS.clone()
    }

    /// Current counter values, without evaluating the node
    pub fn update_id(&self) -> i64 {
        self.counters.update()
    }

    pub fn resync_id(&self) -> i64 {
        self.counters.resync()
    }

    /// Stage the listener is attached to
    pub fn listener_stage(&self) -> Option<Stage> {
        self.listener.stage()
    }

    /// Forget the last id and detach, so the next compute looks the stage
    /// up again. Counters keep growing.
    fn reinit(&mut self) {
        self.last_cache_id = None;
        self.listener.set_stage(None);
        self.counters.bump(ChangeType::Resync);
    }

    fn retarget(&mut self, id: i64) {
        let cache_id = StageCacheId::from_i64(id);
        let stage = if cache_id.is_valid() {
            self.stage_cache.find(cache_id)
        } else {
            None
        };
        if cache_id.is_valid() && stage.is_none() {
            log::debug!("Stage cache id {} is not in the cache", id);
        }
        self.listener.set_stage(stage.as_ref());
        self.last_cache_id = Some(id);
        // A new stage counts as a resync
        self.counters.bump(ChangeType::Resync);
    }
}

impl DgNode for ProxyShapeListenerBase {
    fn class(&self) -> Arc<NodeClass> {
        LISTENER_CLASS.clone()
    }

    fn post_constructor(&mut self, context: &NodeContext) {
        let counters = self.counters.clone();
        let context = context.clone();
        self.listener.set_stage_objects_changed_callback(move |notice| {
            let change = classify_objects_changed(notice);
            if change == ChangeType::Ignored {
                return;
            }
            counters.bump(change);
            context.request_dirty(UPDATE_ID);
            context.request_dirty(RESYNC_ID);
        });
    }

    fn compute(&mut self, plug: &str, data: &mut DataBlock) -> Status {
        if ![OUT_STAGE_CACHE_ID, UPDATE_ID, RESYNC_ID].contains(&plug) {
            return Status::UnknownParameter;
        }

        let id = data.input_int(STAGE_CACHE_ID);
        if self.last_cache_id != Some(id) {
            self.retarget(id);
        }

        data.set_output(OUT_STAGE_CACHE_ID, id);
        data.set_output(UPDATE_ID, self.counters.update());
        data.set_output(RESYNC_ID, self.counters.resync());
        Status::Success
    }

    fn connection_made(&mut self, plug: &str, _other: &PlugRef, as_source: bool) -> Status {
        if plug != STAGE_CACHE_ID || as_source {
            return Status::UnknownParameter;
        }
        self.reinit();
        Status::Success
    }

    fn connection_broken(&mut self, plug: &str, _other: &PlugRef, as_source: bool) -> Status {
        if plug != STAGE_CACHE_ID || as_source {
            return Status::UnknownParameter;
        }
        self.reinit();
        Status::Success
    }

    fn pre_removal(&mut self) {
        self.listener.revoke();
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::{DependencyGraph, NodeId};
    use crate::usd::{SdfPath, Value};

    fn setup() -> (DependencyGraph, Arc<StageCache>, NodeId) {
        let graph = DependencyGraph::new();
        let cache = Arc::new(StageCache::new());
        let node = graph
            .create_node(Box::new(ProxyShapeListenerBase::new(cache.clone())), "listener", None)
            .unwrap();
        (graph, cache, node)
    }

    fn counters(graph: &DependencyGraph, node: NodeId) -> (i64, i64) {
        let update = graph.get_value(node, UPDATE_ID).unwrap().as_int().unwrap();
        let resync = graph.get_value(node, RESYNC_ID).unwrap().as_int().unwrap();
        (update, resync)
    }

    fn listener_stage(graph: &DependencyGraph, node: NodeId) -> Option<Stage> {
        graph
            .with_node(node, |n: &ProxyShapeListenerBase| n.listener_stage())
            .unwrap()
    }

    #[test]
    fn test_unknown_id_passes_through() {
        let (graph, _cache, node) = setup();
        graph.set_value(node, STAGE_CACHE_ID, 42i64).unwrap();
        assert_eq!(graph.get_value(node, OUT_STAGE_CACHE_ID).unwrap().as_int(), Some(42));
        assert!(listener_stage(&graph, node).is_none());
    }

    #[test]
    fn test_counters_follow_notices() {
        let (graph, cache, node) = setup();
        let stage = Stage::create_in_memory("listened.usda");
        let path = SdfPath::new("/a").unwrap();
        stage.define_prim(&path, "Sphere").unwrap();
        stage.set_attribute(&path, "radius", Value::Double(1.0)).unwrap();
        let id = cache.insert(stage.clone());

        graph.set_value(node, STAGE_CACHE_ID, id.to_i64()).unwrap();
        let (update, resync) = counters(&graph, node);
        assert!(listener_stage(&graph, node).unwrap().ptr_eq(&stage));

        stage.set_attribute(&path, "radius", Value::Double(2.0)).unwrap();
        assert_eq!(counters(&graph, node), (update + 1, resync));

        stage.define_prim(&SdfPath::new("/b").unwrap(), "Xform").unwrap();
        assert_eq!(counters(&graph, node), (update + 2, resync + 1));
    }

    #[test]
    fn test_same_id_does_not_bump() {
        let (graph, cache, node) = setup();
        let id = cache.insert(Stage::create_in_memory("same.usda"));
        graph.set_value(node, STAGE_CACHE_ID, id.to_i64()).unwrap();
        let before = counters(&graph, node);
        graph.set_value(node, STAGE_CACHE_ID, id.to_i64()).unwrap();
        assert_eq!(counters(&graph, node), before);
    }

    #[test]
    fn test_rewire_reinitialises_without_reset() {
        let (graph, cache, node) = setup();
        let stage = Stage::create_in_memory("wired.usda");
        let id = cache.insert(stage.clone());

        let source = graph
            .create_node(Box::new(ProxyShapeListenerBase::new(cache.clone())), "source", None)
            .unwrap();
        graph.set_value(source, STAGE_CACHE_ID, id.to_i64()).unwrap();

        let (update, resync) = counters(&graph, node);
        let from = PlugRef::new(source, OUT_STAGE_CACHE_ID);
        let to = PlugRef::new(node, STAGE_CACHE_ID);
        graph.connect(&from, &to).unwrap();
        let (wired_update, wired_resync) = counters(&graph, node);
        assert!(wired_update >= update + 2);
        assert!(wired_resync >= resync + 2);
        assert!(listener_stage(&graph, node).unwrap().ptr_eq(&stage));

        graph.disconnect(&from, &to).unwrap();
        let (update, resync) = counters(&graph, node);
        assert!(update > wired_update);
        assert!(resync > wired_resync);
    }
}
