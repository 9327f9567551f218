//! Notices broadcast by proxy shapes

use std::sync::Arc;

use crate::listener::ChangeType;
use crate::nodes::NodeId;
use crate::usd::{NoticeRegistry, ObjectsChanged, SdfPath, StageWeak};

/// A proxy shape output a stage
#[derive(Debug, Clone)]
pub struct ProxyStageSet {
    pub node: NodeId,
    pub dag_path: String,
    pub stage: StageWeak,
}

/// A stage-shaping input of a proxy shape was dirtied while it had a stage
#[derive(Debug, Clone)]
pub struct ProxyStageInvalidate {
    pub node: NodeId,
    pub dag_path: String,
    pub root_prim: SdfPath,
}

/// A proxy shape's stage reported an update or resync
#[derive(Debug, Clone)]
pub struct ProxyStageObjectsChanged {
    pub node: NodeId,
    pub dag_path: String,
    pub change: ChangeType,
    pub notice: ObjectsChanged,
}

/// The three proxy notice channels. One set per plugin host.
pub struct ProxyNotices {
    pub stage_set: Arc<NoticeRegistry<ProxyStageSet>>,
    pub stage_invalidate: Arc<NoticeRegistry<ProxyStageInvalidate>>,
    pub objects_changed: Arc<NoticeRegistry<ProxyStageObjectsChanged>>,
}

impl Default for ProxyNotices {
    fn default() -> Self {
        Self::new()
    }
}

impl ProxyNotices {
    pub fn new() -> Self {
        Self {
            stage_set: NoticeRegistry::new(),
            stage_invalidate: NoticeRegistry::new(),
            objects_changed: NoticeRegistry::new(),
        }
    }
}
