//! Stages subject
//!
//! Turns per-stage USD notices into scene-item notifications for observers
//! and keeps one listener pair (objects changed, edit target changed) per
//! stage shown by some proxy shape. The listener table is never patched:
//! it is dropped and rebuilt on scene changes, stage sets and stage
//! invalidations.
//!
//! The host can report "after new scene" without a preceding "before new
//! scene"; such a message is ignored.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use crate::nodes::{CallbackId, MessageRegistry, SceneMessage};
use crate::proxy_shape::{ProxyNotices, ProxyShapeRegistry, ProxyStageInvalidate, ProxyStageSet};
use crate::sync::{lock, read, write};
use crate::ufe::{UfePath, UsdStageMap};
use crate::usd::{ListenerKey, ObjectsChanged, Stage, StageEditTargetChanged, StageWeak};

/// What observers hear about scene items
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// Everything at and below the item must be re-read
    SubtreeInvalidate(UfePath),
    ObjectAdd(UfePath),
    ObjectPostDelete(UfePath),
    AttributeValueChanged { path: UfePath, attribute: String },
    ObjectMetadataChanged(UfePath),
    /// The edit target of the stage behind this proxy shape changed
    EditTargetChanged(UfePath),
}

pub type ObserverId = u64;

type Observer = Arc<dyn Fn(&Notification) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SceneTransition {
    Idle,
    /// Between a "before" and an "after" scene message
    InTransition,
}

/// Subscriptions held for one stage. Revoked when dropped.
struct StageListeners {
    stage: StageWeak,
    objects_changed: ListenerKey,
    edit_target_changed: ListenerKey,
}

impl Drop for StageListeners {
    fn drop(&mut self) {
        self.objects_changed.revoke();
        self.edit_target_changed.revoke();
    }
}

struct SubjectState {
    transition: SceneTransition,
    listeners: Vec<StageListeners>,
    pending_invalidates: BTreeSet<UfePath>,
}

/// Decrements on drop
struct CountGuard<'a>(&'a AtomicUsize);

impl<'a> CountGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for CountGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct StagesSubject {
    this: Weak<StagesSubject>,
    registry: Arc<ProxyShapeRegistry>,
    stage_map: Arc<UsdStageMap>,
    state: Mutex<SubjectState>,
    observers: RwLock<Vec<(ObserverId, Observer)>>,
    next_observer: AtomicU64,
    stage_set_guard: AtomicUsize,
    add_or_delete_depth: AtomicUsize,
}

impl StagesSubject {
    pub fn new(registry: Arc<ProxyShapeRegistry>, stage_map: Arc<UsdStageMap>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            registry,
            stage_map,
            state: Mutex::new(SubjectState {
                transition: SceneTransition::Idle,
                listeners: Vec::new(),
                pending_invalidates: BTreeSet::new(),
            }),
            observers: RwLock::new(Vec::new()),
            next_observer: AtomicU64::new(1),
            stage_set_guard: AtomicUsize::new(0),
            add_or_delete_depth: AtomicUsize::new(0),
        })
    }

    pub fn stage_map(&self) -> &Arc<UsdStageMap> {
        &self.stage_map
    }

    /// Follow the proxy shapes' stage-set and stage-invalidate notices
    pub fn attach(&self, notices: &ProxyNotices) -> Vec<ListenerKey> {
        let this = self.this.clone();
        let stage_set = notices.stage_set.register(move |notice| {
            if let Some(subject) = this.upgrade() {
                subject.on_stage_set(notice);
            }
        });
        let this = self.this.clone();
        let stage_invalidate = notices.stage_invalidate.register(move |notice| {
            if let Some(subject) = this.upgrade() {
                subject.on_stage_invalidate(notice);
            }
        });
        vec![stage_set, stage_invalidate]
    }

    /// Follow scene new/open messages
    pub fn register_scene_callbacks(&self, messages: &MessageRegistry) -> Vec<CallbackId> {
        [
            SceneMessage::BeforeNew,
            SceneMessage::BeforeOpen,
            SceneMessage::AfterNew,
            SceneMessage::AfterOpen,
        ]
        .into_iter()
        .map(|message| {
            let this = self.this.clone();
            messages.add_scene_callback(message, move |message| {
                let Some(subject) = this.upgrade() else {
                    return;
                };
                match message {
                    SceneMessage::BeforeNew | SceneMessage::BeforeOpen => {
                        subject.before_scene_change()
                    }
                    SceneMessage::AfterNew | SceneMessage::AfterOpen => {
                        subject.after_scene_change();
                    }
                }
            })
        })
        .collect()
    }

    pub fn transition(&self) -> SceneTransition {
        lock(&self.state).transition
    }

    pub fn before_scene_change(&self) {
        lock(&self.state).transition = SceneTransition::InTransition;
        self.clear_listeners();
        self.stage_map.set_dirty();
    }

    /// Returns false when no scene change was in progress and the message
    /// was ignored
    pub fn after_scene_change(&self) -> bool {
        {
            let mut state = lock(&self.state);
            if state.transition != SceneTransition::InTransition {
                log::warn!("Ignoring scene-change completion outside of a scene change");
                return false;
            }
            state.transition = SceneTransition::Idle;
        }
        self.setup_listeners();
        true
    }

    /// A proxy shape published a stage. Listeners are rebuilt and deferred
    /// invalidations sent, unless this is nested in another stage set or in
    /// a nested compute of the shape.
    pub fn on_stage_set(&self, notice: &ProxyStageSet) {
        self.stage_map.set_dirty();

        if self.stage_set_guard.load(Ordering::SeqCst) > 0 {
            log::debug!("Nested stage set from {}; listeners unchanged", notice.dag_path);
            return;
        }
        let nested_compute = self
            .registry
            .get(notice.node)
            .map_or(false, |shape| shape.in_compute() > 1);
        if nested_compute {
            log::debug!("Stage set from a nested compute of {}", notice.dag_path);
            return;
        }

        let _guard = CountGuard::enter(&self.stage_set_guard);
        self.setup_listeners();

        let pending = std::mem::take(&mut lock(&self.state).pending_invalidates);
        for path in pending {
            self.notify(&Notification::SubtreeInvalidate(path));
        }
    }

    /// Observers are told later, from [`on_stage_set`](Self::on_stage_set);
    /// this runs during dirty propagation.
    pub fn on_stage_invalidate(&self, notice: &ProxyStageInvalidate) {
        self.clear_listeners();
        self.stage_map.set_dirty();
        lock(&self.state)
            .pending_invalidates
            .insert(UfePath::proxy(notice.dag_path.clone()));
    }

    pub fn pending_invalidates(&self) -> Vec<UfePath> {
        lock(&self.state).pending_invalidates.iter().cloned().collect()
    }

    fn clear_listeners(&self) {
        let old = std::mem::take(&mut lock(&self.state).listeners);
        drop(old);
    }

    fn setup_listeners(&self) {
        let listeners: Vec<StageListeners> = self
            .registry
            .all_stages()
            .iter()
            .map(|stage| self.listen_to(stage))
            .collect();
        log::debug!("Listening to {} stages", listeners.len());
        let old = std::mem::replace(&mut lock(&self.state).listeners, listeners);
        drop(old);
    }

    fn listen_to(&self, stage: &Stage) -> StageListeners {
        let this = self.this.clone();
        let objects_changed = stage.objects_changed().register(move |notice| {
            if let Some(subject) = this.upgrade() {
                subject.stage_changed(notice);
            }
        });
        let this = self.this.clone();
        let edit_target_changed = stage.edit_target_changed().register(move |notice| {
            if let Some(subject) = this.upgrade() {
                subject.stage_edit_target_changed(notice);
            }
        });
        StageListeners {
            stage: stage.downgrade(),
            objects_changed,
            edit_target_changed,
        }
    }

    /// Stages with a live listener pair
    pub fn listened_stages(&self) -> Vec<Stage> {
        lock(&self.state)
            .listeners
            .iter()
            .filter_map(|listeners| listeners.stage.upgrade())
            .collect()
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.state).listeners.len()
    }

    pub fn add_observer<F>(&self, observer: F) -> ObserverId
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        let id = self.next_observer.fetch_add(1, Ordering::SeqCst);
        write(&self.observers).push((id, Arc::new(observer)));
        id
    }

    pub fn remove_observer(&self, id: ObserverId) -> bool {
        let mut observers = write(&self.observers);
        let before = observers.len();
        observers.retain(|(observer, _)| *observer != id);
        observers.len() != before
    }

    pub fn observer_count(&self) -> usize {
        read(&self.observers).len()
    }

    fn notify(&self, notification: &Notification) {
        let observers: Vec<Observer> = read(&self.observers)
            .iter()
            .map(|(_, observer)| observer.clone())
            .collect();
        for observer in observers {
            observer(notification);
        }
    }

    /// Run `f` as an add or delete operation: prims resynced into
    /// existence meanwhile are reported as added instead of invalidated
    pub fn with_add_or_delete<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = CountGuard::enter(&self.add_or_delete_depth);
        f()
    }

    pub fn in_add_or_delete(&self) -> bool {
        self.add_or_delete_depth.load(Ordering::SeqCst) > 0
    }

    fn stage_changed(&self, notice: &ObjectsChanged) {
        let Some(stage) = notice.stage() else {
            return;
        };
        let proxies = self.stage_map.paths(&stage);
        let adding = self.in_add_or_delete();

        let mut notifications = Vec::new();
        for proxy in &proxies {
            for path in notice.resynced_paths() {
                if let Some(attribute) = path.property_name() {
                    notifications.push(Notification::AttributeValueChanged {
                        path: proxy.with_prim(path.prim_path()),
                        attribute: attribute.to_string(),
                    });
                } else if path.is_absolute_root() {
                    notifications.push(Notification::SubtreeInvalidate(proxy.clone()));
                } else if !stage.prim_at_path(path).is_valid() {
                    notifications.push(Notification::ObjectPostDelete(proxy.with_prim(path.clone())));
                } else if adding {
                    notifications.push(Notification::ObjectAdd(proxy.with_prim(path.clone())));
                } else {
                    notifications.push(Notification::SubtreeInvalidate(proxy.with_prim(path.clone())));
                }
            }
            for path in notice.changed_info_only_paths() {
                match path.property_name() {
                    Some(attribute) => notifications.push(Notification::AttributeValueChanged {
                        path: proxy.with_prim(path.prim_path()),
                        attribute: attribute.to_string(),
                    }),
                    None => notifications.push(Notification::ObjectMetadataChanged(
                        proxy.with_prim(path.clone()),
                    )),
                }
            }
        }

        for notification in &notifications {
            self.notify(notification);
        }
    }

    fn stage_edit_target_changed(&self, notice: &StageEditTargetChanged) {
        let Some(stage) = notice.stage.upgrade() else {
            return;
        };
        for proxy in self.stage_map.paths(&stage) {
            self.notify(&Notification::EditTargetChanged(proxy));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::{DependencyGraph, NodeId};
    use crate::proxy_shape::{attr, ProxyShapeBase, ProxyShapeServices};
    use crate::usd::{SdfPath, StageCache, Value};

    struct Fixture {
        graph: DependencyGraph,
        services: ProxyShapeServices,
        subject: Arc<StagesSubject>,
        _keys: Vec<ListenerKey>,
        seen: Arc<Mutex<Vec<Notification>>>,
    }

    fn fixture() -> Fixture {
        let services = ProxyShapeServices::new(Arc::new(StageCache::new()));
        let stage_map = Arc::new(UsdStageMap::new(services.registry.clone()));
        let subject = StagesSubject::new(services.registry.clone(), stage_map);
        let keys = subject.attach(&services.notices);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        subject.add_observer(move |n| lock(&sink).push(n.clone()));
        Fixture {
            graph: DependencyGraph::new(),
            services,
            subject,
            _keys: keys,
            seen,
        }
    }

    fn shape_with_stage(fx: &Fixture, name: &str) -> (NodeId, Stage) {
        let node = fx
            .graph
            .create_node(Box::new(ProxyShapeBase::new(fx.services.clone())), name, None)
            .unwrap();
        let stage = Stage::create_in_memory("subject.usda");
        let id = fx.services.stage_cache.insert(stage.clone());
        fx.graph.set_value(node, attr::STAGE_CACHE_ID, id.to_i64()).unwrap();
        fx.services.shape(&fx.graph, node).unwrap().stage();
        (node, stage)
    }

    fn prim(path: &str) -> SdfPath {
        SdfPath::new(path).unwrap()
    }

    #[test]
    fn test_stage_set_installs_listeners() {
        let fx = fixture();
        let (_node, stage) = shape_with_stage(&fx, "stageShape");
        assert_eq!(fx.subject.listener_count(), 1);
        assert!(fx.subject.listened_stages()[0].ptr_eq(&stage));
        assert_eq!(
            fx.subject.stage_map().path(&stage),
            Some(UfePath::proxy("|stageShape"))
        );
    }

    #[test]
    fn test_stage_edits_become_notifications() {
        let fx = fixture();
        let (_node, stage) = shape_with_stage(&fx, "stageShape");
        let proxy = UfePath::proxy("|stageShape");

        stage.define_prim(&prim("/a"), "Xform").unwrap();
        fx.subject.with_add_or_delete(|| {
            stage.define_prim(&prim("/b"), "Xform").unwrap();
        });
        stage.set_attribute(&prim("/a"), "size", Value::Double(1.0)).unwrap();
        stage.set_attribute(&prim("/a"), "size", Value::Double(2.0)).unwrap();
        stage.remove_prim(&prim("/b")).unwrap();

        let seen = lock(&fx.seen).clone();
        let size = Notification::AttributeValueChanged {
            path: proxy.with_prim(prim("/a")),
            attribute: "size".to_string(),
        };
        assert_eq!(
            seen,
            vec![
                Notification::SubtreeInvalidate(proxy.with_prim(prim("/a"))),
                Notification::ObjectAdd(proxy.with_prim(prim("/b"))),
                size.clone(),
                size,
                Notification::ObjectPostDelete(proxy.with_prim(prim("/b"))),
            ]
        );
    }

    #[test]
    fn test_edit_target_change() {
        let fx = fixture();
        let (_node, stage) = shape_with_stage(&fx, "stageShape");
        stage.set_edit_target(stage.session_layer()).unwrap();
        assert_eq!(
            *lock(&fx.seen),
            vec![Notification::EditTargetChanged(UfePath::proxy("|stageShape"))]
        );
    }

    #[test]
    fn test_invalidate_is_deferred_until_stage_set() {
        let fx = fixture();
        let (node, _stage) = shape_with_stage(&fx, "stageShape");

        fx.graph.set_value(node, attr::PRIM_PATH, "/").unwrap();
        assert_eq!(fx.subject.listener_count(), 0);
        assert_eq!(fx.subject.pending_invalidates(), vec![UfePath::proxy("|stageShape")]);
        assert!(lock(&fx.seen).is_empty());

        fx.services.shape(&fx.graph, node).unwrap().stage();
        assert_eq!(
            *lock(&fx.seen),
            vec![Notification::SubtreeInvalidate(UfePath::proxy("|stageShape"))]
        );
        assert!(fx.subject.pending_invalidates().is_empty());
        assert_eq!(fx.subject.listener_count(), 1);
    }

    #[test]
    fn test_nested_compute_skips_rebuild() {
        let fx = fixture();
        let (node, stage) = shape_with_stage(&fx, "stageShape");
        fx.subject.before_scene_change();
        assert_eq!(fx.subject.listener_count(), 0);

        let state = fx.services.registry.get(node).unwrap();
        let _outer = state.enter_compute();
        let _inner = state.enter_compute();
        fx.subject.on_stage_set(&ProxyStageSet {
            node,
            dag_path: state.dag_path(),
            stage: stage.downgrade(),
        });
        assert_eq!(fx.subject.listener_count(), 0);
    }

    #[test]
    fn test_after_without_before_is_ignored() {
        let fx = fixture();
        let (_node, _stage) = shape_with_stage(&fx, "stageShape");
        let _ids = fx.subject.register_scene_callbacks(fx.graph.messages());

        assert!(!fx.subject.after_scene_change());
        assert_eq!(fx.subject.transition(), SceneTransition::Idle);

        fx.graph.messages().fire_scene(SceneMessage::BeforeOpen);
        assert_eq!(fx.subject.transition(), SceneTransition::InTransition);
        assert_eq!(fx.subject.listener_count(), 0);
        assert!(fx.subject.stage_map().is_dirty());

        fx.graph.messages().fire_scene(SceneMessage::AfterOpen);
        assert_eq!(fx.subject.transition(), SceneTransition::Idle);
        assert_eq!(fx.subject.listener_count(), 1);
    }

    #[test]
    fn test_observers_by_id() {
        let fx = fixture();
        let id = fx.subject.add_observer(|_| {});
        assert_eq!(fx.subject.observer_count(), 2);
        assert!(fx.subject.remove_observer(id));
        assert!(!fx.subject.remove_observer(id));
    }
}
