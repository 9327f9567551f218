//! Proxy delegate
//!
//! Mirrors the gprims of one proxy shape's stage into a render index.
//! Stage notices are classified and queued as they arrive; [`sync`]
//! applies them: a resync removes and repopulates the affected subtree,
//! an update dirties the rprims the changed properties feed.
//!
//! [`sync`]: ProxyDelegate::sync

use std::sync::{Arc, Mutex};

use crate::hydra::render_index::{dirty_bits, DirtyBits, RenderIndex};
use crate::listener::{classify_objects_changed, ChangeType, StageNoticeListener};
use crate::proxy_shape::ProxyShape;
use crate::sync::lock;
use crate::usd::{ObjectsChanged, Prim, SdfPath, Stage, TimeCode};

/// Rprim type for a USD prim type, if it is drawable
fn rprim_type(prim_type: &str) -> Option<&'static str> {
    match prim_type {
        "Mesh" | "Cube" | "Sphere" | "Cylinder" | "Cone" | "Capsule" => Some("mesh"),
        "Points" => Some("points"),
        "BasisCurves" => Some("basisCurves"),
        _ => None,
    }
}

/// Dirty bits an edit of `property` causes
fn dirty_bits_for_property(property: &str) -> DirtyBits {
    match property {
        "points" => dirty_bits::DIRTY_POINTS | dirty_bits::DIRTY_EXTENT,
        "size" | "radius" | "height" | "extent" => dirty_bits::DIRTY_POINTS | dirty_bits::DIRTY_EXTENT,
        "visibility" => dirty_bits::DIRTY_VISIBILITY,
        "faceVertexCounts" | "faceVertexIndices" => dirty_bits::DIRTY_TOPOLOGY,
        name if name.starts_with("xformOp") => dirty_bits::DIRTY_TRANSFORM,
        name if name.starts_with("primvars:") => dirty_bits::DIRTY_PRIMVAR,
        _ => dirty_bits::DIRTY_PRIMVAR,
    }
}

const TIME_VARYING: DirtyBits = dirty_bits::DIRTY_POINTS
    | dirty_bits::DIRTY_TRANSFORM
    | dirty_bits::DIRTY_VISIBILITY
    | dirty_bits::DIRTY_EXTENT
    | dirty_bits::DIRTY_PRIMVAR;

pub struct ProxyDelegate {
    delegate_id: SdfPath,
    render_index: Arc<RenderIndex>,
    stage: Option<Stage>,
    root: SdfPath,
    listener: StageNoticeListener,
    pending: Arc<Mutex<Vec<(ChangeType, ObjectsChanged)>>>,
    time: TimeCode,
    excluded: Vec<SdfPath>,
    complexity: i64,
    populated: bool,
}

impl ProxyDelegate {
    /// Rprims are inserted below `delegate_id`
    pub fn new(delegate_id: SdfPath, render_index: Arc<RenderIndex>) -> Self {
        let pending: Arc<Mutex<Vec<(ChangeType, ObjectsChanged)>>> = Arc::default();
        let listener = StageNoticeListener::new();
        let queue = pending.clone();
        listener.set_stage_objects_changed_callback(move |notice| {
            let change = classify_objects_changed(notice);
            if change != ChangeType::Ignored {
                lock(&queue).push((change, notice.clone()));
            }
        });
        Self {
            delegate_id,
            render_index,
            stage: None,
            root: SdfPath::absolute_root(),
            listener,
            pending,
            time: TimeCode::DEFAULT,
            excluded: Vec::new(),
            complexity: 0,
            populated: false,
        }
    }

    pub fn delegate_id(&self) -> &SdfPath {
        &self.delegate_id
    }

    pub fn stage(&self) -> Option<&Stage> {
        self.stage.as_ref()
    }

    pub fn time(&self) -> TimeCode {
        self.time
    }

    pub fn complexity(&self) -> i64 {
        self.complexity
    }

    /// Render-index path for a prim path
    pub fn index_path(&self, prim_path: &SdfPath) -> Option<SdfPath> {
        prim_path.replace_prefix(&SdfPath::absolute_root(), &self.delegate_id)
    }

    /// Show `stage` from `root` down. Changing either drops every rprim.
    pub fn set_stage(&mut self, stage: Option<Stage>, root: SdfPath) {
        let same_stage = match (&self.stage, &stage) {
            (Some(current), Some(new)) => current.ptr_eq(new),
            (None, None) => true,
            _ => false,
        };
        if same_stage && self.root == root {
            return;
        }
        self.clear();
        self.listener.set_stage(stage.as_ref());
        self.stage = stage;
        self.root = root;
    }

    pub fn set_time(&mut self, time: TimeCode) {
        if self.time == time {
            return;
        }
        self.time = time;
        for id in self.render_index.rprim_subtree(&self.delegate_id) {
            self.render_index.mark_rprim_dirty(&id, TIME_VARYING);
        }
    }

    pub fn set_exclude_paths(&mut self, excluded: Vec<SdfPath>) {
        if self.excluded == excluded {
            return;
        }
        self.excluded = excluded;
        if self.populated {
            self.render_index.remove_subtree(&self.delegate_id);
            self.populated = false;
        }
    }

    pub fn set_complexity(&mut self, complexity: i64) {
        if self.complexity == complexity {
            return;
        }
        self.complexity = complexity;
        for id in self.render_index.rprim_subtree(&self.delegate_id) {
            self.render_index.mark_rprim_dirty(&id, dirty_bits::DIRTY_DISPLAY_STYLE);
        }
    }

    /// Notices waiting for [`sync`](Self::sync)
    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }

    fn is_excluded(&self, path: &SdfPath) -> bool {
        self.excluded.iter().any(|excluded| path.has_prefix(excluded))
    }

    fn populate_subtree(&self, prim: &Prim) -> usize {
        if !prim.is_valid() || self.is_excluded(prim.path()) {
            return 0;
        }
        if !prim.path().is_absolute_root() && !prim.is_active() {
            return 0;
        }
        let mut inserted = 0;
        if let Some(kind) = prim.type_name().as_deref().and_then(rprim_type) {
            if let Some(id) = self.index_path(prim.path()) {
                self.render_index.insert_rprim(kind, &self.delegate_id, id);
                inserted += 1;
            }
        }
        for child in prim.children() {
            inserted += self.populate_subtree(&child);
        }
        inserted
    }

    fn populate(&mut self) {
        self.populated = true;
        let Some(stage) = &self.stage else {
            return;
        };
        let root = stage.prim_at_path(&self.root);
        let inserted = self.populate_subtree(&root);
        log::debug!("{} populated {} rprims", self.delegate_id, inserted);
    }

    /// Bring the render index up to date. Returns how many notices were
    /// applied.
    pub fn sync(&mut self) -> usize {
        if !self.populated {
            // A full population supersedes anything queued
            lock(&self.pending).clear();
            self.populate();
            return 0;
        }

        let pending = std::mem::take(&mut *lock(&self.pending));
        for (change, notice) in &pending {
            match change {
                ChangeType::Resync => self.apply_resync(notice),
                ChangeType::Update => self.apply_update(notice.changed_info_only_paths()),
                ChangeType::Ignored => {}
            }
        }
        pending.len()
    }

    fn apply_resync(&self, notice: &ObjectsChanged) {
        let Some(stage) = &self.stage else {
            return;
        };
        let (properties, prims): (Vec<SdfPath>, Vec<SdfPath>) = notice
            .resynced_paths()
            .iter()
            .cloned()
            .partition(SdfPath::is_property_path);

        for path in prims {
            if !path.has_prefix(&self.root) && !self.root.has_prefix(&path) {
                continue;
            }
            // A resync above the root repopulates from the root
            let start = if self.root.has_prefix(&path) {
                self.root.clone()
            } else {
                path
            };
            if let Some(id) = self.index_path(&start) {
                self.render_index.remove_subtree(&id);
            }
            self.populate_subtree(&stage.prim_at_path(&start));
        }
        self.apply_update(&properties);
        // Changed-info paths in a resync notice are plain updates
        self.apply_update(notice.changed_info_only_paths());
    }

    fn apply_update(&self, paths: &[SdfPath]) {
        for path in paths {
            let prim_path = path.prim_path();
            let Some(id) = self.index_path(&prim_path) else {
                continue;
            };
            let bits = path
                .property_name()
                .map_or(dirty_bits::ALL_DIRTY, dirty_bits_for_property);

            if bits & dirty_bits::DIRTY_TRANSFORM != 0 || bits == dirty_bits::ALL_DIRTY {
                // Transforms and metadata reach every descendant
                for rprim in self.render_index.rprim_subtree(&id) {
                    self.render_index.mark_rprim_dirty(&rprim, bits);
                }
            } else if self.render_index.has_rprim(&id) {
                self.render_index.mark_rprim_dirty(&id, bits);
            }
        }
    }

    /// Take stage, time, exclusions and complexity from a proxy shape, then
    /// sync
    pub fn sync_from_shape(&mut self, shape: &ProxyShape<'_>) -> usize {
        let data = shape.stage_data();
        self.set_stage(data.stage, data.prim_path);
        self.set_time(shape.output_time());
        self.set_exclude_paths(shape.exclude_prim_paths());
        self.set_complexity(shape.complexity());
        self.sync()
    }

    /// Drop every rprim and stop listening
    pub fn clear(&mut self) {
        self.render_index.remove_subtree(&self.delegate_id);
        self.listener.set_stage(None);
        lock(&self.pending).clear();
        self.stage = None;
        self.populated = false;
    }
}

impl Drop for ProxyDelegate {
    fn drop(&mut self) {
        self.listener.revoke();
        self.render_index.remove_subtree(&self.delegate_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usd::Value;

    fn path(text: &str) -> SdfPath {
        SdfPath::new(text).unwrap()
    }

    fn stage_with_meshes() -> Stage {
        let stage = Stage::create_in_memory("delegate.usda");
        stage.define_prim(&path("/world"), "Xform").unwrap();
        stage.define_prim(&path("/world/cube"), "Cube").unwrap();
        stage.define_prim(&path("/world/ball"), "Sphere").unwrap();
        stage.set_attribute(&path("/world/ball"), "radius", Value::Double(1.0)).unwrap();
        stage
    }

    fn delegate(index: &Arc<RenderIndex>, stage: &Stage) -> ProxyDelegate {
        let mut delegate = ProxyDelegate::new(path("/ProxyDelegate"), index.clone());
        delegate.set_stage(Some(stage.clone()), SdfPath::absolute_root());
        delegate.sync();
        delegate
    }

    #[test]
    fn test_populates_gprims() {
        let index = Arc::new(RenderIndex::new());
        let stage = stage_with_meshes();
        let _delegate = delegate(&index, &stage);
        assert_eq!(
            index.rprim_ids(),
            vec![path("/ProxyDelegate/world/ball"), path("/ProxyDelegate/world/cube")]
        );
    }

    #[test]
    fn test_update_dirties_one_rprim() {
        let index = Arc::new(RenderIndex::new());
        let stage = stage_with_meshes();
        let mut delegate = delegate(&index, &stage);
        let ball = path("/ProxyDelegate/world/ball");
        let cube = path("/ProxyDelegate/world/cube");
        index.mark_rprim_clean(&ball);
        index.mark_rprim_clean(&cube);

        stage.set_attribute(&path("/world/ball"), "radius", Value::Double(2.0)).unwrap();
        assert_eq!(delegate.pending_count(), 1);
        assert_eq!(delegate.sync(), 1);
        assert_eq!(
            index.dirty_bits(&ball),
            dirty_bits::DIRTY_POINTS | dirty_bits::DIRTY_EXTENT
        );
        assert_eq!(index.dirty_bits(&cube), dirty_bits::CLEAN);
    }

    #[test]
    fn test_resync_repopulates_subtree() {
        let index = Arc::new(RenderIndex::new());
        let stage = stage_with_meshes();
        let mut delegate = delegate(&index, &stage);

        stage.define_prim(&path("/world/mesh"), "Mesh").unwrap();
        stage.remove_prim(&path("/world/cube")).unwrap();
        delegate.sync();
        assert_eq!(
            index.rprim_ids(),
            vec![path("/ProxyDelegate/world/ball"), path("/ProxyDelegate/world/mesh")]
        );
    }

    #[test]
    fn test_exclusions_and_time() {
        let index = Arc::new(RenderIndex::new());
        let stage = stage_with_meshes();
        let mut delegate = delegate(&index, &stage);
        let ball = path("/ProxyDelegate/world/ball");

        delegate.set_exclude_paths(vec![path("/world/cube")]);
        delegate.sync();
        assert_eq!(index.rprim_ids(), vec![ball.clone()]);

        index.mark_rprim_clean(&ball);
        delegate.set_time(TimeCode::new(3.0));
        assert_eq!(index.dirty_bits(&ball), TIME_VARYING);
    }

    #[test]
    fn test_clear_on_stage_change() {
        let index = Arc::new(RenderIndex::new());
        let stage = stage_with_meshes();
        let mut delegate = delegate(&index, &stage);
        delegate.set_stage(None, SdfPath::absolute_root());
        assert_eq!(index.rprim_count(), 0);

        stage.define_prim(&path("/world/late"), "Mesh").unwrap();
        assert_eq!(delegate.pending_count(), 0);
    }
}
