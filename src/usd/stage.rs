//! Stages: a composed view over a session layer and a root layer
//!
//! Opinions are resolved strongest-first over `[session, root]`. Every edit
//! goes to the current edit target and is reported back through the layer
//! to each stage composing it, which turns it into an [`ObjectsChanged`]
//! followed by a [`StageContentsChanged`] notice.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex, Weak};

use glam::{DAffine3, DQuat, DVec3};
use uuid::Uuid;

use crate::error::UsdError;
use crate::sync::lock;
use crate::usd::bounds::{BoundingBox, Purpose, PurposeToggles};
use crate::usd::layer::{
    AttributeSpec, Layer, LayerChanges, LayerData, LayerHandle, LayerObserver, PrimSpec, Specifier,
};
use crate::usd::load::{InitialLoadSet, LoadRules, PopulationMask};
use crate::usd::notice::{
    ListenerKey, NoticeRegistry, ObjectsChanged, StageContentsChanged, StageEditTargetChanged,
};
use crate::usd::path::SdfPath;
use crate::usd::time::TimeCode;
use crate::usd::value::Value;

#[derive(Default)]
struct ChangeBlockState {
    depth: usize,
    changes: LayerChanges,
}

struct StageInner {
    id: Uuid,
    this: Weak<StageInner>,
    root_layer: LayerHandle,
    session_layer: LayerHandle,
    edit_target: Mutex<LayerHandle>,
    population_mask: PopulationMask,
    load_rules: Mutex<LoadRules>,
    objects_changed: Arc<NoticeRegistry<ObjectsChanged>>,
    contents_changed: Arc<NoticeRegistry<StageContentsChanged>>,
    edit_target_changed: Arc<NoticeRegistry<StageEditTargetChanged>>,
    change_block: Mutex<ChangeBlockState>,
}

impl StageInner {
    fn weak(&self) -> StageWeak {
        StageWeak {
            inner: self.this.clone(),
        }
    }

    fn record(&self, changes: LayerChanges) {
        {
            let mut block = lock(&self.change_block);
            if block.depth > 0 {
                block.changes.merge(changes);
                return;
            }
        }
        self.dispatch(changes);
    }

    fn dispatch(&self, mut changes: LayerChanges) {
        changes.normalize();
        if changes.is_empty() {
            return;
        }
        log::trace!(
            "Stage {} changed: {} resynced, {} changed-info",
            self.id,
            changes.resynced.len(),
            changes.changed_info_only.len()
        );
        let notice = ObjectsChanged::new(self.weak(), changes.resynced, changes.changed_info_only);
        self.objects_changed.send(&notice);
        self.contents_changed
            .send(&StageContentsChanged { stage: self.weak() });
    }
}

impl LayerObserver for StageInner {
    fn layer_changed(&self, _layer: &Layer, changes: &LayerChanges) {
        self.record(changes.clone());
    }
}

/// Shared stage handle. Clones refer to the same stage.
#[derive(Clone)]
pub struct Stage {
    inner: Arc<StageInner>,
}

/// Non-owning stage reference
#[derive(Clone, Default)]
pub struct StageWeak {
    inner: Weak<StageInner>,
}

impl StageWeak {
    pub fn upgrade(&self) -> Option<Stage> {
        self.inner.upgrade().map(|inner| Stage { inner })
    }

    pub fn is_expired(&self) -> bool {
        self.inner.strong_count() == 0
    }

    pub fn ptr_eq(&self, other: &StageWeak) -> bool {
        self.inner.ptr_eq(&other.inner)
    }

    pub fn refers_to(&self, stage: &Stage) -> bool {
        std::ptr::eq(self.inner.as_ptr(), Arc::as_ptr(&stage.inner))
    }
}

impl std::fmt::Debug for StageWeak {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.upgrade() {
            Some(stage) => write!(f, "StageWeak({})", stage.id()),
            None => write!(f, "StageWeak(expired)"),
        }
    }
}

impl Stage {
    /// Open the layer at `path` as a new stage with its own session layer
    pub fn open(path: impl AsRef<Path>, load: InitialLoadSet) -> Result<Stage, UsdError> {
        let root = Layer::open(path)?;
        Ok(Self::open_layer(root, None, PopulationMask::all(), load))
    }

    /// Compose a stage over an existing root layer. Without a session layer
    /// a fresh anonymous one is created.
    pub fn open_layer(
        root_layer: LayerHandle,
        session_layer: Option<LayerHandle>,
        population_mask: PopulationMask,
        load: InitialLoadSet,
    ) -> Stage {
        let session_layer = session_layer.unwrap_or_else(|| Layer::new_anonymous("session.usda"));
        let inner = Arc::new_cyclic(|this| StageInner {
            id: Uuid::new_v4(),
            this: this.clone(),
            edit_target: Mutex::new(root_layer.clone()),
            root_layer,
            session_layer,
            population_mask,
            load_rules: Mutex::new(LoadRules::new(load)),
            objects_changed: NoticeRegistry::new(),
            contents_changed: NoticeRegistry::new(),
            edit_target_changed: NoticeRegistry::new(),
            change_block: Mutex::new(ChangeBlockState::default()),
        });

        let observer: Arc<dyn LayerObserver> = inner.clone();
        inner.root_layer.add_observer(Arc::downgrade(&observer));
        if !Arc::ptr_eq(&inner.root_layer, &inner.session_layer) {
            inner.session_layer.add_observer(Arc::downgrade(&observer));
        }

        log::debug!(
            "Opened stage {} on {}",
            inner.id,
            inner.root_layer.identifier()
        );
        Stage { inner }
    }

    /// A new stage over an empty anonymous root layer
    pub fn create_in_memory(tag: &str) -> Stage {
        Self::open_layer(
            Layer::new_anonymous(tag),
            None,
            PopulationMask::all(),
            InitialLoadSet::LoadAll,
        )
    }

    /// A new stage over a named in-memory root layer holding `data`
    pub fn from_layer_data(identifier: &str, data: LayerData) -> Stage {
        Self::open_layer(
            Layer::from_data(identifier, data),
            None,
            PopulationMask::all(),
            InitialLoadSet::LoadAll,
        )
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn downgrade(&self) -> StageWeak {
        self.inner.weak()
    }

    pub fn ptr_eq(&self, other: &Stage) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn root_layer(&self) -> &LayerHandle {
        &self.inner.root_layer
    }

    pub fn session_layer(&self) -> &LayerHandle {
        &self.inner.session_layer
    }

    /// Layers in strength order, strongest first
    pub fn layer_stack(&self) -> Vec<LayerHandle> {
        vec![self.inner.session_layer.clone(), self.inner.root_layer.clone()]
    }

    pub fn uses_layer(&self, layer: &Layer) -> bool {
        self.layers().iter().any(|l| std::ptr::eq(Arc::as_ptr(l), layer))
    }

    pub fn edit_target(&self) -> LayerHandle {
        lock(&self.inner.edit_target).clone()
    }

    pub fn population_mask(&self) -> &PopulationMask {
        &self.inner.population_mask
    }

    pub fn initial_load_set(&self) -> InitialLoadSet {
        lock(&self.inner.load_rules).initial()
    }

    pub fn objects_changed(&self) -> &Arc<NoticeRegistry<ObjectsChanged>> {
        &self.inner.objects_changed
    }

    pub fn contents_changed(&self) -> &Arc<NoticeRegistry<StageContentsChanged>> {
        &self.inner.contents_changed
    }

    pub fn edit_target_changed(&self) -> &Arc<NoticeRegistry<StageEditTargetChanged>> {
        &self.inner.edit_target_changed
    }

    pub fn on_objects_changed<F>(&self, callback: F) -> ListenerKey
    where
        F: Fn(&ObjectsChanged) + Send + Sync + 'static,
    {
        self.inner.objects_changed.register(callback)
    }

    // ---- composition -------------------------------------------------

    fn layers(&self) -> [&LayerHandle; 2] {
        [&self.inner.session_layer, &self.inner.root_layer]
    }

    /// Strongest opinion found by `f`
    fn resolve<T>(&self, path: &SdfPath, f: impl Fn(&PrimSpec) -> Option<T>) -> Option<T> {
        self.layers()
            .iter()
            .find_map(|layer| layer.read(|data| data.spec(path).and_then(&f)))
    }

    fn any_spec(&self, path: &SdfPath, f: impl Fn(&PrimSpec) -> bool) -> bool {
        self.layers()
            .iter()
            .any(|layer| layer.read(|data| data.spec(path).map_or(false, &f)))
    }

    fn is_defined(&self, path: &SdfPath) -> bool {
        self.any_spec(path, |spec| spec.specifier == Specifier::Def)
    }

    fn is_active(&self, path: &SdfPath) -> bool {
        self.resolve(path, |spec| spec.active).unwrap_or(true)
    }

    fn has_payload(&self, path: &SdfPath) -> bool {
        self.any_spec(path, |spec| spec.has_payload)
    }

    fn is_loaded(&self, path: &SdfPath) -> bool {
        !self.has_payload(path) || lock(&self.inner.load_rules).is_loaded(path)
    }

    /// True if the prim at `path` is populated on this stage
    pub fn prim_exists(&self, path: &SdfPath) -> bool {
        if path.is_absolute_root() {
            return true;
        }
        if !path.is_prim_path() || path.is_empty() {
            return false;
        }
        if !self.inner.population_mask.includes(path) || !self.is_defined(path) {
            return false;
        }
        self.children_populated(&path.parent())
    }

    fn children_populated(&self, path: &SdfPath) -> bool {
        path.is_absolute_root()
            || (self.prim_exists(path) && self.is_active(path) && self.is_loaded(path))
    }

    fn child_names(&self, path: &SdfPath) -> Vec<String> {
        if !self.children_populated(path) {
            return Vec::new();
        }
        let mut names: Vec<String> = Vec::new();
        for layer in self.layers().iter().rev() {
            layer.read(|data| {
                if let Some(spec) = data.spec(path) {
                    for child in &spec.children {
                        if !names.contains(child) {
                            names.push(child.clone());
                        }
                    }
                }
            });
        }
        names.retain(|name| {
            path.append_child(name)
                .map(|child| self.prim_exists(&child))
                .unwrap_or(false)
        });
        names
    }

    fn type_name(&self, path: &SdfPath) -> Option<String> {
        self.resolve(path, |spec| spec.type_name.clone())
    }

    fn attribute(&self, path: &SdfPath, name: &str, time: TimeCode) -> Option<Value> {
        self.resolve(path, |spec| {
            spec.attributes
                .get(name)
                .and_then(|attr| attr.value_at(time).cloned())
        })
    }

    fn has_attribute(&self, path: &SdfPath, name: &str) -> bool {
        self.any_spec(path, |spec| spec.attributes.contains_key(name))
    }

    /// Merge a per-key map weakest to strongest
    fn merged<V: Clone>(
        &self,
        path: &SdfPath,
        f: impl Fn(&PrimSpec) -> &BTreeMap<String, V>,
    ) -> BTreeMap<String, V> {
        let mut merged = BTreeMap::new();
        for layer in self.layers().iter().rev() {
            layer.read(|data| {
                if let Some(spec) = data.spec(path) {
                    merged.extend(f(spec).iter().map(|(k, v)| (k.clone(), v.clone())));
                }
            });
        }
        merged
    }

    pub fn prim_at_path(&self, path: &SdfPath) -> Prim {
        if self.prim_exists(path) {
            Prim {
                stage: Some(self.clone()),
                path: path.clone(),
            }
        } else {
            Prim::default()
        }
    }

    pub fn pseudo_root(&self) -> Prim {
        self.prim_at_path(&SdfPath::absolute_root())
    }

    /// Depth-first list of every active prim, pseudo-root excluded
    pub fn traverse(&self) -> Vec<Prim> {
        let mut result = Vec::new();
        self.collect_preorder(&SdfPath::absolute_root(), &mut result);
        result
    }

    fn collect_preorder(&self, path: &SdfPath, out: &mut Vec<Prim>) {
        for name in self.child_names(path) {
            let Ok(child) = path.append_child(&name) else {
                continue;
            };
            if !self.is_active(&child) {
                continue;
            }
            out.push(Prim {
                stage: Some(self.clone()),
                path: child.clone(),
            });
            self.collect_preorder(&child, out);
        }
    }

    // ---- edits -------------------------------------------------------

    fn author<R>(
        &self,
        edit: impl FnOnce(&mut LayerData) -> (R, LayerChanges),
    ) -> Result<R, UsdError> {
        let layer = self.edit_target();
        let (result, changes) = layer.edit(edit)?;
        layer.notify(&changes);
        Ok(result)
    }

    fn require_prim(&self, path: &SdfPath) -> Result<(), UsdError> {
        if path.is_absolute_root() || !self.prim_exists(path) {
            return Err(UsdError::PrimNotFound(path.clone()));
        }
        Ok(())
    }

    /// Define a prim and any missing ancestors. An empty type name leaves
    /// the type untouched.
    pub fn define_prim(&self, path: &SdfPath, type_name: &str) -> Result<Prim, UsdError> {
        if path.is_empty() || path.is_absolute_root() || !path.is_prim_path() {
            return Err(UsdError::InvalidPath(path.to_string()));
        }
        let prefixes = path.prefixes();
        let first_new = prefixes.iter().find(|p| !self.prim_exists(p)).cloned();
        let requested_type = (!type_name.is_empty()).then(|| type_name.to_string());
        let retyped = requested_type.is_some() && self.type_name(path) != requested_type;

        if first_new.is_none() && !retyped {
            return Ok(self.prim_at_path(path));
        }

        let resynced = first_new.unwrap_or_else(|| path.clone());
        self.author(|data| {
            for prefix in &prefixes {
                let (spec, _) = data.ensure_spec(prefix, Specifier::Def);
                spec.specifier = Specifier::Def;
            }
            if let (Some(spec), Some(type_name)) = (data.spec_mut(path), requested_type) {
                spec.type_name = Some(type_name);
            }
            (
                (),
                LayerChanges {
                    resynced: vec![resynced],
                    changed_info_only: Vec::new(),
                },
            )
        })?;
        Ok(self.prim_at_path(path))
    }

    /// Remove the edit target's opinions for the prim subtree. Returns false
    /// if the edit target had none.
    pub fn remove_prim(&self, path: &SdfPath) -> Result<bool, UsdError> {
        if path.is_empty() || path.is_absolute_root() {
            return Err(UsdError::InvalidPath(path.to_string()));
        }
        self.author(|data| {
            let removed = data.remove_spec(path);
            let mut changes = LayerChanges::default();
            if removed {
                changes.resynced.push(path.clone());
            }
            (removed, changes)
        })
    }

    pub fn rename_prim(&self, path: &SdfPath, new_name: &str) -> Result<SdfPath, UsdError> {
        self.require_prim(path)?;
        let new_path = path.parent().append_child(new_name)?;
        if self.prim_exists(&new_path) {
            return Err(UsdError::PrimExists(new_path));
        }
        self.author(|data| match data.rename_spec(path, new_name) {
            Ok(renamed) => (
                Ok(renamed.clone()),
                LayerChanges {
                    resynced: vec![path.clone(), renamed],
                    changed_info_only: Vec::new(),
                },
            ),
            Err(err) => (Err(err), LayerChanges::default()),
        })?
    }

    fn author_attribute(
        &self,
        path: &SdfPath,
        name: &str,
        apply: impl FnOnce(&mut AttributeSpec),
    ) -> Result<(), UsdError> {
        self.require_prim(path)?;
        let property = path.append_property(name)?;
        let is_new = !self.has_attribute(path, name);
        self.author(|data| {
            let (spec, _) = data.ensure_spec(path, Specifier::Over);
            apply(spec.attributes.entry(name.to_string()).or_default());
            let changes = if is_new {
                LayerChanges {
                    resynced: vec![property],
                    changed_info_only: Vec::new(),
                }
            } else {
                LayerChanges {
                    resynced: Vec::new(),
                    changed_info_only: vec![property],
                }
            };
            ((), changes)
        })
    }

    /// Author an attribute's default value. Creating the attribute is a
    /// resync of the property path; changing it is changed-info only.
    pub fn set_attribute(&self, path: &SdfPath, name: &str, value: Value) -> Result<(), UsdError> {
        self.author_attribute(path, name, |attr| attr.default = Some(value))
    }

    pub fn set_attribute_at(
        &self,
        path: &SdfPath,
        name: &str,
        time: TimeCode,
        value: Value,
    ) -> Result<(), UsdError> {
        self.author_attribute(path, name, |attr| {
            if time.is_default() {
                attr.default = Some(value);
            } else {
                attr.time_samples.insert(time, value);
            }
        })
    }

    fn author_prim_field(
        &self,
        path: &SdfPath,
        resync: bool,
        apply: impl FnOnce(&mut PrimSpec),
    ) -> Result<(), UsdError> {
        self.require_prim(path)?;
        self.author(|data| {
            let (spec, _) = data.ensure_spec(path, Specifier::Over);
            apply(spec);
            let mut changes = LayerChanges::default();
            if resync {
                changes.resynced.push(path.clone());
            } else {
                changes.changed_info_only.push(path.clone());
            }
            ((), changes)
        })
    }

    pub fn set_custom_data(&self, path: &SdfPath, key: &str, value: Value) -> Result<(), UsdError> {
        self.author_prim_field(path, false, |spec| {
            spec.custom_data.insert(key.to_string(), value);
        })
    }

    /// Clear a custom-data key in the edit target. Returns false if it
    /// held no such key.
    pub fn clear_custom_data(&self, path: &SdfPath, key: &str) -> Result<bool, UsdError> {
        self.require_prim(path)?;
        self.author(|data| {
            let removed = data
                .spec_mut(path)
                .and_then(|spec| spec.custom_data.remove(key))
                .is_some();
            let mut changes = LayerChanges::default();
            if removed {
                changes.changed_info_only.push(path.clone());
            }
            (removed, changes)
        })
    }

    pub fn set_active(&self, path: &SdfPath, active: bool) -> Result<(), UsdError> {
        self.author_prim_field(path, true, |spec| spec.active = Some(active))
    }

    pub fn set_variant_selection(
        &self,
        path: &SdfPath,
        variant_set: &str,
        selection: &str,
    ) -> Result<(), UsdError> {
        self.author_prim_field(path, true, |spec| {
            spec.variant_selections
                .insert(variant_set.to_string(), selection.to_string());
        })
    }

    /// Load the payloads at and below `path`. Load state belongs to the
    /// stage, so no layer is edited.
    pub fn load(&self, path: &SdfPath) {
        lock(&self.inner.load_rules).load(path.clone());
        self.inner.record(LayerChanges {
            resynced: vec![path.clone()],
            changed_info_only: Vec::new(),
        });
    }

    pub fn unload(&self, path: &SdfPath) {
        lock(&self.inner.load_rules).unload(path.clone());
        self.inner.record(LayerChanges {
            resynced: vec![path.clone()],
            changed_info_only: Vec::new(),
        });
    }

    /// Direct edits to `layer`, which must be the root or session layer
    pub fn set_edit_target(&self, layer: &LayerHandle) -> Result<(), UsdError> {
        if !self.layers().iter().any(|l| Arc::ptr_eq(l, layer)) {
            return Err(UsdError::InvalidEditTarget(layer.identifier().to_string()));
        }
        {
            let mut target = lock(&self.inner.edit_target);
            if Arc::ptr_eq(&target, layer) {
                return Ok(());
            }
            *target = layer.clone();
        }
        self.inner
            .edit_target_changed
            .send(&StageEditTargetChanged {
                stage: self.downgrade(),
            });
        Ok(())
    }

    /// Run `f` with notices held back; everything it changes is reported in
    /// one notice pair when the outermost block ends.
    pub fn change_block<R>(&self, f: impl FnOnce(&Stage) -> R) -> R {
        lock(&self.inner.change_block).depth += 1;
        let result = f(self);
        let pending = {
            let mut block = lock(&self.inner.change_block);
            block.depth -= 1;
            if block.depth == 0 {
                Some(std::mem::take(&mut block.changes))
            } else {
                None
            }
        };
        if let Some(changes) = pending {
            self.inner.dispatch(changes);
        }
        result
    }

    // ---- bounds ------------------------------------------------------

    fn local_transform(&self, path: &SdfPath, time: TimeCode) -> DAffine3 {
        let vec = |name: &str| {
            self.attribute(path, name, time)
                .as_ref()
                .and_then(Value::as_vec3)
        };
        let translate = vec("xformOp:translate").unwrap_or(DVec3::ZERO);
        let scale = vec("xformOp:scale").unwrap_or(DVec3::ONE);
        let rotation = vec("xformOp:rotateXYZ")
            .map(|deg| {
                DQuat::from_rotation_z(deg.z.to_radians())
                    * DQuat::from_rotation_y(deg.y.to_radians())
                    * DQuat::from_rotation_x(deg.x.to_radians())
            })
            .unwrap_or(DQuat::IDENTITY);
        DAffine3::from_scale_rotation_translation(scale, rotation, translate)
    }

    /// Local-to-world transform of the prim at `path`
    pub fn world_transform(&self, path: &SdfPath, time: TimeCode) -> DAffine3 {
        path.prefixes()
            .iter()
            .fold(DAffine3::IDENTITY, |acc, prefix| {
                acc * self.local_transform(prefix, time)
            })
    }

    fn authored_purpose(&self, path: &SdfPath, time: TimeCode) -> Option<Purpose> {
        self.attribute(path, "purpose", time)
            .as_ref()
            .and_then(Value::as_str)
            .map(Purpose::from_token)
    }

    /// Computed purpose: the nearest ancestor's non-default purpose wins,
    /// else the prim's own.
    pub fn compute_purpose(&self, path: &SdfPath, time: TimeCode) -> Purpose {
        let mut purpose = Purpose::Default;
        for prefix in path.prefixes() {
            if purpose != Purpose::Default {
                break;
            }
            purpose = self.authored_purpose(&prefix, time).unwrap_or_default();
        }
        purpose
    }

    fn local_bound(&self, path: &SdfPath, time: TimeCode) -> Option<BoundingBox> {
        let attr = |name: &str| self.attribute(path, name, time);
        if let Some(Value::Vec3Array(extent)) = attr("extent") {
            if extent.len() >= 2 {
                return Some(BoundingBox::new(extent[0], extent[1]));
            }
        }
        match self.type_name(path).as_deref() {
            Some("Cube") => {
                let half = attr("size").as_ref().and_then(Value::as_f64).unwrap_or(2.0) * 0.5;
                Some(BoundingBox::new(DVec3::splat(-half), DVec3::splat(half)))
            }
            Some("Sphere") => {
                let radius = attr("radius").as_ref().and_then(Value::as_f64).unwrap_or(1.0);
                Some(BoundingBox::new(DVec3::splat(-radius), DVec3::splat(radius)))
            }
            Some("Mesh") | Some("Points") => {
                let points = attr("points")?;
                let mut bounds = BoundingBox::empty();
                for point in points.as_vec3_array()? {
                    bounds.extend(*point);
                }
                Some(bounds)
            }
            _ => None,
        }
    }

    /// World-space bounds of the subtree at `root`. Inactive and invisible
    /// prims, excluded subtrees and purposes not enabled in `purposes` do
    /// not contribute.
    pub fn compute_bounding_box(
        &self,
        root: &SdfPath,
        time: TimeCode,
        purposes: PurposeToggles,
        excluded: &[SdfPath],
    ) -> BoundingBox {
        if !self.prim_exists(root) {
            return BoundingBox::empty();
        }
        let parent = root.parent();
        let parent_xform = if root.is_absolute_root() {
            DAffine3::IDENTITY
        } else {
            self.world_transform(&parent, time)
        };
        let parent_purpose = if root.is_absolute_root() {
            Purpose::Default
        } else {
            self.compute_purpose(&parent, time)
        };

        let mut bounds = BoundingBox::empty();
        self.accumulate_bounds(
            root,
            time,
            &purposes,
            excluded,
            parent_xform,
            parent_purpose,
            &mut bounds,
        );
        bounds
    }

    #[allow(clippy::too_many_arguments)]
    fn accumulate_bounds(
        &self,
        path: &SdfPath,
        time: TimeCode,
        purposes: &PurposeToggles,
        excluded: &[SdfPath],
        parent_xform: DAffine3,
        parent_purpose: Purpose,
        bounds: &mut BoundingBox,
    ) {
        if excluded.iter().any(|e| path.has_prefix(e)) {
            return;
        }
        let (xform, purpose) = if path.is_absolute_root() {
            (parent_xform, parent_purpose)
        } else {
            if !self.is_active(path) {
                return;
            }
            let visibility = self.attribute(path, "visibility", time);
            if visibility.as_ref().and_then(Value::as_str) == Some("invisible") {
                return;
            }
            let purpose = if parent_purpose != Purpose::Default {
                parent_purpose
            } else {
                self.authored_purpose(path, time).unwrap_or_default()
            };
            (parent_xform * self.local_transform(path, time), purpose)
        };

        if !purposes.includes(purpose) {
            return;
        }
        if let Some(local) = self.local_bound(path, time) {
            *bounds = bounds.union(&local.transformed(&xform));
        }
        for name in self.child_names(path) {
            if let Ok(child) = path.append_child(&name) {
                self.accumulate_bounds(&child, time, purposes, excluded, xform, purpose, bounds);
            }
        }
    }
}

impl PartialEq for Stage {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for Stage {}

impl std::fmt::Debug for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stage")
            .field("id", &self.inner.id)
            .field("root_layer", &self.inner.root_layer.identifier())
            .finish()
    }
}

/// A prim on a stage. The default value is the invalid prim.
#[derive(Clone, Default)]
pub struct Prim {
    stage: Option<Stage>,
    path: SdfPath,
}

impl Prim {
    pub fn is_valid(&self) -> bool {
        self.stage
            .as_ref()
            .map_or(false, |stage| stage.prim_exists(&self.path))
    }

    pub fn stage(&self) -> Option<&Stage> {
        self.stage.as_ref()
    }

    pub fn path(&self) -> &SdfPath {
        &self.path
    }

    pub fn name(&self) -> &str {
        self.path.name()
    }

    pub fn type_name(&self) -> Option<String> {
        self.stage.as_ref()?.type_name(&self.path)
    }

    pub fn children(&self) -> Vec<Prim> {
        let Some(stage) = &self.stage else {
            return Vec::new();
        };
        stage
            .child_names(&self.path)
            .iter()
            .filter_map(|name| self.path.append_child(name).ok())
            .map(|path| Prim {
                stage: Some(stage.clone()),
                path,
            })
            .collect()
    }

    pub fn parent(&self) -> Prim {
        match &self.stage {
            Some(stage) if !self.path.is_absolute_root() => stage.prim_at_path(&self.path.parent()),
            _ => Prim::default(),
        }
    }

    pub fn attribute(&self, name: &str, time: TimeCode) -> Option<Value> {
        self.stage.as_ref()?.attribute(&self.path, name, time)
    }

    pub fn has_attribute(&self, name: &str) -> bool {
        self.stage
            .as_ref()
            .map_or(false, |stage| stage.has_attribute(&self.path, name))
    }

    pub fn attribute_names(&self) -> Vec<String> {
        let Some(stage) = &self.stage else {
            return Vec::new();
        };
        stage
            .merged(&self.path, |spec| &spec.attributes)
            .into_keys()
            .collect()
    }

    pub fn is_attribute_animated(&self, name: &str) -> bool {
        self.stage.as_ref().map_or(false, |stage| {
            stage.any_spec(&self.path, |spec| {
                spec.attributes.get(name).map_or(false, AttributeSpec::is_animated)
            })
        })
    }

    pub fn custom_data(&self, key: &str) -> Option<Value> {
        self.stage
            .as_ref()?
            .resolve(&self.path, |spec| spec.custom_data.get(key).cloned())
    }

    pub fn custom_data_dict(&self) -> BTreeMap<String, Value> {
        self.stage
            .as_ref()
            .map(|stage| stage.merged(&self.path, |spec| &spec.custom_data))
            .unwrap_or_default()
    }

    pub fn is_active(&self) -> bool {
        self.stage
            .as_ref()
            .map_or(false, |stage| stage.is_active(&self.path))
    }

    pub fn has_payload(&self) -> bool {
        self.stage
            .as_ref()
            .map_or(false, |stage| stage.has_payload(&self.path))
    }

    pub fn is_loaded(&self) -> bool {
        self.stage
            .as_ref()
            .map_or(false, |stage| stage.is_loaded(&self.path))
    }

    pub fn variant_selection(&self, variant_set: &str) -> Option<String> {
        self.stage.as_ref()?.resolve(&self.path, |spec| {
            spec.variant_selections.get(variant_set).cloned()
        })
    }

    pub fn purpose(&self, time: TimeCode) -> Purpose {
        self.stage
            .as_ref()
            .map(|stage| stage.compute_purpose(&self.path, time))
            .unwrap_or_default()
    }
}

impl PartialEq for Prim {
    fn eq(&self, other: &Self) -> bool {
        let same_stage = match (&self.stage, &other.stage) {
            (Some(a), Some(b)) => a.ptr_eq(b),
            (None, None) => true,
            _ => false,
        };
        same_stage && self.path == other.path
    }
}

impl std::fmt::Debug for Prim {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.stage.is_some() {
            write!(f, "Prim({})", self.path)
        } else {
            write!(f, "Prim(invalid)")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usd::notice::ObjectsChanged;

    fn p(s: &str) -> SdfPath {
        SdfPath::new(s).unwrap()
    }

    fn record_notices(stage: &Stage) -> (Arc<Mutex<Vec<ObjectsChanged>>>, ListenerKey) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let key = stage.on_objects_changed(move |notice| lock(&sink).push(notice.clone()));
        (seen, key)
    }

    #[test]
    fn test_define_prim_resyncs_topmost_new_path() {
        let stage = Stage::create_in_memory("test.usda");
        let (seen, _key) = record_notices(&stage);

        let cube = stage.define_prim(&p("/World/cube"), "Cube").unwrap();
        assert!(cube.is_valid());
        assert_eq!(cube.type_name().as_deref(), Some("Cube"));

        let notices = lock(&seen);
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].resynced_paths(), &[p("/World")]);
        assert!(notices[0].resynced_object(&p("/World/cube")));
    }

    #[test]
    fn test_define_existing_prim_is_silent() {
        let stage = Stage::create_in_memory("test.usda");
        stage.define_prim(&p("/cube"), "Cube").unwrap();
        let (seen, _key) = record_notices(&stage);
        stage.define_prim(&p("/cube"), "Cube").unwrap();
        assert!(lock(&seen).is_empty());
    }

    #[test]
    fn test_attribute_create_then_change() {
        let stage = Stage::create_in_memory("test.usda");
        stage.define_prim(&p("/cube"), "Cube").unwrap();
        let (seen, _key) = record_notices(&stage);

        stage.set_attribute(&p("/cube"), "size", Value::Double(3.0)).unwrap();
        stage.set_attribute(&p("/cube"), "size", Value::Double(4.0)).unwrap();

        let notices = lock(&seen);
        assert_eq!(notices[0].resynced_paths(), &[p("/cube.size")]);
        assert!(notices[1].resynced_paths().is_empty());
        assert_eq!(notices[1].changed_info_only_paths(), &[p("/cube.size")]);
    }

    #[test]
    fn test_change_block_batches_notices() {
        let stage = Stage::create_in_memory("test.usda");
        let (seen, _key) = record_notices(&stage);
        let contents = Arc::new(Mutex::new(0));
        let counter = contents.clone();
        let _contents_key = stage
            .contents_changed()
            .register(move |_| *lock(&counter) += 1);

        stage.change_block(|stage| {
            stage.define_prim(&p("/a"), "Xform").unwrap();
            stage.define_prim(&p("/b"), "Xform").unwrap();
        });

        assert_eq!(lock(&seen).len(), 1);
        assert_eq!(lock(&seen)[0].resynced_paths(), &[p("/a"), p("/b")]);
        assert_eq!(*lock(&contents), 1);
    }

    #[test]
    fn test_session_layer_is_stronger() {
        let stage = Stage::create_in_memory("test.usda");
        stage.define_prim(&p("/cube"), "Cube").unwrap();
        stage.set_attribute(&p("/cube"), "size", Value::Double(1.0)).unwrap();

        stage.set_edit_target(&stage.session_layer().clone()).unwrap();
        stage.set_attribute(&p("/cube"), "size", Value::Double(5.0)).unwrap();

        let cube = stage.prim_at_path(&p("/cube"));
        assert_eq!(cube.attribute("size", TimeCode::DEFAULT), Some(Value::Double(5.0)));
        assert_eq!(
            stage.root_layer().read(|d| d.spec(&p("/cube")).unwrap().attributes["size"].clone()),
            AttributeSpec::with_default(Value::Double(1.0))
        );
    }

    #[test]
    fn test_edit_target_must_be_in_stack() {
        let stage = Stage::create_in_memory("test.usda");
        let foreign = Layer::new_anonymous("other.usda");
        assert!(matches!(
            stage.set_edit_target(&foreign),
            Err(UsdError::InvalidEditTarget(_))
        ));
    }

    #[test]
    fn test_locked_edit_target_rejects_edits() {
        let stage = Stage::create_in_memory("test.usda");
        stage.root_layer().set_permission_to_edit(false);
        let (seen, _key) = record_notices(&stage);
        assert!(stage.define_prim(&p("/cube"), "Cube").is_err());
        assert!(lock(&seen).is_empty());
        assert!(!stage.prim_at_path(&p("/cube")).is_valid());
    }

    #[test]
    fn test_unloaded_payload_hides_children() {
        let mut data = LayerData::default();
        data.insert_spec(
            p("/asset"),
            PrimSpec {
                has_payload: true,
                ..PrimSpec::default()
            },
        );
        data.insert_spec(p("/asset/geo"), PrimSpec::default());
        let root = Layer::from_data("asset.usda", data);

        let stage = Stage::open_layer(root, None, PopulationMask::all(), InitialLoadSet::LoadNone);
        assert!(stage.prim_at_path(&p("/asset")).is_valid());
        assert!(!stage.prim_at_path(&p("/asset/geo")).is_valid());

        stage.load(&p("/asset"));
        assert!(stage.prim_at_path(&p("/asset/geo")).is_valid());
    }

    #[test]
    fn test_rename_and_remove() {
        let stage = Stage::create_in_memory("test.usda");
        stage.define_prim(&p("/a/child"), "Xform").unwrap();
        let (seen, _key) = record_notices(&stage);

        let renamed = stage.rename_prim(&p("/a"), "b").unwrap();
        assert_eq!(renamed, p("/b"));
        assert!(stage.prim_at_path(&p("/b/child")).is_valid());
        assert!(stage.remove_prim(&p("/b")).unwrap());
        assert!(!stage.prim_at_path(&p("/b")).is_valid());

        let notices = lock(&seen);
        assert_eq!(notices[0].resynced_paths(), &[p("/a"), p("/b")]);
        assert_eq!(notices[1].resynced_paths(), &[p("/b")]);
    }

    #[test]
    fn test_shared_layer_notifies_every_stage() {
        let root = Layer::new_anonymous("shared.usda");
        let first = Stage::open_layer(root.clone(), None, PopulationMask::all(), InitialLoadSet::LoadAll);
        let second = Stage::open_layer(root, None, PopulationMask::all(), InitialLoadSet::LoadAll);
        let (first_seen, _k1) = record_notices(&first);
        let (second_seen, _k2) = record_notices(&second);

        first.define_prim(&p("/cube"), "Cube").unwrap();
        assert_eq!(lock(&first_seen).len(), 1);
        assert_eq!(lock(&second_seen).len(), 1);
        assert!(lock(&second_seen)[0].sender().refers_to(&second));
    }

    #[test]
    fn test_bounding_box_with_transforms_and_purpose() {
        let stage = Stage::create_in_memory("test.usda");
        stage.define_prim(&p("/World/cube"), "Cube").unwrap();
        stage
            .set_attribute(&p("/World"), "xformOp:translate", Value::Vec3(DVec3::new(10.0, 0.0, 0.0)))
            .unwrap();
        stage.set_attribute(&p("/World/cube"), "size", Value::Double(4.0)).unwrap();
        stage.define_prim(&p("/World/guide"), "Sphere").unwrap();
        stage
            .set_attribute(&p("/World/guide"), "radius", Value::Double(100.0))
            .unwrap();
        stage
            .set_attribute(&p("/World/guide"), "purpose", Value::Token("guide".into()))
            .unwrap();

        let root = SdfPath::absolute_root();
        let bounds = stage.compute_bounding_box(&root, TimeCode::DEFAULT, PurposeToggles::default(), &[]);
        assert_eq!(bounds.min, DVec3::new(8.0, -2.0, -2.0));
        assert_eq!(bounds.max, DVec3::new(12.0, 2.0, 2.0));

        let excluded = stage.compute_bounding_box(
            &root,
            TimeCode::DEFAULT,
            PurposeToggles::default(),
            &[p("/World/cube")],
        );
        assert!(excluded.is_empty());

        let with_guides = stage.compute_bounding_box(&root, TimeCode::DEFAULT, PurposeToggles::all(), &[]);
        assert_eq!(with_guides.max, DVec3::new(110.0, 100.0, 100.0));
    }

    #[test]
    fn test_traverse_skips_inactive() {
        let stage = Stage::create_in_memory("test.usda");
        stage.define_prim(&p("/a/b"), "Xform").unwrap();
        stage.define_prim(&p("/c"), "Xform").unwrap();
        stage.set_active(&p("/a"), false).unwrap();

        let paths: Vec<SdfPath> = stage.traverse().iter().map(|prim| prim.path().clone()).collect();
        assert_eq!(paths, vec![p("/c")]);
        assert!(stage.prim_at_path(&p("/a")).is_valid());
        assert!(!stage.prim_at_path(&p("/a/b")).is_valid());
    }
}
