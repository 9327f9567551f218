//! Layers: containers of prim specs with edit/save permissions

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::SystemTime;

use once_cell::sync::Lazy;

use crate::error::UsdError;
use crate::sync::{lock, read, write};
use crate::usd::path::SdfPath;
use crate::usd::reader;
use crate::usd::time::TimeCode;
use crate::usd::value::Value;

/// Shared layer handle. Holding one keeps the layer alive.
pub type LayerHandle = Arc<Layer>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Specifier {
    #[default]
    Def,
    Over,
}

/// An attribute opinion: a default value and optional time samples
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttributeSpec {
    pub default: Option<Value>,
    pub time_samples: BTreeMap<TimeCode, Value>,
}

impl AttributeSpec {
    pub fn with_default(value: Value) -> Self {
        Self {
            default: Some(value),
            time_samples: BTreeMap::new(),
        }
    }

    /// Held interpolation: the last sample at or before `time`, else the
    /// first sample. `TimeCode::DEFAULT` reads the default value.
    pub fn value_at(&self, time: TimeCode) -> Option<&Value> {
        if time.is_default() || self.time_samples.is_empty() {
            return self.default.as_ref();
        }
        self.time_samples
            .range(..=time)
            .next_back()
            .or_else(|| self.time_samples.iter().next())
            .map(|(_, value)| value)
    }

    pub fn is_animated(&self) -> bool {
        !self.time_samples.is_empty()
    }
}

/// Opinions about one prim in one layer
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PrimSpec {
    pub specifier: Specifier,
    pub type_name: Option<String>,
    pub children: Vec<String>,
    pub attributes: BTreeMap<String, AttributeSpec>,
    pub custom_data: BTreeMap<String, Value>,
    pub active: Option<bool>,
    pub variant_selections: BTreeMap<String, String>,
    pub has_payload: bool,
}

/// The specs held by a layer, keyed by prim path. The pseudo-root spec at
/// `/` always exists and lists the root prims.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerData {
    specs: BTreeMap<SdfPath, PrimSpec>,
}

impl Default for LayerData {
    fn default() -> Self {
        let mut specs = BTreeMap::new();
        specs.insert(SdfPath::absolute_root(), PrimSpec::default());
        Self { specs }
    }
}

impl LayerData {
    pub fn spec(&self, path: &SdfPath) -> Option<&PrimSpec> {
        self.specs.get(path)
    }

    pub fn spec_mut(&mut self, path: &SdfPath) -> Option<&mut PrimSpec> {
        self.specs.get_mut(path)
    }

    pub fn has_spec(&self, path: &SdfPath) -> bool {
        self.specs.contains_key(path)
    }

    pub fn spec_count(&self) -> usize {
        self.specs.len()
    }

    pub fn paths(&self) -> impl Iterator<Item = &SdfPath> {
        self.specs.keys()
    }

    /// Insert a spec as-is, listing it under its parent (which is created as
    /// an `over` if missing).
    pub fn insert_spec(&mut self, path: SdfPath, spec: PrimSpec) {
        if path.is_absolute_root() {
            self.specs.insert(path, spec);
            return;
        }
        let parent = path.parent();
        if !self.specs.contains_key(&parent) {
            self.insert_spec(
                parent.clone(),
                PrimSpec {
                    specifier: Specifier::Over,
                    ..PrimSpec::default()
                },
            );
        }
        if let Some(parent_spec) = self.specs.get_mut(&parent) {
            let name = path.name().to_string();
            if !parent_spec.children.contains(&name) {
                parent_spec.children.push(name);
            }
        }
        self.specs.insert(path, spec);
    }

    /// Get the spec at `path`, creating it (and any missing ancestors) with
    /// the given specifier. Returns true in the second slot if it was created.
    pub fn ensure_spec(&mut self, path: &SdfPath, specifier: Specifier) -> (&mut PrimSpec, bool) {
        let created = !self.specs.contains_key(path);
        if created {
            self.insert_spec(
                path.clone(),
                PrimSpec {
                    specifier,
                    ..PrimSpec::default()
                },
            );
        }
        let spec = self
            .specs
            .entry(path.clone())
            .or_insert_with(PrimSpec::default);
        (spec, created)
    }

    /// Remove the spec at `path` and all descendants. Returns false if no
    /// spec existed.
    pub fn remove_spec(&mut self, path: &SdfPath) -> bool {
        if path.is_absolute_root() || !self.specs.contains_key(path) {
            return false;
        }
        self.specs.retain(|spec_path, _| !spec_path.has_prefix(path));
        if let Some(parent) = self.specs.get_mut(&path.parent()) {
            parent.children.retain(|child| child != path.name());
        }
        true
    }

    /// Move the spec subtree at `path` to a sibling named `new_name`,
    /// keeping its position among the siblings.
    pub fn rename_spec(&mut self, path: &SdfPath, new_name: &str) -> Result<SdfPath, UsdError> {
        let parent = path.parent();
        let new_path = parent.append_child(new_name)?;
        if self.specs.contains_key(&new_path) {
            return Err(UsdError::PrimExists(new_path));
        }
        if !self.specs.contains_key(path) {
            return Err(UsdError::PrimNotFound(path.clone()));
        }

        let moved: Vec<(SdfPath, PrimSpec)> = self
            .specs
            .iter()
            .filter(|(spec_path, _)| spec_path.has_prefix(path))
            .map(|(spec_path, spec)| (spec_path.clone(), spec.clone()))
            .collect();
        self.specs.retain(|spec_path, _| !spec_path.has_prefix(path));
        for (old, spec) in moved {
            if let Some(renamed) = old.replace_prefix(path, &new_path) {
                self.specs.insert(renamed, spec);
            }
        }

        if let Some(parent_spec) = self.specs.get_mut(&parent) {
            for child in parent_spec.children.iter_mut() {
                if child == path.name() {
                    *child = new_name.to_string();
                }
            }
        }
        Ok(new_path)
    }
}

/// Paths touched by one layer edit
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LayerChanges {
    pub resynced: Vec<SdfPath>,
    pub changed_info_only: Vec<SdfPath>,
}

impl LayerChanges {
    pub fn is_empty(&self) -> bool {
        self.resynced.is_empty() && self.changed_info_only.is_empty()
    }

    pub fn merge(&mut self, other: LayerChanges) {
        for path in other.resynced {
            if !self.resynced.contains(&path) {
                self.resynced.push(path);
            }
        }
        for path in other.changed_info_only {
            if !self.changed_info_only.contains(&path) {
                self.changed_info_only.push(path);
            }
        }
    }

    /// Drop changed-info entries that fall under a resynced path
    pub fn normalize(&mut self) {
        let resynced = &self.resynced;
        self.changed_info_only
            .retain(|path| !resynced.iter().any(|r| path.has_prefix(r)));
    }
}

/// Receives edits made to a layer it composes
pub(crate) trait LayerObserver: Send + Sync {
    fn layer_changed(&self, layer: &Layer, changes: &LayerChanges);
}

/// Size and modification time of the file a layer was read from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStamp {
    pub modified: SystemTime,
    pub size: u64,
}

impl FileStamp {
    pub fn of(path: &Path) -> Option<Self> {
        let metadata = path.metadata().ok()?;
        Some(Self {
            modified: metadata.modified().ok()?,
            size: metadata.len(),
        })
    }
}

/// File layers currently open, by canonical path
static OPEN_LAYERS: Lazy<Mutex<HashMap<PathBuf, Weak<Layer>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

fn registry_key(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

/// A layer of scene description
pub struct Layer {
    identifier: String,
    real_path: Option<PathBuf>,
    anonymous: bool,
    file_stamp: Option<FileStamp>,
    permission_to_edit: AtomicBool,
    permission_to_save: AtomicBool,
    dirty: AtomicBool,
    data: RwLock<LayerData>,
    observers: Mutex<Vec<Weak<dyn LayerObserver>>>,
}

impl Layer {
    fn from_parts(
        identifier: String,
        real_path: Option<PathBuf>,
        anonymous: bool,
        data: LayerData,
    ) -> LayerHandle {
        let file_stamp = real_path.as_deref().and_then(FileStamp::of);
        Arc::new(Self {
            identifier,
            real_path,
            anonymous,
            file_stamp,
            permission_to_edit: AtomicBool::new(true),
            permission_to_save: AtomicBool::new(true),
            dirty: AtomicBool::new(false),
            data: RwLock::new(data),
            observers: Mutex::new(Vec::new()),
        })
    }

    /// Find the open layer for `path` or read it from a `.usda`, `.usdc` or
    /// `.usd` file. Every stage opened on the same file shares one layer
    /// while any of them is alive. A layer whose file changed on disk is
    /// replaced by a fresh read.
    pub fn open(path: impl AsRef<Path>) -> Result<LayerHandle, UsdError> {
        let path = path.as_ref();
        let key = registry_key(path);
        let mut open_layers = lock(&OPEN_LAYERS);
        open_layers.retain(|_, layer| layer.strong_count() > 0);
        if let Some(layer) = open_layers.get(&key).and_then(Weak::upgrade) {
            if !layer.is_stale_on_disk() {
                return Ok(layer);
            }
            log::debug!("Re-reading {}, changed on disk", layer.identifier());
        }

        let data = reader::read_layer(path)?;
        let identifier = path.to_string_lossy().into_owned();
        let layer = Self::from_parts(identifier, Some(path.to_path_buf()), false, data);
        open_layers.insert(key, Arc::downgrade(&layer));
        Ok(layer)
    }

    /// The open layer for `path`, if some stage still holds it
    pub fn find(path: impl AsRef<Path>) -> Option<LayerHandle> {
        lock(&OPEN_LAYERS)
            .get(&registry_key(path.as_ref()))
            .and_then(Weak::upgrade)
    }

    /// Create an anonymous, in-memory layer. The tag becomes part of the
    /// identifier: `anon:<uuid>:<tag>`.
    pub fn new_anonymous(tag: &str) -> LayerHandle {
        let identifier = format!("anon:{}:{}", uuid::Uuid::new_v4().simple(), tag);
        Self::from_parts(identifier, None, true, LayerData::default())
    }

    /// Create a named in-memory layer with the given content
    pub fn from_data(identifier: impl Into<String>, data: LayerData) -> LayerHandle {
        Self::from_parts(identifier.into(), None, false, data)
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn real_path(&self) -> Option<&Path> {
        self.real_path.as_deref()
    }

    pub fn is_anonymous(&self) -> bool {
        self.anonymous
    }

    /// True if the backing file changed size or modification time since the
    /// layer was read. In-memory layers are never stale.
    pub fn is_stale_on_disk(&self) -> bool {
        match (&self.real_path, &self.file_stamp) {
            (Some(path), Some(stamp)) => FileStamp::of(path).as_ref() != Some(stamp),
            (Some(_), None) => true,
            _ => false,
        }
    }

    pub fn permission_to_edit(&self) -> bool {
        self.permission_to_edit.load(Ordering::SeqCst)
    }

    pub fn set_permission_to_edit(&self, allow: bool) {
        self.permission_to_edit.store(allow, Ordering::SeqCst);
    }

    pub fn permission_to_save(&self) -> bool {
        self.permission_to_save.load(Ordering::SeqCst)
    }

    pub fn set_permission_to_save(&self, allow: bool) {
        self.permission_to_save.store(allow, Ordering::SeqCst);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    /// Run a read-only closure against the layer content
    pub fn read<R>(&self, f: impl FnOnce(&LayerData) -> R) -> R {
        f(&read(&self.data))
    }

    /// Run an edit against the layer content. Fails without touching the
    /// layer if it does not permit editing.
    pub fn edit<R>(&self, f: impl FnOnce(&mut LayerData) -> R) -> Result<R, UsdError> {
        if !self.permission_to_edit() {
            return Err(UsdError::LayerNotEditable(self.identifier.clone()));
        }
        let result = f(&mut write(&self.data));
        self.dirty.store(true, Ordering::SeqCst);
        Ok(result)
    }

    pub(crate) fn add_observer(&self, observer: Weak<dyn LayerObserver>) {
        let mut observers = lock(&self.observers);
        observers.retain(|o| o.strong_count() > 0);
        observers.push(observer);
    }

    /// Tell every live stage composing this layer about an edit. The order
    /// in which stages hear about it is unspecified.
    pub(crate) fn notify(&self, changes: &LayerChanges) {
        if changes.is_empty() {
            return;
        }
        let observers: Vec<Arc<dyn LayerObserver>> = {
            let mut observers = lock(&self.observers);
            observers.retain(|o| o.strong_count() > 0);
            observers.iter().filter_map(Weak::upgrade).collect()
        };
        for observer in observers {
            observer.layer_changed(self, changes);
        }
    }
}

impl std::fmt::Debug for Layer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Layer")
            .field("identifier", &self.identifier)
            .field("permission_to_edit", &self.permission_to_edit())
            .field("permission_to_save", &self.permission_to_save())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> SdfPath {
        SdfPath::new(s).unwrap()
    }

    #[test]
    fn test_insert_creates_parents() {
        let mut data = LayerData::default();
        data.insert_spec(p("/World/cube"), PrimSpec::default());

        assert!(data.has_spec(&p("/World")));
        assert_eq!(data.spec(&p("/World")).unwrap().specifier, Specifier::Over);
        assert_eq!(data.spec(&p("/")).unwrap().children, vec!["World"]);
        assert_eq!(data.spec(&p("/World")).unwrap().children, vec!["cube"]);
    }

    #[test]
    fn test_remove_subtree() {
        let mut data = LayerData::default();
        data.insert_spec(p("/World/cube/mesh"), PrimSpec::default());
        assert!(data.remove_spec(&p("/World/cube")));
        assert!(!data.has_spec(&p("/World/cube/mesh")));
        assert!(data.spec(&p("/World")).unwrap().children.is_empty());
        assert!(!data.remove_spec(&p("/World/cube")));
    }

    #[test]
    fn test_rename_keeps_order() {
        let mut data = LayerData::default();
        data.insert_spec(p("/a"), PrimSpec::default());
        data.insert_spec(p("/b/child"), PrimSpec::default());
        data.insert_spec(p("/c"), PrimSpec::default());

        let renamed = data.rename_spec(&p("/b"), "box").unwrap();
        assert_eq!(renamed, p("/box"));
        assert!(data.has_spec(&p("/box/child")));
        assert!(!data.has_spec(&p("/b")));
        assert_eq!(data.spec(&p("/")).unwrap().children, vec!["a", "box", "c"]);
        assert!(matches!(
            data.rename_spec(&p("/a"), "c"),
            Err(UsdError::PrimExists(_))
        ));
    }

    #[test]
    fn test_attribute_held_interpolation() {
        let mut attr = AttributeSpec::with_default(Value::Double(1.0));
        attr.time_samples.insert(TimeCode::new(10.0), Value::Double(10.0));
        attr.time_samples.insert(TimeCode::new(20.0), Value::Double(20.0));

        assert_eq!(attr.value_at(TimeCode::DEFAULT), Some(&Value::Double(1.0)));
        assert_eq!(attr.value_at(TimeCode::new(5.0)), Some(&Value::Double(10.0)));
        assert_eq!(attr.value_at(TimeCode::new(15.0)), Some(&Value::Double(10.0)));
        assert_eq!(attr.value_at(TimeCode::new(25.0)), Some(&Value::Double(20.0)));
    }

    #[test]
    fn test_edit_respects_permission() {
        let layer = Layer::new_anonymous("session.usda");
        assert!(layer.identifier().starts_with("anon:"));
        assert!(layer.identifier().ends_with(":session.usda"));

        layer.set_permission_to_edit(false);
        let result = layer.edit(|data| data.insert_spec(p("/cube"), PrimSpec::default()));
        assert!(matches!(result, Err(UsdError::LayerNotEditable(_))));
        assert!(!layer.read(|data| data.has_spec(&p("/cube"))));
        assert!(!layer.is_dirty());

        layer.set_permission_to_edit(true);
        layer
            .edit(|data| data.insert_spec(p("/cube"), PrimSpec::default()))
            .unwrap();
        assert!(layer.is_dirty());
    }

    #[test]
    fn test_changes_normalize() {
        let mut changes = LayerChanges {
            resynced: vec![p("/World")],
            changed_info_only: vec![p("/World/cube.size"), p("/Other.size")],
        };
        changes.normalize();
        assert_eq!(changes.changed_info_only, vec![p("/Other.size")]);
    }

    #[test]
    fn test_open_shares_live_file_layers() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("shared.usda");
        std::fs::write(&file, "#usda 1.0\n\ndef Xform \"cube\"\n{\n}\n").unwrap();

        let first = Layer::open(&file).unwrap();
        let second = Layer::open(&file).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(Arc::ptr_eq(&Layer::find(&file).unwrap(), &first));

        drop(first);
        drop(second);
        assert!(Layer::find(&file).is_none());
    }

    #[test]
    fn test_open_rereads_stale_layer() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("stale.usda");
        std::fs::write(&file, "#usda 1.0\n\ndef Xform \"cube\"\n{\n}\n").unwrap();
        let before = Layer::open(&file).unwrap();

        std::fs::write(
            &file,
            "#usda 1.0\n\ndef Xform \"cube\"\n{\n}\n\ndef Xform \"ball\"\n{\n}\n",
        )
        .unwrap();
        assert!(before.is_stale_on_disk());
        let after = Layer::open(&file).unwrap();
        assert!(!Arc::ptr_eq(&before, &after));
        assert!(after.read(|data| data.has_spec(&p("/ball"))));
    }
}
