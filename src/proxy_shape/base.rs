//! ProxyShapeBase: the DAG node that owns a USD stage
//!
//! The node resolves a stage from its inputs in two steps. `inStageDataCached`
//! holds the stage resolved from the stage-shaping inputs (file path, prim
//! path, load set, population mask, variant selections, stage cache id or
//! an upstream `inStageData`). `outStageData` publishes it. Each step only
//! runs when its plug is dirty, so a stage is opened once per change of the
//! inputs that shape it.
//!
//! Per-shape state that outlives a single compute (bounding-box cache, the
//! stage notice listener, re-entrancy counter, version counters) lives in a
//! shared [`ProxyShapeState`] so that the stages subject, the batch
//! renderer and the Hydra bridge can read it without evaluating the graph.

use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use glam::DVec3;
use once_cell::sync::Lazy;

use crate::config::MayaUsdConfig;
use crate::listener::{classify_objects_changed, ChangeType, StageNoticeListener};
use crate::nodes::{
    Attribute, DataBlock, DependencyGraph, DgNode, NodeClass, NodeContext, NodeId, NodeKind, PlugData,
    StageData, Status,
};
use crate::proxy_shape::bbox_cache::{BoundingBoxCache, CacheStatistics};
use crate::proxy_shape::closest_point::{ClosestPointHit, ClosestPointRegistry};
use crate::proxy_shape::hooks::{BaseHooks, ProxyShapeHooks};
use crate::proxy_shape::import_data::{ImportData, StageResolver};
use crate::proxy_shape::notices::{
    ProxyNotices, ProxyStageInvalidate, ProxyStageObjectsChanged, ProxyStageSet,
};
use crate::proxy_shape::registry::ProxyShapeRegistry;
use crate::sync::{lock, read, write};
use crate::ufe::UfePath;
use crate::usd::{
    BoundingBox, InitialLoadSet, ObjectsChanged, PopulationMask, Prim, PurposeToggles, SdfPath, Stage,
    StageCache, StageCacheId, StageWeak, TimeCode,
};

pub const PROXY_SHAPE_BASE_TYPE: &str = "mayaUsdProxyShapeBase";
pub const PROXY_SHAPE_TYPE: &str = "mayaUsdProxyShape";

/// Attribute names
pub mod attr {
    pub const FILE_PATH: &str = "filePath";
    pub const PRIM_PATH: &str = "primPath";
    pub const EXCLUDE_PRIM_PATHS: &str = "excludePrimPaths";
    pub const TIME: &str = "time";
    pub const COMPLEXITY: &str = "complexity";
    pub const DRAW_RENDER_PURPOSE: &str = "drawRenderPurpose";
    pub const DRAW_PROXY_PURPOSE: &str = "drawProxyPurpose";
    pub const DRAW_GUIDE_PURPOSE: &str = "drawGuidePurpose";
    pub const LOAD_PAYLOADS: &str = "loadPayloads";
    pub const SHARE_STAGE: &str = "shareStage";
    pub const STAGE_CACHE_ID: &str = "stageCacheId";
    pub const POPULATION_MASK_INCLUDE_PATHS: &str = "populationMaskIncludePaths";
    pub const VARIANT_SELECTIONS: &str = "variantSelections";
    pub const IN_STAGE_DATA: &str = "inStageData";
    pub const IN_STAGE_DATA_CACHED: &str = "inStageDataCached";
    pub const OUT_STAGE_DATA: &str = "outStageData";
    pub const OUT_STAGE_CACHE_ID: &str = "outStageCacheId";
    pub const OUT_TIME: &str = "outTime";
}

/// Inputs that decide which stage the shape holds
const STAGE_INPUTS: &[&str] = &[
    attr::FILE_PATH,
    attr::PRIM_PATH,
    attr::LOAD_PAYLOADS,
    attr::SHARE_STAGE,
    attr::STAGE_CACHE_ID,
    attr::POPULATION_MASK_INCLUDE_PATHS,
    attr::VARIANT_SELECTIONS,
    attr::IN_STAGE_DATA,
];

/// Inputs that only change how the stage is drawn
const DRAW_INPUTS: &[&str] = &[
    attr::EXCLUDE_PRIM_PATHS,
    attr::COMPLEXITY,
    attr::DRAW_RENDER_PURPOSE,
    attr::DRAW_PROXY_PURPOSE,
    attr::DRAW_GUIDE_PURPOSE,
];

const MAX_COMPLEXITY: i64 = 8;

fn empty_strings() -> PlugData {
    PlugData::StringArray(Vec::new())
}

fn build_base_class() -> NodeClass {
    let mut class = NodeClass::new(PROXY_SHAPE_BASE_TYPE, NodeKind::Dag)
        .with_attribute(Attribute::input(attr::FILE_PATH, ""))
        .with_attribute(Attribute::input(attr::PRIM_PATH, ""))
        .with_attribute(Attribute::input(attr::EXCLUDE_PRIM_PATHS, empty_strings()))
        .with_attribute(Attribute::input(attr::TIME, TimeCode::new(0.0)))
        .with_attribute(Attribute::input(attr::COMPLEXITY, 0i64))
        .with_attribute(Attribute::input(attr::DRAW_RENDER_PURPOSE, false))
        .with_attribute(Attribute::input(attr::DRAW_PROXY_PURPOSE, true))
        .with_attribute(Attribute::input(attr::DRAW_GUIDE_PURPOSE, false))
        .with_attribute(Attribute::input(attr::LOAD_PAYLOADS, true))
        .with_attribute(Attribute::input(attr::SHARE_STAGE, true))
        .with_attribute(Attribute::input(attr::STAGE_CACHE_ID, -1i64))
        .with_attribute(Attribute::input(attr::POPULATION_MASK_INCLUDE_PATHS, empty_strings()))
        .with_attribute(Attribute::input(attr::VARIANT_SELECTIONS, empty_strings()))
        .with_attribute(Attribute::input(attr::IN_STAGE_DATA, PlugData::None).storable(false))
        .with_attribute(Attribute::output(attr::IN_STAGE_DATA_CACHED, PlugData::None).internal())
        .with_attribute(Attribute::output(attr::OUT_STAGE_DATA, PlugData::None))
        .with_attribute(Attribute::output(attr::OUT_STAGE_CACHE_ID, -1i64))
        .with_attribute(Attribute::output(attr::OUT_TIME, TimeCode::new(0.0)));

    // Affects edges are not transitive: every input names every output
    for input in STAGE_INPUTS {
        class = class
            .attribute_affects(input, attr::IN_STAGE_DATA_CACHED)
            .attribute_affects(input, attr::OUT_STAGE_DATA)
            .attribute_affects(input, attr::OUT_STAGE_CACHE_ID);
    }
    for input in DRAW_INPUTS {
        class = class.attribute_affects(input, attr::OUT_STAGE_DATA);
    }
    class
        .attribute_affects(attr::TIME, attr::OUT_TIME)
        .attribute_affects(attr::TIME, attr::OUT_STAGE_DATA)
}

static BASE_CLASS: Lazy<NodeClass> = Lazy::new(build_base_class);

static PROXY_SHAPE_CLASS: Lazy<Arc<NodeClass>> =
    Lazy::new(|| Arc::new(NodeClass::derive_from(&BASE_CLASS, PROXY_SHAPE_TYPE)));

/// Process-wide collaborators a proxy shape needs, handed down by the
/// plugin host
#[derive(Clone)]
pub struct ProxyShapeServices {
    pub stage_cache: Arc<StageCache>,
    pub resolver: Arc<StageResolver>,
    pub notices: Arc<ProxyNotices>,
    pub registry: Arc<ProxyShapeRegistry>,
    pub closest_point: Arc<ClosestPointRegistry>,
    pub bounding_box_cache_capacity: Option<usize>,
}

impl ProxyShapeServices {
    /// Fresh registries around `stage_cache`
    pub fn new(stage_cache: Arc<StageCache>) -> Self {
        Self {
            resolver: Arc::new(StageResolver::new(stage_cache.clone())),
            stage_cache,
            notices: Arc::new(ProxyNotices::new()),
            registry: Arc::new(ProxyShapeRegistry::new()),
            closest_point: Arc::new(ClosestPointRegistry::new()),
            bounding_box_cache_capacity: MayaUsdConfig::default().bounding_box_cache_capacity,
        }
    }

    pub fn with_bounding_box_cache_capacity(mut self, capacity: Option<usize>) -> Self {
        self.bounding_box_cache_capacity = capacity;
        self
    }

    /// Query view of a registered shape
    pub fn shape<'g>(&self, graph: &'g DependencyGraph, node: NodeId) -> Option<ProxyShape<'g>> {
        let state = self.registry.get(node)?;
        Some(ProxyShape::new(graph, state, self.closest_point.clone()))
    }
}

/// Marks a compute in progress for as long as it lives
pub struct ComputeGuard<'a> {
    counter: &'a AtomicUsize,
}

impl Drop for ComputeGuard<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

/// State of one proxy shape shared outside the graph
pub struct ProxyShapeState {
    node: AtomicUsize,
    type_name: String,
    dag_path: RwLock<String>,
    hooks: Arc<dyn ProxyShapeHooks>,
    bounding_boxes: Mutex<BoundingBoxCache>,
    in_compute: AtomicUsize,
    stage: Mutex<StageWeak>,
    root_prim: Mutex<SdfPath>,
    listener: Mutex<StageNoticeListener>,
    invalidated: AtomicBool,
    usd_stage_version: AtomicU64,
    draw_dirty_count: AtomicU64,
}

impl ProxyShapeState {
    fn new(type_name: &str, hooks: Arc<dyn ProxyShapeHooks>, capacity: Option<usize>) -> Self {
        Self {
            node: AtomicUsize::new(0),
            type_name: type_name.to_string(),
            dag_path: RwLock::new(String::new()),
            hooks,
            bounding_boxes: Mutex::new(BoundingBoxCache::new(capacity)),
            in_compute: AtomicUsize::new(0),
            stage: Mutex::new(StageWeak::default()),
            root_prim: Mutex::new(SdfPath::absolute_root()),
            listener: Mutex::new(StageNoticeListener::new()),
            invalidated: AtomicBool::new(false),
            usd_stage_version: AtomicU64::new(0),
            draw_dirty_count: AtomicU64::new(0),
        }
    }

    pub fn node(&self) -> NodeId {
        self.node.load(Ordering::SeqCst)
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn dag_path(&self) -> String {
        read(&self.dag_path).clone()
    }

    /// Scene-item path of the shape itself
    pub fn ufe_path(&self) -> UfePath {
        UfePath::proxy(self.dag_path())
    }

    pub fn hooks(&self) -> &Arc<dyn ProxyShapeHooks> {
        &self.hooks
    }

    /// Nesting depth of computes on this shape
    pub fn in_compute(&self) -> usize {
        self.in_compute.load(Ordering::SeqCst)
    }

    /// Count a compute (or a pull nested in one) until the guard drops
    pub fn enter_compute(&self) -> ComputeGuard<'_> {
        self.in_compute.fetch_add(1, Ordering::SeqCst);
        ComputeGuard {
            counter: &self.in_compute,
        }
    }

    /// The stage last published on `outStageData`
    pub fn stage(&self) -> Option<Stage> {
        lock(&self.stage).upgrade()
    }

    pub fn stage_weak(&self) -> StageWeak {
        lock(&self.stage).clone()
    }

    pub fn root_prim(&self) -> SdfPath {
        lock(&self.root_prim).clone()
    }

    /// Stage the notice listener is attached to
    pub fn listened_stage(&self) -> Option<Stage> {
        lock(&self.listener).stage()
    }

    pub fn clear_bounding_box_cache(&self) {
        lock(&self.bounding_boxes).clear();
    }

    pub fn bounding_box_cache_len(&self) -> usize {
        lock(&self.bounding_boxes).len()
    }

    pub fn bounding_box_stats(&self) -> CacheStatistics {
        lock(&self.bounding_boxes).stats().clone()
    }

    /// Bumped on every stage swap and every update or resync of the stage
    pub fn usd_stage_version(&self) -> u64 {
        self.usd_stage_version.load(Ordering::SeqCst)
    }

    /// Bumped whenever the shape needs redrawing
    pub fn draw_dirty_count(&self) -> u64 {
        self.draw_dirty_count.load(Ordering::SeqCst)
    }

    fn mark_draw_dirty(&self) {
        self.draw_dirty_count.fetch_add(1, Ordering::SeqCst);
    }

    /// Publish `stage`. Returns true if it differs from the current one.
    fn set_stage(&self, stage: Option<&Stage>, root_prim: &SdfPath) -> bool {
        *lock(&self.root_prim) = root_prim.clone();
        {
            let mut current = lock(&self.stage);
            let unchanged = match stage {
                Some(stage) => current.refers_to(stage),
                None => current.is_expired(),
            };
            if unchanged {
                return false;
            }
            *current = stage.map(Stage::downgrade).unwrap_or_default();
        }

        lock(&self.listener).set_stage(stage);
        self.clear_bounding_box_cache();
        self.usd_stage_version.fetch_add(1, Ordering::SeqCst);
        self.mark_draw_dirty();
        true
    }

    fn on_stage_objects_changed(&self, notice: &ObjectsChanged, notices: &ProxyNotices) {
        let change = classify_objects_changed(notice);
        if change == ChangeType::Ignored {
            return;
        }
        // Bounds may move on either kind of change
        self.clear_bounding_box_cache();
        self.usd_stage_version.fetch_add(1, Ordering::SeqCst);
        self.mark_draw_dirty();
        notices.objects_changed.send(&ProxyStageObjectsChanged {
            node: self.node(),
            dag_path: self.dag_path(),
            change,
            notice: notice.clone(),
        });
    }

    fn cached_bounding_box(&self, time: TimeCode) -> Option<BoundingBox> {
        lock(&self.bounding_boxes).get(time)
    }

    fn cache_bounding_box(&self, time: TimeCode, bounds: BoundingBox) {
        lock(&self.bounding_boxes).insert(time, bounds);
    }
}

/// The proxy shape node
pub struct ProxyShapeBase {
    class: Arc<NodeClass>,
    state: Arc<ProxyShapeState>,
    services: ProxyShapeServices,
}

impl ProxyShapeBase {
    /// A plain `mayaUsdProxyShape`
    pub fn new(services: ProxyShapeServices) -> Self {
        Self::with_hooks(services, PROXY_SHAPE_CLASS.clone(), Arc::new(BaseHooks))
    }

    /// A derived proxy shape type. `class` should come from
    /// [`derive_class`](Self::derive_class).
    pub fn with_hooks(
        services: ProxyShapeServices,
        class: Arc<NodeClass>,
        hooks: Arc<dyn ProxyShapeHooks>,
    ) -> Self {
        let state = Arc::new(ProxyShapeState::new(
            class.type_name(),
            hooks,
            services.bounding_box_cache_capacity,
        ));
        Self {
            class,
            state,
            services,
        }
    }

    /// Class of the abstract base type
    pub fn base_class() -> &'static NodeClass {
        &BASE_CLASS
    }

    pub fn proxy_shape_class() -> Arc<NodeClass> {
        PROXY_SHAPE_CLASS.clone()
    }

    /// Class for a new proxy shape type with every base attribute
    pub fn derive_class(type_name: &str) -> NodeClass {
        NodeClass::derive_from(&BASE_CLASS, type_name)
    }

    pub fn state(&self) -> &Arc<ProxyShapeState> {
        &self.state
    }

    fn compute_in_stage_data_cached(&self, data: &mut DataBlock) -> Status {
        let state = self.state.clone();
        let _nested = state.enter_compute();

        let upstream = data
            .input_value(attr::IN_STAGE_DATA)
            .as_stage_data()
            .filter(|upstream| upstream.is_valid())
            .cloned();

        let prim_path = match data.input_str(attr::PRIM_PATH).trim() {
            "" => upstream
                .as_ref()
                .map(|upstream| upstream.prim_path.clone())
                .filter(|path| !path.is_empty())
                .unwrap_or_else(SdfPath::absolute_root),
            text => SdfPath::new(text)
                .ok()
                .filter(SdfPath::is_prim_path)
                .unwrap_or_else(|| {
                    log::warn!("{}: invalid prim path '{}'", self.state.dag_path(), text);
                    SdfPath::empty()
                }),
        };

        let stage = match upstream {
            Some(upstream) => upstream.stage,
            None => self
                .stage_from_cache_id(data)
                .or_else(|| self.stage_from_file(data)),
        };

        let cache_id = stage
            .as_ref()
            .and_then(|stage| self.services.stage_cache.id_of(stage))
            .unwrap_or(StageCacheId::INVALID);
        let stage_data = match stage {
            Some(stage) => StageData::new(stage, prim_path),
            None => StageData::default(),
        };

        data.set_output(attr::IN_STAGE_DATA_CACHED, stage_data);
        data.set_output(attr::OUT_STAGE_CACHE_ID, cache_id.to_i64());
        Status::Success
    }

    fn stage_from_cache_id(&self, data: &DataBlock) -> Option<Stage> {
        let id = StageCacheId::from_i64(data.input_int(attr::STAGE_CACHE_ID));
        if !id.is_valid() {
            return None;
        }
        let stage = self.services.stage_cache.find(id);
        if stage.is_none() {
            log::debug!("{}: stage cache id {} is not in the cache", self.state.dag_path(), id);
        }
        stage
    }

    fn stage_from_file(&self, data: &DataBlock) -> Option<Stage> {
        let file_path = data.input_str(attr::FILE_PATH).trim();
        if file_path.is_empty() {
            return None;
        }

        let mut import = ImportData::new(file_path);
        import.load_set = if data.input_bool(attr::LOAD_PAYLOADS) {
            InitialLoadSet::LoadAll
        } else {
            InitialLoadSet::LoadNone
        };
        import.population_mask = PopulationMask::new(
            data.input_string_array(attr::POPULATION_MASK_INCLUDE_PATHS)
                .iter()
                .filter_map(|text| match SdfPath::new(text.trim()) {
                    Ok(path) if path.is_prim_path() => Some(path),
                    _ => {
                        log::warn!("Ignoring population mask entry '{}'", text);
                        None
                    }
                }),
        );
        import.variant_selections =
            ImportData::parse_variant_selections(data.input_string_array(attr::VARIANT_SELECTIONS));
        import.session_layer = self.state.hooks.compute_session_layer(data);

        let shared = data.input_bool(attr::SHARE_STAGE);
        match self.services.resolver.resolve(&import, shared) {
            Ok(stage) => Some(stage),
            Err(err) => {
                log::warn!("{}: cannot open '{}': {}", self.state.dag_path(), file_path, err);
                None
            }
        }
    }

    fn compute_out_stage_data(&self, data: &mut DataBlock) -> Status {
        let stage_data = data
            .input_value(attr::IN_STAGE_DATA_CACHED)
            .as_stage_data()
            .cloned()
            .unwrap_or_default();

        let changed = self
            .state
            .set_stage(stage_data.stage.as_ref(), &stage_data.prim_path);
        if changed {
            match &stage_data.stage {
                Some(stage) => log::info!(
                    "{} now holds stage {}",
                    self.state.dag_path(),
                    stage.root_layer().identifier()
                ),
                None => log::info!("{} has no stage", self.state.dag_path()),
            }
        }
        let invalidated = self.state.invalidated.swap(false, Ordering::SeqCst);

        data.set_output(attr::OUT_STAGE_DATA, stage_data.clone());

        if changed || invalidated {
            self.services.notices.stage_set.send(&ProxyStageSet {
                node: self.state.node(),
                dag_path: self.state.dag_path(),
                stage: stage_data
                    .stage
                    .as_ref()
                    .map(Stage::downgrade)
                    .unwrap_or_default(),
            });
        }
        Status::Success
    }
}

impl DgNode for ProxyShapeBase {
    fn class(&self) -> Arc<NodeClass> {
        self.class.clone()
    }

    fn post_constructor(&mut self, context: &NodeContext) {
        self.state.node.store(context.id, Ordering::SeqCst);
        *write(&self.state.dag_path) = context.dag_path.clone().unwrap_or_default();

        let state = Arc::downgrade(&self.state);
        let notices = self.services.notices.clone();
        lock(&self.state.listener).set_stage_objects_changed_callback(move |notice| {
            if let Some(state) = state.upgrade() {
                state.on_stage_objects_changed(notice, &notices);
            }
        });

        self.services.registry.add(self.state.clone());
        log::debug!("Registered proxy shape {}", self.state.dag_path());
    }

    fn compute(&mut self, plug: &str, data: &mut DataBlock) -> Status {
        let state = self.state.clone();
        let _guard = state.enter_compute();
        match plug {
            attr::IN_STAGE_DATA_CACHED | attr::OUT_STAGE_CACHE_ID => {
                self.compute_in_stage_data_cached(data)
            }
            attr::OUT_STAGE_DATA => {
                if data.is_dirty(attr::IN_STAGE_DATA_CACHED) {
                    crate::return_on_failure!(self.compute_in_stage_data_cached(data));
                }
                self.compute_out_stage_data(data)
            }
            attr::OUT_TIME => {
                let time = data.input_time(attr::TIME);
                data.set_output(attr::OUT_TIME, time);
                Status::Success
            }
            _ => Status::UnknownParameter,
        }
    }

    fn set_dependents_dirty(&mut self, plug: &str, affected: &mut Vec<String>) -> Status {
        if STAGE_INPUTS.contains(&plug) {
            self.state.clear_bounding_box_cache();
            if self.state.stage().is_some() {
                self.state.invalidated.store(true, Ordering::SeqCst);
                self.services.notices.stage_invalidate.send(&ProxyStageInvalidate {
                    node: self.state.node(),
                    dag_path: self.state.dag_path(),
                    root_prim: self.state.root_prim(),
                });
            }
        } else if DRAW_INPUTS.contains(&plug) {
            // Bounds depend on purposes and excluded prims, not just time
            self.state.clear_bounding_box_cache();
            self.state.mark_draw_dirty();
        } else if plug != attr::TIME {
            return Status::Success;
        }

        if !affected.iter().any(|name| name == attr::OUT_STAGE_DATA) {
            affected.push(attr::OUT_STAGE_DATA.to_string());
        }
        Status::Success
    }

    fn pre_removal(&mut self) {
        self.services.registry.remove(self.state.node());
        lock(&self.state.listener).revoke();
        self.state.clear_bounding_box_cache();
        log::debug!("Unregistered proxy shape {}", self.state.dag_path());
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Shape selection filter reported to the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionMask {
    Nothing,
    Meshes,
}

/// Read-only view of a proxy shape in a graph. Queries pull plugs the way
/// draw code would, so they may trigger a compute.
pub struct ProxyShape<'g> {
    graph: &'g DependencyGraph,
    state: Arc<ProxyShapeState>,
    closest_point: Arc<ClosestPointRegistry>,
}

impl<'g> ProxyShape<'g> {
    pub fn new(
        graph: &'g DependencyGraph,
        state: Arc<ProxyShapeState>,
        closest_point: Arc<ClosestPointRegistry>,
    ) -> Self {
        Self {
            graph,
            state,
            closest_point,
        }
    }

    pub fn node(&self) -> NodeId {
        self.state.node()
    }

    pub fn state(&self) -> &Arc<ProxyShapeState> {
        &self.state
    }

    pub fn graph(&self) -> &'g DependencyGraph {
        self.graph
    }

    pub fn dag_path(&self) -> String {
        self.state.dag_path()
    }

    fn plug(&self, name: &str) -> PlugData {
        match self.graph.get_value(self.node(), name) {
            Ok(value) => value,
            Err(err) => {
                log::debug!("{}.{}: {}", self.dag_path(), name, err);
                PlugData::None
            }
        }
    }

    /// `outStageData`; empty when the stage cannot be resolved
    pub fn stage_data(&self) -> StageData {
        match self.plug(attr::OUT_STAGE_DATA) {
            PlugData::Stage(data) => data,
            _ => StageData::default(),
        }
    }

    pub fn is_stage_valid(&self) -> bool {
        self.stage_data().is_valid()
    }

    pub fn stage(&self) -> Option<Stage> {
        self.stage_data().stage
    }

    /// The prim at `primPath`, or an invalid prim
    pub fn usd_prim(&self) -> Prim {
        let data = self.stage_data();
        match data.stage {
            Some(stage) if !data.prim_path.is_empty() => stage.prim_at_path(&data.prim_path),
            _ => Prim::default(),
        }
    }

    pub fn stage_cache_id(&self) -> StageCacheId {
        StageCacheId::from_i64(self.plug(attr::OUT_STAGE_CACHE_ID).as_int().unwrap_or(-1))
    }

    /// Excluded subtrees; entries that are not prim paths are skipped
    pub fn exclude_prim_paths(&self) -> Vec<SdfPath> {
        self.plug(attr::EXCLUDE_PRIM_PATHS)
            .as_string_array()
            .unwrap_or(&[])
            .iter()
            .filter_map(|text| SdfPath::new(text.trim()).ok())
            .filter(SdfPath::is_prim_path)
            .collect()
    }

    pub fn complexity(&self) -> i64 {
        self.plug(attr::COMPLEXITY)
            .as_int()
            .unwrap_or(0)
            .clamp(0, MAX_COMPLEXITY)
    }

    pub fn time(&self) -> TimeCode {
        self.plug(attr::TIME).as_time().unwrap_or_default()
    }

    /// `outTime`, the time draw code samples at
    pub fn output_time(&self) -> TimeCode {
        self.plug(attr::OUT_TIME).as_time().unwrap_or_default()
    }

    pub fn draw_purpose_toggles(&self) -> PurposeToggles {
        PurposeToggles {
            render: self.plug(attr::DRAW_RENDER_PURPOSE).as_bool().unwrap_or(false),
            proxy: self.plug(attr::DRAW_PROXY_PURPOSE).as_bool().unwrap_or(true),
            guide: self.plug(attr::DRAW_GUIDE_PURPOSE).as_bool().unwrap_or(false),
        }
    }

    /// Bound at the output time, cached per time code
    pub fn bounding_box(&self) -> BoundingBox {
        // Pull first: a stage swap clears the cache
        if !self.is_stage_valid() {
            return BoundingBox::empty();
        }
        let time = self.output_time();
        if let Some(bounds) = self.state.cached_bounding_box(time) {
            return bounds;
        }

        let mut bounds = self.state.hooks.compute_bounding_box(self, time);
        if bounds.is_empty() {
            bounds = self.state.hooks.cache_empty_bounding_box();
        }
        self.state.cache_bounding_box(time, bounds);
        bounds
    }

    /// Bound of the stage below the root prim with the shape's purpose
    /// toggles and exclusions applied
    pub fn stage_bounding_box(&self, time: TimeCode) -> BoundingBox {
        let data = self.stage_data();
        let Some(stage) = data.stage else {
            return BoundingBox::empty();
        };
        stage.compute_bounding_box(
            &data.prim_path,
            time,
            self.draw_purpose_toggles(),
            &self.exclude_prim_paths(),
        )
    }

    /// Misses unless a closest-point delegate is registered
    pub fn closest_point(&self, ray_source: DVec3, ray_direction: DVec3) -> Option<ClosestPointHit> {
        let delegate = self.closest_point.delegate()?;
        delegate.closest_point(self, ray_source, ray_direction)
    }

    pub fn can_make_live(&self) -> bool {
        self.closest_point.is_set()
    }

    pub fn selection_mask(&self) -> SelectionMask {
        if self.can_make_live() {
            SelectionMask::Meshes
        } else {
            SelectionMask::Nothing
        }
    }

    pub fn usd_stage_version(&self) -> u64 {
        self.state.usd_stage_version()
    }

    pub fn draw_dirty_count(&self) -> u64 {
        self.state.draw_dirty_count()
    }

    pub fn clear_bounding_box_cache(&self) {
        self.state.clear_bounding_box_cache();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy_shape::closest_point::BoundsIntersector;
    use crate::usd::{Layer, LayerHandle, Value};
    use std::io::Write;
    use std::sync::atomic::AtomicUsize;

    const CUBE: &str = r#"#usda 1.0

def Xform "cube"
{
    def Cube "geo"
    {
        double size = 2
    }
}
"#;

    const SPHERE: &str = r#"#usda 1.0

def Sphere "ball"
{
    double radius = 3
}
"#;

    fn write_usda(dir: &tempfile::TempDir, name: &str, body: &str) -> String {
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(body.as_bytes()).unwrap();
        path.to_string_lossy().into_owned()
    }

    fn setup() -> (DependencyGraph, ProxyShapeServices, NodeId) {
        let graph = DependencyGraph::new();
        let services = ProxyShapeServices::new(Arc::new(StageCache::new()));
        let node = graph
            .create_node(Box::new(ProxyShapeBase::new(services.clone())), "stageShape", None)
            .unwrap();
        (graph, services, node)
    }

    #[test]
    fn test_class_affects_are_exhaustive() {
        let class = ProxyShapeBase::proxy_shape_class();
        assert!(class.is_type(PROXY_SHAPE_BASE_TYPE));
        for input in STAGE_INPUTS.iter().chain(DRAW_INPUTS).chain(&[attr::TIME]) {
            assert!(
                class.affected_by(input).contains(&attr::OUT_STAGE_DATA),
                "{} must affect outStageData",
                input
            );
        }
    }

    #[test]
    fn test_resolves_stage_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_usda(&dir, "cube.usda", CUBE);
        let (graph, services, node) = setup();
        graph.set_value(node, attr::FILE_PATH, file.as_str()).unwrap();

        let shape = services.shape(&graph, node).unwrap();
        assert!(shape.is_stage_valid());
        let children = shape.usd_prim().children();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].name(), "cube");
        assert!(shape.stage_cache_id().is_valid());
        assert!(shape.state().listened_stage().is_some());
    }

    #[test]
    fn test_compute_depth_tracks_active_pull() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_usda(&dir, "cube.usda", CUBE);
        let (graph, services, node) = setup();
        let seen_depth = Arc::new(AtomicUsize::new(usize::MAX));
        let registry = services.registry.clone();
        let depth = seen_depth.clone();
        let key = services.notices.stage_set.register(move |notice: &ProxyStageSet| {
            if let Some(state) = registry.get(notice.node) {
                depth.store(state.in_compute(), Ordering::SeqCst);
            }
        });

        graph.set_value(node, attr::FILE_PATH, file.as_str()).unwrap();
        let shape = services.shape(&graph, node).unwrap();
        assert!(shape.is_stage_valid());
        assert_eq!(seen_depth.load(Ordering::SeqCst), 1);
        assert_eq!(shape.state().in_compute(), 0);
        key.revoke();
    }

    #[test]
    fn test_invalid_inputs_give_empty_results() {
        let (graph, services, node) = setup();
        let shape = services.shape(&graph, node).unwrap();
        assert!(!shape.is_stage_valid());
        assert!(!shape.usd_prim().is_valid());
        assert!(shape.bounding_box().is_empty());

        graph
            .set_value(node, attr::FILE_PATH, "/does/not/exist.usda")
            .unwrap();
        assert!(!shape.is_stage_valid());
        assert_eq!(shape.stage_cache_id(), StageCacheId::INVALID);
    }

    #[test]
    fn test_bad_prim_path_keeps_stage_but_no_prim() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_usda(&dir, "cube.usda", CUBE);
        let (graph, services, node) = setup();
        graph.set_value(node, attr::FILE_PATH, file.as_str()).unwrap();
        graph.set_value(node, attr::PRIM_PATH, "not a path").unwrap();

        let shape = services.shape(&graph, node).unwrap();
        assert!(shape.is_stage_valid());
        assert!(!shape.usd_prim().is_valid());
    }

    #[test]
    fn test_draw_inputs_do_not_reopen_stage() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_usda(&dir, "cube.usda", CUBE);
        let (graph, services, node) = setup();
        graph.set_value(node, attr::FILE_PATH, file.as_str()).unwrap();

        let stage_sets = Arc::new(AtomicUsize::new(0));
        let counter = stage_sets.clone();
        let _key = services.notices.stage_set.register(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let shape = services.shape(&graph, node).unwrap();
        let first = shape.stage().unwrap();
        assert_eq!(stage_sets.load(Ordering::SeqCst), 1);

        graph.set_value(node, attr::COMPLEXITY, 3i64).unwrap();
        assert!(graph.is_dirty(node, attr::OUT_STAGE_DATA));
        assert!(!graph.is_dirty(node, attr::IN_STAGE_DATA_CACHED));
        assert!(shape.stage().unwrap().ptr_eq(&first));
        assert_eq!(stage_sets.load(Ordering::SeqCst), 1);
        assert_eq!(shape.complexity(), 3);
    }

    #[test]
    fn test_bounding_box_cached_per_time() {
        let dir = tempfile::tempdir().unwrap();
        let cube = write_usda(&dir, "cube.usda", CUBE);
        let ball = write_usda(&dir, "ball.usda", SPHERE);
        let (graph, services, node) = setup();
        graph.set_value(node, attr::FILE_PATH, cube.as_str()).unwrap();
        let shape = services.shape(&graph, node).unwrap();

        let bounds = shape.bounding_box();
        assert_eq!(bounds.size(), DVec3::splat(2.0));
        let recomputes = shape.state().bounding_box_stats().recomputes;
        shape.bounding_box();
        assert_eq!(shape.state().bounding_box_stats().recomputes, recomputes);

        graph.set_value(node, attr::TIME, TimeCode::new(5.0)).unwrap();
        shape.bounding_box();
        assert_eq!(shape.state().bounding_box_stats().recomputes, recomputes + 1);
        assert_eq!(shape.state().bounding_box_cache_len(), 2);

        graph.set_value(node, attr::FILE_PATH, ball.as_str()).unwrap();
        assert_eq!(shape.state().bounding_box_cache_len(), 0);
        assert_eq!(shape.bounding_box().size(), DVec3::splat(6.0));
    }

    #[test]
    fn test_stage_edit_clears_bounds_and_rebroadcasts() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_usda(&dir, "cube.usda", CUBE);
        let (graph, services, node) = setup();
        graph.set_value(node, attr::FILE_PATH, file.as_str()).unwrap();
        let shape = services.shape(&graph, node).unwrap();
        shape.bounding_box();
        let version = shape.usd_stage_version();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _key = services.notices.objects_changed.register(move |notice| {
            lock(&sink).push(notice.change);
        });

        let stage = shape.stage().unwrap();
        let geo = SdfPath::new("/cube/geo").unwrap();
        stage.set_attribute(&geo, "size", Value::Double(4.0)).unwrap();

        assert_eq!(*lock(&seen), vec![ChangeType::Update]);
        assert_eq!(shape.state().bounding_box_cache_len(), 0);
        assert_eq!(shape.usd_stage_version(), version + 1);
        assert_eq!(shape.bounding_box().size(), DVec3::splat(4.0));
    }

    #[test]
    fn test_stage_input_change_sends_invalidate() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_usda(&dir, "cube.usda", CUBE);
        let (graph, services, node) = setup();

        let invalidates = Arc::new(AtomicUsize::new(0));
        let counter = invalidates.clone();
        let _key = services.notices.stage_invalidate.register(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        graph.set_value(node, attr::FILE_PATH, file.as_str()).unwrap();
        assert_eq!(invalidates.load(Ordering::SeqCst), 0);

        let shape = services.shape(&graph, node).unwrap();
        shape.stage();
        graph.set_value(node, attr::PRIM_PATH, "/cube").unwrap();
        assert_eq!(invalidates.load(Ordering::SeqCst), 1);
        assert_eq!(shape.usd_prim().name(), "cube");
    }

    #[test]
    fn test_stage_cache_id_input() {
        let (graph, services, node) = setup();
        let stage = Stage::create_in_memory("cached.usda");
        let id = services.stage_cache.insert(stage.clone());
        graph.set_value(node, attr::STAGE_CACHE_ID, id.to_i64()).unwrap();

        let shape = services.shape(&graph, node).unwrap();
        assert!(shape.stage().unwrap().ptr_eq(&stage));
        assert_eq!(shape.stage_cache_id(), id);
    }

    #[test]
    fn test_session_layer_hook() {
        struct SessionHooks(LayerHandle);
        impl ProxyShapeHooks for SessionHooks {
            fn compute_session_layer(&self, _data: &DataBlock) -> Option<LayerHandle> {
                Some(self.0.clone())
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let file = write_usda(&dir, "cube.usda", CUBE);
        let graph = DependencyGraph::new();
        let services = ProxyShapeServices::new(Arc::new(StageCache::new()));
        let session = Layer::new_anonymous("custom-session.usda");
        let class = Arc::new(ProxyShapeBase::derive_class("customProxyShape"));
        let node = graph
            .create_node(
                Box::new(ProxyShapeBase::with_hooks(
                    services.clone(),
                    class,
                    Arc::new(SessionHooks(session.clone())),
                )),
                "customShape",
                None,
            )
            .unwrap();
        graph.set_value(node, attr::FILE_PATH, file.as_str()).unwrap();

        let shape = services.shape(&graph, node).unwrap();
        let stage = shape.stage().unwrap();
        assert!(Arc::ptr_eq(stage.session_layer(), &session));
        assert_eq!(graph.nodes_of_type(PROXY_SHAPE_BASE_TYPE), vec![node]);
    }

    #[test]
    fn test_closest_point_needs_delegate() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_usda(&dir, "cube.usda", CUBE);
        let (graph, services, node) = setup();
        graph.set_value(node, attr::FILE_PATH, file.as_str()).unwrap();
        let shape = services.shape(&graph, node).unwrap();

        let source = DVec3::new(0.0, 0.0, 10.0);
        let direction = DVec3::new(0.0, 0.0, -1.0);
        assert!(shape.closest_point(source, direction).is_none());
        assert!(!shape.can_make_live());
        assert_eq!(shape.selection_mask(), SelectionMask::Nothing);

        services.closest_point.set_delegate(Some(Arc::new(BoundsIntersector)));
        let hit = shape.closest_point(source, direction).unwrap();
        assert_eq!(hit.point, DVec3::new(0.0, 0.0, 1.0));
        assert_eq!(hit.normal, DVec3::new(0.0, 0.0, 1.0));
        assert!(shape.can_make_live());
        assert!(shape.closest_point(source, DVec3::new(0.0, 0.0, 1.0)).is_none());
    }

    #[test]
    fn test_removal_unregisters() {
        let (graph, services, node) = setup();
        assert_eq!(services.registry.len(), 1);
        graph.delete_node(node).unwrap();
        assert!(services.registry.is_empty());
        assert!(services.shape(&graph, node).is_none());
    }
}
