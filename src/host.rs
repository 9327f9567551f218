//! Plugin host
//!
//! Owns every process-wide registry of the proxy-stage core and hands
//! them to the nodes it creates. [`PluginHost::initialize`] wires the
//! host into a graph's messages; [`PluginHost::uninitialize`] undoes it.

use std::sync::{Arc, Mutex};

use crate::config::MayaUsdConfig;
use crate::draw::ShapeAdapterRegistry;
use crate::error::DgError;
use crate::hydra::{ProxyDelegate, RenderIndex, SceneIndexPluginRegistry, SceneIndexRegistration};
use crate::layers::LockedLayers;
use crate::nodes::{CallbackId, DependencyGraph, NodeId, SceneMessage, TransformNode};
use crate::proxy_shape::{
    attr, ProxyShape, ProxyShapeBase, ProxyShapeListenerBase, ProxyShapeServices, ProxyStageSet,
    PROXY_SHAPE_BASE_TYPE,
};
use crate::sync::lock;
use crate::ufe::{StagesSubject, UsdStageMap};
use crate::usd::{ListenerKey, SdfPath, StageCache};

/// What [`PluginHost::initialize`] installed
#[derive(Default)]
struct Wiring {
    notice_keys: Vec<ListenerKey>,
    scene_callbacks: Vec<CallbackId>,
    scene_indices: Option<Arc<SceneIndexRegistration>>,
}

pub struct PluginHost {
    config: MayaUsdConfig,
    graph: Arc<DependencyGraph>,
    services: ProxyShapeServices,
    locked_layers: Arc<LockedLayers>,
    stage_map: Arc<UsdStageMap>,
    subject: Arc<StagesSubject>,
    scene_index_plugins: Arc<SceneIndexPluginRegistry>,
    render_index: Arc<RenderIndex>,
    shape_adapters: Arc<ShapeAdapterRegistry>,
    wiring: Mutex<Option<Wiring>>,
}

impl PluginHost {
    pub fn new(config: MayaUsdConfig) -> Self {
        Self::with_graph(config, Arc::new(DependencyGraph::new()))
    }

    pub fn with_graph(config: MayaUsdConfig, graph: Arc<DependencyGraph>) -> Self {
        let services = ProxyShapeServices::new(Arc::new(StageCache::new()))
            .with_bounding_box_cache_capacity(config.bounding_box_cache_capacity);
        let stage_map = Arc::new(UsdStageMap::new(services.registry.clone()));
        let subject = StagesSubject::new(services.registry.clone(), stage_map.clone());
        let shape_adapters = Arc::new(ShapeAdapterRegistry::new(
            services.registry.clone(),
            services.closest_point.clone(),
        ));
        Self {
            config,
            graph,
            services,
            locked_layers: Arc::new(LockedLayers::new()),
            stage_map,
            subject,
            scene_index_plugins: Arc::new(SceneIndexPluginRegistry::new()),
            render_index: Arc::new(RenderIndex::new()),
            shape_adapters,
            wiring: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &MayaUsdConfig {
        &self.config
    }

    pub fn graph(&self) -> &Arc<DependencyGraph> {
        &self.graph
    }

    pub fn services(&self) -> &ProxyShapeServices {
        &self.services
    }

    pub fn stage_cache(&self) -> &Arc<StageCache> {
        &self.services.stage_cache
    }

    pub fn locked_layers(&self) -> &Arc<LockedLayers> {
        &self.locked_layers
    }

    pub fn stage_map(&self) -> &Arc<UsdStageMap> {
        &self.stage_map
    }

    pub fn subject(&self) -> &Arc<StagesSubject> {
        &self.subject
    }

    pub fn scene_index_plugins(&self) -> &Arc<SceneIndexPluginRegistry> {
        &self.scene_index_plugins
    }

    pub fn render_index(&self) -> &Arc<RenderIndex> {
        &self.render_index
    }

    pub fn shape_adapters(&self) -> &Arc<ShapeAdapterRegistry> {
        &self.shape_adapters
    }

    pub fn is_initialized(&self) -> bool {
        lock(&self.wiring).is_some()
    }

    /// Connect the registries to the graph. Returns false if already done.
    pub fn initialize(&self) -> bool {
        let mut wiring = lock(&self.wiring);
        if wiring.is_some() {
            return false;
        }
        self.graph
            .set_reject_reentrant(self.config.reject_reentrant_compute);

        let messages = self.graph.messages();
        let mut notice_keys = self.subject.attach(&self.services.notices);
        let mut scene_callbacks = self.subject.register_scene_callbacks(messages);

        // Files that cannot be written are system-locked as their stage is set
        let locked_layers = self.locked_layers.clone();
        notice_keys.push(
            self.services
                .notices
                .stage_set
                .register(move |notice: &ProxyStageSet| {
                    if let Some(stage) = notice.stage.upgrade() {
                        let changed = locked_layers.refresh_system_locks(&notice.dag_path, &stage);
                        if changed > 0 {
                            log::debug!("{} layers of {} changed lock state", changed, notice.dag_path);
                        }
                    }
                }),
        );

        let shape_adapters = self.shape_adapters.clone();
        scene_callbacks.push(messages.add_node_removed_callback(
            PROXY_SHAPE_BASE_TYPE,
            move |info| {
                shape_adapters.remove_adapter(info.id);
            },
        ));

        // Locks and adapters belong to the outgoing scene
        for message in [SceneMessage::BeforeNew, SceneMessage::BeforeOpen] {
            let locked_layers = self.locked_layers.clone();
            let shape_adapters = self.shape_adapters.clone();
            scene_callbacks.push(messages.add_scene_callback(message, move |_| {
                locked_layers.clear();
                shape_adapters.clear();
            }));
        }

        let scene_indices = SceneIndexRegistration::new(
            &self.graph,
            self.scene_index_plugins.clone(),
            self.render_index.clone(),
        );

        *wiring = Some(Wiring {
            notice_keys,
            scene_callbacks,
            scene_indices: Some(scene_indices),
        });
        log::info!("Proxy-stage core initialized");
        true
    }

    /// Revoke everything [`initialize`](Self::initialize) installed
    pub fn uninitialize(&self) -> bool {
        let wiring = lock(&self.wiring).take();
        let Some(wiring) = wiring else {
            return false;
        };
        for key in &wiring.notice_keys {
            key.revoke();
        }
        let messages = self.graph.messages();
        for callback in wiring.scene_callbacks {
            messages.remove_callback(callback);
        }
        drop(wiring.scene_indices);
        log::info!("Proxy-stage core uninitialized");
        true
    }

    /// Create a transform `name` with a proxy shape `<name>Shape` below it.
    /// Returns the shape node.
    pub fn create_proxy_shape(&self, name: &str) -> Result<NodeId, DgError> {
        let transform = self
            .graph
            .create_node(Box::new(TransformNode), name, None)?;
        let shape = self.graph.create_node(
            Box::new(ProxyShapeBase::new(self.services.clone())),
            &format!("{}Shape", name),
            Some(transform),
        )?;
        self.graph
            .set_value(shape, attr::SHARE_STAGE, self.config.share_stages)?;
        Ok(shape)
    }

    pub fn create_listener_node(&self, name: &str) -> Result<NodeId, DgError> {
        self.graph.create_node(
            Box::new(ProxyShapeListenerBase::new(self.services.stage_cache.clone())),
            name,
            None,
        )
    }

    pub fn proxy_shape(&self, node: NodeId) -> Option<ProxyShape<'_>> {
        self.services.shape(&self.graph, node)
    }

    /// A render delegate for the proxy shape `node`, sharing the host's
    /// render index
    pub fn create_delegate(&self, node: NodeId) -> Option<ProxyDelegate> {
        self.services.registry.get(node)?;
        let delegate_id = SdfPath::new(&format!("/MayaUsdProxyDelegate_{}", node)).ok()?;
        Some(ProxyDelegate::new(delegate_id, self.render_index.clone()))
    }
}

impl Drop for PluginHost {
    fn drop(&mut self) {
        self.uninitialize();
    }
}
