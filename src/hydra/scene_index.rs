//! Scene indices and the plugin registry that creates them

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use crate::hydra::render_index::{RenderIndex, SceneIndexId};
use crate::nodes::NodeId;
use crate::sync::{read, write};

/// A value handed to scene-index plugins
#[derive(Debug, Clone, PartialEq)]
pub enum DataSource {
    Node(NodeId),
    Bool(bool),
    Int(i64),
    String(String),
    Container(RetainedContainer),
}

/// Fixed name to data-source mapping
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetainedContainer {
    entries: BTreeMap<String, DataSource>,
}

impl RetainedContainer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: DataSource) -> Self {
        self.entries.insert(name.into(), value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&DataSource> {
        self.entries.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub trait SceneIndex: Send + Sync {
    fn display_name(&self) -> String;
}

/// Creates scene indices on request. Returning `None` means the plugin
/// declined; callers carry on without a scene index.
pub trait SceneIndexPlugin: Send + Sync {
    fn append_scene_index(&self, input_args: &RetainedContainer) -> Option<Arc<dyn SceneIndex>>;
}

impl<F> SceneIndexPlugin for F
where
    F: Fn(&RetainedContainer) -> Option<Arc<dyn SceneIndex>> + Send + Sync,
{
    fn append_scene_index(&self, input_args: &RetainedContainer) -> Option<Arc<dyn SceneIndex>> {
        self(input_args)
    }
}

/// Scene-index plugins by identifier
#[derive(Default)]
pub struct SceneIndexPluginRegistry {
    plugins: RwLock<BTreeMap<String, Arc<dyn SceneIndexPlugin>>>,
}

impl SceneIndexPluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `plugin` under `id`. A second registration under the same
    /// id is a coding error: it is logged and the first plugin kept.
    pub fn register(&self, id: &str, plugin: Arc<dyn SceneIndexPlugin>) -> bool {
        let mut plugins = write(&self.plugins);
        if plugins.contains_key(id) {
            log::error!("Scene index plugin '{}' is already registered", id);
            return false;
        }
        plugins.insert(id.to_string(), plugin);
        log::debug!("Registered scene index plugin '{}'", id);
        true
    }

    pub fn unregister(&self, id: &str) -> bool {
        write(&self.plugins).remove(id).is_some()
    }

    pub fn is_registered(&self, id: &str) -> bool {
        read(&self.plugins).contains_key(id)
    }

    pub fn plugin(&self, id: &str) -> Option<Arc<dyn SceneIndexPlugin>> {
        let plugin = read(&self.plugins).get(id).cloned();
        if plugin.is_none() {
            log::debug!("No scene index plugin '{}'", id);
        }
        plugin
    }

    /// Have the plugin `id` create a scene index and insert it into
    /// `render_index`
    pub fn append_scene_index(
        &self,
        id: &str,
        input_args: &RetainedContainer,
        render_index: &RenderIndex,
    ) -> Option<(SceneIndexId, Arc<dyn SceneIndex>)> {
        let plugin = self.plugin(id)?;
        let Some(scene_index) = plugin.append_scene_index(input_args) else {
            log::debug!("Scene index plugin '{}' created nothing", id);
            return None;
        };
        let index_id = render_index.insert_scene_index(scene_index.clone());
        Some((index_id, scene_index))
    }

    pub fn ids(&self) -> Vec<String> {
        read(&self.plugins).keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        read(&self.plugins).len()
    }

    pub fn is_empty(&self) -> bool {
        read(&self.plugins).is_empty()
    }
}

const MAX_REFINE_LEVEL: i64 = 8;

/// Display style for a proxy shape's complexity
pub fn display_style_data_source(complexity: i64) -> RetainedContainer {
    RetainedContainer::new()
        .with("refineLevel", DataSource::Int(complexity.clamp(0, MAX_REFINE_LEVEL)))
        .with("flatShadingEnabled", DataSource::Bool(false))
        .with("displacementEnabled", DataSource::Bool(true))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(String);

    impl SceneIndex for Named {
        fn display_name(&self) -> String {
            self.0.clone()
        }
    }

    fn named_plugin(name: &'static str) -> Arc<dyn SceneIndexPlugin> {
        Arc::new(move |_: &RetainedContainer| {
            Some(Arc::new(Named(name.to_string())) as Arc<dyn SceneIndex>)
        })
    }

    #[test]
    fn test_duplicate_registration_keeps_first() {
        let registry = SceneIndexPluginRegistry::new();
        assert!(registry.register("FooMayaNodeSceneIndexPlugin", named_plugin("first")));
        assert!(!registry.register("FooMayaNodeSceneIndexPlugin", named_plugin("second")));

        let index = RenderIndex::new();
        let (id, scene_index) = registry
            .append_scene_index("FooMayaNodeSceneIndexPlugin", &RetainedContainer::new(), &index)
            .unwrap();
        assert_eq!(scene_index.display_name(), "first");
        assert!(index.scene_index(id).is_some());
    }

    #[test]
    fn test_missing_or_declining_plugin() {
        let registry = SceneIndexPluginRegistry::new();
        let index = RenderIndex::new();
        assert!(registry
            .append_scene_index("Missing", &RetainedContainer::new(), &index)
            .is_none());

        registry.register(
            "Declines",
            Arc::new(|_: &RetainedContainer| -> Option<Arc<dyn SceneIndex>> { None }),
        );
        assert!(registry
            .append_scene_index("Declines", &RetainedContainer::new(), &index)
            .is_none());
        assert_eq!(index.scene_index_count(), 0);
    }

    #[test]
    fn test_display_style_clamps_refine_level() {
        assert_eq!(
            display_style_data_source(12).get("refineLevel"),
            Some(&DataSource::Int(8))
        );
        assert_eq!(
            display_style_data_source(-1).get("refineLevel"),
            Some(&DataSource::Int(0))
        );
    }
}
