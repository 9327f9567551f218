//! Rendering side of the proxy shapes
//!
//! A [`ProxyDelegate`] mirrors a shape's stage into a [`RenderIndex`] as
//! rprims with dirty bits. Other DAG node types can contribute their own
//! scene indices through [`SceneIndexRegistration`].

pub mod delegate;
pub mod registration;
pub mod render_index;
pub mod scene_index;

pub use delegate::ProxyDelegate;
pub use registration::{scene_index_plugin_id, SceneIndexRegistration, OBJECT_KEY, SCENE_INDEX_PLUGIN_SUFFIX};
pub use render_index::{dirty_bits, ChangeTracker, DirtyBits, RenderIndex, Rprim, SceneIndexId};
pub use scene_index::{
    display_style_data_source, DataSource, RetainedContainer, SceneIndex, SceneIndexPlugin,
    SceneIndexPluginRegistry,
};
