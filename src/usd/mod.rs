//! USD stage runtime
//!
//! Layers, stages, change notices and the stage cache the proxy shapes
//! resolve against.

pub mod bounds;
pub mod layer;
pub mod load;
pub mod notice;
pub mod path;
pub mod reader;
pub mod stage;
pub mod stage_cache;
pub mod time;
pub mod value;

pub use bounds::{BoundingBox, Purpose, PurposeToggles};
pub use layer::{AttributeSpec, FileStamp, Layer, LayerChanges, LayerData, LayerHandle, PrimSpec, Specifier};
pub use load::{InitialLoadSet, LoadRules, PopulationMask};
pub use notice::{
    ListenerKey, NoticeCallback, NoticeRegistry, ObjectsChanged, StageContentsChanged,
    StageEditTargetChanged,
};
pub use path::SdfPath;
pub use stage::{Prim, Stage, StageWeak};
pub use stage_cache::{StageCache, StageCacheId, StageKey};
pub use time::TimeCode;
pub use value::Value;
