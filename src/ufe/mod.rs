//! Scene-item side of the proxy shapes: two-segment paths, the proxy to
//! stage map, and the subject that relays stage changes to observers

pub mod path;
pub mod stage_map;
pub mod subject;

pub use path::UfePath;
pub use stage_map::UsdStageMap;
pub use subject::{Notification, ObserverId, SceneTransition, StagesSubject};
